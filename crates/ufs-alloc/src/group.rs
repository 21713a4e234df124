//! Allocation inside one cylinder group.
//!
//! Every entry point reads the group's cylinder-group block, mutates it and
//! the in-memory counters together, and writes it back before returning.
//! A group that cannot satisfy a request returns `Ok(None)` so the hashed
//! strategy can move on; a group whose metadata is inconsistent returns
//! `Corruption`.

use tracing::{debug, error, trace};
use ufs_block::BlockDevice;
use ufs_error::{Result, UfsError};
use ufs_ondisk::{CylinderGroup, FsGeometry, Ufs2Dinode};
use ufs_types::{BlockNumber, DINODE_SIZE, GroupNumber, InodeNumber, MAXFRAG, unix_now};

use crate::bitmap::{
    AROUND, INSIDE, blkmap, clrbit, clrblock, fragacct, fragtbl, isblock, isfreeblock, isset,
    scanc, setbit, setblock,
};
use crate::params::{FsParams, read_group, write_group};

fn corrupt(geo: &FsGeometry, cg: GroupNumber, detail: impl Into<String>) -> UfsError {
    UfsError::corruption(geo.cgtod(cg).0, detail)
}

/// Apply a `fragacct` delta to the group's `frsum` histogram.
fn adjust_frsum(geo: &FsGeometry, group: &mut CylinderGroup, fragmap: u32, cnt: i32) {
    let mut delta = [0_i32; MAXFRAG];
    fragacct(geo.frag, fragmap, &mut delta, cnt);
    for (size, d) in delta.iter().enumerate() {
        if *d != 0 {
            group.adjust_frsum(size, *d);
        }
    }
}

// ── Map search ──────────────────────────────────────────────────────────────

/// Find a free run of `allocsiz` fragments, starting at the byte holding
/// `bpref` (or the fragment rotor) and wrapping once. Returns the run's
/// fragment offset in the group and moves the fragment rotor there.
fn mapsearch(
    geo: &FsGeometry,
    group: &mut CylinderGroup,
    bpref: BlockNumber,
    allocsiz: u32,
) -> Result<u32> {
    let start = (if bpref.is_hole() {
        group.frotor() / 8
    } else {
        geo.dtogd(bpref) / 8
    }) as usize;
    let table = fragtbl(geo.frag);
    // allocsiz is at most frag (8), so the shift stays inside a byte
    #[expect(clippy::cast_possible_truncation)]
    let mask = (1_u32 << (allocsiz - 1 + geo.frag % 8)) as u8;
    let map = group.blksfree();
    let map_len = map.len();
    let start = start.min(map_len.saturating_sub(1));

    let mut base = start;
    let mut len = map_len - start;
    let mut loc = scanc(&map[start..], table, mask);
    if loc == 0 {
        base = 0;
        len = start + 1;
        loc = scanc(&map[..len], table, mask);
        if loc == 0 {
            return Err(corrupt(geo, group.cgx(), "free map has no run the histogram promised"));
        }
    }
    let byte = u32::try_from(base + len - loc)
        .map_err(|_| corrupt(geo, group.cgx(), "map offset overflow"))?;
    let first = byte * 8;
    group.set_frotor(first);

    let map = group.blksfree();
    let mut bno = first;
    while bno < first + 8 {
        let blk = blkmap(geo.frag, map, bno) << 1;
        let mut field = AROUND[allocsiz as usize];
        let mut subfield = INSIDE[allocsiz as usize];
        for pos in 0..=(geo.frag - allocsiz) {
            if blk & field == subfield {
                return Ok(bno + pos);
            }
            field <<= 1;
            subfield <<= 1;
        }
        bno += geo.frag;
    }
    Err(corrupt(geo, group.cgx(), "matched map byte holds no fitting run"))
}

// ── Cluster accounting ──────────────────────────────────────────────────────

/// Record block `blkno` (block index in the group) becoming free (`cnt`
/// = 1) or used (`cnt` = -1) in the cluster map and histogram, and
/// refresh the group's `maxcluster`.
pub fn clusteracct(fs: &mut FsParams, group: &mut CylinderGroup, blkno: u32, cnt: i32) {
    if !group.has_clusters() {
        return;
    }
    let contig = fs.geo.contigsumsize;
    let nblks = group.nclusterblks();
    {
        let map = group.clustersfree_mut();
        if cnt > 0 {
            setbit(map, blkno);
        } else {
            clrbit(map, blkno);
        }
    }
    let map = group.clustersfree();

    let start = blkno + 1;
    let end = (start + contig).min(nblks);
    let forw = (start..end).take_while(|i| isset(map, *i)).count();

    let back = if blkno == 0 {
        0
    } else {
        let lowest = blkno.saturating_sub(contig);
        (lowest..blkno).rev().take_while(|i| isset(map, *i)).count()
    };

    let total = (back + forw + 1).min(contig as usize);
    group.adjust_clustersum(total, cnt);
    if back > 0 {
        group.adjust_clustersum(back, -cnt);
    }
    if forw > 0 {
        group.adjust_clustersum(forw, -cnt);
    }

    let longest = (1..=contig as usize)
        .rev()
        .find(|len| group.clustersum(*len) > 0)
        .unwrap_or(0);
    if let Some(slot) = fs.maxcluster.get_mut(group.cgx().0 as usize) {
        *slot = i32::try_from(longest).unwrap_or(0);
    }
}

// ── Block allocation ────────────────────────────────────────────────────────

/// Take one full block from a loaded group: the block holding `bpref` if
/// it is in this group and free, otherwise the next free block after the
/// rotor. Returns the fragment offset in the group.
fn alloccgblk(fs: &mut FsParams, group: &mut CylinderGroup, bpref: BlockNumber) -> Result<u32> {
    let geo = fs.geo.clone();
    let cgx = group.cgx();
    let bno = 'found: {
        let search_from = if bpref.is_hole() || geo.dtog(bpref) != cgx {
            BlockNumber(u64::from(group.rotor()))
        } else {
            let bpref = geo.blknum(bpref);
            let bno = geo.dtogd(bpref);
            if isblock(geo.frag, group.blksfree(), bno / geo.frag) {
                break 'found bno;
            }
            bpref
        };
        let bno = mapsearch(&geo, group, search_from, geo.frag)?;
        group.set_rotor(bno);
        bno
    };
    let blkno = bno / geo.frag;
    clrblock(geo.frag, group.blksfree_mut(), blkno);
    clusteracct(fs, group, blkno, -1);
    fs.account(group, |cs| cs.nbfree -= 1);
    Ok(bno)
}

/// Allocate `size` bytes (a whole block or a fragment run) in group `cg`.
///
/// Fragment requests use the smallest `frsum` bucket that fits and fall
/// back to splitting a full block, registering the leftover run.
pub fn alloc_in_group(
    dev: &dyn BlockDevice,
    fs: &mut FsParams,
    cg: GroupNumber,
    bpref: BlockNumber,
    size: u32,
) -> Result<Option<BlockNumber>> {
    let geo = fs.geo.clone();
    let full = size == geo.bsize;
    if full && fs.summary_of(cg).nbfree == 0 {
        return Ok(None);
    }
    let mut group = read_group(dev, &geo, cg)?;
    if full && group.summary().nbfree == 0 {
        return Err(corrupt(&geo, cg, "summary reports free blocks, group header has none"));
    }
    group.set_time(unix_now().0);

    if full {
        let bno = alloccgblk(fs, &mut group, bpref)?;
        write_group(dev, &geo, &group)?;
        let blkno = BlockNumber(geo.cgbase(cg) + u64::from(bno));
        trace!(cg = cg.0, block = blkno.0, size, "alloc_block");
        return Ok(Some(blkno));
    }

    let frags = u32::try_from(geo.numfrags(u64::from(size)))
        .map_err(|_| UfsError::InvalidArgument(format!("fragment count for {size} bytes")))?;
    let allocsiz = (frags..geo.frag).find(|s| group.frsum(*s as usize) != 0);
    let Some(allocsiz) = allocsiz else {
        // No run fits: carve the request out of a full block.
        if group.summary().nbfree == 0 {
            return Ok(None);
        }
        let bno = alloccgblk(fs, &mut group, bpref)?;
        for i in frags..geo.frag {
            setbit(group.blksfree_mut(), bno + i);
        }
        let leftover = geo.frag - frags;
        let leftover_i32 = i32::try_from(leftover).unwrap_or(0);
        fs.account(&mut group, |cs| cs.nffree += leftover_i32);
        group.adjust_frsum(leftover as usize, 1);
        write_group(dev, &geo, &group)?;
        let blkno = BlockNumber(geo.cgbase(cg) + u64::from(bno));
        trace!(cg = cg.0, block = blkno.0, frags, leftover, "alloc_frags_split");
        return Ok(Some(blkno));
    };

    let bno = mapsearch(&geo, &mut group, bpref, allocsiz)?;
    for i in 0..frags {
        clrbit(group.blksfree_mut(), bno + i);
    }
    let frags_i32 = i32::try_from(frags).unwrap_or(0);
    fs.account(&mut group, |cs| cs.nffree -= frags_i32);
    group.adjust_frsum(allocsiz as usize, -1);
    if frags != allocsiz {
        group.adjust_frsum((allocsiz - frags) as usize, 1);
    }
    write_group(dev, &geo, &group)?;
    let blkno = BlockNumber(geo.cgbase(cg) + u64::from(bno));
    trace!(cg = cg.0, block = blkno.0, frags, allocsiz, "alloc_frags");
    Ok(Some(blkno))
}

/// Return `size` bytes starting at fragment `bno` to the free map.
///
/// Freeing a block or fragment that is already free is fatal.
pub fn free_blocks(
    dev: &dyn BlockDevice,
    fs: &mut FsParams,
    bno: BlockNumber,
    size: u32,
    ino: InodeNumber,
) -> Result<()> {
    let geo = fs.geo.clone();
    let frags = geo.numfrags(u64::from(size));
    if size == 0
        || size > geo.bsize
        || size % geo.fsize != 0
        || u64::from(geo.fragnum(bno)) + frags > u64::from(geo.frag)
    {
        return Err(UfsError::InvalidArgument(format!(
            "free of {size} bytes at block {bno} for inode {ino}"
        )));
    }
    if bno.0 >= geo.size {
        return Err(UfsError::corruption(bno.0, format!("inode {ino} points past the end of the filesystem")));
    }
    let cg = geo.dtog(bno);
    let mut group = read_group(dev, &geo, cg)?;
    group.set_time(unix_now().0);
    let cgbno = geo.dtogd(bno);

    if size == geo.bsize {
        let blkno = cgbno / geo.frag;
        if !isfreeblock(geo.frag, group.blksfree(), blkno) {
            error!(block = bno.0, ino = ino.0, "freeing free block");
            panic!("freeing free block {bno} (inode {ino})");
        }
        setblock(geo.frag, group.blksfree_mut(), blkno);
        clusteracct(fs, &mut group, blkno, 1);
        fs.account(&mut group, |cs| cs.nbfree += 1);
    } else {
        let bbase = cgbno - geo.fragnum(bno);
        let before = blkmap(geo.frag, group.blksfree(), bbase);
        adjust_frsum(&geo, &mut group, before, -1);
        // frags <= frag, checked above
        #[expect(clippy::cast_possible_truncation)]
        let frags = frags as u32;
        for i in 0..frags {
            if isset(group.blksfree(), cgbno + i) {
                error!(block = bno.0 + u64::from(i), ino = ino.0, "freeing free frag");
                panic!("freeing free fragment {} (inode {ino})", bno.0 + u64::from(i));
            }
            setbit(group.blksfree_mut(), cgbno + i);
        }
        let frags_i32 = i32::try_from(frags).unwrap_or(0);
        fs.account(&mut group, |cs| cs.nffree += frags_i32);
        let after = blkmap(geo.frag, group.blksfree(), bbase);
        adjust_frsum(&geo, &mut group, after, 1);

        let blkno = bbase / geo.frag;
        if isblock(geo.frag, group.blksfree(), blkno) {
            let frag_i32 = i32::try_from(geo.frag).unwrap_or(0);
            fs.account(&mut group, |cs| cs.nffree -= frag_i32);
            clusteracct(fs, &mut group, blkno, 1);
            fs.account(&mut group, |cs| cs.nbfree += 1);
        }
    }
    write_group(dev, &geo, &group)?;
    trace!(cg = cg.0, block = bno.0, size, ino = ino.0, "free_blocks");
    Ok(())
}

// ── Inode allocation ────────────────────────────────────────────────────────

/// Allocate an inode in group `cg`: `ipref` (taken modulo `ipg`) if it is
/// free, else the first free inode at or after the inode rotor.
///
/// Inode-table blocks past the group's initialized high-water mark are
/// zeroed and given fresh generation numbers on first use.
pub fn alloc_inode_in_group(
    dev: &dyn BlockDevice,
    fs: &mut FsParams,
    cg: GroupNumber,
    ipref: u64,
    is_dir: bool,
) -> Result<Option<InodeNumber>> {
    let geo = fs.geo.clone();
    if fs.summary_of(cg).nifree == 0 {
        return Ok(None);
    }
    let mut group = read_group(dev, &geo, cg)?;
    if group.summary().nifree == 0 {
        return Err(corrupt(&geo, cg, "summary reports free inodes, group header has none"));
    }
    group.set_time(unix_now().0);

    // ipref % ipg fits in u32 because ipg does
    #[expect(clippy::cast_possible_truncation)]
    let preferred = (ipref != 0)
        .then(|| (ipref % u64::from(geo.ipg)) as u32)
        .filter(|p| !isset(group.inosused(), *p));
    let idx = match preferred {
        Some(idx) => idx,
        None => {
            let map = group.inosused();
            let start = (group.irotor() / 8) as usize;
            let byte = map[start.min(map.len())..]
                .iter()
                .position(|b| *b != 0xff)
                .map(|p| p + start)
                .or_else(|| map.iter().position(|b| *b != 0xff))
                .ok_or_else(|| corrupt(&geo, cg, "inode map full despite free count"))?;
            let idx = u32::try_from(byte * 8)
                .map_err(|_| corrupt(&geo, cg, "inode map offset overflow"))?
                + map[byte].trailing_ones();
            group.set_irotor(idx);
            idx
        }
    };

    while idx + geo.inopb > group.initediblk() && group.initediblk() < geo.ipg {
        let first = InodeNumber(geo.cg_first_inode(cg) + u64::from(group.initediblk()));
        init_inode_block(dev, &geo, first)?;
        group.set_initediblk(group.initediblk() + geo.inopb);
    }

    setbit(group.inosused_mut(), idx);
    fs.account(&mut group, |cs| cs.nifree -= 1);
    if is_dir {
        fs.account(&mut group, |cs| cs.ndir += 1);
    }
    write_group(dev, &geo, &group)?;
    let ino = InodeNumber(geo.cg_first_inode(cg) + u64::from(idx));
    trace!(cg = cg.0, ino = ino.0, is_dir, "alloc_inode");
    Ok(Some(ino))
}

/// Zero one inode-table block and stamp each slot with a random
/// generation number.
fn init_inode_block(dev: &dyn BlockDevice, geo: &FsGeometry, first: InodeNumber) -> Result<()> {
    let mut buf = vec![0_u8; geo.bsize as usize];
    for slot in buf.chunks_exact_mut(DINODE_SIZE) {
        let din = Ufs2Dinode {
            generation: new_generation(),
            ..Ufs2Dinode::default()
        };
        din.write_to_bytes(slot)
            .map_err(|e| ufs_ondisk::parse_to_ufs_error(&e, geo.ino_to_fsba(first).0))?;
    }
    dev.write_block(geo.fsbtodb(geo.ino_to_fsba(first)), &buf)
}

/// A non-zero generation number.
#[must_use]
pub fn new_generation() -> u32 {
    rand::random::<u32>() / 2 + 1
}

/// Release inode `ino`. An out-of-range number, or freeing a free inode
/// on a writable filesystem, is fatal.
pub fn free_inode(dev: &dyn BlockDevice, fs: &mut FsParams, ino: InodeNumber, is_dir: bool) -> Result<()> {
    let geo = fs.geo.clone();
    if ino.0 >= geo.max_inodes() {
        error!(ino = ino.0, max = geo.max_inodes(), "inode number out of range");
        panic!("free of inode {ino} beyond {} inodes", geo.max_inodes());
    }
    let cg = geo.ino_to_cg(ino);
    let mut group = read_group(dev, &geo, cg)?;
    group.set_time(unix_now().0);
    // ino % ipg fits in u32
    #[expect(clippy::cast_possible_truncation)]
    let idx = (ino.0 % u64::from(geo.ipg)) as u32;
    if !isset(group.inosused(), idx) && !fs.read_only {
        error!(ino = ino.0, "freeing free inode");
        panic!("freeing free inode {ino}");
    }
    clrbit(group.inosused_mut(), idx);
    if idx < group.irotor() {
        group.set_irotor(idx);
    }
    fs.account(&mut group, |cs| cs.nifree += 1);
    if is_dir {
        fs.account(&mut group, |cs| cs.ndir -= 1);
    }
    write_group(dev, &geo, &group)?;
    trace!(cg = cg.0, ino = ino.0, is_dir, "free_inode");
    Ok(())
}

// ── Formatting ──────────────────────────────────────────────────────────────

/// Lay out an empty cylinder group: every data block free, metadata
/// reserved, no inodes in use. Only the first `initediblk` inodes need
/// zeroed table blocks; the caller writes those.
#[must_use]
pub fn init_group(fs: &mut FsParams, cg: GroupNumber, initediblk: u32, now: i64) -> CylinderGroup {
    let geo = fs.geo.clone();
    let mut group = CylinderGroup::new_empty(&geo, cg, now);
    group.set_initediblk(initediblk.min(geo.ipg));
    let ndblk = group.ndblk();
    let mut first_data = geo.dblkno;
    if cg.0 == 0 {
        // ceil to whole blocks was applied by cs_frags
        #[expect(clippy::cast_possible_truncation)]
        let cs = geo.cs_frags() as u32;
        first_data += cs;
    }

    let mut nbfree = 0_i32;
    let mut nffree = 0_i32;
    let mut frag = first_data;
    while frag < ndblk {
        let blkno = frag / geo.frag;
        if frag + geo.frag <= ndblk {
            setblock(geo.frag, group.blksfree_mut(), blkno);
            clusteracct(fs, &mut group, blkno, 1);
            nbfree += 1;
        } else {
            for f in frag..ndblk {
                setbit(group.blksfree_mut(), f);
                nffree += 1;
            }
            let tail = blkmap(geo.frag, group.blksfree(), frag);
            adjust_frsum(&geo, &mut group, tail, 1);
        }
        frag += geo.frag;
    }

    let nifree = i32::try_from(geo.ipg).unwrap_or(i32::MAX);
    group.set_summary(ufs_ondisk::CgSummary {
        ndir: 0,
        nbfree,
        nifree,
        nffree,
    });
    if let Some(cs) = fs.cs.get_mut(cg.0 as usize) {
        *cs = group.summary();
    }
    fs.cstotal = fs.summed();
    group
}

/// Mark an inode in use while formatting, before any counters are live
/// on disk (the reserved inodes 0 and 1).
pub fn reserve_inode(fs: &mut FsParams, group: &mut CylinderGroup, idx: u32) {
    if !isset(group.inosused(), idx) {
        setbit(group.inosused_mut(), idx);
        fs.account(group, |cs| cs.nifree -= 1);
    }
}

/// Write empty cylinder groups for every group of `fs.geo`, with the
/// first two inode-table blocks of each group initialized and inodes 0
/// and 1 reserved, then the summary array.
pub fn format_groups(dev: &dyn BlockDevice, fs: &mut FsParams, now: i64) -> Result<()> {
    let geo = fs.geo.clone();
    let initedi = (2 * geo.inopb).min(geo.ipg);
    for cgx in 0..geo.ncg {
        let cg = GroupNumber(cgx);
        let mut group = init_group(fs, cg, initedi, now);
        if cgx == 0 {
            reserve_inode(fs, &mut group, 0);
            reserve_inode(fs, &mut group, 1);
        }
        let mut first = geo.cg_first_inode(cg);
        while first < geo.cg_first_inode(cg) + u64::from(initedi) {
            init_inode_block(dev, &geo, InodeNumber(first))?;
            first += u64::from(geo.inopb);
        }
        write_group(dev, &geo, &group)?;
    }
    fs.write_summaries(dev)?;
    debug!(ncg = geo.ncg, nbfree = fs.cstotal.nbfree, nffree = fs.cstotal.nffree, "format_groups");
    Ok(())
}

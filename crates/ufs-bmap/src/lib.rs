#![forbid(unsafe_code)]
//! UFS2 block-address tree.
//!
//! Maps logical file blocks to fragment addresses through the inode's
//! twelve direct pointers and its single, double and triple indirect
//! pointer blocks. A pointer block holds `nindir = bsize / 8` little-endian
//! 64-bit fragment addresses; 0 marks a hole.
//!
//! Tier `L` (0 = single indirect) addresses `nindir^(L+1)` logical blocks
//! starting right after the blocks of all shallower tiers.

use tracing::{debug, trace};
use ufs_alloc::FsParams;
use ufs_block::BlockDevice;
use ufs_error::{Result, UfsError};
use ufs_inode::{Inode, Touch, refresh_blocks, touch};
use ufs_ondisk::{FsGeometry, Ufs2Dinode, parse_to_ufs_error};
use ufs_types::{BlockNumber, InodeNumber, NDADDR, NIADDR, read_le_u64, write_le_u64};

// ── Allocation seam ─────────────────────────────────────────────────────────

/// Allocator callback for data runs and pointer blocks.
///
/// `size` is a byte count: a whole block or a fragment multiple.
pub trait BlockAllocator {
    /// Allocate `size` bytes, preferably near `pref`.
    fn alloc_block(&mut self, pref: BlockNumber, size: u32) -> Result<BlockNumber>;

    /// Free `size` bytes starting at `bno`.
    fn free_block(&mut self, bno: BlockNumber, size: u32) -> Result<()>;
}

/// [`BlockAllocator`] over the cylinder-group allocator, charging every
/// allocation to one inode.
pub struct FsAllocator<'a> {
    pub dev: &'a dyn BlockDevice,
    pub fs: &'a mut FsParams,
    pub ino: InodeNumber,
}

impl<'a> FsAllocator<'a> {
    pub fn new(dev: &'a dyn BlockDevice, fs: &'a mut FsParams, ino: InodeNumber) -> Self {
        Self { dev, fs, ino }
    }
}

impl BlockAllocator for FsAllocator<'_> {
    fn alloc_block(&mut self, pref: BlockNumber, size: u32) -> Result<BlockNumber> {
        ufs_alloc::alloc_block(self.dev, self.fs, self.ino, pref, size)
    }

    fn free_block(&mut self, bno: BlockNumber, size: u32) -> Result<()> {
        ufs_alloc::free_blocks(self.dev, self.fs, bno, size, self.ino)
    }
}

// ── Raw runs ────────────────────────────────────────────────────────────────

/// Read `len` bytes (a fragment multiple) starting at fragment `bno`.
pub fn read_run(dev: &dyn BlockDevice, geo: &FsGeometry, bno: BlockNumber, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    dev.read_block(geo.fsbtodb(bno), &mut buf)?;
    Ok(buf)
}

/// Write `data` (a fragment multiple) starting at fragment `bno`.
pub fn write_run(dev: &dyn BlockDevice, geo: &FsGeometry, bno: BlockNumber, data: &[u8]) -> Result<()> {
    dev.write_block(geo.fsbtodb(bno), data)
}

fn entry(buf: &[u8], idx: usize, block: u64) -> Result<u64> {
    read_le_u64(buf, idx * 8).map_err(|e| parse_to_ufs_error(&e, block))
}

fn put_entry(buf: &mut [u8], idx: usize, value: u64, block: u64) -> Result<()> {
    write_le_u64(buf, idx * 8, value).map_err(|e| parse_to_ufs_error(&e, block))
}

// ── Path resolution ─────────────────────────────────────────────────────────

/// Where the pointer for a logical block lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Direct(usize),
    /// `indices[..=level]` index the pointer blocks from the top down.
    Indirect { level: usize, indices: [usize; NIADDR] },
}

fn locate(geo: &FsGeometry, lbn: u64) -> Result<Slot> {
    if lbn < NDADDR as u64 {
        // lbn < 12
        #[expect(clippy::cast_possible_truncation)]
        return Ok(Slot::Direct(lbn as usize));
    }
    let nindir = u64::from(geo.nindir);
    let mut off = lbn - NDADDR as u64;
    let mut span = 1_u64;
    for level in 0..NIADDR {
        span = span.saturating_mul(nindir);
        if off < span {
            let mut indices = [0_usize; NIADDR];
            let mut div = span;
            for slot in indices.iter_mut().take(level + 1) {
                div /= nindir;
                // remainder of nindir fits in usize
                #[expect(clippy::cast_possible_truncation)]
                let idx = ((off / div) % nindir) as usize;
                *slot = idx;
            }
            return Ok(Slot::Indirect { level, indices });
        }
        off -= span;
    }
    Err(UfsError::InvalidArgument(format!(
        "logical block {lbn} beyond the triple-indirect range"
    )))
}

/// First logical block addressed by indirect tier `level`.
#[must_use]
pub fn tier_start(geo: &FsGeometry, level: usize) -> u64 {
    let nindir = u64::from(geo.nindir);
    let mut start = NDADDR as u64;
    let mut span = 1_u64;
    for _ in 0..level {
        span = span.saturating_mul(nindir);
        start = start.saturating_add(span);
    }
    start
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// Resolve logical block `lbn` of `din` to its fragment address; a hole
/// anywhere on the path yields [`BlockNumber::HOLE`].
pub fn bmap(dev: &dyn BlockDevice, geo: &FsGeometry, din: &Ufs2Dinode, lbn: u64) -> Result<BlockNumber> {
    match locate(geo, lbn)? {
        Slot::Direct(i) => Ok(BlockNumber(din.db[i])),
        Slot::Indirect { level, indices } => {
            let mut ptr = din.ib[level];
            for idx in &indices[..=level] {
                if ptr == 0 {
                    return Ok(BlockNumber::HOLE);
                }
                let buf = read_run(dev, geo, BlockNumber(ptr), geo.bsize as usize)?;
                ptr = entry(&buf, *idx, ptr)?;
            }
            Ok(BlockNumber(ptr))
        }
    }
}

// ── Materialization ─────────────────────────────────────────────────────────

fn new_pointer_block(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    alloc: &mut dyn BlockAllocator,
    pref: BlockNumber,
) -> Result<BlockNumber> {
    let bno = alloc.alloc_block(pref, geo.bsize)?;
    write_run(dev, geo, bno, &vec![0_u8; geo.bsize as usize])?;
    trace!(block = bno.0, "indirect_alloc");
    Ok(bno)
}

/// Point logical block `lbn` of `din` at `bno`.
///
/// Missing pointer blocks on the path are allocated, zeroed and linked in
/// first. Clearing a pointer (`bno` = hole) never allocates. The caller
/// writes the inode.
pub fn set_block(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    alloc: &mut dyn BlockAllocator,
    din: &mut Ufs2Dinode,
    lbn: u64,
    bno: BlockNumber,
) -> Result<()> {
    match locate(geo, lbn)? {
        Slot::Direct(i) => din.db[i] = bno.0,
        Slot::Indirect { level, indices } => {
            if din.ib[level] == 0 {
                if bno.is_hole() {
                    return Ok(());
                }
                let pref = BlockNumber(din.db[NDADDR - 1]);
                din.ib[level] = new_pointer_block(dev, geo, alloc, pref)?.0;
            }
            let mut ptr = din.ib[level];
            for (depth, idx) in indices[..=level].iter().enumerate() {
                let mut buf = read_run(dev, geo, BlockNumber(ptr), geo.bsize as usize)?;
                if depth == level {
                    put_entry(&mut buf, *idx, bno.0, ptr)?;
                    write_run(dev, geo, BlockNumber(ptr), &buf)?;
                    break;
                }
                let mut child = entry(&buf, *idx, ptr)?;
                if child == 0 {
                    if bno.is_hole() {
                        return Ok(());
                    }
                    child = new_pointer_block(dev, geo, alloc, BlockNumber(ptr))?.0;
                    put_entry(&mut buf, *idx, child, ptr)?;
                    write_run(dev, geo, BlockNumber(ptr), &buf)?;
                }
                ptr = child;
            }
        }
    }
    trace!(lbn, block = bno.0, "set_block");
    Ok(())
}

/// Grow the allocation of the current last block when the file is about
/// to be extended to `new_size`.
///
/// Only a last block in the direct range can be a partial fragment run.
/// Bytes past the old end of file inside that run are zeroed; if the run
/// must grow, a larger run is allocated, the data copied and the old run
/// freed. The caller updates `din.size` and writes the inode.
pub fn extend_tail(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    alloc: &mut dyn BlockAllocator,
    din: &mut Ufs2Dinode,
    new_size: u64,
) -> Result<()> {
    let old_size = din.size;
    if new_size <= old_size || old_size == 0 {
        return Ok(());
    }
    let lbn = geo.lblkno(old_size - 1);
    if lbn >= NDADDR as u64 {
        return Ok(());
    }
    let bno = bmap(dev, geo, din, lbn)?;
    if bno.is_hole() {
        return Ok(());
    }
    let osize = geo.sblksize(old_size, lbn) as usize;
    let nsize = geo.sblksize(new_size, lbn) as usize;
    let mut buf = vec![0_u8; nsize.max(osize)];
    dev.read_block(geo.fsbtodb(bno), &mut buf[..osize])?;
    // blkoff < bsize
    #[expect(clippy::cast_possible_truncation)]
    let tail = geo.blkoff(old_size) as usize;
    if tail != 0 {
        buf[tail..osize].fill(0);
    }
    if nsize == osize {
        if tail != 0 {
            write_run(dev, geo, bno, &buf)?;
        }
        return Ok(());
    }
    // nsize fits in u32: it is at most bsize
    #[expect(clippy::cast_possible_truncation)]
    let moved = alloc.alloc_block(bno, nsize as u32)?;
    write_run(dev, geo, moved, &buf)?;
    #[expect(clippy::cast_possible_truncation)]
    alloc.free_block(bno, osize as u32)?;
    set_block(dev, geo, alloc, din, lbn, moved)?;
    trace!(lbn, from = bno.0, to = moved.0, osize, nsize, "extend_tail");
    Ok(())
}

// ── Truncation ──────────────────────────────────────────────────────────────

/// Free the pointer blocks under `ptr` whose range lies at or past
/// logical block `keep`, children before parents.
///
/// `depth` counts pointer levels below this block (0 = its entries are
/// data blocks) and `first` is the first logical block it addresses.
/// Returns whether `ptr` itself was freed.
fn prune(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    alloc: &mut dyn BlockAllocator,
    ptr: u64,
    depth: u32,
    first: u64,
    keep: u64,
) -> Result<bool> {
    let nindir = u64::from(geo.nindir);
    let child_span = nindir.saturating_pow(depth);
    let span = child_span.saturating_mul(nindir);
    if first >= keep {
        if depth > 0 {
            let buf = read_run(dev, geo, BlockNumber(ptr), geo.bsize as usize)?;
            for i in 0..geo.nindir as usize {
                let child = entry(&buf, i, ptr)?;
                if child != 0 {
                    let child_first = first + i as u64 * child_span;
                    prune(dev, geo, alloc, child, depth - 1, child_first, keep)?;
                }
            }
        }
        alloc.free_block(BlockNumber(ptr), geo.bsize)?;
        trace!(block = ptr, depth, first, "indirect_free");
        return Ok(true);
    }
    if depth == 0 || first.saturating_add(span) <= keep {
        return Ok(false);
    }
    let mut buf = read_run(dev, geo, BlockNumber(ptr), geo.bsize as usize)?;
    let mut changed = false;
    for i in 0..geo.nindir as usize {
        let child_first = first + i as u64 * child_span;
        if child_first.saturating_add(child_span) <= keep {
            continue;
        }
        let child = entry(&buf, i, ptr)?;
        if child != 0 && prune(dev, geo, alloc, child, depth - 1, child_first, keep)? {
            put_entry(&mut buf, i, 0, ptr)?;
            changed = true;
        }
    }
    if changed {
        write_run(dev, geo, BlockNumber(ptr), &buf)?;
    }
    Ok(false)
}

/// Set the size of `inode` to `new_size`, freeing everything past it.
///
/// Blocks are released from the old last block down. The new last block
/// has the bytes past the new end zeroed; in the direct range it also
/// keeps only the fragments it still needs, the trimmed ones freed in
/// place. Pointer blocks whose whole range
/// lies past the new end are then freed deepest first and unlinked from
/// their parent. Growing a file only adjusts the tail run; the new range
/// stays a hole. The block count is rederived and the inode written.
///
/// A failure part way leaves the tree partially updated.
pub fn truncate(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    alloc: &mut dyn BlockAllocator,
    inode: &mut Inode,
    new_size: u64,
) -> Result<()> {
    let old_size = inode.din.size;
    let din = &mut inode.din;
    if new_size > old_size {
        extend_tail(dev, geo, alloc, din, new_size)?;
    } else if new_size < old_size {
        let bsize = u64::from(geo.bsize);
        let old_last = geo.lblkno(old_size - 1);
        let keep = new_size.div_ceil(bsize);

        for lbn in (keep..=old_last).rev() {
            let bno = bmap(dev, geo, din, lbn)?;
            if bno.is_hole() {
                continue;
            }
            alloc.free_block(bno, geo.sblksize(old_size, lbn))?;
            set_block(dev, geo, alloc, din, lbn, BlockNumber::HOLE)?;
        }

        if keep > 0 {
            let lbn = keep - 1;
            // sblksize is a full block outside the direct range
            let osize = geo.sblksize(old_size, lbn);
            let nsize = geo.sblksize(new_size, lbn);
            // blkoff < bsize
            #[expect(clippy::cast_possible_truncation)]
            let tail = geo.blkoff(new_size) as usize;
            let bno = bmap(dev, geo, din, lbn)?;
            if !bno.is_hole() && (tail != 0 || nsize < osize) {
                let mut buf = read_run(dev, geo, bno, nsize as usize)?;
                if tail != 0 {
                    buf[tail..].fill(0);
                }
                write_run(dev, geo, bno, &buf)?;
                if nsize < osize {
                    let cut = BlockNumber(bno.0 + geo.numfrags(u64::from(nsize)));
                    alloc.free_block(cut, osize - nsize)?;
                }
                trace!(lbn, block = bno.0, osize, nsize, tail, "truncate_partial");
            }
        }

        for level in (0..NIADDR).rev() {
            let ptr = din.ib[level];
            if ptr == 0 {
                continue;
            }
            // level < NIADDR
            #[expect(clippy::cast_possible_truncation)]
            let depth = level as u32;
            if prune(dev, geo, alloc, ptr, depth, tier_start(geo, level), keep)? {
                din.ib[level] = 0;
            }
        }
    }
    din.size = new_size;
    refresh_blocks(geo, din);
    touch(din, Touch::MODIFY);
    inode.store(dev, geo)?;
    debug!(ino = inode.number.0, old_size, new_size, blocks = inode.din.blocks, "truncate");
    Ok(())
}

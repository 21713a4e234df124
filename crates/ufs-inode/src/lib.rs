#![forbid(unsafe_code)]
//! Inode management.
//!
//! Reads and writes `ufs2_dinode` records in the inode table, derives the
//! 512-byte block count a file of a given size occupies, sizes block
//! transfers near end of file, and maintains timestamps and inline symlink
//! targets.

use tracing::trace;
use ufs_block::BlockDevice;
use ufs_error::{Result, UfsError};
use ufs_ondisk::{FsGeometry, Ufs2Dinode, parse_to_ufs_error};
use ufs_types::{DEV_BSIZE, DINODE_SIZE, InodeNumber, MAXSYMLINKLEN, NDADDR, NIADDR, howmany, unix_now};

/// An on-disk inode together with its number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub number: InodeNumber,
    pub din: Ufs2Dinode,
}

impl Inode {
    /// Read inode `number` from the inode table.
    pub fn load(dev: &dyn BlockDevice, geo: &FsGeometry, number: InodeNumber) -> Result<Self> {
        let din = read_dinode(dev, geo, number)?;
        Ok(Self { number, din })
    }

    /// Write this inode back to its slot in the inode table.
    pub fn store(&self, dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<()> {
        write_dinode(dev, geo, self.number, &self.din)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.din.size
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.din.is_dir()
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.din.is_symlink()
    }
}

// ── Inode table I/O ─────────────────────────────────────────────────────────

fn check_range(geo: &FsGeometry, ino: InodeNumber) -> Result<()> {
    if ino.0 >= geo.max_inodes() {
        return Err(UfsError::InvalidArgument(format!(
            "inode {ino} beyond the {} inodes of this filesystem",
            geo.max_inodes()
        )));
    }
    Ok(())
}

fn read_table_block(dev: &dyn BlockDevice, geo: &FsGeometry, ino: InodeNumber) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; geo.bsize as usize];
    dev.read_block(geo.fsbtodb(geo.ino_to_fsba(ino)), &mut buf)?;
    Ok(buf)
}

/// Read the dinode of `ino`.
pub fn read_dinode(dev: &dyn BlockDevice, geo: &FsGeometry, ino: InodeNumber) -> Result<Ufs2Dinode> {
    check_range(geo, ino)?;
    let buf = read_table_block(dev, geo, ino)?;
    let off = geo.ino_to_fsbo(ino);
    Ufs2Dinode::parse_from_bytes(&buf[off..off + DINODE_SIZE])
        .map_err(|e| parse_to_ufs_error(&e, geo.ino_to_fsba(ino).0))
}

/// Write `din` into the slot of `ino`, leaving its neighbours untouched.
pub fn write_dinode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    ino: InodeNumber,
    din: &Ufs2Dinode,
) -> Result<()> {
    check_range(geo, ino)?;
    let mut buf = read_table_block(dev, geo, ino)?;
    let off = geo.ino_to_fsbo(ino);
    din.write_to_bytes(&mut buf[off..off + DINODE_SIZE])
        .map_err(|e| parse_to_ufs_error(&e, geo.ino_to_fsba(ino).0))?;
    dev.write_block(geo.fsbtodb(geo.ino_to_fsba(ino)), &buf)?;
    trace!(ino = ino.0, size = din.size, blocks = din.blocks, nlink = din.nlink, "inode_write");
    Ok(())
}

// ── Construction and timestamps ─────────────────────────────────────────────

/// Which timestamps [`touch`] refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Touch {
    pub access: bool,
    pub modify: bool,
    pub change: bool,
}

impl Touch {
    pub const ACCESS: Self = Self {
        access: true,
        modify: false,
        change: false,
    };
    pub const CHANGE: Self = Self {
        access: false,
        modify: false,
        change: true,
    };
    /// Content change: mtime and ctime.
    pub const MODIFY: Self = Self {
        access: false,
        modify: true,
        change: true,
    };
    pub const ALL: Self = Self {
        access: true,
        modify: true,
        change: true,
    };
}

/// Set the selected timestamps to the current time.
pub fn touch(din: &mut Ufs2Dinode, what: Touch) {
    let (secs, nsec) = unix_now();
    if what.access {
        din.atime = secs;
        din.atimensec = nsec;
    }
    if what.modify {
        din.mtime = secs;
        din.mtimensec = nsec;
    }
    if what.change {
        din.ctime = secs;
        din.ctimensec = nsec;
    }
}

/// A fresh dinode for a newly allocated inode. The generation number is
/// supplied by the caller; all pointers are holes and the link count is
/// left for the caller to set.
#[must_use]
pub fn new_dinode(mode: u16, uid: u32, gid: u32, generation: u32) -> Ufs2Dinode {
    let (secs, nsec) = unix_now();
    Ufs2Dinode {
        mode,
        uid,
        gid,
        generation,
        atime: secs,
        mtime: secs,
        ctime: secs,
        birthtime: secs,
        atimensec: nsec,
        mtimensec: nsec,
        ctimensec: nsec,
        birthnsec: nsec,
        ..Ufs2Dinode::default()
    }
}

// ── Size arithmetic ─────────────────────────────────────────────────────────

/// Fragments a dense file of `size` bytes occupies, data and indirect
/// blocks included.
///
/// Below the indirect range the last block is a partial fragment run, so
/// the data part is simply `numfrags(fragroundup(size))`. Beyond it every
/// data block is whole and each indirect tier adds one pointer block per
/// `nindir^d` data blocks at depth `d`.
#[must_use]
pub fn frags_for_size(geo: &FsGeometry, size: u64) -> u64 {
    let bsize = u64::from(geo.bsize);
    let direct_bytes = NDADDR as u64 * bsize;
    if size <= direct_bytes {
        return geo.numfrags(geo.fragroundup(size));
    }
    let nblocks = howmany(size, bsize);
    let nindir = u64::from(geo.nindir);
    let mut remaining = nblocks - NDADDR as u64;
    let mut indirect = 0_u64;
    let mut span = 1_u64;
    for _level in 0..NIADDR {
        if remaining == 0 {
            break;
        }
        span = span.saturating_mul(nindir);
        let take = remaining.min(span);
        let mut per = 1_u64;
        while per < span {
            per = per.saturating_mul(nindir);
            indirect += howmany(take, per);
        }
        remaining -= take;
    }
    geo.blkstofrags(nblocks + indirect)
}

/// Block count (512-byte units) for `din` as stored in `di_blocks`.
///
/// Short symlinks live in the pointer area and occupy nothing.
#[must_use]
pub fn calc_num_blocks(geo: &FsGeometry, din: &Ufs2Dinode) -> u64 {
    if din.is_symlink() && din.size < MAXSYMLINKLEN as u64 {
        return 0;
    }
    frags_for_size(geo, din.size) * u64::from(geo.fsize / DEV_BSIZE)
}

/// Recompute `di_blocks` from the current size.
pub fn refresh_blocks(geo: &FsGeometry, din: &mut Ufs2Dinode) {
    din.blocks = calc_num_blocks(geo, din);
}

/// Bytes to transfer for the logical block holding `offset` in a file of
/// `file_size` bytes: a whole block, or for the last block in the direct
/// range only its fragments in use. For a write, pass the size the file
/// will have afterwards. Zero at or past end of file.
#[must_use]
pub fn inode_io_size(geo: &FsGeometry, file_size: u64, offset: u64) -> u32 {
    if offset >= file_size {
        return 0;
    }
    geo.sblksize(file_size, geo.lblkno(offset))
}

// ── Symlink targets ─────────────────────────────────────────────────────────

/// The target of a short symlink kept in the pointer area, or `None` if
/// the target lives in a data block.
#[must_use]
pub fn inline_target(din: &Ufs2Dinode) -> Option<Vec<u8>> {
    if !din.has_inline_target() {
        return None;
    }
    // size < MAXSYMLINKLEN here
    #[expect(clippy::cast_possible_truncation)]
    let len = din.size as usize;
    Some(din.inline_bytes()[..len].to_vec())
}

/// Store `target` in the pointer area and set the size to its length.
pub fn set_inline_target(din: &mut Ufs2Dinode, target: &[u8]) -> Result<()> {
    if target.len() >= MAXSYMLINKLEN {
        return Err(UfsError::InvalidArgument(format!(
            "symlink target of {} bytes does not fit inline",
            target.len()
        )));
    }
    din.set_inline_bytes(target)
        .map_err(|e| UfsError::InvalidArgument(e.to_string()))?;
    din.size = target.len() as u64;
    din.blocks = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ufs_block::{ByteBlockDevice, MemByteDevice};
    use ufs_ondisk::GeometryConfig;
    use ufs_types::{S_IFDIR, S_IFLNK, S_IFREG};

    fn small_geo() -> FsGeometry {
        let cfg = GeometryConfig {
            bsize: 4096,
            fsize: 512,
            fpg: 2048,
            ipg: 256,
            ..GeometryConfig::default()
        };
        FsGeometry::new(&cfg, 2 * 2048 * 512).unwrap()
    }

    fn mem_dev(geo: &FsGeometry) -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(MemByteDevice::new((geo.size * u64::from(geo.fsize)) as usize)).unwrap()
    }

    #[test]
    fn dinode_round_trips_through_the_table() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        let mut a = Inode {
            number: InodeNumber(17),
            din: new_dinode(S_IFREG | 0o644, 1000, 100, 42),
        };
        a.din.nlink = 1;
        a.din.size = 1500;
        a.din.db[0] = 400;
        a.store(&dev, &geo).unwrap();
        let b = Inode {
            number: InodeNumber(18),
            din: new_dinode(S_IFDIR | 0o755, 0, 0, 7),
        };
        b.store(&dev, &geo).unwrap();

        let back = Inode::load(&dev, &geo, InodeNumber(17)).unwrap();
        assert_eq!(back, a);
        assert!(Inode::load(&dev, &geo, InodeNumber(18)).unwrap().is_dir());
        // a different group's table is separate
        let other = read_dinode(&dev, &geo, InodeNumber(256 + 17)).unwrap();
        assert!(other.is_free());
    }

    #[test]
    fn out_of_range_inode_is_rejected() {
        let geo = small_geo();
        let dev = mem_dev(&geo);
        assert!(matches!(
            read_dinode(&dev, &geo, InodeNumber(512)),
            Err(UfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn block_counts_follow_size() {
        let geo = small_geo();
        let mut din = new_dinode(S_IFREG | 0o644, 0, 0, 1);
        assert_eq!(calc_num_blocks(&geo, &din), 0);
        din.size = 1500;
        assert_eq!(calc_num_blocks(&geo, &din), 3);
        din.size = 5000;
        assert_eq!(calc_num_blocks(&geo, &din), 10);
        din.size = 12 * 4096;
        assert_eq!(calc_num_blocks(&geo, &din), 96);
        // one byte into the single-indirect range: 13 data + 1 pointer block
        din.size = 12 * 4096 + 1;
        assert_eq!(calc_num_blocks(&geo, &din), 14 * 8);
        // one byte into the double-indirect range
        din.size = (12 + 512) * 4096 + 1;
        assert_eq!(calc_num_blocks(&geo, &din), (525 + 3) * 8);
    }

    #[test]
    fn short_symlink_occupies_nothing() {
        let geo = small_geo();
        let mut din = new_dinode(S_IFLNK | 0o777, 0, 0, 1);
        set_inline_target(&mut din, b"../target/file").unwrap();
        refresh_blocks(&geo, &mut din);
        assert_eq!(din.blocks, 0);
        assert_eq!(inline_target(&din).unwrap(), b"../target/file");
        let long = vec![b'x'; MAXSYMLINKLEN];
        assert!(set_inline_target(&mut din, &long).is_err());
    }

    #[test]
    fn io_size_trims_last_direct_block() {
        let geo = small_geo();
        assert_eq!(inode_io_size(&geo, 5000, 0), 4096);
        assert_eq!(inode_io_size(&geo, 5000, 4096), 1024);
        assert_eq!(inode_io_size(&geo, 5000, 5000), 0);
        assert_eq!(inode_io_size(&geo, 8192, 4096), 4096);
        let big = 20 * 4096 + 10;
        assert_eq!(inode_io_size(&geo, big, 20 * 4096), 4096);
    }

    #[test]
    fn touch_sets_selected_times() {
        let mut din = Ufs2Dinode::default();
        touch(&mut din, Touch::MODIFY);
        assert!(din.mtime > 0);
        assert_eq!(din.ctime, din.mtime);
        assert_eq!(din.atime, 0);
        touch(&mut din, Touch::ACCESS);
        assert!(din.atime > 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn block_count_is_monotonic_in_size(a in 0_u64..(600 * 4096), b in 0_u64..(600 * 4096)) {
            let geo = small_geo();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(frags_for_size(&geo, lo) <= frags_for_size(&geo, hi));
            prop_assert!(frags_for_size(&geo, hi) >= geo.numfrags(geo.fragroundup(hi)));
        }
    }
}

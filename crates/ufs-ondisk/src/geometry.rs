//! Filesystem geometry and unit conversions.
//!
//! Addresses inside the engine are fragment numbers ([`BlockNumber`]); the
//! device is addressed in `DEV_BSIZE` sectors ([`DiskAddr`]). Every group
//! has the same layout: superblock copy at `sblkno`, the cylinder-group block
//! at `cblkno`, the inode table at `iblkno`, and data from `dblkno` on.

use serde::{Deserialize, Serialize};
use ufs_error::{Result, UfsError};
use ufs_types::{
    BlockNumber, DADDR_SIZE, DEV_BSIZE, DINODE_SIZE, DiskAddr, GroupNumber, InodeNumber, MAXFRAG,
    NDADDR, SBLOCK_UFS2, SBLOCKSIZE, howmany,
};

use crate::cg::CG_HEADER_SIZE;

/// Longest cluster run tracked by `clustersum`.
pub const FS_MAXCONTIG: u32 = 16;

/// Tunables a formatter chooses; everything else is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Block size in bytes.
    pub bsize: u32,
    /// Fragment size in bytes.
    pub fsize: u32,
    /// Fragments per cylinder group.
    pub fpg: u32,
    /// Inodes per cylinder group.
    pub ipg: u32,
    /// Cluster accounting limit; 0 disables cluster maps.
    pub maxcontig: u32,
    /// Percentage of space held back from non-root users.
    pub minfree: u32,
    /// Expected average file size, feeds `dirpref`.
    pub avgfilesize: u32,
    /// Expected files per directory, feeds `dirpref`.
    pub avgfpdir: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            bsize: 8192,
            fsize: 1024,
            fpg: 8192,
            ipg: 2048,
            maxcontig: FS_MAXCONTIG,
            minfree: 8,
            avgfilesize: 16384,
            avgfpdir: 64,
        }
    }
}

/// Immutable filesystem geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGeometry {
    pub bsize: u32,
    pub fsize: u32,
    /// Fragments per block.
    pub frag: u32,
    /// Number of cylinder groups.
    pub ncg: u32,
    /// Inodes per group.
    pub ipg: u32,
    /// Fragments per group.
    pub fpg: u32,
    /// Total fragments in the filesystem.
    pub size: u64,
    /// Fragments available for data after metadata.
    pub dsize: u64,
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    /// Fragment address of the per-group summary array.
    pub csaddr: u64,
    /// Bytes of the per-group summary array.
    pub cssize: u32,
    /// Bytes of a cylinder-group block.
    pub cgsize: u32,
    /// Longest cluster run tracked, 0 when cluster accounting is off.
    pub contigsumsize: u32,
    pub minfree: u32,
    pub avgfilesize: u32,
    pub avgfpdir: u32,
    /// Shift converting fragments to device sectors.
    pub fsbtodb: u32,
    /// Block pointers per indirect block.
    pub nindir: u32,
    /// Inodes per block.
    pub inopb: u32,
}

impl FsGeometry {
    /// Derive a geometry for an image of `image_bytes` bytes.
    ///
    /// A trailing partial group too small to hold its own metadata plus one
    /// data block is dropped.
    pub fn new(cfg: &GeometryConfig, image_bytes: u64) -> Result<Self> {
        let bad = |msg: String| Err(UfsError::InvalidGeometry(msg));
        if !cfg.bsize.is_power_of_two() || !(4096..=65536).contains(&cfg.bsize) {
            return bad(format!("bsize={} must be a power of two in 4096..=65536", cfg.bsize));
        }
        if !cfg.fsize.is_power_of_two() || cfg.fsize < DEV_BSIZE || cfg.fsize > cfg.bsize {
            return bad(format!("fsize={} must be a power of two in 512..=bsize", cfg.fsize));
        }
        let frag = cfg.bsize / cfg.fsize;
        if frag as usize > MAXFRAG {
            return bad(format!("bsize/fsize={frag} exceeds {MAXFRAG}"));
        }
        let inopb = cfg.bsize / DINODE_SIZE as u32;
        if cfg.ipg == 0 || cfg.ipg % inopb != 0 || cfg.ipg % 8 != 0 {
            return bad(format!("ipg={} must be a non-zero multiple of {inopb} and 8", cfg.ipg));
        }
        if cfg.fpg == 0 || cfg.fpg % (frag * 8) != 0 {
            return bad(format!("fpg={} must be a non-zero multiple of {}", cfg.fpg, frag * 8));
        }
        let contigsumsize = cfg.maxcontig.min(FS_MAXCONTIG);

        let block_frags = |bytes: u64| howmany(bytes, u64::from(cfg.bsize)) * u64::from(frag);
        let sblkno = u32::try_from(SBLOCK_UFS2 / u64::from(cfg.fsize))
            .map_err(|_| UfsError::InvalidGeometry("sblkno overflows u32".into()))?;
        let cblkno = sblkno + u32::try_from(block_frags(u64::from(SBLOCKSIZE)))
            .map_err(|_| UfsError::InvalidGeometry("cblkno overflows u32".into()))?;
        let cgsize = cg_layout_size(cfg.ipg, cfg.fpg, frag, contigsumsize);
        if cgsize > cfg.bsize {
            return bad(format!("cylinder group needs {cgsize} bytes, block holds {}", cfg.bsize));
        }
        let iblkno = cblkno + frag;
        let dblkno = iblkno + (cfg.ipg / inopb) * frag;
        if dblkno + frag > cfg.fpg {
            return bad(format!("group metadata ({dblkno} frags) leaves no data in fpg={}", cfg.fpg));
        }

        let total_frags = image_bytes / u64::from(cfg.fsize);
        let full = total_frags / u64::from(cfg.fpg);
        let tail = total_frags % u64::from(cfg.fpg);
        let tail_blocks = tail / u64::from(frag);
        let mut ncg = full;
        let mut size = full * u64::from(cfg.fpg);
        if tail_blocks * u64::from(frag) >= u64::from(dblkno + frag) {
            ncg += 1;
            size += tail_blocks * u64::from(frag);
        }
        if ncg == 0 {
            return bad(format!("image of {image_bytes} bytes holds no complete group"));
        }
        let ncg = u32::try_from(ncg)
            .map_err(|_| UfsError::InvalidGeometry("group count overflows u32".into()))?;
        let cssize = ncg * crate::cg::CSUM_SIZE as u32;
        let cs_frags = block_frags(u64::from(cssize));
        let dsize = size - u64::from(ncg) * u64::from(dblkno) - cs_frags;

        Ok(Self {
            bsize: cfg.bsize,
            fsize: cfg.fsize,
            frag,
            ncg,
            ipg: cfg.ipg,
            fpg: cfg.fpg,
            size,
            dsize,
            sblkno,
            cblkno,
            iblkno,
            dblkno,
            csaddr: u64::from(dblkno),
            cssize,
            cgsize,
            contigsumsize,
            minfree: cfg.minfree,
            avgfilesize: cfg.avgfilesize,
            avgfpdir: cfg.avgfpdir,
            fsbtodb: (cfg.fsize / DEV_BSIZE).trailing_zeros(),
            nindir: cfg.bsize / DADDR_SIZE,
            inopb,
        })
    }

    // ── Shifts and masks ────────────────────────────────────────────────

    #[must_use]
    pub fn bshift(&self) -> u32 {
        self.bsize.trailing_zeros()
    }

    #[must_use]
    pub fn fshift(&self) -> u32 {
        self.fsize.trailing_zeros()
    }

    #[must_use]
    pub fn fragshift(&self) -> u32 {
        self.frag.trailing_zeros()
    }

    // ── Address conversions ─────────────────────────────────────────────

    /// Fragment address to device sector.
    #[must_use]
    pub fn fsbtodb(&self, bno: BlockNumber) -> DiskAddr {
        DiskAddr(bno.0 << self.fsbtodb)
    }

    /// First fragment of a group.
    #[must_use]
    pub fn cgbase(&self, cg: GroupNumber) -> u64 {
        u64::from(self.fpg) * u64::from(cg.0)
    }

    /// Fragment address of a group's cylinder-group block.
    #[must_use]
    pub fn cgtod(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(self.cgbase(cg) + u64::from(self.cblkno))
    }

    /// Fragment address of a group's inode table.
    #[must_use]
    pub fn cgimin(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(self.cgbase(cg) + u64::from(self.iblkno))
    }

    /// First data fragment of a group.
    #[must_use]
    pub fn cgdmin(&self, cg: GroupNumber) -> BlockNumber {
        BlockNumber(self.cgbase(cg) + u64::from(self.dblkno))
    }

    /// Group containing a fragment.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn dtog(&self, bno: BlockNumber) -> GroupNumber {
        // ncg is a u32, so the quotient fits.
        GroupNumber((bno.0 / u64::from(self.fpg)) as u32)
    }

    /// Fragment offset within its group.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn dtogd(&self, bno: BlockNumber) -> u32 {
        (bno.0 % u64::from(self.fpg)) as u32
    }

    /// Number of fragments actually present in a group (the last may be short).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn frags_in_group(&self, cg: GroupNumber) -> u32 {
        let base = self.cgbase(cg);
        (self.size.saturating_sub(base)).min(u64::from(self.fpg)) as u32
    }

    /// Total inodes (`ncg * ipg`).
    #[must_use]
    pub fn max_inodes(&self) -> u64 {
        u64::from(self.ncg) * u64::from(self.ipg)
    }

    /// First inode number of a group.
    #[must_use]
    pub fn cg_first_inode(&self, cg: GroupNumber) -> u64 {
        u64::from(self.ipg) * u64::from(cg.0)
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn ino_to_cg(&self, ino: InodeNumber) -> GroupNumber {
        GroupNumber((ino.0 / u64::from(self.ipg)) as u32)
    }

    /// Fragment address of the inode-table block holding `ino`.
    #[must_use]
    pub fn ino_to_fsba(&self, ino: InodeNumber) -> BlockNumber {
        let cg = self.ino_to_cg(ino);
        let in_group = ino.0 % u64::from(self.ipg);
        BlockNumber(self.cgimin(cg).0 + self.blkstofrags(in_group / u64::from(self.inopb)))
    }

    /// Byte offset of `ino` inside its inode-table block.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn ino_to_fsbo(&self, ino: InodeNumber) -> usize {
        (ino.0 % u64::from(self.inopb)) as usize * DINODE_SIZE
    }

    // ── Size arithmetic ─────────────────────────────────────────────────

    #[must_use]
    pub fn blkstofrags(&self, blocks: u64) -> u64 {
        blocks << self.fragshift()
    }

    #[must_use]
    pub fn fragstoblks(&self, frags: u64) -> u64 {
        frags >> self.fragshift()
    }

    /// Bytes to whole fragments (truncating).
    #[must_use]
    pub fn numfrags(&self, bytes: u64) -> u64 {
        bytes >> self.fshift()
    }

    #[must_use]
    pub fn fragroundup(&self, bytes: u64) -> u64 {
        let mask = u64::from(self.fsize) - 1;
        (bytes + mask) & !mask
    }

    #[must_use]
    pub fn blkroundup(&self, bytes: u64) -> u64 {
        let mask = u64::from(self.bsize) - 1;
        (bytes + mask) & !mask
    }

    /// Logical block containing byte `offset`.
    #[must_use]
    pub fn lblkno(&self, offset: u64) -> u64 {
        offset >> self.bshift()
    }

    /// Byte offset within its logical block.
    #[must_use]
    pub fn blkoff(&self, offset: u64) -> u64 {
        offset & (u64::from(self.bsize) - 1)
    }

    #[must_use]
    pub fn lblktosize(&self, lbn: u64) -> u64 {
        lbn << self.bshift()
    }

    /// Round a fragment address down to its block.
    #[must_use]
    pub fn blknum(&self, bno: BlockNumber) -> BlockNumber {
        BlockNumber(bno.0 & !(u64::from(self.frag) - 1))
    }

    /// Fragment index within its block.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn fragnum(&self, bno: BlockNumber) -> u32 {
        (bno.0 & (u64::from(self.frag) - 1)) as u32
    }

    /// Allocation size of logical block `lbn` in a file of `file_size`
    /// bytes: a whole block unless it is the last block and lies in the
    /// direct range, in which case only the fragments in use.
    #[must_use]
    pub fn sblksize(&self, file_size: u64, lbn: u64) -> u32 {
        if lbn >= NDADDR as u64 || file_size >= self.lblktosize(lbn + 1) {
            self.bsize
        } else {
            #[expect(clippy::cast_possible_truncation)]
            let tail = self.fragroundup(self.blkoff(file_size)) as u32;
            tail
        }
    }

    /// Bytes read or written for one cylinder-group block.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn cg_io_size(&self) -> usize {
        self.fragroundup(u64::from(self.cgsize)) as usize
    }

    /// Fragments reserved for the summary array in group 0.
    #[must_use]
    pub fn cs_frags(&self) -> u64 {
        self.blkstofrags(howmany(u64::from(self.cssize), u64::from(self.bsize)))
    }
}

/// Bytes a cylinder-group block needs for the given parameters, following
/// the map layout `newfs` produces.
#[must_use]
pub fn cg_layout_size(ipg: u32, fpg: u32, frag: u32, contigsumsize: u32) -> u32 {
    let iusedoff = CG_HEADER_SIZE as u32;
    let freeoff = iusedoff + ipg.div_ceil(8);
    let mut nextfree = freeoff + fpg.div_ceil(8);
    if contigsumsize > 0 {
        let clustersumoff = nextfree.next_multiple_of(4) - 4;
        let clusteroff = clustersumoff + (contigsumsize + 1) * 4;
        nextfree = clusteroff + (fpg / frag).div_ceil(8);
    }
    nextfree
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn small_config() -> GeometryConfig {
        GeometryConfig {
            bsize: 4096,
            fsize: 512,
            fpg: 2048,
            ipg: 256,
            ..GeometryConfig::default()
        }
    }

    #[test]
    fn derives_layout_for_small_groups() {
        let geo = FsGeometry::new(&small_config(), 4 * 2048 * 512).unwrap();
        assert_eq!(geo.frag, 8);
        assert_eq!(geo.ncg, 4);
        assert_eq!(geo.inopb, 16);
        assert_eq!(geo.nindir, 512);
        assert_eq!(geo.sblkno, 128);
        assert_eq!(geo.cblkno, 144);
        assert_eq!(geo.iblkno, 152);
        assert_eq!(geo.dblkno, 280);
        assert_eq!(geo.fsbtodb, 0);
        assert_eq!(geo.size, 4 * 2048);
        assert_eq!(geo.csaddr, 280);
        assert_eq!(geo.cs_frags(), 8);
    }

    #[test]
    fn conversions_match_ffs_macros() {
        let geo = FsGeometry::new(&GeometryConfig::default(), 64 << 20).unwrap();
        assert_eq!(geo.fsbtodb(BlockNumber(10)), DiskAddr(20));
        assert_eq!(geo.dtog(BlockNumber(8192 + 17)), GroupNumber(1));
        assert_eq!(geo.dtogd(BlockNumber(8192 + 17)), 17);
        assert_eq!(geo.blknum(BlockNumber(21)), BlockNumber(16));
        assert_eq!(geo.fragnum(BlockNumber(21)), 5);
        assert_eq!(geo.numfrags(3000), 2);
        assert_eq!(geo.fragroundup(3000), 3072);
        assert_eq!(geo.lblkno(8192 * 3 + 1), 3);
        assert_eq!(geo.blkoff(8192 * 3 + 1), 1);
        assert_eq!(geo.ino_to_cg(InodeNumber(2049)), GroupNumber(1));
        let per_block = u64::from(geo.inopb);
        assert_eq!(
            geo.ino_to_fsba(InodeNumber(2048 + per_block + 1)),
            BlockNumber(8192 + u64::from(geo.iblkno) + 8)
        );
        assert_eq!(geo.ino_to_fsbo(InodeNumber(per_block + 3)), 3 * 256);
    }

    #[test]
    fn sblksize_uses_fragments_only_for_last_direct_block() {
        let geo = FsGeometry::new(&small_config(), 4 * 2048 * 512).unwrap();
        assert_eq!(geo.sblksize(5000, 0), 4096);
        assert_eq!(geo.sblksize(5000, 1), 1024);
        assert_eq!(geo.sblksize(4096 * 20 + 10, 19), 4096);
        assert_eq!(geo.sblksize(4096 * 20 + 10, 20), 4096);
    }

    #[test]
    fn drops_short_trailing_group() {
        let geo = FsGeometry::new(&small_config(), (2 * 2048 + 100) * 512).unwrap();
        assert_eq!(geo.ncg, 2);
        let geo = FsGeometry::new(&small_config(), (2 * 2048 + 1024) * 512).unwrap();
        assert_eq!(geo.ncg, 3);
        assert_eq!(geo.frags_in_group(GroupNumber(2)), 1024);
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut cfg = small_config();
        cfg.fsize = 256;
        assert!(FsGeometry::new(&cfg, 1 << 22).is_err());
        let mut cfg = small_config();
        cfg.ipg = 100;
        assert!(FsGeometry::new(&cfg, 1 << 22).is_err());
        let mut cfg = small_config();
        cfg.fpg = 300;
        assert!(FsGeometry::new(&cfg, 1 << 22).is_err());
        assert!(FsGeometry::new(&small_config(), 4096).is_err());
    }

    #[test]
    fn geometry_serializes_as_json() {
        let geo = FsGeometry::new(&small_config(), 4 * 2048 * 512).unwrap();
        let json = serde_json::to_string(&geo).unwrap();
        let back: FsGeometry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, geo);
        let cfg: GeometryConfig = serde_json::from_str(r#"{"bsize": 4096}"#).unwrap();
        assert_eq!(cfg.fsize, 1024);
    }
}

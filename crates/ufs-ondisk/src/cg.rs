//! Cylinder-group block (`struct cg`, UFS2 layout).
//!
//! The block is kept as raw bytes and accessed in place: the header fields
//! sit at fixed offsets and the maps at offsets recorded in the header, so
//! a parsed group serializes back bit-for-bit.

use serde::{Deserialize, Serialize};
use ufs_types::{
    CG_MAGIC, GroupNumber, MAXFRAG, ParseError, read_le_i32, read_le_i64, read_le_u32,
    write_le_i32, write_le_i64,
};

use crate::geometry::FsGeometry;

/// Size of the fixed header; maps start right after it.
pub const CG_HEADER_SIZE: usize = 168;
/// Size of one `struct csum` entry in the summary array.
pub const CSUM_SIZE: usize = 16;

const OFF_MAGIC: usize = 4;
const OFF_OLD_TIME: usize = 8;
const OFF_CGX: usize = 12;
const OFF_NDBLK: usize = 20;
const OFF_CS: usize = 24;
const OFF_ROTOR: usize = 40;
const OFF_FROTOR: usize = 44;
const OFF_IROTOR: usize = 48;
const OFF_FRSUM: usize = 52;
const OFF_IUSEDOFF: usize = 92;
const OFF_FREEOFF: usize = 96;
const OFF_NEXTFREEOFF: usize = 100;
const OFF_CLUSTERSUMOFF: usize = 104;
const OFF_CLUSTEROFF: usize = 108;
const OFF_NCLUSTERBLKS: usize = 112;
const OFF_NIBLK: usize = 116;
const OFF_INITEDIBLK: usize = 120;
const OFF_TIME: usize = 136;

/// Per-group free counts (`struct csum`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgSummary {
    pub ndir: i32,
    pub nbfree: i32,
    pub nifree: i32,
    pub nffree: i32,
}

impl CgSummary {
    /// Decode a 16-byte `struct csum`.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ndir: read_le_i32(bytes, offset)?,
            nbfree: read_le_i32(bytes, offset + 4)?,
            nifree: read_le_i32(bytes, offset + 8)?,
            nffree: read_le_i32(bytes, offset + 12)?,
        })
    }

    pub fn write(&self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_i32(bytes, offset, self.ndir)?;
        write_le_i32(bytes, offset + 4, self.nbfree)?;
        write_le_i32(bytes, offset + 8, self.nifree)?;
        write_le_i32(bytes, offset + 12, self.nffree)
    }
}

/// One cylinder-group block held in memory for a read-modify-write cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CylinderGroup {
    buf: Vec<u8>,
    iusedoff: usize,
    freeoff: usize,
    clustersumoff: usize,
    clusteroff: usize,
    ipg: u32,
    fpg: u32,
    contigsumsize: u32,
}

impl CylinderGroup {
    /// Validate and wrap a cylinder-group block read from disk.
    pub fn parse(buf: Vec<u8>, geo: &FsGeometry, cg: GroupNumber) -> Result<Self, ParseError> {
        if buf.len() < CG_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: CG_HEADER_SIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        let magic = read_le_u32(&buf, OFF_MAGIC)?;
        if magic != CG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(CG_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_le_u32(&buf, OFF_CGX)? != cg.0 {
            return Err(ParseError::InvalidField {
                field: "cg_cgx",
                reason: "group index does not match block location",
            });
        }
        let off = |at: usize| -> Result<usize, ParseError> {
            usize::try_from(read_le_u32(&buf, at)?)
                .map_err(|_| ParseError::IntegerConversion { field: "cg map offset" })
        };
        let group = Self {
            iusedoff: off(OFF_IUSEDOFF)?,
            freeoff: off(OFF_FREEOFF)?,
            clustersumoff: off(OFF_CLUSTERSUMOFF)?,
            clusteroff: off(OFF_CLUSTEROFF)?,
            ipg: geo.ipg,
            fpg: geo.fpg,
            contigsumsize: geo.contigsumsize,
            buf,
        };
        group.check_map(group.iusedoff, geo.ipg.div_ceil(8), "cg_iusedoff")?;
        group.check_map(group.freeoff, geo.fpg.div_ceil(8), "cg_freeoff")?;
        if geo.contigsumsize > 0 {
            group.check_map(group.clustersumoff, (geo.contigsumsize + 1) * 4, "cg_clustersumoff")?;
            group.check_map(group.clusteroff, (geo.fpg / geo.frag).div_ceil(8), "cg_clusteroff")?;
        }
        Ok(group)
    }

    fn check_map(&self, offset: usize, len: u32, field: &'static str) -> Result<(), ParseError> {
        let end = offset.checked_add(len as usize);
        if offset < CG_HEADER_SIZE - 4 || end.is_none_or(|end| end > self.buf.len()) {
            return Err(ParseError::InvalidField {
                field,
                reason: "map lies outside the cylinder-group block",
            });
        }
        Ok(())
    }

    /// A freshly laid out group with every fragment and inode marked in
    /// use; the formatter frees what is available.
    #[must_use]
    pub fn new_empty(geo: &FsGeometry, cg: GroupNumber, now: i64) -> Self {
        let mut buf = vec![0_u8; geo.cg_io_size()];
        let ndblk = geo.frags_in_group(cg);
        let iusedoff = CG_HEADER_SIZE;
        let freeoff = iusedoff + geo.ipg.div_ceil(8) as usize;
        let mut nextfreeoff = freeoff + geo.fpg.div_ceil(8) as usize;
        let (mut clustersumoff, mut clusteroff) = (0, 0);
        if geo.contigsumsize > 0 {
            clustersumoff = nextfreeoff.next_multiple_of(4) - 4;
            clusteroff = clustersumoff + (geo.contigsumsize as usize + 1) * 4;
            nextfreeoff = clusteroff + (geo.fpg / geo.frag).div_ceil(8) as usize;
        }
        let fields: [(usize, u32); 12] = [
            (OFF_MAGIC, CG_MAGIC),
            (OFF_CGX, cg.0),
            (OFF_NDBLK, ndblk),
            (OFF_IUSEDOFF, offset_u32(iusedoff)),
            (OFF_FREEOFF, offset_u32(freeoff)),
            (OFF_NEXTFREEOFF, offset_u32(nextfreeoff)),
            (OFF_CLUSTERSUMOFF, offset_u32(clustersumoff)),
            (OFF_CLUSTEROFF, offset_u32(clusteroff)),
            (OFF_NCLUSTERBLKS, ndblk / geo.frag),
            (OFF_NIBLK, geo.ipg),
            (OFF_INITEDIBLK, geo.ipg),
            (OFF_OLD_TIME, 0),
        ];
        for (at, value) in fields {
            buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
        buf[OFF_TIME..OFF_TIME + 8].copy_from_slice(&now.to_le_bytes());
        Self {
            buf,
            iusedoff,
            freeoff,
            clustersumoff,
            clusteroff,
            ipg: geo.ipg,
            fpg: geo.fpg,
            contigsumsize: geo.contigsumsize,
        }
    }

    /// Raw block contents, ready to be written back.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── Header fields ───────────────────────────────────────────────────

    fn u32_at(&self, at: usize) -> u32 {
        let b = &self.buf[at..at + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn set_u32_at(&mut self, at: usize, value: u32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn magic(&self) -> u32 {
        self.u32_at(OFF_MAGIC)
    }

    #[must_use]
    pub fn cgx(&self) -> GroupNumber {
        GroupNumber(self.u32_at(OFF_CGX))
    }

    /// Fragments in this group.
    #[must_use]
    pub fn ndblk(&self) -> u32 {
        self.u32_at(OFF_NDBLK)
    }

    #[must_use]
    pub fn nclusterblks(&self) -> u32 {
        self.u32_at(OFF_NCLUSTERBLKS)
    }

    #[must_use]
    pub fn initediblk(&self) -> u32 {
        self.u32_at(OFF_INITEDIBLK)
    }

    pub fn set_initediblk(&mut self, value: u32) {
        self.set_u32_at(OFF_INITEDIBLK, value);
    }

    #[must_use]
    pub fn time(&self) -> i64 {
        read_le_i64(&self.buf, OFF_TIME).unwrap_or_default()
    }

    pub fn set_time(&mut self, now: i64) {
        // Header length was validated at parse time.
        let _ = write_le_i64(&mut self.buf, OFF_TIME, now);
    }

    #[must_use]
    pub fn summary(&self) -> CgSummary {
        CgSummary::parse(&self.buf, OFF_CS).unwrap_or_default()
    }

    pub fn set_summary(&mut self, cs: CgSummary) {
        let _ = cs.write(&mut self.buf, OFF_CS);
    }

    /// Next block search position (fragment offset in group).
    #[must_use]
    pub fn rotor(&self) -> u32 {
        self.u32_at(OFF_ROTOR)
    }

    pub fn set_rotor(&mut self, value: u32) {
        self.set_u32_at(OFF_ROTOR, value);
    }

    /// Next fragment search position.
    #[must_use]
    pub fn frotor(&self) -> u32 {
        self.u32_at(OFF_FROTOR)
    }

    pub fn set_frotor(&mut self, value: u32) {
        self.set_u32_at(OFF_FROTOR, value);
    }

    /// Next inode search position.
    #[must_use]
    pub fn irotor(&self) -> u32 {
        self.u32_at(OFF_IROTOR)
    }

    pub fn set_irotor(&mut self, value: u32) {
        self.set_u32_at(OFF_IROTOR, value);
    }

    // ── Histograms ──────────────────────────────────────────────────────

    /// Count of free fragment runs of exactly `size` fragments.
    #[must_use]
    pub fn frsum(&self, size: usize) -> i32 {
        debug_assert!(size < MAXFRAG);
        i32::from_le_bytes(self.u32_at(OFF_FRSUM + size * 4).to_le_bytes())
    }

    pub fn adjust_frsum(&mut self, size: usize, delta: i32) {
        let value = self.frsum(size) + delta;
        self.set_u32_at(OFF_FRSUM + size * 4, u32::from_le_bytes(value.to_le_bytes()));
    }

    /// Count of free cluster runs of length `len` (the last bucket
    /// collects runs of `contigsumsize` and longer).
    #[must_use]
    pub fn clustersum(&self, len: usize) -> i32 {
        if self.contigsumsize == 0 {
            return 0;
        }
        i32::from_le_bytes(self.u32_at(self.clustersumoff + len * 4).to_le_bytes())
    }

    pub fn adjust_clustersum(&mut self, len: usize, delta: i32) {
        if self.contigsumsize == 0 {
            return;
        }
        let value = self.clustersum(len) + delta;
        let at = self.clustersumoff + len * 4;
        self.set_u32_at(at, u32::from_le_bytes(value.to_le_bytes()));
    }

    #[must_use]
    pub fn has_clusters(&self) -> bool {
        self.contigsumsize > 0
    }

    // ── Maps ────────────────────────────────────────────────────────────

    /// Inode-used bitmap, one bit per inode.
    #[must_use]
    pub fn inosused(&self) -> &[u8] {
        &self.buf[self.iusedoff..self.iusedoff + self.ipg.div_ceil(8) as usize]
    }

    pub fn inosused_mut(&mut self) -> &mut [u8] {
        let len = self.ipg.div_ceil(8) as usize;
        &mut self.buf[self.iusedoff..self.iusedoff + len]
    }

    /// Free-fragment bitmap, a set bit is a free fragment.
    #[must_use]
    pub fn blksfree(&self) -> &[u8] {
        &self.buf[self.freeoff..self.freeoff + self.fpg.div_ceil(8) as usize]
    }

    pub fn blksfree_mut(&mut self) -> &mut [u8] {
        let len = self.fpg.div_ceil(8) as usize;
        &mut self.buf[self.freeoff..self.freeoff + len]
    }

    /// Free-cluster bitmap, one bit per block; empty when clusters are off.
    #[must_use]
    pub fn clustersfree(&self) -> &[u8] {
        if self.contigsumsize == 0 {
            return &[];
        }
        let len = self.cluster_map_len();
        &self.buf[self.clusteroff..self.clusteroff + len]
    }

    pub fn clustersfree_mut(&mut self) -> &mut [u8] {
        if self.contigsumsize == 0 {
            return &mut [];
        }
        let len = self.cluster_map_len();
        &mut self.buf[self.clusteroff..self.clusteroff + len]
    }

    fn cluster_map_len(&self) -> usize {
        let blocks = self.nclusterblks().max(1);
        blocks.div_ceil(8) as usize
    }
}

#[expect(clippy::cast_possible_truncation)]
const fn offset_u32(offset: usize) -> u32 {
    // Offsets are bounded by the block size.
    offset as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryConfig;
    use ufs_types::write_le_u32;

    fn geo() -> FsGeometry {
        let cfg = GeometryConfig {
            bsize: 4096,
            fsize: 512,
            fpg: 2048,
            ipg: 256,
            ..GeometryConfig::default()
        };
        FsGeometry::new(&cfg, 4 * 2048 * 512).unwrap()
    }

    #[test]
    fn empty_group_round_trips_through_parse() {
        let geo = geo();
        let mut cg = CylinderGroup::new_empty(&geo, GroupNumber(2), 1_700_000_000);
        cg.set_summary(CgSummary {
            ndir: 1,
            nbfree: 200,
            nifree: 250,
            nffree: 3,
        });
        cg.adjust_frsum(3, 1);
        cg.set_rotor(64);
        cg.blksfree_mut()[40] = 0xFF;
        cg.inosused_mut()[0] = 0b0000_0111;

        let bytes = cg.as_bytes().to_vec();
        let parsed = CylinderGroup::parse(bytes.clone(), &geo, GroupNumber(2)).unwrap();
        assert_eq!(parsed.as_bytes(), bytes.as_slice());
        assert_eq!(parsed.magic(), CG_MAGIC);
        assert_eq!(parsed.cgx(), GroupNumber(2));
        assert_eq!(parsed.summary().nbfree, 200);
        assert_eq!(parsed.frsum(3), 1);
        assert_eq!(parsed.rotor(), 64);
        assert_eq!(parsed.blksfree()[40], 0xFF);
        assert_eq!(parsed.inosused()[0], 7);
        assert_eq!(parsed.time(), 1_700_000_000);
        assert_eq!(parsed.ndblk(), 2048);
        assert_eq!(parsed.nclusterblks(), 256);
    }

    #[test]
    fn header_fields_sit_at_ufs2_offsets() {
        let geo = geo();
        let cg = CylinderGroup::new_empty(&geo, GroupNumber(1), 0);
        let bytes = cg.as_bytes();
        assert_eq!(read_le_u32(bytes, 4).unwrap(), 0x0009_0255);
        assert_eq!(read_le_u32(bytes, 12).unwrap(), 1);
        assert_eq!(read_le_u32(bytes, 92).unwrap(), 168);
        assert_eq!(read_le_u32(bytes, 96).unwrap(), 168 + 32);
        // clustersum is based one slot early: index 0 is never used.
        assert_eq!(read_le_u32(bytes, 104).unwrap(), 452);
        assert_eq!(read_le_u32(bytes, 108).unwrap(), 452 + 17 * 4);
    }

    #[test]
    fn rejects_bad_magic_and_wrong_group() {
        let geo = geo();
        let cg = CylinderGroup::new_empty(&geo, GroupNumber(0), 0);
        let mut bytes = cg.as_bytes().to_vec();
        assert!(matches!(
            CylinderGroup::parse(bytes.clone(), &geo, GroupNumber(1)),
            Err(ParseError::InvalidField { field: "cg_cgx", .. })
        ));
        bytes[4] = 0;
        assert!(matches!(
            CylinderGroup::parse(bytes, &geo, GroupNumber(0)),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn rejects_maps_outside_block() {
        let geo = geo();
        let cg = CylinderGroup::new_empty(&geo, GroupNumber(0), 0);
        let mut bytes = cg.as_bytes().to_vec();
        write_le_u32(&mut bytes, OFF_FREEOFF, 4000).unwrap();
        assert!(CylinderGroup::parse(bytes, &geo, GroupNumber(0)).is_err());
    }

    #[test]
    fn summary_entry_codec() {
        let mut buf = [0_u8; 32];
        let cs = CgSummary {
            ndir: 2,
            nbfree: -1,
            nifree: 7,
            nffree: 9,
        };
        cs.write(&mut buf, 16).unwrap();
        assert_eq!(CgSummary::parse(&buf, 16).unwrap(), cs);
    }
}

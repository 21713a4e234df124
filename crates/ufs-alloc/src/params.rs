//! Mounted-filesystem parameters: geometry plus the mutable counters the
//! allocator keeps in step with the cylinder-group headers.

use tracing::{debug, warn};
use ufs_block::BlockDevice;
use ufs_error::{Result, UfsError};
use ufs_ondisk::cg::CSUM_SIZE;
use ufs_ondisk::{CgSummary, CylinderGroup, FsGeometry, parse_to_ufs_error};
use ufs_types::GroupNumber;

use crate::bitmap::{isblock, isset};

/// Geometry, aggregate and per-group counters, and the two per-group
/// placement heuristics.
#[derive(Debug, Clone)]
pub struct FsParams {
    pub geo: FsGeometry,
    /// Filesystem-wide totals; always the sum of `cs`.
    pub cstotal: CgSummary,
    /// Per-group counters mirrored from each cylinder-group header.
    pub cs: Vec<CgSummary>,
    /// Longest free cluster per group, in blocks.
    pub maxcluster: Vec<i32>,
    /// Directories created back to back in a group without an
    /// intervening file.
    pub contigdirs: Vec<u8>,
    pub read_only: bool,
}

impl FsParams {
    /// Parameters for a geometry whose groups are all empty.
    #[must_use]
    pub fn new(geo: FsGeometry) -> Self {
        let ncg = geo.ncg as usize;
        Self {
            geo,
            cstotal: CgSummary::default(),
            cs: vec![CgSummary::default(); ncg],
            maxcluster: vec![0; ncg],
            contigdirs: vec![0; ncg],
            read_only: false,
        }
    }

    /// Rebuild the in-memory counters from the cylinder-group headers of a
    /// mounted image, checking each header against its own bitmaps.
    pub fn load(dev: &dyn BlockDevice, geo: FsGeometry) -> Result<Self> {
        let mut params = Self::new(geo);
        for cgx in 0..params.geo.ncg {
            let cg = GroupNumber(cgx);
            let group = read_group(dev, &params.geo, cg)?;
            let header = group.summary();
            let counted = recount(&params.geo, &group);
            if counted != header {
                warn!(cg = cgx, ?header, ?counted, "cg_summary_mismatch");
                return Err(UfsError::corruption(
                    params.geo.cgtod(cg).0,
                    format!("group {cgx} free counts disagree with its bitmaps"),
                ));
            }
            params.maxcluster[cgx as usize] = longest_cluster(&params.geo, &group);
            params.cs[cgx as usize] = header;
            add_summary(&mut params.cstotal, &header, 1);
        }
        debug!(
            ncg = params.geo.ncg,
            nbfree = params.cstotal.nbfree,
            nffree = params.cstotal.nffree,
            nifree = params.cstotal.nifree,
            ndir = params.cstotal.ndir,
            "fs_params_loaded"
        );
        Ok(params)
    }

    /// Write the per-group summary array to its reserved blocks.
    pub fn write_summaries(&self, dev: &dyn BlockDevice) -> Result<()> {
        let len = usize::try_from(self.geo.cs_frags() * u64::from(self.geo.fsize))
            .map_err(|_| UfsError::InvalidGeometry("summary area too large".into()))?;
        let mut buf = vec![0_u8; len];
        for (i, cs) in self.cs.iter().enumerate() {
            cs.write(&mut buf, i * CSUM_SIZE)
                .map_err(|e| parse_to_ufs_error(&e, self.geo.csaddr))?;
        }
        dev.write_block(self.geo.fsbtodb(ufs_types::BlockNumber(self.geo.csaddr)), &buf)
    }

    /// Apply one counter change to the group header, the per-group mirror
    /// and the totals together.
    pub(crate) fn account(&mut self, group: &mut CylinderGroup, change: impl Fn(&mut CgSummary)) {
        let mut header = group.summary();
        change(&mut header);
        group.set_summary(header);
        change(&mut self.cstotal);
        if let Some(cs) = self.cs.get_mut(group.cgx().0 as usize) {
            change(cs);
        }
    }

    /// Sum of the per-group counters; equals `cstotal` between calls.
    #[must_use]
    pub fn summed(&self) -> CgSummary {
        let mut total = CgSummary::default();
        for cs in &self.cs {
            add_summary(&mut total, cs, 1);
        }
        total
    }

    /// Free space in bytes, counting whole blocks and loose fragments.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let frags = i64::from(self.cstotal.nbfree) * i64::from(self.geo.frag)
            + i64::from(self.cstotal.nffree);
        u64::try_from(frags).unwrap_or(0) * u64::from(self.geo.fsize)
    }

    pub(crate) fn summary_of(&self, cg: GroupNumber) -> CgSummary {
        self.cs.get(cg.0 as usize).copied().unwrap_or_default()
    }
}

fn add_summary(total: &mut CgSummary, cs: &CgSummary, sign: i32) {
    total.ndir += sign * cs.ndir;
    total.nbfree += sign * cs.nbfree;
    total.nifree += sign * cs.nifree;
    total.nffree += sign * cs.nffree;
}

// ── Group I/O ───────────────────────────────────────────────────────────────

/// Read and validate a group's cylinder-group block. A bad magic or a
/// group index that does not match is `Corruption`.
pub fn read_group(dev: &dyn BlockDevice, geo: &FsGeometry, cg: GroupNumber) -> Result<CylinderGroup> {
    let at = geo.cgtod(cg);
    let mut buf = vec![0_u8; geo.cg_io_size()];
    dev.read_block(geo.fsbtodb(at), &mut buf)?;
    CylinderGroup::parse(buf, geo, cg).map_err(|e| parse_to_ufs_error(&e, at.0))
}

pub fn write_group(dev: &dyn BlockDevice, geo: &FsGeometry, group: &CylinderGroup) -> Result<()> {
    dev.write_block(geo.fsbtodb(geo.cgtod(group.cgx())), group.as_bytes())
}

/// Count free blocks, loose fragments and free inodes from a group's
/// bitmaps. `ndir` is taken from the header since no bitmap records it.
#[must_use]
pub fn recount(geo: &FsGeometry, group: &CylinderGroup) -> CgSummary {
    let map = group.blksfree();
    let ndblk = group.ndblk();
    let mut nbfree = 0;
    let mut nffree = 0;
    let mut frag = 0;
    while frag < ndblk {
        let block = frag / geo.frag;
        if frag + geo.frag <= ndblk && isblock(geo.frag, map, block) {
            nbfree += 1;
        } else {
            let end = (frag + geo.frag).min(ndblk);
            nffree += (frag..end).filter(|f| isset(map, *f)).count();
        }
        frag += geo.frag;
    }
    let used = (0..geo.ipg).filter(|i| isset(group.inosused(), *i)).count();
    let as_i32 = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);
    CgSummary {
        ndir: group.summary().ndir,
        nbfree: as_i32(nbfree),
        nifree: as_i32(geo.ipg as usize - used),
        nffree: as_i32(nffree),
    }
}

/// Longest cluster bucket with a free run, 0 when none or when cluster
/// accounting is off.
#[must_use]
pub fn longest_cluster(geo: &FsGeometry, group: &CylinderGroup) -> i32 {
    if !group.has_clusters() {
        return 0;
    }
    (1..=geo.contigsumsize as usize)
        .rev()
        .find(|len| group.clustersum(*len) > 0)
        .map_or(0, |len| i32::try_from(len).unwrap_or(0))
}

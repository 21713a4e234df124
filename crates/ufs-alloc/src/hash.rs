//! Cross-group allocation policy.
//!
//! `hashalloc` probes the preferred group, then groups at power-of-two
//! offsets, then every remaining group. `dirpref` spreads directories
//! across groups; files stay near their parent.

use tracing::{debug, trace};
use ufs_block::BlockDevice;
use ufs_error::{Result, UfsError};
use ufs_types::{BlockNumber, GroupNumber, InodeNumber, S_IFDIR, S_IFMT};

use crate::group::{alloc_in_group, alloc_inode_in_group};
use crate::params::FsParams;

/// Run `allocator` over the groups in hashed order until one returns
/// `Some`. The first probe gets `pref`; later probes get 0. An error from
/// any probe ends the search.
pub fn hashalloc<T>(
    ncg: u32,
    cg: GroupNumber,
    pref: u64,
    mut allocator: impl FnMut(GroupNumber, u64) -> Result<Option<T>>,
) -> Result<Option<T>> {
    if ncg == 0 {
        return Ok(None);
    }
    let icg = cg.0 % ncg;
    if let Some(found) = allocator(GroupNumber(icg), pref)? {
        return Ok(Some(found));
    }

    // quadratic rehash
    let mut cg = icg;
    let mut step = 1;
    while step < ncg {
        cg += step;
        if cg >= ncg {
            cg -= ncg;
        }
        if let Some(found) = allocator(GroupNumber(cg), 0)? {
            return Ok(Some(found));
        }
        step *= 2;
    }

    // brute force; offsets 0 and 1 were covered above
    let mut cg = (icg + 2) % ncg;
    for _ in 2..ncg {
        if let Some(found) = allocator(GroupNumber(cg), 0)? {
            return Ok(Some(found));
        }
        cg += 1;
        if cg == ncg {
            cg = 0;
        }
    }
    Ok(None)
}

/// Allocate `size` bytes of disk for inode `ino`.
///
/// `size` must be a non-zero multiple of the fragment size no larger than
/// a block. The search starts in the group of `pref` when it is set, else
/// in the inode's own group.
pub fn alloc_block(
    dev: &dyn BlockDevice,
    fs: &mut FsParams,
    ino: InodeNumber,
    pref: BlockNumber,
    size: u32,
) -> Result<BlockNumber> {
    let geo = fs.geo.clone();
    if size > geo.bsize {
        return Err(UfsError::InvalidArgument(format!(
            "allocation of {size} bytes exceeds block size {}",
            geo.bsize
        )));
    }
    if size == 0 || size % geo.fsize != 0 {
        return Err(UfsError::InvalidArgument(format!(
            "allocation of {size} bytes is not a fragment multiple"
        )));
    }
    if fs.read_only {
        return Err(UfsError::ReadOnly);
    }
    if size == geo.bsize && fs.cstotal.nbfree == 0 {
        return Err(UfsError::NoSpace);
    }
    let cg = if !pref.is_hole() && pref.0 < geo.size {
        geo.dtog(pref)
    } else {
        geo.ino_to_cg(ino)
    };
    let found = hashalloc(geo.ncg, cg, pref.0, |g, p| {
        alloc_in_group(dev, fs, g, BlockNumber(p), size)
    })?;
    let Some(bno) = found else {
        debug!(ino = ino.0, size, "alloc_block_no_space");
        return Err(UfsError::NoSpace);
    };
    Ok(bno)
}

/// Preferred inode for a new directory under `parent`: the first inode of
/// the chosen group.
///
/// A group qualifies when it holds fewer than `maxndir` directories, has
/// at least `minifree` free inodes and `minbfree` free blocks, and has not
/// received `maxcontigdirs` directories in a row. The backstops take any
/// group with an average share of free inodes.
#[must_use]
pub fn dirpref(fs: &FsParams, parent: InodeNumber) -> u64 {
    let geo = &fs.geo;
    let ncg = i64::from(geo.ncg);
    let ipg = i64::from(geo.ipg);
    let avgifree = i64::from(fs.cstotal.nifree) / ncg;
    let avgbfree = i64::from(fs.cstotal.nbfree) / ncg;
    let avgndir = i64::from(fs.cstotal.ndir) / ncg;

    let maxndir = (avgndir + ipg / 16).min(ipg);
    let minifree = (avgifree - avgifree / 4).max(1);
    let minbfree = (avgbfree - avgbfree / 4).max(1);
    let cgsize = i64::from(geo.fsize) * i64::from(geo.fpg);
    let bsize = i64::from(geo.bsize);
    let mut dirsize = i64::from(geo.avgfilesize) * i64::from(geo.avgfpdir);
    let curdirsize = if avgndir > 0 {
        (cgsize - avgbfree * bsize) / avgndir
    } else {
        0
    };
    dirsize = dirsize.max(curdirsize);
    let mut maxcontigdirs = if dirsize <= 0 {
        0
    } else {
        ((avgbfree * bsize) / dirsize).min(255)
    };
    if geo.avgfpdir > 0 {
        maxcontigdirs = maxcontigdirs.min(ipg / i64::from(geo.avgfpdir));
    }
    let maxcontigdirs = maxcontigdirs.max(1);

    let prefcg = geo.ino_to_cg(parent).0.min(geo.ncg.saturating_sub(1));
    let order = (prefcg..geo.ncg).chain(0..prefcg);
    let cs_of = |cg: u32| fs.cs.get(cg as usize).copied().unwrap_or_default();

    let balanced = order.clone().find(|cg| {
        let cs = cs_of(*cg);
        let contig = fs.contigdirs.get(*cg as usize).copied().unwrap_or(0);
        i64::from(cs.ndir) < maxndir
            && i64::from(cs.nifree) >= minifree
            && i64::from(cs.nbfree) >= minbfree
            && i64::from(contig) < maxcontigdirs
    });
    let chosen = balanced
        .or_else(|| order.clone().find(|cg| i64::from(cs_of(*cg).nifree) >= avgifree))
        .unwrap_or(prefcg);
    trace!(parent = parent.0, cg = chosen, maxndir, maxcontigdirs, "dirpref");
    geo.cg_first_inode(GroupNumber(chosen))
}

/// Allocate an inode of type `mode` near `parent`.
///
/// Directories are placed by [`dirpref`]; everything else prefers the
/// parent's own inode number. Tracks runs of consecutive directory
/// creations per group.
pub fn alloc_inode(
    dev: &dyn BlockDevice,
    fs: &mut FsParams,
    parent: InodeNumber,
    mode: u16,
) -> Result<InodeNumber> {
    if fs.read_only {
        return Err(UfsError::ReadOnly);
    }
    if fs.cstotal.nifree == 0 {
        return Err(UfsError::NoSpace);
    }
    let is_dir = mode & S_IFMT == S_IFDIR;
    let mut ipref = if is_dir { dirpref(fs, parent) } else { parent.0 };
    if ipref >= fs.geo.max_inodes() {
        ipref = 0;
    }
    let cg = fs.geo.ino_to_cg(InodeNumber(ipref));
    if let Some(contig) = fs.contigdirs.get_mut(cg.0 as usize) {
        if is_dir {
            *contig = contig.saturating_add(1);
        } else {
            *contig = contig.saturating_sub(1);
        }
    }
    let ncg = fs.geo.ncg;
    let found = hashalloc(ncg, cg, ipref, |g, p| alloc_inode_in_group(dev, fs, g, p, is_dir))?;
    found.ok_or(UfsError::NoSpace)
}

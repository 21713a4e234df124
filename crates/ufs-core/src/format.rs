//! Image formatting.
//!
//! Lays out empty cylinder groups over the whole device and creates the
//! root directory as inode 2. The superblock itself is not written; the
//! geometry travels separately.

use tracing::info;
use ufs_alloc::{FsParams, alloc_block, alloc_inode_in_group, format_groups, new_generation};
use ufs_block::BlockDevice;
use ufs_bmap::write_run;
use ufs_dir::init_dir_block;
use ufs_error::{Result, UfsError};
use ufs_inode::{new_dinode, refresh_blocks, write_dinode};
use ufs_ondisk::{FsGeometry, GeometryConfig};
use ufs_types::{BlockNumber, DIRBLKSIZ, GroupNumber, InodeNumber, S_IFDIR, unix_now};

use crate::{MountOptions, Ufs};

/// Format `dev` with the geometry `cfg` yields for its size and return
/// the allocator state of the fresh filesystem.
pub fn format_device(dev: &dyn BlockDevice, cfg: &GeometryConfig, opts: &MountOptions) -> Result<FsParams> {
    let bytes = dev.sector_count() * u64::from(dev.sector_size());
    let geo = FsGeometry::new(cfg, bytes)?;
    let mut fs = FsParams::new(geo);
    format_groups(dev, &mut fs, unix_now().0)?;
    make_root(dev, &mut fs, opts)?;
    fs.write_summaries(dev)?;
    info!(
        ncg = fs.geo.ncg,
        size = fs.geo.size,
        nbfree = fs.cstotal.nbfree,
        nifree = fs.cstotal.nifree,
        "formatted"
    );
    Ok(fs)
}

/// Format `dev` and mount the result.
pub fn format(dev: Box<dyn BlockDevice>, cfg: &GeometryConfig, opts: MountOptions) -> Result<Ufs> {
    let mut fs = format_device(&*dev, cfg, &opts)?;
    fs.read_only = opts.read_only;
    Ok(Ufs::from_parts(dev, fs, opts))
}

fn make_root(dev: &dyn BlockDevice, fs: &mut FsParams, opts: &MountOptions) -> Result<()> {
    let ino = alloc_inode_in_group(dev, fs, GroupNumber(0), InodeNumber::ROOT.0, true)?.ok_or(UfsError::NoSpace)?;
    if ino != InodeNumber::ROOT {
        return Err(UfsError::Format(format!("root directory allocated as inode {ino}")));
    }
    let geo = fs.geo.clone();
    let run = geo.fragroundup(DIRBLKSIZ as u64);
    // at most one block
    #[expect(clippy::cast_possible_truncation)]
    let bno = alloc_block(dev, fs, ino, BlockNumber::HOLE, run as u32)?;
    let mut block = init_dir_block(ino, ino)?;
    #[expect(clippy::cast_possible_truncation)]
    block.resize(run as usize, 0);
    write_run(dev, &geo, bno, &block)?;

    let mut din = new_dinode(S_IFDIR | 0o755, opts.uid, opts.gid, new_generation());
    din.nlink = 2;
    din.size = DIRBLKSIZ as u64;
    din.db[0] = bno.0;
    refresh_blocks(&geo, &mut din);
    write_dinode(dev, &geo, ino, &din)
}

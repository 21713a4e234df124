#![forbid(unsafe_code)]
//! UFS2 filesystem context.
//!
//! [`Ufs`] ties a block device to its allocator state and inode cache and
//! carries the file-level operations (create, mkdir, rename, read, write,
//! ...) built on the allocation, block-map and directory layers. It is
//! passed explicitly; there is no global filesystem. [`SharedUfs`] adds
//! the per-filesystem lock a concurrent dispatcher needs.
//!
//! ```text
//!   ops (create, write, rename, ...)
//!     │ acquire / release
//!   vnode cache ── kill on last release of an unlinked inode
//!     │
//!   ufs-dir ── ufs-bmap ── ufs-alloc ── ufs-block
//! ```

pub mod format;
pub mod ops;
pub mod vnode;

pub use format::{format, format_device};
pub use ops::{InodeAttr, StatFs};
pub use ufs_block::{BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemByteDevice};
pub use ufs_dir::DirEntry;
pub use ufs_error::UfsError;
pub use ufs_ondisk::{FsGeometry, GeometryConfig};
pub use ufs_types::{FileType, InodeNumber};
pub use vnode::{Vnode, VnodeCache, VnodeHandle};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use ufs_alloc::FsParams;
use ufs_dir::InodeSource;
use ufs_error::Result;
use ufs_inode::{Inode, read_dinode};
use ufs_ondisk::Ufs2Dinode;

// ── Mount options ───────────────────────────────────────────────────────────

/// Options fixed at mount time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Reject every mutation with `ReadOnly`.
    pub read_only: bool,
    /// Owner given to files this mount creates.
    pub uid: u32,
    pub gid: u32,
    /// Identity of this filesystem in the inode cache.
    pub fsid: u64,
}

// ── Filesystem context ──────────────────────────────────────────────────────

/// A mounted UFS2 filesystem.
pub struct Ufs {
    dev: Box<dyn BlockDevice>,
    fs: FsParams,
    opts: MountOptions,
    vnodes: VnodeCache,
}

impl std::fmt::Debug for Ufs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ufs")
            .field("geometry", &self.fs.geo)
            .field("cstotal", &self.fs.cstotal)
            .field("opts", &self.opts)
            .field("cached_vnodes", &self.vnodes.len())
            .finish_non_exhaustive()
    }
}

impl Ufs {
    /// Mount an image whose geometry is known, rebuilding the allocator
    /// counters from its cylinder groups.
    pub fn mount(dev: Box<dyn BlockDevice>, geo: FsGeometry, opts: MountOptions) -> Result<Self> {
        let needed = geo.size * u64::from(geo.fsize);
        let have = dev.sector_count() * u64::from(dev.sector_size());
        if have < needed {
            return Err(UfsError::InvalidGeometry(format!(
                "device holds {have} bytes, geometry needs {needed}"
            )));
        }
        let mut fs = FsParams::load(&*dev, geo)?;
        fs.read_only = opts.read_only;
        let root = read_dinode(&*dev, &fs.geo, InodeNumber::ROOT)?;
        if !root.is_dir() {
            return Err(UfsError::corruption(
                fs.geo.ino_to_fsba(InodeNumber::ROOT).0,
                "root inode is not a directory",
            ));
        }
        info!(
            ncg = fs.geo.ncg,
            bsize = fs.geo.bsize,
            fsize = fs.geo.fsize,
            read_only = opts.read_only,
            "mounted"
        );
        Ok(Self::from_parts(dev, fs, opts))
    }

    pub(crate) fn from_parts(dev: Box<dyn BlockDevice>, fs: FsParams, opts: MountOptions) -> Self {
        Self {
            dev,
            fs,
            opts,
            vnodes: VnodeCache::new(),
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.fs.geo
    }

    #[must_use]
    pub fn params(&self) -> &FsParams {
        &self.fs
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.opts
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &*self.dev
    }

    #[must_use]
    pub fn vnodes(&self) -> &VnodeCache {
        &self.vnodes
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.fs.read_only
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.fs.read_only {
            return Err(UfsError::ReadOnly);
        }
        Ok(())
    }

    // ── Inode references ────────────────────────────────────────────────

    /// Take a reference to inode `ino`.
    pub fn acquire(&mut self, ino: InodeNumber) -> Result<VnodeHandle> {
        self.vnodes.acquire(&*self.dev, &self.fs.geo, self.opts.fsid, ino)
    }

    /// Resolve `path` from the root and take a reference to the result.
    pub fn acquire_path(&mut self, path: &str, follow: bool) -> Result<VnodeHandle> {
        let ino = self.resolve(path, follow)?;
        self.acquire(ino)
    }

    /// Drop a reference taken by [`acquire`](Self::acquire); `dirty` asks
    /// for the inode to be written.
    pub fn release(&mut self, h: VnodeHandle, dirty: bool) -> Result<()> {
        self.vnodes.release(&*self.dev, &mut self.fs, h, dirty)
    }

    /// The cached inode behind `h`.
    pub fn inode(&self, h: VnodeHandle) -> Result<&Inode> {
        self.vnodes.inode(h)
    }

    pub(crate) fn inode_mut(&mut self, h: VnodeHandle) -> Result<&mut Inode> {
        self.vnodes.inode_mut(h)
    }

    /// Allocate a fresh inode near `parent`; see [`VnodeCache::valloc`].
    pub fn valloc(&mut self, parent: InodeNumber, mode: u16) -> Result<VnodeHandle> {
        self.check_writable()?;
        self.vnodes.valloc(
            &*self.dev,
            &mut self.fs,
            self.opts.fsid,
            parent,
            mode,
            self.opts.uid,
            self.opts.gid,
        )
    }

    /// Run `body` on `h`, then release `h`, dirty if `body` succeeded and
    /// `dirty` is set. The body's error wins over a release error.
    pub(crate) fn holding<T>(
        &mut self,
        h: VnodeHandle,
        dirty: bool,
        body: impl FnOnce(&mut Self, VnodeHandle) -> Result<T>,
    ) -> Result<T> {
        let out = body(self, h);
        let released = self.release(h, dirty && out.is_ok());
        let value = out?;
        released?;
        Ok(value)
    }

    /// Release several handles in reverse order, reporting the first
    /// failure after all of them were released.
    pub(crate) fn release_all(&mut self, handles: &[VnodeHandle], dirty: bool) -> Result<()> {
        let mut first_err = None;
        for h in handles.iter().rev() {
            if let Err(e) = self.release(*h, dirty) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Resolve `path` relative to the root directory.
    pub fn resolve(&self, path: &str, follow: bool) -> Result<InodeNumber> {
        self.resolve_at(InodeNumber::ROOT, path.as_bytes(), follow)
    }

    pub(crate) fn resolve_at(&self, start: InodeNumber, path: &[u8], follow: bool) -> Result<InodeNumber> {
        let mut src = CachedInodes {
            cache: &self.vnodes,
            dev: &*self.dev,
            geo: &self.fs.geo,
            fsid: self.opts.fsid,
        };
        ufs_dir::namei(&mut src, &*self.dev, &self.fs.geo, start, path, follow)
    }

    /// Write the summary area and flush the device.
    pub fn sync(&mut self) -> Result<()> {
        if !self.fs.read_only {
            self.fs.write_summaries(&*self.dev)?;
        }
        self.dev.sync()?;
        debug!(cached = self.vnodes.len(), "sync");
        Ok(())
    }
}

/// Serves inodes from the cache when present so path walks see unwritten
/// changes.
struct CachedInodes<'a> {
    cache: &'a VnodeCache,
    dev: &'a dyn BlockDevice,
    geo: &'a FsGeometry,
    fsid: u64,
}

impl InodeSource for CachedInodes<'_> {
    fn dinode(&mut self, ino: InodeNumber) -> Result<Ufs2Dinode> {
        match self.cache.find(self.fsid, ino) {
            Some(h) => self.cache.inode(h).map(|i| i.din.clone()),
            None => read_dinode(self.dev, self.geo, ino),
        }
    }
}

// ── Shared access ───────────────────────────────────────────────────────────

/// A filesystem shared between threads. Every operation holds the
/// filesystem lock for its whole duration.
#[derive(Debug, Clone)]
pub struct SharedUfs {
    inner: Arc<Mutex<Ufs>>,
}

impl SharedUfs {
    #[must_use]
    pub fn new(ufs: Ufs) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ufs)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Ufs> {
        self.inner.lock()
    }

    /// Run `op` with the filesystem locked.
    pub fn with<T>(&self, op: impl FnOnce(&mut Ufs) -> T) -> T {
        op(&mut self.inner.lock())
    }
}

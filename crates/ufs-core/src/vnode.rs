//! In-core inode cache.
//!
//! Every operation that reads or mutates an inode goes through a
//! [`VnodeCache`]: [`acquire`](VnodeCache::acquire) returns a handle to the
//! single in-memory copy of the inode, loading it on first use, and
//! [`release`](VnodeCache::release) drops the reference and decides what
//! happens to the on-disk inode. The last release of an inode with no
//! remaining links frees its blocks and the inode itself.
//!
//! Vnodes live in an arena addressed by [`VnodeHandle`]; 256 hash buckets
//! keyed by `(filesystem id, inode number)` hold lists of handles.

use tracing::{debug, error, trace};
use ufs_alloc::{FsParams, alloc_inode, free_inode, new_generation};
use ufs_block::BlockDevice;
use ufs_bmap::{FsAllocator, truncate};
use ufs_error::{Result, UfsError};
use ufs_inode::{Inode, new_dinode, read_dinode};
use ufs_ondisk::{FsGeometry, Ufs2Dinode};
use ufs_types::InodeNumber;

/// Number of hash buckets.
pub const VNODE_BUCKETS: usize = 256;

/// Stable index of a vnode in the cache arena. Valid until the reference
/// it was returned for is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VnodeHandle(usize);

/// A cached inode and its reference count.
#[derive(Debug)]
pub struct Vnode {
    pub fsid: u64,
    pub inode: Inode,
    pub refcount: u32,
}

#[derive(Debug)]
pub struct VnodeCache {
    slots: Vec<Option<Vnode>>,
    free_slots: Vec<usize>,
    buckets: Vec<Vec<VnodeHandle>>,
}

impl Default for VnodeCache {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_of(fsid: u64, ino: InodeNumber) -> usize {
    // masked to the bucket range
    #[expect(clippy::cast_possible_truncation)]
    let key = (fsid.wrapping_add(ino.0) & (VNODE_BUCKETS as u64 - 1)) as usize;
    key
}

impl VnodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![Vec::new(); VNODE_BUCKETS],
        }
    }

    /// Number of cached vnodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handle of the cached vnode for `(fsid, ino)`, if any.
    #[must_use]
    pub fn find(&self, fsid: u64, ino: InodeNumber) -> Option<VnodeHandle> {
        self.buckets[bucket_of(fsid, ino)].iter().copied().find(|h| {
            self.slots[h.0]
                .as_ref()
                .is_some_and(|v| v.fsid == fsid && v.inode.number == ino)
        })
    }

    pub fn get(&self, h: VnodeHandle) -> Result<&Vnode> {
        self.slots
            .get(h.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| UfsError::InvalidArgument(format!("stale vnode handle {}", h.0)))
    }

    pub fn get_mut(&mut self, h: VnodeHandle) -> Result<&mut Vnode> {
        self.slots
            .get_mut(h.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| UfsError::InvalidArgument(format!("stale vnode handle {}", h.0)))
    }

    pub fn inode(&self, h: VnodeHandle) -> Result<&Inode> {
        self.get(h).map(|v| &v.inode)
    }

    pub fn inode_mut(&mut self, h: VnodeHandle) -> Result<&mut Inode> {
        self.get_mut(h).map(|v| &mut v.inode)
    }

    fn insert(&mut self, vnode: Vnode) -> VnodeHandle {
        let bucket = bucket_of(vnode.fsid, vnode.inode.number);
        let h = if let Some(idx) = self.free_slots.pop() {
            self.slots[idx] = Some(vnode);
            VnodeHandle(idx)
        } else {
            self.slots.push(Some(vnode));
            VnodeHandle(self.slots.len() - 1)
        };
        self.buckets[bucket].push(h);
        h
    }

    fn remove(&mut self, h: VnodeHandle) -> Result<Vnode> {
        let vnode = self
            .slots
            .get_mut(h.0)
            .and_then(Option::take)
            .ok_or_else(|| UfsError::InvalidArgument(format!("stale vnode handle {}", h.0)))?;
        self.buckets[bucket_of(vnode.fsid, vnode.inode.number)].retain(|x| *x != h);
        self.free_slots.push(h.0);
        Ok(vnode)
    }

    /// Take a reference to inode `ino`, reading it from disk if it is not
    /// cached.
    pub fn acquire(
        &mut self,
        dev: &dyn BlockDevice,
        geo: &FsGeometry,
        fsid: u64,
        ino: InodeNumber,
    ) -> Result<VnodeHandle> {
        if let Some(h) = self.find(fsid, ino) {
            let vnode = self.get_mut(h)?;
            vnode.refcount += 1;
            trace!(ino = ino.0, refcount = vnode.refcount, "vnode_ref");
            return Ok(h);
        }
        let inode = Inode::load(dev, geo, ino)?;
        let h = self.insert(Vnode {
            fsid,
            inode,
            refcount: 1,
        });
        trace!(ino = ino.0, cached = self.len(), "vnode_load");
        Ok(h)
    }

    /// Drop one reference.
    ///
    /// While references remain, a dirty inode is written immediately. The
    /// last release evicts the vnode and then either kills the file (no
    /// links left) or writes it back if dirty. An unallocated inode is
    /// only evicted. Nothing is written on a read-only filesystem.
    pub fn release(&mut self, dev: &dyn BlockDevice, fs: &mut FsParams, h: VnodeHandle, dirty: bool) -> Result<()> {
        let writable = !fs.read_only;
        let vnode = self.get_mut(h)?;
        vnode.refcount = vnode.refcount.saturating_sub(1);
        if vnode.refcount > 0 {
            if dirty && writable {
                vnode.inode.store(dev, &fs.geo)?;
            }
            return Ok(());
        }
        let vnode = self.remove(h)?;
        trace!(ino = vnode.inode.number.0, dirty, "vnode_evict");
        if !writable {
            return Ok(());
        }
        if vnode.inode.din.nlink == 0 && !vnode.inode.din.is_free() {
            kill(dev, fs, vnode.inode)
        } else if dirty {
            vnode.inode.store(dev, &fs.geo)
        } else {
            Ok(())
        }
    }

    /// Allocate a new inode of type `mode` near `parent` and return a
    /// reference to it.
    ///
    /// The inode starts with no links; releasing it before a link count
    /// is set frees it again. An allocated inode whose on-disk copy is
    /// still in use is fatal.
    #[expect(clippy::too_many_arguments)]
    pub fn valloc(
        &mut self,
        dev: &dyn BlockDevice,
        fs: &mut FsParams,
        fsid: u64,
        parent: InodeNumber,
        mode: u16,
        uid: u32,
        gid: u32,
    ) -> Result<VnodeHandle> {
        let ino = alloc_inode(dev, fs, parent, mode)?;
        let old = read_dinode(dev, &fs.geo, ino)?;
        if !old.is_free() || self.find(fsid, ino).is_some() {
            error!(ino = ino.0, mode = old.mode, "allocated inode is still in use");
            panic!("duplicate allocation of inode {ino}");
        }
        let inode = Inode {
            number: ino,
            din: new_dinode(mode, uid, gid, new_generation()),
        };
        inode.store(dev, &fs.geo)?;
        debug!(ino = ino.0, parent = parent.0, mode, "valloc");
        Ok(self.insert(Vnode {
            fsid,
            inode,
            refcount: 1,
        }))
    }
}

/// Free everything an unlinked inode owns: its blocks, its bitmap slot,
/// and its on-disk contents apart from the generation number.
fn kill(dev: &dyn BlockDevice, fs: &mut FsParams, mut inode: Inode) -> Result<()> {
    let geo = fs.geo.clone();
    let is_dir = inode.is_dir();
    if !inode.din.has_inline_target() && (inode.din.size != 0 || inode.din.blocks != 0) {
        let mut alloc = FsAllocator::new(dev, fs, inode.number);
        truncate(dev, &geo, &mut alloc, &mut inode, 0)?;
    }
    free_inode(dev, fs, inode.number, is_dir)?;
    inode.din = Ufs2Dinode {
        generation: inode.din.generation,
        ..Ufs2Dinode::default()
    };
    inode.store(dev, &geo)?;
    debug!(ino = inode.number.0, is_dir, "inode_killed");
    Ok(())
}

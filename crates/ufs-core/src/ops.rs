//! File-level operations on a mounted [`Ufs`].
//!
//! Every operation takes references through the vnode cache and gives them
//! back before returning, so an inode whose last name disappears is freed
//! as soon as the operation that unlinked it is done.
//!
//! Paths are slash-separated and resolved from the root; a path with no
//! slash names an entry of the root directory.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};
use ufs_alloc::alloc_block;
use ufs_bmap::{BlockAllocator, FsAllocator, bmap, extend_tail, read_run, set_block, tier_start, truncate, write_run};
use ufs_dir::{DirEntry, init_dir_block, is_empty, link, lookup, read_dir, read_symlink, set_dotdot, unlink};
use ufs_error::{Result, UfsError};
use ufs_inode::{Inode, Touch, refresh_blocks, set_inline_target, touch};
use ufs_types::{
    BlockNumber, DIRBLKSIZ, FileType, InodeNumber, LINK_MAX, MAXNAMLEN, MAXSYMLINKLEN, NIADDR, S_IFBLK,
    S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, S_IRWXG, S_IRWXO, S_IRWXU, S_ISGID,
    S_ISUID, S_ISVTX,
};

use crate::{Ufs, VnodeHandle};

// ── Attribute types ─────────────────────────────────────────────────────────

/// Inode attributes, the engine's view of `struct stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Allocated space in 512-byte units.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Birth time.
    pub crtime: SystemTime,
    pub kind: FileType,
    /// Permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number of a character or block special file.
    pub rdev: u32,
    /// Preferred I/O size.
    pub blksize: u32,
    pub generation: u32,
}

impl InodeAttr {
    #[must_use]
    pub fn from_inode(inode: &Inode, blksize: u32) -> Self {
        let din = &inode.din;
        let kind = din.file_type();
        // the device number lives in the first pointer slot
        let rdev = match kind {
            FileType::CharDevice | FileType::BlockDevice => u32::try_from(din.db[0]).unwrap_or(0),
            _ => 0,
        };
        Self {
            ino: inode.number,
            size: din.size,
            blocks: din.blocks,
            atime: to_system_time(din.atime, din.atimensec),
            mtime: to_system_time(din.mtime, din.mtimensec),
            ctime: to_system_time(din.ctime, din.ctimensec),
            crtime: to_system_time(din.birthtime, din.birthnsec),
            kind,
            perm: din.mode & PERM_MASK,
            nlink: u32::from(din.nlink),
            uid: din.uid,
            gid: din.gid,
            rdev,
            blksize,
            generation: din.generation,
        }
    }
}

/// Convert a (seconds, nanoseconds) pair to `SystemTime`, falling back to
/// `UNIX_EPOCH` when it is out of range.
fn to_system_time(secs: i64, nsec: i32) -> SystemTime {
    let nsec = u32::try_from(nsec).unwrap_or(0);
    let converted = if secs >= 0 {
        u64::try_from(secs)
            .ok()
            .and_then(|s| UNIX_EPOCH.checked_add(Duration::new(s, nsec)))
    } else {
        secs.checked_neg()
            .and_then(|abs| u64::try_from(abs).ok())
            .and_then(|abs| UNIX_EPOCH.checked_sub(Duration::new(abs, 0)))
            .and_then(|t| t.checked_add(Duration::new(0, nsec)))
    };
    converted.unwrap_or(UNIX_EPOCH)
}

/// Split a `SystemTime` into on-disk seconds and nanoseconds. Times
/// before the epoch keep a non-negative nanosecond part.
fn from_system_time(t: SystemTime) -> (i64, i32) {
    let (d, before) = match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d, false),
        Err(e) => (e.duration(), true),
    };
    let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
    let nsec = i32::try_from(d.subsec_nanos()).unwrap_or(0);
    match (before, nsec) {
        (false, _) => (secs, nsec),
        (true, 0) => (-secs, 0),
        (true, _) => (-secs - 1, 1_000_000_000 - nsec),
    }
}

/// Bits `chmod` may change.
const PERM_MASK: u16 = S_IRWXU | S_IRWXG | S_IRWXO | S_ISUID | S_ISGID | S_ISVTX;

// MAXNAMLEN is 255
#[expect(clippy::cast_possible_truncation)]
const NAME_MAX: u32 = MAXNAMLEN as u32;

/// Filesystem-wide usage, in the units of `statvfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub bsize: u32,
    /// Fragment size; `blocks`, `bfree` and `bavail` count fragments.
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    /// Free fragments outside the `minfree` reserve.
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u32,
}

// ── Path helpers ────────────────────────────────────────────────────────────

/// Split `path` into its parent path and final component.
fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(UfsError::InvalidArgument(format!("path {path:?} names no entry")));
    }
    Ok(match trimmed.rfind('/') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    })
}

/// A name an operation may add or remove.
fn check_component(name: &str) -> Result<()> {
    if name == "." || name == ".." {
        return Err(UfsError::InvalidArgument(format!("cannot use {name:?} as an entry name")));
    }
    ufs_dir::validate_name(name.as_bytes())
}

fn not_found(name: &[u8]) -> UfsError {
    UfsError::NotFound(String::from_utf8_lossy(name).into_owned())
}

impl Ufs {
    fn resolve_parent(&self, parent: &str) -> Result<InodeNumber> {
        if parent.is_empty() {
            return Ok(InodeNumber::ROOT);
        }
        self.resolve(parent, true)
    }

    /// Run `body` on the directory holding the last component of `path`,
    /// which is passed along as the entry name.
    fn in_parent<T>(
        &mut self,
        path: &str,
        body: impl FnOnce(&mut Self, VnodeHandle, &[u8]) -> Result<T>,
    ) -> Result<T> {
        self.check_writable()?;
        let (parent, name) = split_path(path)?;
        check_component(name)?;
        let dir = self.resolve_parent(parent)?;
        let h = self.acquire(dir)?;
        self.holding(h, true, |ufs, h| {
            if !ufs.inode(h)?.is_dir() {
                return Err(UfsError::NotDirectory);
            }
            body(ufs, h, name.as_bytes())
        })
    }

    /// Largest file size the block-address tree can map.
    fn max_file_size(&self) -> u64 {
        let geo = &self.fs.geo;
        tier_start(geo, NIADDR).saturating_mul(u64::from(geo.bsize))
    }

    fn check_file_size(&self, size: u64) -> Result<()> {
        let max = self.max_file_size();
        if size > max {
            return Err(UfsError::InvalidArgument(format!(
                "size {size} exceeds the {max}-byte file limit"
            )));
        }
        Ok(())
    }

    // ── Directory plumbing ──────────────────────────────────────────────

    fn dir_lookup(&self, dir: VnodeHandle, name: &[u8]) -> Result<Option<(InodeNumber, FileType)>> {
        let din = &self.vnodes.inode(dir)?.din;
        lookup(&*self.dev, &self.fs.geo, din, name)
    }

    fn dir_is_empty(&self, dir: VnodeHandle) -> Result<bool> {
        let din = &self.vnodes.inode(dir)?.din;
        is_empty(&*self.dev, &self.fs.geo, din)
    }

    /// Add `name -> ino` to `dir`. A full directory reports `NoSpace`.
    fn enter(&mut self, dir: VnodeHandle, name: &[u8], ino: InodeNumber, kind: FileType) -> Result<()> {
        let din = &self.vnodes.inode(dir)?.din;
        match link(&*self.dev, &self.fs.geo, self.fs.read_only, din, name, ino, kind) {
            Err(UfsError::NoSpace) => self.grow_dir(dir),
            other => other,
        }
    }

    // TODO: append a fresh DIRBLKSIZ chunk (extend the last fragment run or
    // allocate a new block) and retry the insert.
    fn grow_dir(&self, dir: VnodeHandle) -> Result<()> {
        let inode = self.vnodes.inode(dir)?;
        debug!(ino = inode.number.0, size = inode.din.size, "dir_full");
        Err(UfsError::NoSpace)
    }

    fn remove_entry(&mut self, dir: VnodeHandle, name: &[u8]) -> Result<InodeNumber> {
        let din = &self.vnodes.inode(dir)?.din;
        let ino = unlink(&*self.dev, &self.fs.geo, self.fs.read_only, din, Some(name), None)?;
        touch(&mut self.vnodes.inode_mut(dir)?.din, Touch::MODIFY);
        Ok(ino)
    }

    /// Allocate an inode of `mode`, let `fill` give it contents, and name
    /// it `name` in `dir`. A failure anywhere leaves the new inode unlinked
    /// so its release frees it again.
    fn create_node(
        &mut self,
        dir: VnodeHandle,
        name: &[u8],
        mode: u16,
        fill: impl FnOnce(&mut Self, VnodeHandle) -> Result<()>,
    ) -> Result<InodeNumber> {
        if self.dir_lookup(dir, name)?.is_some() {
            return Err(UfsError::Exists);
        }
        let parent = self.inode(dir)?.number;
        let h = self.valloc(parent, mode)?;
        self.holding(h, true, |ufs, h| {
            fill(ufs, h)?;
            let ino = ufs.inode(h)?.number;
            ufs.enter(dir, name, ino, FileType::from_mode(mode))?;
            ufs.inode_mut(h)?.din.nlink = if mode & S_IFMT == S_IFDIR { 2 } else { 1 };
            touch(&mut ufs.inode_mut(dir)?.din, Touch::MODIFY);
            trace!(ino = ino.0, parent = parent.0, mode, "node_created");
            Ok(ino)
        })
    }

    /// Give a new directory its first chunk holding `.` and `..`.
    fn fill_dir(&mut self, h: VnodeHandle, parent: InodeNumber) -> Result<()> {
        let geo = self.fs.geo.clone();
        let ino = self.inode(h)?.number;
        let run = geo.fragroundup(DIRBLKSIZ as u64);
        // one chunk is below a block
        #[expect(clippy::cast_possible_truncation)]
        let bno = alloc_block(&*self.dev, &mut self.fs, ino, BlockNumber::HOLE, run as u32)?;
        let mut block = init_dir_block(ino, parent)?;
        #[expect(clippy::cast_possible_truncation)]
        block.resize(run as usize, 0);
        write_run(&*self.dev, &geo, bno, &block)?;
        let din = &mut self.inode_mut(h)?.din;
        din.size = DIRBLKSIZ as u64;
        din.db[0] = bno.0;
        refresh_blocks(&geo, din);
        Ok(())
    }

    /// Store a symlink target inline when short, else in a fragment run.
    fn fill_symlink(&mut self, h: VnodeHandle, target: &[u8]) -> Result<()> {
        if target.len() < MAXSYMLINKLEN {
            return set_inline_target(&mut self.inode_mut(h)?.din, target);
        }
        let geo = self.fs.geo.clone();
        let ino = self.inode(h)?.number;
        let run = geo.fragroundup(target.len() as u64);
        // target length is at most bsize
        #[expect(clippy::cast_possible_truncation)]
        let bno = alloc_block(&*self.dev, &mut self.fs, ino, BlockNumber::HOLE, run as u32)?;
        let mut block = target.to_vec();
        #[expect(clippy::cast_possible_truncation)]
        block.resize(run as usize, 0);
        write_run(&*self.dev, &geo, bno, &block)?;
        let din = &mut self.inode_mut(h)?.din;
        din.size = target.len() as u64;
        din.db[0] = bno.0;
        refresh_blocks(&geo, din);
        Ok(())
    }

    // ── File data ───────────────────────────────────────────────────────

    fn read_range(&self, h: VnodeHandle, offset: u64, len: u64) -> Result<Vec<u8>> {
        let geo = &self.fs.geo;
        let din = &self.vnodes.inode(h)?.din;
        if offset >= din.size {
            return Ok(Vec::new());
        }
        let end = din.size.min(offset.saturating_add(len));
        let mut out = Vec::new();
        let mut pos = offset;
        while pos < end {
            let lbn = geo.lblkno(pos);
            let io = u64::from(geo.sblksize(din.size, lbn));
            let within = geo.blkoff(pos);
            let take = (io - within).min(end - pos);
            let bno = bmap(&*self.dev, geo, din, lbn)?;
            // io and within are below bsize
            #[expect(clippy::cast_possible_truncation)]
            let (io, within, take) = (io as usize, within as usize, take as usize);
            if bno.is_hole() {
                out.resize(out.len() + take, 0);
            } else {
                let buf = read_run(&*self.dev, geo, bno, io)?;
                out.extend_from_slice(&buf[within..within + take]);
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, allocating blocks for every hole the range
    /// touches. Returns the byte count written.
    fn write_at(&mut self, h: VnodeHandle, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| UfsError::InvalidArgument("write range overflows".to_owned()))?;
        self.check_file_size(end)?;
        let geo = self.fs.geo.clone();
        let Self { dev, fs, vnodes, .. } = self;
        let inode = vnodes.inode_mut(h)?;
        let ino = inode.number;
        let new_size = inode.din.size.max(end);
        let mut alloc = FsAllocator::new(&**dev, fs, ino);
        extend_tail(&**dev, &geo, &mut alloc, &mut inode.din, new_size)?;
        inode.din.size = new_size;

        let mut pos = offset;
        let mut done = 0_usize;
        let mut prev = BlockNumber::HOLE;
        while done < data.len() {
            let lbn = geo.lblkno(pos);
            let io = geo.sblksize(new_size, lbn);
            // blkoff < bsize
            #[expect(clippy::cast_possible_truncation)]
            let within = geo.blkoff(pos) as usize;
            let take = (io as usize - within).min(data.len() - done);
            let mut bno = bmap(&**dev, &geo, &inode.din, lbn)?;
            let mut buf = if bno.is_hole() {
                let pref = if prev.is_hole() { prev } else { BlockNumber(prev.0 + u64::from(geo.frag)) };
                bno = alloc.alloc_block(pref, io)?;
                set_block(&**dev, &geo, &mut alloc, &mut inode.din, lbn, bno)?;
                vec![0_u8; io as usize]
            } else {
                read_run(&**dev, &geo, bno, io as usize)?
            };
            buf[within..within + take].copy_from_slice(&data[done..done + take]);
            write_run(&**dev, &geo, bno, &buf)?;
            prev = bno;
            pos += take as u64;
            done += take;
        }
        refresh_blocks(&geo, &mut inode.din);
        touch(&mut inode.din, Touch::MODIFY);
        trace!(ino = ino.0, offset, len = data.len(), size = new_size, "write");
        Ok(done)
    }

    /// Fail when `dir` is `moving` or lies below it.
    fn check_not_ancestor(&self, moving: InodeNumber, dir: InodeNumber) -> Result<()> {
        let mut cur = dir;
        loop {
            if cur == moving {
                return Err(UfsError::InvalidArgument(
                    "cannot move a directory below itself".to_owned(),
                ));
            }
            if cur == InodeNumber::ROOT {
                return Ok(());
            }
            let parent = self.resolve_at(cur, b"..", false)?;
            if parent == cur {
                return Err(UfsError::corruption(
                    self.fs.geo.ino_to_fsba(cur).0,
                    format!("directory {cur} is its own parent"),
                ));
            }
            cur = parent;
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Attributes of inode `ino`.
    pub fn getattr(&mut self, ino: InodeNumber) -> Result<InodeAttr> {
        let h = self.acquire(ino)?;
        self.holding(h, false, |ufs, h| {
            let inode = ufs.inode(h)?;
            if inode.din.is_free() {
                return Err(UfsError::NotFound(format!("inode {ino}")));
            }
            Ok(InodeAttr::from_inode(inode, ufs.fs.geo.bsize))
        })
    }

    /// Attributes of the entry `name` in directory `parent`.
    pub fn lookup(&mut self, parent: InodeNumber, name: &str) -> Result<InodeAttr> {
        let h = self.acquire(parent)?;
        let found = self.holding(h, false, |ufs, h| {
            if !ufs.inode(h)?.is_dir() {
                return Err(UfsError::NotDirectory);
            }
            ufs.dir_lookup(h, name.as_bytes())
        })?;
        let (ino, _) = found.ok_or_else(|| not_found(name.as_bytes()))?;
        self.getattr(ino)
    }

    /// Entries of directory `ino` from byte position `offset` on. Each
    /// entry's `offset` resumes the listing after it.
    pub fn read_dir(&mut self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let h = self.acquire(ino)?;
        self.holding(h, false, |ufs, h| {
            let din = &ufs.vnodes.inode(h)?.din;
            if !din.is_dir() {
                return Err(UfsError::NotDirectory);
            }
            read_dir(&*ufs.dev, &ufs.fs.geo, din, offset)
        })
    }

    /// Up to `size` bytes of regular file `ino` from `offset`. Holes read
    /// as zeros; nothing is returned at or past end of file.
    pub fn read(&mut self, ino: InodeNumber, offset: u64, size: u32) -> Result<Vec<u8>> {
        let h = self.acquire(ino)?;
        self.holding(h, false, |ufs, h| {
            let din = &ufs.inode(h)?.din;
            if din.is_dir() {
                return Err(UfsError::IsDirectory);
            }
            if !din.is_reg() {
                return Err(UfsError::InvalidArgument(format!("inode {ino} is not a regular file")));
            }
            ufs.read_range(h, offset, u64::from(size))
        })
    }

    /// Target of the symlink at `path`.
    pub fn readlink(&mut self, path: &str) -> Result<Vec<u8>> {
        let ino = self.resolve(path, false)?;
        let h = self.acquire(ino)?;
        self.holding(h, false, |ufs, h| {
            let din = &ufs.vnodes.inode(h)?.din;
            read_symlink(&*ufs.dev, &ufs.fs.geo, din)
        })
    }

    /// Usage counters, computed from the in-memory summaries.
    #[must_use]
    pub fn statfs(&self) -> StatFs {
        let geo = &self.fs.geo;
        let cs = self.fs.cstotal;
        let free = i64::from(cs.nbfree) * i64::from(geo.frag) + i64::from(cs.nffree);
        let free = u64::try_from(free).unwrap_or(0);
        let reserved = geo.dsize * u64::from(geo.minfree) / 100;
        StatFs {
            bsize: geo.bsize,
            frsize: geo.fsize,
            blocks: geo.dsize,
            bfree: free,
            bavail: free.saturating_sub(reserved),
            files: geo.max_inodes() - InodeNumber::ROOT.0,
            ffree: u64::try_from(cs.nifree).unwrap_or(0),
            namemax: NAME_MAX,
        }
    }

    // ── File contents ───────────────────────────────────────────────────

    /// Write `data` into regular file `ino` at `offset`.
    pub fn write(&mut self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let h = self.acquire(ino)?;
        self.holding(h, true, |ufs, h| {
            let din = &ufs.inode(h)?.din;
            if din.is_dir() {
                return Err(UfsError::IsDirectory);
            }
            if !din.is_reg() {
                return Err(UfsError::InvalidArgument(format!("inode {ino} is not a regular file")));
            }
            ufs.write_at(h, offset, data)
        })
    }

    /// Grow or shrink regular file `ino` to `size` bytes.
    pub fn set_size(&mut self, ino: InodeNumber, size: u64) -> Result<()> {
        self.check_writable()?;
        self.check_file_size(size)?;
        let h = self.acquire(ino)?;
        self.holding(h, true, |ufs, h| {
            let din = &ufs.inode(h)?.din;
            if din.is_dir() {
                return Err(UfsError::IsDirectory);
            }
            if !din.is_reg() {
                return Err(UfsError::InvalidArgument(format!("inode {ino} is not a regular file")));
            }
            let geo = ufs.fs.geo.clone();
            let Self { dev, fs, vnodes, .. } = ufs;
            let inode = vnodes.inode_mut(h)?;
            let mut alloc = FsAllocator::new(&**dev, fs, inode.number);
            truncate(&**dev, &geo, &mut alloc, inode, size)
        })
    }

    /// [`set_size`](Self::set_size) on the file at `path`.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        let ino = self.resolve(path, true)?;
        self.set_size(ino, size)
    }

    // ── Attributes ──────────────────────────────────────────────────────

    /// Replace the permission bits of the file at `path`, keeping its type.
    pub fn chmod(&mut self, path: &str, mode: u16) -> Result<InodeAttr> {
        self.check_writable()?;
        let ino = self.resolve(path, true)?;
        let h = self.acquire(ino)?;
        self.holding(h, true, |ufs, h| {
            let blksize = ufs.fs.geo.bsize;
            let inode = ufs.inode_mut(h)?;
            inode.din.mode = (inode.din.mode & !PERM_MASK) | (mode & PERM_MASK);
            touch(&mut inode.din, Touch::CHANGE);
            debug!(ino = ino.0, mode = inode.din.mode, "chmod");
            Ok(InodeAttr::from_inode(inode, blksize))
        })
    }

    /// Set the access and modification times of the file at `path`. A
    /// `None` leaves that timestamp alone; the change time is refreshed.
    pub fn utimens(&mut self, path: &str, atime: Option<SystemTime>, mtime: Option<SystemTime>) -> Result<InodeAttr> {
        self.check_writable()?;
        let ino = self.resolve(path, true)?;
        let h = self.acquire(ino)?;
        self.holding(h, true, |ufs, h| {
            let blksize = ufs.fs.geo.bsize;
            let inode = ufs.inode_mut(h)?;
            let din = &mut inode.din;
            if let Some(t) = atime {
                (din.atime, din.atimensec) = from_system_time(t);
            }
            if let Some(t) = mtime {
                (din.mtime, din.mtimensec) = from_system_time(t);
            }
            touch(din, Touch::CHANGE);
            debug!(ino = ino.0, atime = din.atime, mtime = din.mtime, "utimens");
            Ok(InodeAttr::from_inode(inode, blksize))
        })
    }

    // ── Namespace ───────────────────────────────────────────────────────

    /// Create a regular file, device node, fifo or socket at `path`. A
    /// mode without a type creates a regular file; `rdev` is kept for
    /// device nodes only.
    pub fn create(&mut self, path: &str, mode: u16, rdev: u32) -> Result<InodeAttr> {
        let kind = match mode & S_IFMT {
            0 => S_IFREG,
            t @ (S_IFREG | S_IFCHR | S_IFBLK | S_IFIFO | S_IFSOCK) => t,
            t => {
                return Err(UfsError::InvalidArgument(format!("cannot create a node of type {t:o}")));
            }
        };
        let mode = kind | (mode & PERM_MASK);
        let ino = self.in_parent(path, |ufs, dir, name| {
            ufs.create_node(dir, name, mode, |ufs, h| {
                if kind == S_IFCHR || kind == S_IFBLK {
                    ufs.inode_mut(h)?.din.db[0] = u64::from(rdev);
                }
                Ok(())
            })
        })?;
        debug!(ino = ino.0, path, mode, "create");
        self.getattr(ino)
    }

    /// Create a directory at `path`.
    pub fn mkdir(&mut self, path: &str, perm: u16) -> Result<InodeAttr> {
        let ino = self.in_parent(path, |ufs, dir, name| {
            if ufs.inode(dir)?.din.nlink >= LINK_MAX {
                return Err(UfsError::TooManyLinks);
            }
            let parent = ufs.inode(dir)?.number;
            let ino = ufs.create_node(dir, name, S_IFDIR | (perm & PERM_MASK), |ufs, h| ufs.fill_dir(h, parent))?;
            ufs.inode_mut(dir)?.din.nlink += 1;
            Ok(ino)
        })?;
        debug!(ino = ino.0, path, "mkdir");
        self.getattr(ino)
    }

    /// Create a symlink at `path` pointing to `target`.
    pub fn symlink(&mut self, target: &[u8], path: &str) -> Result<InodeAttr> {
        if target.is_empty() {
            return Err(UfsError::InvalidArgument("empty symlink target".to_owned()));
        }
        if target.len() > self.fs.geo.bsize as usize {
            return Err(UfsError::NameTooLong);
        }
        let ino = self.in_parent(path, |ufs, dir, name| {
            ufs.create_node(dir, name, S_IFLNK | 0o777, |ufs, h| ufs.fill_symlink(h, target))
        })?;
        debug!(ino = ino.0, path, len = target.len(), "symlink");
        self.getattr(ino)
    }

    /// Give the inode at `existing` the additional name `new_path`.
    /// Directories cannot be hard-linked.
    pub fn link(&mut self, existing: &str, new_path: &str) -> Result<InodeAttr> {
        self.check_writable()?;
        let ino = self.resolve(existing, false)?;
        let h = self.acquire(ino)?;
        self.holding(h, true, |ufs, h| {
            let din = &ufs.inode(h)?.din;
            if din.is_dir() {
                return Err(UfsError::PermissionDenied);
            }
            if din.nlink >= LINK_MAX {
                return Err(UfsError::TooManyLinks);
            }
            let kind = din.file_type();
            ufs.in_parent(new_path, |ufs, dir, name| {
                if ufs.dir_lookup(dir, name)?.is_some() {
                    return Err(UfsError::Exists);
                }
                ufs.enter(dir, name, ino, kind)?;
                touch(&mut ufs.inode_mut(dir)?.din, Touch::MODIFY);
                Ok(())
            })?;
            let din = &mut ufs.inode_mut(h)?.din;
            din.nlink += 1;
            touch(din, Touch::CHANGE);
            Ok(())
        })?;
        debug!(ino = ino.0, new_path, "link");
        self.getattr(ino)
    }

    /// Remove the non-directory entry at `path`. The inode is freed once
    /// its last name and reference are gone.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.in_parent(path, |ufs, dir, name| {
            let (ino, _) = ufs.dir_lookup(dir, name)?.ok_or_else(|| not_found(name))?;
            let h = ufs.acquire(ino)?;
            ufs.holding(h, true, |ufs, h| {
                if ufs.inode(h)?.is_dir() {
                    return Err(UfsError::IsDirectory);
                }
                ufs.remove_entry(dir, name)?;
                let din = &mut ufs.inode_mut(h)?.din;
                din.nlink = din.nlink.saturating_sub(1);
                touch(din, Touch::CHANGE);
                debug!(ino = ino.0, nlink = din.nlink, "unlink");
                Ok(())
            })
        })
    }

    /// Remove the empty directory at `path`.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.in_parent(path, |ufs, dir, name| {
            let (ino, _) = ufs.dir_lookup(dir, name)?.ok_or_else(|| not_found(name))?;
            let h = ufs.acquire(ino)?;
            ufs.holding(h, true, |ufs, h| {
                if !ufs.inode(h)?.is_dir() {
                    return Err(UfsError::NotDirectory);
                }
                if !ufs.dir_is_empty(h)? {
                    return Err(UfsError::NotEmpty);
                }
                ufs.remove_entry(dir, name)?;
                let din = &mut ufs.inode_mut(h)?.din;
                din.nlink = 0;
                touch(din, Touch::CHANGE);
                let parent = &mut ufs.inode_mut(dir)?.din;
                parent.nlink = parent.nlink.saturating_sub(1);
                debug!(ino = ino.0, "rmdir");
                Ok(())
            })
        })
    }

    /// Move the entry at `from` to `to`, replacing a compatible entry
    /// already there. A directory moved to another parent has its `..`
    /// repointed.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.check_writable()?;
        let (src_parent, src_name) = split_path(from)?;
        check_component(src_name)?;
        let (dst_parent, dst_name) = split_path(to)?;
        check_component(dst_name)?;
        let src_dir = self.resolve_parent(src_parent)?;
        let dst_dir = self.resolve_parent(dst_parent)?;

        let mut held = Vec::new();
        let out = self.rename_held(
            &mut held,
            (src_dir, src_name.as_bytes()),
            (dst_dir, dst_name.as_bytes()),
        );
        // entries already rewritten on disk stay, so their inodes are written too
        let released = self.release_all(&held, true);
        out?;
        released?;
        debug!(from, to, "rename");
        Ok(())
    }

    fn rename_held(
        &mut self,
        held: &mut Vec<VnodeHandle>,
        (src_dir, src_name): (InodeNumber, &[u8]),
        (dst_dir, dst_name): (InodeNumber, &[u8]),
    ) -> Result<()> {
        let sdh = self.acquire(src_dir)?;
        held.push(sdh);
        let ddh = self.acquire(dst_dir)?;
        held.push(ddh);
        if !self.inode(sdh)?.is_dir() || !self.inode(ddh)?.is_dir() {
            return Err(UfsError::NotDirectory);
        }
        let (src_ino, kind) = self.dir_lookup(sdh, src_name)?.ok_or_else(|| not_found(src_name))?;
        let sh = self.acquire(src_ino)?;
        held.push(sh);
        let moving_dir = self.inode(sh)?.is_dir();
        let existing = self.dir_lookup(ddh, dst_name)?;
        if existing.is_some_and(|(ino, _)| ino == src_ino) {
            return Ok(());
        }
        let cross = src_dir != dst_dir;
        if moving_dir && cross {
            self.check_not_ancestor(src_ino, dst_dir)?;
            if existing.is_none() && self.inode(ddh)?.din.nlink >= LINK_MAX {
                return Err(UfsError::TooManyLinks);
            }
        }

        if let Some((dst_ino, _)) = existing {
            let dh = self.acquire(dst_ino)?;
            held.push(dh);
            let target_dir = self.inode(dh)?.is_dir();
            if moving_dir && !target_dir {
                return Err(UfsError::NotDirectory);
            }
            if !moving_dir && target_dir {
                return Err(UfsError::IsDirectory);
            }
            if target_dir && !self.dir_is_empty(dh)? {
                return Err(UfsError::NotEmpty);
            }
            self.remove_entry(ddh, dst_name)?;
            let din = &mut self.inode_mut(dh)?.din;
            if target_dir {
                din.nlink = 0;
                let parent = &mut self.inode_mut(ddh)?.din;
                parent.nlink = parent.nlink.saturating_sub(1);
            } else {
                din.nlink = din.nlink.saturating_sub(1);
                touch(din, Touch::CHANGE);
            }
            trace!(ino = dst_ino.0, "rename_replaced");
        }

        self.enter(ddh, dst_name, src_ino, kind)?;
        touch(&mut self.inode_mut(ddh)?.din, Touch::MODIFY);
        self.remove_entry(sdh, src_name)?;
        if moving_dir && cross {
            let din = &self.vnodes.inode(sh)?.din;
            set_dotdot(&*self.dev, &self.fs.geo, self.fs.read_only, din, dst_dir)?;
            let old_parent = &mut self.inode_mut(sdh)?.din;
            old_parent.nlink = old_parent.nlink.saturating_sub(1);
            self.inode_mut(ddh)?.din.nlink += 1;
        }
        touch(&mut self.inode_mut(sh)?.din, Touch::CHANGE);
        Ok(())
    }
}

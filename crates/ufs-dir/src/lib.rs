#![forbid(unsafe_code)]
//! Directory operations.
//!
//! A directory is a file whose blocks are tiled by variable-length records
//! in `DIRBLKSIZ` chunks. [`iterate`] streams those records to a visitor
//! that may edit the chunk in place and ask for the block to be written
//! back; insertion, removal, lookup and listing are all visitors.
//!
//! Path resolution with symbolic-link following lives in [`namei`].

pub mod namei;

pub use namei::{DiskInodes, InodeSource, namei, read_symlink};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use ufs_block::BlockDevice;
use ufs_bmap::{bmap, read_run, write_run};
use ufs_error::{Result, UfsError};
use ufs_inode::inode_io_size;
use ufs_ondisk::{
    DIRENT_HEADER_LEN, DirentHeader, FsGeometry, Ufs2Dinode, dir_rec_len, parse_to_ufs_error, record_name,
    write_record,
};
use ufs_types::{BlockNumber, DIRBLKSIZ, FileType, InodeNumber, MAXNAMLEN, howmany};

// ── Visitor protocol ────────────────────────────────────────────────────────

/// What [`iterate`] does after a visitor returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// The chunk was edited; keep going and write the block back.
    Rewrite,
    Stop,
    StopAndRewrite,
}

impl Visit {
    fn rewrites(self) -> bool {
        matches!(self, Self::Rewrite | Self::StopAndRewrite)
    }

    fn stops(self) -> bool {
        matches!(self, Self::Stop | Self::StopAndRewrite)
    }
}

/// One record as seen by a visitor, with mutable access to its chunk.
pub struct Record<'a> {
    /// The `DIRBLKSIZ` chunk holding the record.
    pub chunk: &'a mut [u8],
    /// Offset of the record inside `chunk`.
    pub offset: usize,
    /// Offset of the physically preceding record in the chunk, if any.
    pub prev: Option<usize>,
    pub header: DirentHeader,
    /// Byte position of the record in the directory.
    pub pos: u64,
    /// Fragment address of the block holding the chunk.
    pub block: BlockNumber,
}

impl Record<'_> {
    pub fn name(&self) -> Result<&[u8]> {
        record_name(self.chunk, self.offset, &self.header).map_err(|e| parse_to_ufs_error(&e, self.block.0))
    }

    /// Header of the record following this one in the same chunk.
    pub fn next_header(&self) -> Result<Option<DirentHeader>> {
        let next = self.offset + usize::from(self.header.reclen);
        if next >= self.chunk.len() {
            return Ok(None);
        }
        check_record(self.chunk, next, self.block).map(Some)
    }

    /// Store `self.header` back into the chunk.
    pub fn write_header(&mut self) -> Result<()> {
        self.header
            .write(self.chunk, self.offset)
            .map_err(|e| parse_to_ufs_error(&e, self.block.0))
    }
}

/// Parse the header at `off` and check that the record tiles its chunk.
fn check_record(chunk: &[u8], off: usize, block: BlockNumber) -> Result<DirentHeader> {
    let header = DirentHeader::parse(chunk, off).map_err(|e| parse_to_ufs_error(&e, block.0))?;
    let reclen = usize::from(header.reclen);
    let bad = if reclen < DIRENT_HEADER_LEN || reclen % 4 != 0 {
        Some("record length not a positive multiple of 4")
    } else if off + reclen > chunk.len() {
        Some("record crosses its chunk")
    } else if !header.is_unused() && header.used_len() > reclen {
        Some("name longer than its record")
    } else {
        None
    };
    match bad {
        Some(detail) => Err(UfsError::corruption(
            block.0,
            format!("directory record at chunk offset {off}: {detail}"),
        )),
        None => Ok(header),
    }
}

/// Walk every record of directory `dir` in order.
///
/// Each block is read once; blocks whose chunks a visitor edited are
/// written back before moving on. After a visit the record's length is
/// re-read, so a visitor that shrinks a record sees the space it carved
/// off as the next record. Returns whether a visitor stopped the walk.
pub fn iterate<F>(dev: &dyn BlockDevice, geo: &FsGeometry, dir: &Ufs2Dinode, mut visitor: F) -> Result<bool>
where
    F: FnMut(&mut Record<'_>) -> Result<Visit>,
{
    if !dir.is_dir() {
        return Err(UfsError::NotDirectory);
    }
    let bsize = u64::from(geo.bsize);
    for lbn in 0..howmany(dir.size, bsize) {
        let bno = bmap(dev, geo, dir, lbn)?;
        if bno.is_hole() {
            continue;
        }
        let start = geo.lblktosize(lbn);
        let len = inode_io_size(geo, dir.size, start) as usize;
        let mut buf = read_run(dev, geo, bno, len)?;
        // the directory size is a multiple of DIRBLKSIZ; the run may be longer
        #[expect(clippy::cast_possible_truncation)]
        let valid = (dir.size - start).min(len as u64) as usize;
        let mut dirty = false;
        let mut stopped = false;

        'chunks: for (ci, chunk) in buf[..valid].chunks_exact_mut(DIRBLKSIZ).enumerate() {
            let mut off = 0;
            let mut prev = None;
            while off < DIRBLKSIZ {
                let header = check_record(chunk, off, bno)?;
                let visit = {
                    let mut rec = Record {
                        chunk: &mut *chunk,
                        offset: off,
                        prev,
                        header,
                        pos: start + (ci * DIRBLKSIZ + off) as u64,
                        block: bno,
                    };
                    visitor(&mut rec)?
                };
                dirty |= visit.rewrites();
                if visit.stops() {
                    stopped = true;
                    break 'chunks;
                }
                let reclen = usize::from(check_record(chunk, off, bno)?.reclen);
                prev = Some(off);
                off += reclen;
            }
        }

        if dirty {
            write_run(dev, geo, bno, &buf)?;
            trace!(lbn, block = bno.0, "dir_block_rewrite");
        }
        if stopped {
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Names ───────────────────────────────────────────────────────────────────

/// A single path component: non-empty, at most `MAXNAMLEN` bytes, no `/`
/// or NUL.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(UfsError::InvalidArgument("empty directory entry name".to_owned()));
    }
    if name.len() > MAXNAMLEN {
        return Err(UfsError::NameTooLong);
    }
    if name.iter().any(|b| *b == b'/' || *b == 0) {
        return Err(UfsError::InvalidArgument(format!(
            "directory entry name {:?} contains '/' or NUL",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

fn record_ino(ino: InodeNumber) -> Result<u32> {
    match u32::try_from(ino.0) {
        Ok(0) | Err(_) => Err(UfsError::InvalidArgument(format!(
            "inode {ino} cannot be stored in a directory record"
        ))),
        Ok(v) => Ok(v),
    }
}

fn to_u16(len: usize, block: BlockNumber) -> Result<u16> {
    u16::try_from(len).map_err(|_| UfsError::corruption(block.0, "record length exceeds u16"))
}

// ── Insert ──────────────────────────────────────────────────────────────────

/// Per-record insertion step.
///
/// An unused record first absorbs an unused successor, then takes the new
/// entry if it fits. A used record with enough slack is shrunk to its
/// minimum and the remainder becomes an unused record, which is the next
/// one visited.
fn link_step(rec: &mut Record<'_>, need: usize, ino: u32, ftype: FileType, name: &[u8]) -> Result<Visit> {
    let reclen = usize::from(rec.header.reclen);
    if rec.header.is_unused() {
        let mut visit = Visit::Continue;
        if let Some(next) = rec.next_header()?.filter(DirentHeader::is_unused) {
            rec.header.reclen = to_u16(reclen + usize::from(next.reclen), rec.block)?;
            rec.write_header()?;
            visit = Visit::Rewrite;
            trace!(pos = rec.pos, reclen = rec.header.reclen, "dir_coalesce");
        }
        if usize::from(rec.header.reclen) >= need {
            write_record(rec.chunk, rec.offset, ino, ftype, name, rec.header.reclen)
                .map_err(|e| parse_to_ufs_error(&e, rec.block.0))?;
            trace!(pos = rec.pos, ino, reclen = rec.header.reclen, "dir_fill");
            return Ok(Visit::StopAndRewrite);
        }
        return Ok(visit);
    }

    let used = rec.header.used_len();
    if reclen >= used + need {
        rec.header.reclen = to_u16(used, rec.block)?;
        rec.write_header()?;
        let slack = DirentHeader {
            ino: 0,
            reclen: to_u16(reclen - used, rec.block)?,
            d_type: 0,
            namlen: 0,
        };
        slack
            .write(rec.chunk, rec.offset + used)
            .map_err(|e| parse_to_ufs_error(&e, rec.block.0))?;
        trace!(pos = rec.pos, kept = used, carved = reclen - used, "dir_split");
        return Ok(Visit::Rewrite);
    }
    Ok(Visit::Continue)
}

/// Add the entry `name -> ino` to directory `dir`.
///
/// Fails with `NoSpace` when no record can make room; the directory is
/// not grown here. Duplicate names are not detected.
pub fn link(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    read_only: bool,
    dir: &Ufs2Dinode,
    name: &[u8],
    ino: InodeNumber,
    ftype: FileType,
) -> Result<()> {
    if read_only {
        return Err(UfsError::ReadOnly);
    }
    validate_name(name)?;
    let raw = record_ino(ino)?;
    let need = dir_rec_len(name.len());
    let placed = iterate(dev, geo, dir, |rec| link_step(rec, need, raw, ftype, name))?;
    if !placed {
        debug!(name = %String::from_utf8_lossy(name), ino = ino.0, "dir_link_no_space");
        return Err(UfsError::NoSpace);
    }
    Ok(())
}

// ── Remove ──────────────────────────────────────────────────────────────────

/// Remove the first used record matching every given selector and return
/// the inode it named.
///
/// A record that is not first in its chunk is folded into the record
/// before it; the first record of a chunk keeps its length and only has
/// its inode number cleared.
pub fn unlink(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    read_only: bool,
    dir: &Ufs2Dinode,
    name: Option<&[u8]>,
    ino: Option<InodeNumber>,
) -> Result<InodeNumber> {
    if read_only {
        return Err(UfsError::ReadOnly);
    }
    if name.is_none() && ino.is_none() {
        return Err(UfsError::InvalidArgument("unlink needs a name or an inode".to_owned()));
    }
    if let Some(name) = name {
        validate_name(name)?;
    }
    let mut removed = None;
    iterate(dev, geo, dir, |rec| {
        if rec.header.is_unused() {
            return Ok(Visit::Continue);
        }
        if ino.is_some_and(|want| rec.header.inode() != want) {
            return Ok(Visit::Continue);
        }
        if let Some(want) = name {
            if rec.name()? != want {
                return Ok(Visit::Continue);
            }
        }
        removed = Some(rec.header.inode());
        if let Some(prev) = rec.prev {
            let mut before = check_record(rec.chunk, prev, rec.block)?;
            before.reclen = to_u16(usize::from(before.reclen) + usize::from(rec.header.reclen), rec.block)?;
            before
                .write(rec.chunk, prev)
                .map_err(|e| parse_to_ufs_error(&e, rec.block.0))?;
        } else {
            rec.header.ino = 0;
            rec.write_header()?;
        }
        trace!(pos = rec.pos, merged = rec.prev.is_some(), "dir_unlink");
        Ok(Visit::StopAndRewrite)
    })?;
    removed.ok_or_else(|| {
        UfsError::NotFound(match name {
            Some(n) => String::from_utf8_lossy(n).into_owned(),
            None => format!("entry for inode {}", ino.unwrap_or(InodeNumber::NONE)),
        })
    })
}

// ── Lookup and listing ──────────────────────────────────────────────────────

/// Find `name` in `dir`.
pub fn lookup(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    dir: &Ufs2Dinode,
    name: &[u8],
) -> Result<Option<(InodeNumber, FileType)>> {
    let mut found = None;
    iterate(dev, geo, dir, |rec| {
        if rec.header.is_unused() || usize::from(rec.header.namlen) != name.len() {
            return Ok(Visit::Continue);
        }
        if rec.name()? == name {
            found = Some((rec.header.inode(), rec.header.file_type()));
            return Ok(Visit::Stop);
        }
        Ok(Visit::Continue)
    })?;
    Ok(found)
}

/// A used directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    /// Position just past this record; resumes a listing after it.
    pub offset: u64,
    pub kind: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// List the used records of `dir` at or after byte position `from`.
pub fn read_dir(dev: &dyn BlockDevice, geo: &FsGeometry, dir: &Ufs2Dinode, from: u64) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    iterate(dev, geo, dir, |rec| {
        if rec.pos >= from && !rec.header.is_unused() {
            out.push(DirEntry {
                ino: rec.header.inode(),
                offset: rec.pos + u64::from(rec.header.reclen),
                kind: rec.header.file_type(),
                name: rec.name()?.to_vec(),
            });
        }
        Ok(Visit::Continue)
    })?;
    Ok(out)
}

fn is_dot_or_dotdot(name: &[u8]) -> bool {
    name == b"." || name == b".."
}

/// True when `dir` holds nothing but `.` and `..`.
pub fn is_empty(dev: &dyn BlockDevice, geo: &FsGeometry, dir: &Ufs2Dinode) -> Result<bool> {
    let mut empty = true;
    iterate(dev, geo, dir, |rec| {
        if rec.header.is_unused() || is_dot_or_dotdot(rec.name()?) {
            return Ok(Visit::Continue);
        }
        empty = false;
        Ok(Visit::Stop)
    })?;
    Ok(empty)
}

/// Repoint the `..` entry of `dir` at `parent`.
pub fn set_dotdot(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    read_only: bool,
    dir: &Ufs2Dinode,
    parent: InodeNumber,
) -> Result<()> {
    if read_only {
        return Err(UfsError::ReadOnly);
    }
    let raw = record_ino(parent)?;
    let mut first_block = None;
    let done = iterate(dev, geo, dir, |rec| {
        first_block.get_or_insert(rec.block);
        if rec.header.is_unused() || rec.name()? != b".." {
            return Ok(Visit::Continue);
        }
        rec.header.ino = raw;
        rec.write_header()?;
        Ok(Visit::StopAndRewrite)
    })?;
    if !done {
        return Err(UfsError::corruption(
            first_block.map_or(0, |b| b.0),
            "directory has no '..' entry",
        ));
    }
    Ok(())
}

/// A fresh `DIRBLKSIZ` chunk holding `.` and `..`; `..` owns the rest of
/// the chunk.
pub fn init_dir_block(ino: InodeNumber, parent: InodeNumber) -> Result<Vec<u8>> {
    let mut block = vec![0_u8; DIRBLKSIZ];
    let dot_len = dir_rec_len(1);
    let map = |e: ufs_types::ParseError| UfsError::Format(e.to_string());
    write_record(
        &mut block,
        0,
        record_ino(ino)?,
        FileType::Directory,
        b".",
        to_u16(dot_len, BlockNumber::HOLE)?,
    )
    .map_err(map)?;
    write_record(
        &mut block,
        dot_len,
        record_ino(parent)?,
        FileType::Directory,
        b"..",
        to_u16(DIRBLKSIZ - dot_len, BlockNumber::HOLE)?,
    )
    .map_err(map)?;
    Ok(block)
}

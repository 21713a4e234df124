#![forbid(unsafe_code)]
//! Shared types for the UFS engine.
//!
//! Unit-carrying newtypes keep fragment addresses, device sectors, inode
//! numbers and cylinder-group indices from being mixed up. The constants
//! mirror the UFS2 on-disk format.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── UFS2 format constants ───────────────────────────────────────────────────

/// Byte offset of the UFS2 superblock.
pub const SBLOCK_UFS2: u64 = 65_536;
/// Space reserved for the superblock.
pub const SBLOCKSIZE: u32 = 8192;
/// Device sector size; `fsbtodb` converts fragments to this unit.
pub const DEV_BSIZE: u32 = 512;
/// Direct block pointers per inode.
pub const NDADDR: usize = 12;
/// Indirect block pointers per inode (single, double, triple).
pub const NIADDR: usize = 3;
/// External attribute block pointers per inode.
pub const NXADDR: usize = 2;
/// Largest supported fragments-per-block.
pub const MAXFRAG: usize = 8;
/// Size of a block pointer (`ufs2_daddr_t`).
pub const DADDR_SIZE: u32 = 8;
/// On-disk UFS2 inode size.
pub const DINODE_SIZE: usize = 256;
/// Cylinder-group magic number.
pub const CG_MAGIC: u32 = 0x0009_0255;
/// Directory chunk size; records never cross a chunk.
pub const DIRBLKSIZ: usize = 512;
/// Longest name a directory record can hold.
pub const MAXNAMLEN: usize = 255;
/// Largest link count accepted by `link` and `mkdir`.
pub const LINK_MAX: u16 = 255;
/// Symlink targets shorter than this live inline in the block pointers.
pub const MAXSYMLINKLEN: usize = (NDADDR + NIADDR) * DADDR_SIZE as usize;
/// Maximum number of symlinks followed during one path resolution.
pub const MAX_SYMLINK_HOPS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Cylinder group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Device address in `DEV_BSIZE` sectors (what `fsbtodb` yields).
///
/// Kept distinct from [`BlockNumber`], which counts filesystem fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskAddr(pub u64);

impl DiskAddr {
    /// Byte offset of this sector on the device, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(u64::from(DEV_BSIZE))
    }
}

impl InodeNumber {
    /// Root directory inode.
    pub const ROOT: Self = Self(2);
    /// Never allocated; inode 0 means "unused" in directory records.
    pub const NONE: Self = Self(0);
}

impl BlockNumber {
    /// A zero block pointer denotes a hole.
    pub const HOLE: Self = Self(0);

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == 0
    }

    /// Add a fragment count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DiskAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Mode bits ───────────────────────────────────────────────────────────────

/// File type mask.
pub const S_IFMT: u16 = 0o170_000;
/// FIFO.
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;
/// Set-user-ID on execution.
pub const S_ISUID: u16 = 0o4000;
/// Set-group-ID on execution.
pub const S_ISGID: u16 = 0o2000;
/// Sticky bit.
pub const S_ISVTX: u16 = 0o1000;
pub const S_IRWXU: u16 = 0o700;
pub const S_IRWXG: u16 = 0o070;
pub const S_IRWXO: u16 = 0o007;

/// Directory record type tag (`d_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Fifo = 1,
    CharDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    Symlink = 10,
    Socket = 12,
    Whiteout = 14,
}

impl FileType {
    /// Derive the record tag from an inode mode.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFIFO => Self::Fifo,
            S_IFCHR => Self::CharDevice,
            S_IFDIR => Self::Directory,
            S_IFBLK => Self::BlockDevice,
            S_IFREG => Self::RegularFile,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            _ => Self::Unknown,
        }
    }

    /// Decode a raw `d_type` byte; unknown values decode as `Unknown`.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Fifo,
            2 => Self::CharDevice,
            4 => Self::Directory,
            6 => Self::BlockDevice,
            8 => Self::RegularFile,
            10 => Self::Symlink,
            12 => Self::Socket,
            14 => Self::Whiteout,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    read_le_u32(data, offset).map(|v| i32::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

/// Mutable counterpart of [`ensure_slice`].
#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        })
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Round `value` up to a multiple of `alignment` (a non-zero power of two).
///
/// Returns `None` on overflow or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// `howmany(x, y)`: number of `y`-sized units needed to hold `x`.
#[must_use]
pub fn howmany(x: u64, y: u64) -> u64 {
    x.div_ceil(y)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Wall-clock time as (seconds, nanoseconds) since the Unix epoch, the
/// shape every on-disk timestamp uses. A clock before the epoch reads as 0.
#[must_use]
pub fn unix_now() -> (i64, i32) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (
        i64::try_from(now.as_secs()).unwrap_or(i64::MAX),
        i32::try_from(now.subsec_nanos()).unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_round_trip_at_offsets() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0xBEEF).unwrap();
        write_le_u32(&mut buf, 2, 0x0009_0255).unwrap();
        write_le_i64(&mut buf, 8, -2).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), CG_MAGIC);
        assert_eq!(read_le_i64(&buf, 8).unwrap(), -2);
        assert_eq!(buf[2], 0x55);
    }

    #[test]
    fn short_buffers_report_insufficient_data() {
        let buf = [0_u8; 3];
        assert_eq!(
            read_le_u32(&buf, 0),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3,
            })
        );
        let mut small = [0_u8; 4];
        assert!(write_le_u64(&mut small, 0, 1).is_err());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(FileType::from_mode(S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(FileType::from_mode(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(FileType::from_mode(0o644), FileType::Unknown);
        assert_eq!(FileType::from_raw(FileType::Socket as u8), FileType::Socket);
        assert_eq!(FileType::from_raw(3), FileType::Unknown);
    }

    #[test]
    fn symlink_inline_threshold_matches_pointer_area() {
        assert_eq!(MAXSYMLINKLEN, 120);
    }

    #[test]
    fn sector_byte_offset_checks_overflow() {
        assert_eq!(DiskAddr(3).to_byte_offset(), Some(1536));
        assert_eq!(DiskAddr(u64::MAX).to_byte_offset(), None);
    }

    #[test]
    fn align_and_howmany() {
        assert_eq!(align_up(5, 4), Some(8));
        assert_eq!(align_up(8, 4), Some(8));
        assert_eq!(align_up(1, 0), None);
        assert_eq!(align_up(u64::MAX, 8), None);
        assert_eq!(howmany(9, 8), 2);
        assert_eq!(howmany(0, 8), 0);
    }

    #[test]
    fn display_newtypes() {
        assert_eq!(BlockNumber(42).to_string(), "42");
        assert_eq!(InodeNumber::ROOT.to_string(), "2");
        assert_eq!(GroupNumber(3).to_string(), "3");
        assert!(BlockNumber::HOLE.is_hole());
    }
}

#![forbid(unsafe_code)]
//! Error types for the UFS engine.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ufs-types` | Byte-level format violations in cylinder groups, inodes and records |
//! | Runtime | `UfsError` | `ufs-error` (this crate) | Errors surfaced to the dispatch layer, CLI and API consumers |
//!
//! `ufs-error` does not depend on `ufs-types`; the `ParseError` to
//! `UfsError` conversion lives in `ufs-ondisk`, the first crate that sees
//! both. A parse failure on live metadata becomes `Corruption` with the
//! fragment address of the offending block.
//!
//! ## Fatal conditions
//!
//! Freeing an already-free block, fragment or inode, an inode number beyond
//! `ncg * ipg`, and allocating an inode whose on-disk mode is still set are
//! not represented here. They are invariant violations: the allocator logs
//! them and panics instead of returning.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` / `Parse` / `InvalidGeometry` / `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `PermissionDenied` | `EACCES` |
//! | `ReadOnly` | `EROFS` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `TooManyLinks` | `EMLINK` |
//! | `SymlinkLoop` | `ELOOP` |

use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum UfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata at a known fragment address is unreadable or inconsistent.
    ///
    /// Covers a bad cylinder-group magic, a free count that disagrees with
    /// the bitmap, and records that do not tile their chunk.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format or image shape.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Geometry that the engine cannot operate on.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Oversized request, malformed path, or an unlink with no selector.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation exhausted every cylinder group, or a directory is full.
    #[error("no space left on device")]
    NoSpace,

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    /// Filesystem is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Name exceeds 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists (create, mkdir, link, symlink).
    #[error("file exists")]
    Exists,

    /// Link count would exceed `LINK_MAX`.
    #[error("too many links")]
    TooManyLinks,

    /// Path resolution followed more symbolic links than allowed.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
}

impl UfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The mapping is exhaustive; adding a variant without an errno is a
    /// compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::TooManyLinks => libc::EMLINK,
            Self::SymlinkLoop => libc::ELOOP,
        }
    }

    /// Shorthand for a `Corruption` error.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `UfsError`.
pub type Result<T> = std::result::Result<T, UfsError>;

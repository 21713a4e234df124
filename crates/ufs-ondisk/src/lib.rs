#![forbid(unsafe_code)]
//! On-disk format for UFS2.
//!
//! Pure codec crate, no I/O. Parses and serializes cylinder-group blocks,
//! `ufs2_dinode` records and directory records, and carries the filesystem
//! geometry with the unit conversions (`fsbtodb`, `dtog`, `ino_to_fsba`, ...)
//! every other layer relies on.

pub mod cg;
pub mod dinode;
pub mod dirent;
pub mod geometry;

pub use cg::{CG_HEADER_SIZE, CgSummary, CylinderGroup};
pub use dinode::Ufs2Dinode;
pub use dirent::{DIRENT_HEADER_LEN, DirentHeader, dir_rec_len, record_name, write_record};
pub use geometry::{FsGeometry, GeometryConfig};

use ufs_error::UfsError;
use ufs_types::ParseError;

/// Convert a parse failure on live metadata into a `Corruption` error
/// tagged with the fragment address it was read from.
#[must_use]
pub fn parse_to_ufs_error(err: &ParseError, block: u64) -> UfsError {
    match err {
        ParseError::InvalidMagic { .. } | ParseError::InvalidField { .. } => UfsError::Corruption {
            block,
            detail: err.to_string(),
        },
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            UfsError::Corruption {
                block,
                detail: format!("truncated or out-of-range metadata: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_become_corruption_with_block() {
        let err = ParseError::InvalidMagic {
            expected: 0x0009_0255,
            actual: 0,
        };
        let converted = parse_to_ufs_error(&err, 144);
        assert!(matches!(converted, UfsError::Corruption { block: 144, .. }));
        assert_eq!(converted.to_errno(), 5);
    }
}

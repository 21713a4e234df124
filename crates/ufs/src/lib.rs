#![forbid(unsafe_code)]
//! UFS2 engine public API facade.
//!
//! Re-exports the filesystem context from `ufs-core` through a stable
//! external interface. This is the crate the CLI and other consumers
//! depend on.

pub use ufs_core::*;

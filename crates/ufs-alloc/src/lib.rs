#![forbid(unsafe_code)]
//! Block, fragment and inode allocation for UFS2.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **bitmap**: free-map bit operations and the fragment pattern tables.
//! 2. **group**: allocation and release inside one cylinder group, with
//!    fragment histograms and cluster accounting kept in step.
//! 3. **hash**: cross-group policy (`hashalloc`, `dirpref`) and the public
//!    `alloc_block` / `alloc_inode` entry points.
//!
//! [`FsParams`] carries the geometry and the counters that must always
//! equal the sum of the cylinder-group headers.

pub mod bitmap;
pub mod group;
pub mod hash;
pub mod params;

pub use group::{
    alloc_in_group, alloc_inode_in_group, format_groups, free_blocks, free_inode, new_generation,
};
pub use hash::{alloc_block, alloc_inode, dirpref, hashalloc};
pub use params::{FsParams, read_group, recount, write_group};

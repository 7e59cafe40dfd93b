//! # sptree-storage
//!
//! Paged storage and insertion engine for space-partitioned tree indexes.
//!
//! This crate provides:
//! - Slotted pages with offset-stable line pointers and checksummed headers
//! - A buffer manager handing out exclusive page latches, blocking or not
//! - The SP-GiST insertion engine: descent, leaf chains, pick-split and
//!   inner tuple mutation, driven by a pluggable partitioning strategy

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Page layout and disk format
pub mod page;

/// Page frames, latches and file backing
pub mod buffer;

/// Space-partitioned tree index
pub mod spgist;

pub use spgist::{
    InsertContext, InsertMode, InsertOutcome, PartitionStrategy, SpGistConfig, SpGistError,
    SpGistIndex, SpGistResult,
};

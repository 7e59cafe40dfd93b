//! # sptree-common
//!
//! Common types and constants for the sptree crates.
//!
//! This crate provides the foundational types shared by the write-ahead
//! record model and the storage engine:
//!
//! - **Types**: identifiers (`PageId`, `TxnId`, `Lsn`) and item addressing
//!   (`ItemOffset`, `ItemPointer`)
//! - **Constants**: page geometry and index tuning defaults
//!
//! ## Example
//!
//! ```rust
//! use sptree_common::types::{ItemPointer, PageId};
//!
//! let ptr = ItemPointer::new(PageId::new(7), 3);
//! assert!(ptr.is_valid());
//! assert_eq!(ptr.page_id(), PageId::new(7));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod types;

pub use constants::*;

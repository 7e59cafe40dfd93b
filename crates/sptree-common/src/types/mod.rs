//! Type definitions shared across the sptree crates.

mod ids;

pub use ids::{ItemOffset, ItemPointer, Lsn, PageId, TxnId, FIRST_OFFSET, INVALID_OFFSET};

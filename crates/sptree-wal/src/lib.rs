//! # sptree-wal
//!
//! Change records for the sptree insertion engine.
//!
//! The engine describes every atomic group of page mutations with one
//! [`ChangeRecord`] and hands it to a [`WalSink`] while the affected pages
//! are still latched. Record replay is outside this crate; records carry
//! enough information to identify every touched page and the tuples that
//! were written.
//!
//! ## Record Format
//!
//! [`MemoryWal`] frames each record as:
//!
//! ```text
//! +----------+------------+--------------------+
//! | Type (1) | Length (4) | Payload (variable) |
//! +----------+------------+--------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

/// Change record types and serialization.
pub mod record;

/// Destinations for change records.
pub mod sink;

pub use error::{WalError, WalResult};
pub use record::{
    AddLeafPayload, AddNodePayload, ChangeRecord, CreateIndexPayload, MoveLeafsPayload, NodeLink,
    Payload, PickSplitPayload, RecordFlags, RecordType, SplitTuplePayload,
};
pub use sink::{MemoryWal, NoopWal, WalSink};

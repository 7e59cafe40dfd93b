//! Change record types and serialization.
//!
//! Each record is a fixed type byte followed by a typed payload encoded
//! little-endian with `bytes`.

pub mod payload;
pub mod types;

pub use payload::{
    AddLeafPayload, AddNodePayload, CreateIndexPayload, MoveLeafsPayload, NodeLink, Payload,
    PickSplitPayload, SplitTuplePayload,
};
pub use types::{ChangeRecord, RecordFlags, RecordType};

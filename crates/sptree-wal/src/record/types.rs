//! Change record types and flags.
//!
//! This module defines the record types and the main `ChangeRecord` enum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sptree_common::types::PageId;

use super::payload::*;
use crate::error::{WalError, WalResult};

/// Record type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Fixed pages of a new index were initialized.
    CreateIndex = 1,
    /// A leaf tuple was added.
    AddLeaf = 2,
    /// A leaf chain was moved to another page.
    MoveLeafs = 3,
    /// A node was added to an inner tuple.
    AddNode = 4,
    /// An inner tuple was split into prefix and postfix.
    SplitTuple = 5,
    /// A leaf location was partitioned under a new inner tuple.
    PickSplit = 6,
}

impl RecordType {
    /// Converts the record type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record type from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::CreateIndex),
            2 => Ok(Self::AddLeaf),
            3 => Ok(Self::MoveLeafs),
            4 => Ok(Self::AddNode),
            5 => Ok(Self::SplitTuple),
            6 => Ok(Self::PickSplit),
            _ => Err(WalError::UnknownRecordType(value)),
        }
    }

    /// Returns true if the record changes the tree's shape rather than
    /// only adding leaf data.
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::AddNode | Self::SplitTuple | Self::PickSplit)
    }
}

bitflags::bitflags! {
    /// Flags qualifying a change record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordFlags: u16 {
        /// The destination page was freshly initialized.
        const NEW_PAGE = 0b0000_0000_0001;
        /// The affected tree is the one for null keys.
        const STORES_NULLS = 0b0000_0000_0010;
        /// A dead chain head was overwritten instead of tombstoned.
        const REPLACE_DEAD = 0b0000_0000_0100;
        /// The source page was reinitialized wholesale.
        const INIT_SRC = 0b0000_0000_1000;
        /// The second leaf page was initialized.
        const INIT_DEST = 0b0000_0001_0000;
        /// The page receiving the inner tuple was initialized.
        const INIT_INNER = 0b0000_0010_0000;
        /// The root was promoted from leaf to inner.
        const ROOT_SPLIT = 0b0000_0100_0000;
        /// The change was made during an exclusive build.
        const BUILD = 0b0000_1000_0000;
    }
}

/// One atomic group of page mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// Index creation.
    CreateIndex(CreateIndexPayload),
    /// Leaf tuple added.
    AddLeaf(AddLeafPayload),
    /// Leaf chain relocated.
    MoveLeafs(MoveLeafsPayload),
    /// Inner tuple enlarged.
    AddNode(AddNodePayload),
    /// Inner tuple split.
    SplitTuple(SplitTuplePayload),
    /// Leaf location partitioned.
    PickSplit(PickSplitPayload),
}

impl ChangeRecord {
    /// Returns the record type.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::CreateIndex(_) => RecordType::CreateIndex,
            Self::AddLeaf(_) => RecordType::AddLeaf,
            Self::MoveLeafs(_) => RecordType::MoveLeafs,
            Self::AddNode(_) => RecordType::AddNode,
            Self::SplitTuple(_) => RecordType::SplitTuple,
            Self::PickSplit(_) => RecordType::PickSplit,
        }
    }

    /// Returns every page the record describes a change to, sorted and
    /// without duplicates.
    pub fn touched_pages(&self) -> Vec<PageId> {
        let mut pages = match self {
            Self::CreateIndex(p) => vec![p.meta, p.root, p.nulls_root],
            Self::AddLeaf(p) => {
                let mut v = vec![p.page_id];
                v.extend(p.parent.map(|l| l.page_id));
                v
            }
            Self::MoveLeafs(p) => vec![p.src_page, p.dest_page, p.parent.page_id],
            Self::AddNode(p) => {
                let mut v = vec![p.page_id, p.new_location.page_id()];
                v.extend(p.parent.map(|l| l.page_id));
                v
            }
            Self::SplitTuple(p) => vec![p.prefix.page_id(), p.postfix.page_id()],
            Self::PickSplit(p) => {
                let mut v = vec![p.src_page, p.dest_page, p.inner.page_id()];
                v.extend(p.leaves.iter().map(|l| l.page_id()));
                v.extend(p.parent.map(|l| l.page_id));
                v
            }
        };
        pages.retain(|p| p.is_valid());
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    /// Encodes the record as `[type][len][payload]`.
    pub fn encode(&self) -> WalResult<Bytes> {
        let payload = match self {
            Self::CreateIndex(p) => p.serialize()?,
            Self::AddLeaf(p) => p.serialize()?,
            Self::MoveLeafs(p) => p.serialize()?,
            Self::AddNode(p) => p.serialize()?,
            Self::SplitTuple(p) => p.serialize()?,
            Self::PickSplit(p) => p.serialize()?,
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| WalError::serialization_error("payload exceeds u32 length"))?;

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(self.record_type().as_u8());
        buf.put_u32_le(len);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Decodes one framed record, returning it and the number of bytes
    /// consumed.
    pub fn decode(bytes: &[u8]) -> WalResult<(Self, usize)> {
        let mut buf = bytes;
        if buf.remaining() < 5 {
            return Err(WalError::deserialization_error("record frame too short"));
        }
        let record_type = RecordType::from_u8(buf.get_u8())?;
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(WalError::deserialization_error("record payload truncated"));
        }
        let payload = &buf[..len];

        let record = match record_type {
            RecordType::CreateIndex => Self::CreateIndex(CreateIndexPayload::deserialize(payload)?),
            RecordType::AddLeaf => Self::AddLeaf(AddLeafPayload::deserialize(payload)?),
            RecordType::MoveLeafs => Self::MoveLeafs(MoveLeafsPayload::deserialize(payload)?),
            RecordType::AddNode => Self::AddNode(AddNodePayload::deserialize(payload)?),
            RecordType::SplitTuple => Self::SplitTuple(SplitTuplePayload::deserialize(payload)?),
            RecordType::PickSplit => Self::PickSplit(PickSplitPayload::deserialize(payload)?),
        };
        Ok((record, 5 + len))
    }
}

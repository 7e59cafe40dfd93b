//! On-page tuple formats.
//!
//! Three tuple families share the first byte, which holds the
//! [`TupleState`]:
//!
//! ```text
//! Leaf (12 byte header):
//! +-------+-------+----------+------------+-------------+-----------+-------+
//! | state | flags | next u16 | heap block | heap offset | datum len | datum |
//! +-------+-------+----------+------------+-------------+-----------+-------+
//!
//! Inner (8 byte header):
//! +-------+-------+-------------+-------------+-----+--------+-------+-----+
//! | state | flags | n_nodes u16 | prefix len  | pad | prefix | node0 | ... |
//! +-------+-------+-------------+-------------+-----+--------+-------+-----+
//!
//! Node (10 byte header):
//! +-------------+------------+-------+-----+-----------+-------+
//! | block u32   | offset u16 | flags | pad | label len | label |
//! +-------------+------------+-------+-----+-----------+-------+
//!
//! Dead (20 bytes, redirect / dead / placeholder):
//! +-------+-----+----------+--------------+---------------+-----+---------+
//! | state | pad | next u16 | target block | target offset | pad | xid u64 |
//! +-------+-----+----------+--------------+---------------+-----+---------+
//! ```
//!
//! Leaf and inner tuples are padded to at least [`DEAD_TUPLE_SIZE`] so any
//! of them can be overwritten by a tombstone without moving other items.
//! Tuples are built as owned values and encoded to [`Bytes`]; the few
//! fields the engine patches in place (chain links, downlinks, redirect
//! targets) have dedicated accessors over the raw item bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sptree_common::types::{ItemOffset, ItemPointer, PageId, TxnId, INVALID_OFFSET};
use thiserror::Error;

use super::error::{SpGistError, SpGistResult};
use crate::page::SLOT_SIZE;

/// Size of a leaf tuple header.
pub const LEAF_HEADER_SIZE: usize = 12;

/// Size of every tombstone.
pub const DEAD_TUPLE_SIZE: usize = 20;

/// Size of an inner tuple header.
pub const INNER_HEADER_SIZE: usize = 8;

/// Size of a node header inside an inner tuple.
pub const NODE_HEADER_SIZE: usize = 10;

const LEAF_IS_NULL: u8 = 0x01;
const INNER_ALL_THE_SAME: u8 = 0x01;
const INNER_HAS_PREFIX: u8 = 0x02;
const NODE_HAS_LABEL: u8 = 0x01;

/// Tuple bytes that do not decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed tuple: {0}")]
pub struct MalformedTuple(pub String);

impl MalformedTuple {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// Attaches the page the tuple was read from.
    pub fn on_page(self, page_id: PageId) -> SpGistError {
        SpGistError::corrupted(page_id, self.0)
    }
}

/// Result type for tuple decoding.
pub type TupleResult<T> = Result<T, MalformedTuple>;

/// Lifecycle state stored in the first byte of every tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TupleState {
    /// Normal tuple.
    Live = 0,
    /// Tombstone pointing at the tuple's new location.
    Redirect = 1,
    /// Dead leaf kept only as a chain head.
    Dead = 2,
    /// Reusable slot.
    Placeholder = 3,
}

impl TupleState {
    /// Converts a byte to a state.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Live),
            1 => Some(Self::Redirect),
            2 => Some(Self::Dead),
            3 => Some(Self::Placeholder),
            _ => None,
        }
    }

    /// Converts the state to a byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Reads the state byte of any tuple.
pub fn tuple_state(bytes: &[u8]) -> TupleResult<TupleState> {
    let b = *bytes
        .first()
        .ok_or_else(|| MalformedTuple::new("empty item"))?;
    TupleState::from_byte(b).ok_or_else(|| MalformedTuple::new(format!("unknown tuple state {b}")))
}

fn check_len(bytes: &[u8], need: usize, what: &str) -> TupleResult<()> {
    if bytes.len() < need {
        return Err(MalformedTuple::new(format!(
            "{what} needs {need} bytes, item has {}",
            bytes.len()
        )));
    }
    Ok(())
}

fn get_pointer(buf: &mut &[u8]) -> ItemPointer {
    let block = buf.get_u32_le();
    let offset = buf.get_u16_le();
    ItemPointer::new(PageId::new(block), offset)
}

// =============================================================================
// Leaf tuples
// =============================================================================

/// A leaf entry: one indexed value and the row it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafTuple {
    /// Row this entry indexes.
    pub heap_ptr: ItemPointer,
    /// Next tuple of the chain on the same page, or `INVALID_OFFSET`.
    pub next: ItemOffset,
    /// Leaf datum; `None` for a null key.
    pub datum: Option<Vec<u8>>,
}

impl LeafTuple {
    /// Creates an unlinked leaf tuple.
    pub fn new(heap_ptr: ItemPointer, datum: Option<Vec<u8>>) -> Self {
        Self {
            heap_ptr,
            next: INVALID_OFFSET,
            datum,
        }
    }

    /// Encoded size of a leaf holding `datum`.
    pub fn size_for(datum: Option<&[u8]>) -> usize {
        let len = datum.map_or(0, <[u8]>::len);
        (LEAF_HEADER_SIZE + len).max(DEAD_TUPLE_SIZE)
    }

    /// Encoded size.
    #[inline]
    pub fn size(&self) -> usize {
        Self::size_for(self.datum.as_deref())
    }

    /// Space the tuple takes on a page, including its slot.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.size() + SLOT_SIZE
    }

    /// Returns true if the tuple indexes a null key.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.datum.is_none()
    }

    /// Encodes the tuple.
    pub fn encode(&self) -> Bytes {
        let size = self.size();
        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(TupleState::Live.as_byte());
        buf.put_u8(if self.is_null() { LEAF_IS_NULL } else { 0 });
        buf.put_u16_le(self.next);
        buf.put_u32_le(self.heap_ptr.page_id().as_u32());
        buf.put_u16_le(self.heap_ptr.offset());
        let datum = self.datum.as_deref().unwrap_or(&[]);
        buf.put_u16_le(datum.len() as u16);
        buf.put_slice(datum);
        buf.resize(size, 0);
        buf.freeze()
    }

    /// Decodes a live leaf tuple.
    pub fn decode(bytes: &[u8]) -> TupleResult<Self> {
        check_len(bytes, LEAF_HEADER_SIZE, "leaf tuple")?;
        let mut buf = bytes;
        let state = buf.get_u8();
        if state != TupleState::Live.as_byte() {
            return Err(MalformedTuple::new(format!(
                "expected live leaf tuple, found state {state}"
            )));
        }
        let flags = buf.get_u8();
        let next = buf.get_u16_le();
        let heap_ptr = get_pointer(&mut buf);
        let len = buf.get_u16_le() as usize;
        check_len(bytes, LEAF_HEADER_SIZE + len, "leaf datum")?;

        let datum = if flags & LEAF_IS_NULL != 0 {
            None
        } else {
            Some(buf[..len].to_vec())
        };
        Ok(Self {
            heap_ptr,
            next,
            datum,
        })
    }
}

/// Reads the chain link of a leaf or dead tuple.
pub fn leaf_next(bytes: &[u8]) -> TupleResult<ItemOffset> {
    check_len(bytes, 4, "chain link")?;
    Ok(u16::from_le_bytes([bytes[2], bytes[3]]))
}

/// Overwrites the chain link of a leaf tuple in place.
pub fn set_leaf_next(bytes: &mut [u8], next: ItemOffset) -> TupleResult<()> {
    check_len(bytes, 4, "chain link")?;
    bytes[2..4].copy_from_slice(&next.to_le_bytes());
    Ok(())
}

// =============================================================================
// Inner tuples
// =============================================================================

/// One child of an inner tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTuple {
    /// Optional label; either every node of a tuple has one or none does.
    pub label: Option<Vec<u8>>,
    /// Child location; invalid until something is stored below the node.
    pub downlink: ItemPointer,
}

impl NodeTuple {
    /// Creates a node with no child yet.
    pub fn new(label: Option<Vec<u8>>) -> Self {
        Self {
            label,
            downlink: ItemPointer::INVALID,
        }
    }

    /// Encoded size.
    #[inline]
    pub fn size(&self) -> usize {
        NODE_HEADER_SIZE + self.label.as_ref().map_or(0, Vec::len)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.downlink.page_id().as_u32());
        buf.put_u16_le(self.downlink.offset());
        buf.put_u8(if self.label.is_some() { NODE_HAS_LABEL } else { 0 });
        buf.put_u8(0);
        let label = self.label.as_deref().unwrap_or(&[]);
        buf.put_u16_le(label.len() as u16);
        buf.put_slice(label);
    }

    fn decode_from(buf: &mut &[u8]) -> TupleResult<Self> {
        if buf.remaining() < NODE_HEADER_SIZE {
            return Err(MalformedTuple::new("node header truncated"));
        }
        let downlink = get_pointer(buf);
        let flags = buf.get_u8();
        buf.advance(1);
        let len = buf.get_u16_le() as usize;
        if buf.remaining() < len {
            return Err(MalformedTuple::new("node label truncated"));
        }
        let label = (flags & NODE_HAS_LABEL != 0).then(|| buf[..len].to_vec());
        buf.advance(len);
        Ok(Self { label, downlink })
    }
}

/// A partitioning decision: an optional shared prefix and its child nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerTuple {
    /// Every node carries the same label and values were spread arbitrarily.
    pub all_the_same: bool,
    /// Prefix shared by every value below this tuple.
    pub prefix: Option<Vec<u8>>,
    /// Child nodes in order.
    pub nodes: Vec<NodeTuple>,
}

impl InnerTuple {
    /// Creates an inner tuple.
    pub fn new(prefix: Option<Vec<u8>>, nodes: Vec<NodeTuple>, all_the_same: bool) -> Self {
        Self {
            all_the_same,
            prefix,
            nodes,
        }
    }

    /// Encoded size.
    pub fn size(&self) -> usize {
        let raw = INNER_HEADER_SIZE
            + self.prefix.as_ref().map_or(0, Vec::len)
            + self.nodes.iter().map(NodeTuple::size).sum::<usize>();
        raw.max(DEAD_TUPLE_SIZE)
    }

    /// Space the tuple takes on a page, including its slot.
    #[inline]
    pub fn footprint(&self) -> usize {
        self.size() + SLOT_SIZE
    }

    /// Rejects tuples that could never be stored on a page of `capacity`
    /// usable bytes.
    pub fn check_size(&self, capacity: usize) -> SpGistResult<()> {
        let size = self.size();
        let max = capacity - SLOT_SIZE;
        if size > max || self.nodes.len() > u16::MAX as usize {
            return Err(SpGistError::InnerTupleTooLarge { size, max });
        }
        Ok(())
    }

    /// Returns node labels, or `None` if the nodes are unlabeled.
    pub fn labels(&self) -> TupleResult<Option<Vec<&[u8]>>> {
        let Some(first) = self.nodes.first() else {
            return Ok(None);
        };
        let labeled = first.label.is_some();
        let mut labels = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            match (&node.label, labeled) {
                (Some(label), true) => labels.push(label.as_slice()),
                (None, false) => {}
                _ => {
                    return Err(MalformedTuple::new(
                        "some but not all node labels are null in inner tuple",
                    ))
                }
            }
        }
        Ok(labeled.then_some(labels))
    }

    /// Encodes the tuple.
    pub fn encode(&self) -> Bytes {
        let size = self.size();
        let mut buf = BytesMut::with_capacity(size);
        let mut flags = 0;
        if self.all_the_same {
            flags |= INNER_ALL_THE_SAME;
        }
        if self.prefix.is_some() {
            flags |= INNER_HAS_PREFIX;
        }
        let prefix = self.prefix.as_deref().unwrap_or(&[]);

        buf.put_u8(TupleState::Live.as_byte());
        buf.put_u8(flags);
        buf.put_u16_le(self.nodes.len() as u16);
        buf.put_u16_le(prefix.len() as u16);
        buf.put_u16_le(0);
        buf.put_slice(prefix);
        for node in &self.nodes {
            node.encode_into(&mut buf);
        }
        buf.resize(size, 0);
        buf.freeze()
    }

    /// Decodes a live inner tuple.
    pub fn decode(bytes: &[u8]) -> TupleResult<Self> {
        check_len(bytes, INNER_HEADER_SIZE, "inner tuple")?;
        let mut buf = bytes;
        let state = buf.get_u8();
        if state != TupleState::Live.as_byte() {
            return Err(MalformedTuple::new(format!(
                "expected live inner tuple, found state {state}"
            )));
        }
        let flags = buf.get_u8();
        let n_nodes = buf.get_u16_le() as usize;
        let prefix_len = buf.get_u16_le() as usize;
        buf.advance(2);
        if buf.remaining() < prefix_len {
            return Err(MalformedTuple::new("prefix truncated"));
        }
        let prefix = (flags & INNER_HAS_PREFIX != 0).then(|| buf[..prefix_len].to_vec());
        buf.advance(prefix_len);

        let mut nodes = Vec::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            nodes.push(NodeTuple::decode_from(&mut buf)?);
        }
        Ok(Self {
            all_the_same: flags & INNER_ALL_THE_SAME != 0,
            prefix,
            nodes,
        })
    }
}

/// Overwrites the downlink of node `node` in an encoded inner tuple.
pub fn set_node_downlink(bytes: &mut [u8], node: usize, downlink: ItemPointer) -> TupleResult<()> {
    check_len(bytes, INNER_HEADER_SIZE, "inner tuple")?;
    let n_nodes = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    if node >= n_nodes {
        return Err(MalformedTuple::new(format!(
            "node {node} out of range for inner tuple with {n_nodes} nodes"
        )));
    }
    let prefix_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;

    let mut pos = INNER_HEADER_SIZE + prefix_len;
    for _ in 0..node {
        check_len(bytes, pos + NODE_HEADER_SIZE, "node header")?;
        let label_len = u16::from_le_bytes([bytes[pos + 8], bytes[pos + 9]]) as usize;
        pos += NODE_HEADER_SIZE + label_len;
    }
    check_len(bytes, pos + NODE_HEADER_SIZE, "node header")?;
    bytes[pos..pos + 4].copy_from_slice(&downlink.page_id().as_u32().to_le_bytes());
    bytes[pos + 4..pos + 6].copy_from_slice(&downlink.offset().to_le_bytes());
    Ok(())
}

// =============================================================================
// Tombstones
// =============================================================================

/// A tombstone left where a tuple used to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadTuple {
    /// Redirect, Dead or Placeholder.
    pub state: TupleState,
    /// New location of the tuple (redirects only).
    pub target: ItemPointer,
    /// Transaction that left the redirect.
    pub xid: TxnId,
}

impl DeadTuple {
    /// Creates a tombstone of the given kind.
    ///
    /// Only redirects keep `target` and `xid`.
    pub fn new(state: TupleState, target: ItemPointer, xid: TxnId) -> Self {
        if state == TupleState::Redirect {
            Self { state, target, xid }
        } else {
            Self {
                state,
                target: ItemPointer::INVALID,
                xid: TxnId::INVALID,
            }
        }
    }

    /// Creates a placeholder.
    pub fn placeholder() -> Self {
        Self::new(TupleState::Placeholder, ItemPointer::INVALID, TxnId::INVALID)
    }

    /// Encodes the tombstone.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DEAD_TUPLE_SIZE);
        buf.put_u8(self.state.as_byte());
        buf.put_u8(0);
        buf.put_u16_le(INVALID_OFFSET);
        buf.put_u32_le(self.target.page_id().as_u32());
        buf.put_u16_le(self.target.offset());
        buf.put_u16_le(0);
        buf.put_u64_le(self.xid.as_u64());
        buf.freeze()
    }

    /// Decodes a tombstone.
    pub fn decode(bytes: &[u8]) -> TupleResult<Self> {
        check_len(bytes, DEAD_TUPLE_SIZE, "dead tuple")?;
        let state = tuple_state(bytes)?;
        if state == TupleState::Live {
            return Err(MalformedTuple::new("expected tombstone, found live tuple"));
        }
        let mut buf = &bytes[4..];
        let target = get_pointer(&mut buf);
        buf.advance(2);
        let xid = TxnId::new(buf.get_u64_le());
        Ok(Self { state, target, xid })
    }
}

/// Points an encoded redirect at a new location.
pub fn set_redirect_target(bytes: &mut [u8], target: ItemPointer) -> TupleResult<()> {
    check_len(bytes, DEAD_TUPLE_SIZE, "dead tuple")?;
    if tuple_state(bytes)? != TupleState::Redirect {
        return Err(MalformedTuple::new("expected redirect tuple"));
    }
    bytes[4..8].copy_from_slice(&target.page_id().as_u32().to_le_bytes());
    bytes[8..10].copy_from_slice(&target.offset().to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(block: u32, offset: ItemOffset) -> ItemPointer {
        ItemPointer::new(PageId::new(block), offset)
    }

    #[test]
    fn test_leaf_tuple_encoding() {
        let mut leaf = LeafTuple::new(ptr(7, 3), Some(b"some longer datum".to_vec()));
        leaf.next = 4;
        let bytes = leaf.encode();
        assert_eq!(bytes.len(), LEAF_HEADER_SIZE + 17);
        assert_eq!(tuple_state(&bytes).unwrap(), TupleState::Live);
        assert_eq!(leaf_next(&bytes).unwrap(), 4);
        assert_eq!(LeafTuple::decode(&bytes).unwrap(), leaf);
    }

    #[test]
    fn test_small_leaf_padded_to_dead_size() {
        let leaf = LeafTuple::new(ptr(1, 1), Some(b"ab".to_vec()));
        assert_eq!(leaf.size(), DEAD_TUPLE_SIZE);
        assert_eq!(leaf.encode().len(), DEAD_TUPLE_SIZE);

        let null = LeafTuple::new(ptr(1, 2), None);
        assert!(null.is_null());
        assert_eq!(null.size(), DEAD_TUPLE_SIZE);
        assert_eq!(LeafTuple::decode(&null.encode()).unwrap().datum, None);
    }

    #[test]
    fn test_empty_datum_is_not_null() {
        let leaf = LeafTuple::new(ptr(1, 1), Some(Vec::new()));
        let decoded = LeafTuple::decode(&leaf.encode()).unwrap();
        assert_eq!(decoded.datum, Some(Vec::new()));
    }

    #[test]
    fn test_set_leaf_next_in_place() {
        let leaf = LeafTuple::new(ptr(9, 9), Some(b"x".to_vec()));
        let mut bytes = leaf.encode().to_vec();
        set_leaf_next(&mut bytes, 12).unwrap();
        assert_eq!(LeafTuple::decode(&bytes).unwrap().next, 12);
    }

    #[test]
    fn test_leaf_decode_rejects_tombstone() {
        let dead = DeadTuple::placeholder().encode();
        assert!(LeafTuple::decode(&dead).is_err());
        assert!(LeafTuple::decode(&[]).is_err());
    }

    #[test]
    fn test_inner_tuple_encoding() {
        let mut nodes = vec![
            NodeTuple::new(Some(b"a".to_vec())),
            NodeTuple::new(Some(b"bcd".to_vec())),
        ];
        nodes[1].downlink = ptr(5, 2);
        let inner = InnerTuple::new(Some(b"pre".to_vec()), nodes, false);
        let bytes = inner.encode();
        assert_eq!(bytes.len(), INNER_HEADER_SIZE + 3 + 2 * NODE_HEADER_SIZE + 4);

        let decoded = InnerTuple::decode(&bytes).unwrap();
        assert_eq!(decoded, inner);
        let labels = decoded.labels().unwrap().unwrap();
        assert_eq!(labels, vec![&b"a"[..], &b"bcd"[..]]);
    }

    #[test]
    fn test_inner_tuple_empty_prefix_differs_from_none() {
        let with_empty = InnerTuple::new(Some(Vec::new()), vec![NodeTuple::new(None)], false);
        let without = InnerTuple::new(None, vec![NodeTuple::new(None)], true);
        assert_eq!(InnerTuple::decode(&with_empty.encode()).unwrap().prefix, Some(Vec::new()));
        let decoded = InnerTuple::decode(&without.encode()).unwrap();
        assert_eq!(decoded.prefix, None);
        assert!(decoded.all_the_same);
        assert_eq!(decoded.labels().unwrap(), None);
    }

    #[test]
    fn test_mixed_labels_rejected() {
        let inner = InnerTuple::new(
            None,
            vec![NodeTuple::new(Some(b"a".to_vec())), NodeTuple::new(None)],
            false,
        );
        assert!(inner.labels().is_err());
    }

    #[test]
    fn test_set_node_downlink() {
        let inner = InnerTuple::new(
            Some(b"xy".to_vec()),
            vec![
                NodeTuple::new(Some(b"long label".to_vec())),
                NodeTuple::new(Some(b"q".to_vec())),
                NodeTuple::new(Some(b"r".to_vec())),
            ],
            false,
        );
        let mut bytes = inner.encode().to_vec();
        set_node_downlink(&mut bytes, 2, ptr(11, 4)).unwrap();
        let decoded = InnerTuple::decode(&bytes).unwrap();
        assert_eq!(decoded.nodes[0].downlink, ItemPointer::INVALID);
        assert_eq!(decoded.nodes[2].downlink, ptr(11, 4));
        assert!(set_node_downlink(&mut bytes, 3, ptr(1, 1)).is_err());
    }

    #[test]
    fn test_inner_tuple_size_limit() {
        let inner = InnerTuple::new(Some(vec![0u8; 4060]), vec![NodeTuple::new(None)], false);
        assert!(matches!(
            inner.check_size(4096 - 32),
            Err(SpGistError::InnerTupleTooLarge { .. })
        ));
        let small = InnerTuple::new(None, vec![NodeTuple::new(None)], false);
        assert_eq!(small.size(), DEAD_TUPLE_SIZE);
        assert!(small.check_size(4096 - 32).is_ok());
    }

    #[test]
    fn test_dead_tuple_kinds() {
        let redirect = DeadTuple::new(TupleState::Redirect, ptr(3, 8), TxnId::new(42));
        let bytes = redirect.encode();
        assert_eq!(bytes.len(), DEAD_TUPLE_SIZE);
        assert_eq!(DeadTuple::decode(&bytes).unwrap(), redirect);
        assert_eq!(leaf_next(&bytes).unwrap(), INVALID_OFFSET);

        let placeholder = DeadTuple::new(TupleState::Placeholder, ptr(3, 8), TxnId::new(42));
        assert_eq!(placeholder.target, ItemPointer::INVALID);
        assert_eq!(placeholder.xid, TxnId::INVALID);
    }

    #[test]
    fn test_set_redirect_target() {
        let redirect = DeadTuple::new(TupleState::Redirect, ptr(0, 1), TxnId::MIN);
        let mut bytes = redirect.encode().to_vec();
        set_redirect_target(&mut bytes, ptr(6, 2)).unwrap();
        assert_eq!(DeadTuple::decode(&bytes).unwrap().target, ptr(6, 2));

        let mut placeholder = DeadTuple::placeholder().encode().to_vec();
        assert!(set_redirect_target(&mut placeholder, ptr(6, 2)).is_err());
    }
}

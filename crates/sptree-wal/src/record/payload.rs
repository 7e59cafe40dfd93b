//! Change record payloads.
//!
//! This module defines the payload structures for the different record
//! types. All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sptree_common::types::{ItemOffset, ItemPointer, PageId};

use super::types::RecordFlags;
use crate::error::{WalError, WalResult};

/// Trait for serializable payloads.
pub trait Payload: Sized {
    /// Serializes the payload to bytes.
    fn serialize(&self) -> WalResult<Bytes>;
    /// Deserializes the payload from bytes.
    fn deserialize(bytes: &[u8]) -> WalResult<Self>;
}

/// A node of an inner tuple whose downlink was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLink {
    /// Page holding the inner tuple.
    pub page_id: PageId,
    /// Offset of the inner tuple.
    pub offset: ItemOffset,
    /// Index of the node inside the inner tuple.
    pub node: u16,
}

impl NodeLink {
    /// Creates a new node link.
    pub fn new(page_id: PageId, offset: ItemOffset, node: u16) -> Self {
        Self {
            page_id,
            offset,
            node,
        }
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn put_page(buf: &mut BytesMut, page_id: PageId) {
    buf.put_u32_le(page_id.as_u32());
}

fn put_ptr(buf: &mut BytesMut, ptr: ItemPointer) {
    put_page(buf, ptr.page_id());
    buf.put_u16_le(ptr.offset());
}

fn put_blob(buf: &mut BytesMut, blob: &[u8]) -> WalResult<()> {
    let len = u32::try_from(blob.len())
        .map_err(|_| WalError::serialization_error("tuple image exceeds u32 length"))?;
    buf.put_u32_le(len);
    buf.extend_from_slice(blob);
    Ok(())
}

fn put_offsets(buf: &mut BytesMut, offsets: &[ItemOffset]) -> WalResult<()> {
    let count = u16::try_from(offsets.len())
        .map_err(|_| WalError::serialization_error("too many offsets in one record"))?;
    buf.put_u16_le(count);
    for &off in offsets {
        buf.put_u16_le(off);
    }
    Ok(())
}

fn put_link(buf: &mut BytesMut, link: Option<NodeLink>) {
    match link {
        Some(link) => {
            buf.put_u8(1);
            put_page(buf, link.page_id);
            buf.put_u16_le(link.offset);
            buf.put_u16_le(link.node);
        }
        None => buf.put_u8(0),
    }
}

/// Bounds-checked cursor over a payload.
struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> WalResult<()> {
        if self.buf.remaining() < n {
            return Err(WalError::deserialization_error(format!(
                "{} truncated",
                self.what
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> WalResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> WalResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> WalResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn flags(&mut self) -> WalResult<RecordFlags> {
        Ok(RecordFlags::from_bits_truncate(self.u16()?))
    }

    fn page(&mut self) -> WalResult<PageId> {
        Ok(PageId::new(self.u32()?))
    }

    fn ptr(&mut self) -> WalResult<ItemPointer> {
        let page = self.page()?;
        let offset = self.u16()?;
        Ok(ItemPointer::new(page, offset))
    }

    fn blob(&mut self) -> WalResult<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let blob = Bytes::copy_from_slice(&self.buf[..len]);
        self.buf.advance(len);
        Ok(blob)
    }

    fn offsets(&mut self) -> WalResult<Vec<ItemOffset>> {
        let count = self.u16()? as usize;
        self.need(count * 2)?;
        Ok((0..count).map(|_| self.buf.get_u16_le()).collect())
    }

    fn link(&mut self) -> WalResult<Option<NodeLink>> {
        match self.u8()? {
            0 => Ok(None),
            1 => {
                let page_id = self.page()?;
                let offset = self.u16()?;
                let node = self.u16()?;
                Ok(Some(NodeLink::new(page_id, offset, node)))
            }
            other => Err(WalError::deserialization_error(format!(
                "{}: bad node link tag {}",
                self.what, other
            ))),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Index creation: the fixed pages were initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIndexPayload {
    /// Page size the index was created with.
    pub page_size: u32,
    /// Metadata page.
    pub meta: PageId,
    /// Root of the tree for non-null keys.
    pub root: PageId,
    /// Root of the tree for null keys.
    pub nulls_root: PageId,
}

impl Payload for CreateIndexPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32_le(self.page_size);
        put_page(&mut buf, self.meta);
        put_page(&mut buf, self.root);
        put_page(&mut buf, self.nulls_root);
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut r = Reader::new(bytes, "CreateIndexPayload");
        Ok(Self {
            page_size: r.u32()?,
            meta: r.page()?,
            root: r.page()?,
            nulls_root: r.page()?,
        })
    }
}

/// A leaf tuple was added to a page, possibly threaded into a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddLeafPayload {
    /// Leaf page that received the tuple.
    pub page_id: PageId,
    /// Offset the tuple landed at.
    pub offset: ItemOffset,
    /// Chain head whose next link now points at the new tuple, if any.
    pub head_offset: ItemOffset,
    /// `NEW_PAGE`, `STORES_NULLS`.
    pub flags: RecordFlags,
    /// Parent downlink set to the new tuple, if any.
    pub parent: Option<NodeLink>,
    /// Leaf tuple image.
    pub leaf: Bytes,
}

impl Payload for AddLeafPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(24 + self.leaf.len());
        put_page(&mut buf, self.page_id);
        buf.put_u16_le(self.offset);
        buf.put_u16_le(self.head_offset);
        buf.put_u16_le(self.flags.bits());
        put_link(&mut buf, self.parent);
        put_blob(&mut buf, &self.leaf)?;
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut r = Reader::new(bytes, "AddLeafPayload");
        Ok(Self {
            page_id: r.page()?,
            offset: r.u16()?,
            head_offset: r.u16()?,
            flags: r.flags()?,
            parent: r.link()?,
            leaf: r.blob()?,
        })
    }
}

/// A whole leaf chain was relocated to another page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveLeafsPayload {
    /// Page the chain was moved away from.
    pub src_page: PageId,
    /// Page that now holds the chain.
    pub dest_page: PageId,
    /// `NEW_PAGE`, `REPLACE_DEAD`, `STORES_NULLS`, `BUILD`.
    pub flags: RecordFlags,
    /// Offsets tombstoned on the source page, first one became the redirect.
    pub deleted: Vec<ItemOffset>,
    /// Offsets written on the destination page, new tuple last.
    pub inserted: Vec<ItemOffset>,
    /// Parent downlink rewritten to the new chain head.
    pub parent: NodeLink,
    /// Leaf tuple images in `inserted` order.
    pub tuples: Vec<Bytes>,
}

impl Payload for MoveLeafsPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let images: usize = self.tuples.iter().map(|t| t.len() + 4).sum();
        let mut buf = BytesMut::with_capacity(
            32 + 2 * (self.deleted.len() + self.inserted.len()) + images,
        );
        put_page(&mut buf, self.src_page);
        put_page(&mut buf, self.dest_page);
        buf.put_u16_le(self.flags.bits());
        put_offsets(&mut buf, &self.deleted)?;
        put_offsets(&mut buf, &self.inserted)?;
        put_link(&mut buf, Some(self.parent));
        for tuple in &self.tuples {
            put_blob(&mut buf, tuple)?;
        }
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut r = Reader::new(bytes, "MoveLeafsPayload");
        let src_page = r.page()?;
        let dest_page = r.page()?;
        let flags = r.flags()?;
        let deleted = r.offsets()?;
        let inserted = r.offsets()?;
        let parent = r
            .link()?
            .ok_or_else(|| WalError::deserialization_error("MoveLeafsPayload without parent"))?;
        let tuples = (0..inserted.len())
            .map(|_| r.blob())
            .collect::<WalResult<Vec<_>>>()?;
        Ok(Self {
            src_page,
            dest_page,
            flags,
            deleted,
            inserted,
            parent,
            tuples,
        })
    }
}

/// An inner tuple gained a node, in place or by relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNodePayload {
    /// Page that held the inner tuple.
    pub page_id: PageId,
    /// Offset of the inner tuple on that page.
    pub offset: ItemOffset,
    /// Where the enlarged tuple went when it did not fit in place.
    pub new_location: ItemPointer,
    /// `NEW_PAGE`, `BUILD`.
    pub flags: RecordFlags,
    /// Parent downlink rewritten to the relocated tuple.
    pub parent: Option<NodeLink>,
    /// Enlarged inner tuple image.
    pub tuple: Bytes,
}

impl Payload for AddNodePayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(32 + self.tuple.len());
        put_page(&mut buf, self.page_id);
        buf.put_u16_le(self.offset);
        put_ptr(&mut buf, self.new_location);
        buf.put_u16_le(self.flags.bits());
        put_link(&mut buf, self.parent);
        put_blob(&mut buf, &self.tuple)?;
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut r = Reader::new(bytes, "AddNodePayload");
        Ok(Self {
            page_id: r.page()?,
            offset: r.u16()?,
            new_location: r.ptr()?,
            flags: r.flags()?,
            parent: r.link()?,
            tuple: r.blob()?,
        })
    }
}

/// An inner tuple was split into a prefix and a postfix tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitTuplePayload {
    /// Location of the prefix tuple (the original slot).
    pub prefix: ItemPointer,
    /// Location of the postfix tuple.
    pub postfix: ItemPointer,
    /// `NEW_PAGE`.
    pub flags: RecordFlags,
    /// Prefix tuple image.
    pub prefix_tuple: Bytes,
    /// Postfix tuple image.
    pub postfix_tuple: Bytes,
}

impl Payload for SplitTuplePayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf =
            BytesMut::with_capacity(24 + self.prefix_tuple.len() + self.postfix_tuple.len());
        put_ptr(&mut buf, self.prefix);
        put_ptr(&mut buf, self.postfix);
        buf.put_u16_le(self.flags.bits());
        put_blob(&mut buf, &self.prefix_tuple)?;
        put_blob(&mut buf, &self.postfix_tuple)?;
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut r = Reader::new(bytes, "SplitTuplePayload");
        Ok(Self {
            prefix: r.ptr()?,
            postfix: r.ptr()?,
            flags: r.flags()?,
            prefix_tuple: r.blob()?,
            postfix_tuple: r.blob()?,
        })
    }
}

/// A leaf location was partitioned under a new inner tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickSplitPayload {
    /// Page the leaf tuples were collected from.
    pub src_page: PageId,
    /// Second leaf page, if one was needed.
    pub dest_page: PageId,
    /// Location of the new inner tuple.
    pub inner: ItemPointer,
    /// `INIT_SRC`, `INIT_DEST`, `INIT_INNER`, `ROOT_SPLIT`, `STORES_NULLS`, `BUILD`.
    pub flags: RecordFlags,
    /// Offsets tombstoned on the source page.
    pub deleted: Vec<ItemOffset>,
    /// Where each redistributed leaf tuple landed.
    pub leaves: Vec<ItemPointer>,
    /// Parent downlink rewritten to the new inner tuple, if any.
    pub parent: Option<NodeLink>,
    /// Inner tuple image.
    pub inner_tuple: Bytes,
}

impl Payload for PickSplitPayload {
    fn serialize(&self) -> WalResult<Bytes> {
        let mut buf = BytesMut::with_capacity(
            40 + 2 * self.deleted.len() + 6 * self.leaves.len() + self.inner_tuple.len(),
        );
        put_page(&mut buf, self.src_page);
        put_page(&mut buf, self.dest_page);
        put_ptr(&mut buf, self.inner);
        buf.put_u16_le(self.flags.bits());
        put_offsets(&mut buf, &self.deleted)?;
        let count = u16::try_from(self.leaves.len())
            .map_err(|_| WalError::serialization_error("too many leaves in one record"))?;
        buf.put_u16_le(count);
        for &leaf in &self.leaves {
            put_ptr(&mut buf, leaf);
        }
        put_link(&mut buf, self.parent);
        put_blob(&mut buf, &self.inner_tuple)?;
        Ok(buf.freeze())
    }

    fn deserialize(bytes: &[u8]) -> WalResult<Self> {
        let mut r = Reader::new(bytes, "PickSplitPayload");
        let src_page = r.page()?;
        let dest_page = r.page()?;
        let inner = r.ptr()?;
        let flags = r.flags()?;
        let deleted = r.offsets()?;
        let count = r.u16()? as usize;
        let leaves = (0..count)
            .map(|_| r.ptr())
            .collect::<WalResult<Vec<_>>>()?;
        Ok(Self {
            src_page,
            dest_page,
            inner,
            flags,
            deleted,
            leaves,
            parent: r.link()?,
            inner_tuple: r.blob()?,
        })
    }
}

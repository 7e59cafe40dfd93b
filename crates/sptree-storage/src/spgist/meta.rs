//! The meta page.
//!
//! Block 0 holds a single item identifying the index and persisting the
//! last-used-page cache between sessions. The cache is only a hint; a
//! stale entry costs at most one failed page probe.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sptree_common::types::{PageId, FIRST_OFFSET};

use super::error::{SpGistError, SpGistResult};
use super::page::{item_at, item_at_mut, META_BLOCK};
use crate::page::{PageFlags, SlottedPage};

/// Identifies an index meta page.
pub const META_MAGIC: u32 = 0x5350_4D54;

/// Meta page format version.
pub const META_VERSION: u32 = 1;

/// Number of entries in the last-used-page cache.
pub const CACHE_SLOTS: usize = 8;

const META_ITEM_SIZE: usize = 8 + CACHE_SLOTS * 8;

/// A page recently used for one kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastUsedPage {
    /// Cached block, or invalid.
    pub page_id: PageId,
    /// Free space the page was last known to have.
    pub free_space: usize,
}

impl LastUsedPage {
    /// An empty cache entry.
    pub const EMPTY: Self = Self {
        page_id: PageId::INVALID,
        free_space: 0,
    };
}

impl Default for LastUsedPage {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Contents of the meta page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetaData {
    /// Last-used-page cache, indexed by request flags.
    pub last_used: [LastUsedPage; CACHE_SLOTS],
}

impl MetaData {
    /// Encodes the meta item.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(META_ITEM_SIZE);
        buf.put_u32_le(META_MAGIC);
        buf.put_u32_le(META_VERSION);
        for entry in &self.last_used {
            buf.put_u32_le(entry.page_id.as_u32());
            buf.put_u32_le(entry.free_space as u32);
        }
        buf.freeze()
    }

    /// Decodes the meta item.
    pub fn decode(bytes: &[u8]) -> SpGistResult<Self> {
        if bytes.len() < META_ITEM_SIZE {
            return Err(SpGistError::corrupted(META_BLOCK, "meta item truncated"));
        }
        let mut buf = bytes;
        let magic = buf.get_u32_le();
        if magic != META_MAGIC {
            return Err(SpGistError::corrupted(
                META_BLOCK,
                format!("bad meta magic 0x{magic:08X}"),
            ));
        }
        let version = buf.get_u32_le();
        if version != META_VERSION {
            return Err(SpGistError::corrupted(
                META_BLOCK,
                format!("unsupported meta version {version}"),
            ));
        }

        let mut meta = Self::default();
        for entry in meta.last_used.iter_mut() {
            entry.page_id = PageId::new(buf.get_u32_le());
            entry.free_space = buf.get_u32_le() as usize;
        }
        Ok(meta)
    }
}

/// Formats block 0 as a meta page holding `meta`.
pub fn init_meta_page<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut SlottedPage<B>,
    meta: &MetaData,
) -> SpGistResult<()> {
    page.initialize(META_BLOCK, PageFlags::META);
    page.add_item(&meta.encode())
        .map(|_| ())
        .ok_or_else(|| SpGistError::internal("meta item does not fit on a page"))
}

/// Reads the meta page.
pub fn read_meta<B: AsRef<[u8]>>(page: &SlottedPage<B>) -> SpGistResult<MetaData> {
    if !page.flags().contains(PageFlags::META) {
        return Err(SpGistError::corrupted(page.page_id(), "not a meta page"));
    }
    MetaData::decode(item_at(page, FIRST_OFFSET)?)
}

/// Overwrites the meta item.
pub fn write_meta<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut SlottedPage<B>,
    meta: &MetaData,
) -> SpGistResult<()> {
    let encoded = meta.encode();
    let item = item_at_mut(page, FIRST_OFFSET)?;
    if item.len() != encoded.len() {
        return Err(SpGistError::corrupted(META_BLOCK, "meta item has wrong size"));
    }
    item.copy_from_slice(&encoded);
    Ok(())
}

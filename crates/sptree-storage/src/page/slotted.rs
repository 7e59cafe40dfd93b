//! Slotted page with offset-stable items.
//!
//! Item offsets are 1-based positions in the slot array. Items are never
//! removed from the slot array; callers overwrite them in place (with a
//! tombstone, for instance) so that every offset handed out stays
//! meaningful. Replacing an item with one of a different length compacts
//! the item data without moving any slot.

use sptree_common::types::{ItemOffset, Lsn, PageId, INVALID_OFFSET};

use super::header::{PageHeader, PAGE_HEADER_SIZE};
use super::types::PageFlags;

/// Size of each slot in bytes (offset: 2, length: 2).
pub const SLOT_SIZE: usize = 4;

/// A slot in the slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset from the start of the page to the item data.
    pub offset: u16,
    /// Length of the item in bytes.
    pub length: u16,
}

impl Slot {
    /// Creates a new slot.
    #[inline]
    pub const fn new(offset: u16, length: u16) -> Self {
        Self { offset, length }
    }

    /// Reads a slot from bytes.
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= SLOT_SIZE);
        Self {
            offset: u16::from_le_bytes([bytes[0], bytes[1]]),
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Writes the slot to bytes.
    #[inline]
    pub fn to_bytes(&self) -> [u8; SLOT_SIZE] {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[0..2].copy_from_slice(&self.offset.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }
}

/// A slotted page over a borrowed or owned buffer.
///
/// # Example
///
/// ```rust
/// use sptree_storage::page::{PageFlags, SlottedPage};
/// use sptree_common::types::PageId;
///
/// let mut buffer = vec![0u8; 4096];
/// let mut page = SlottedPage::new(&mut buffer[..]);
/// page.initialize(PageId::new(1), PageFlags::LEAF);
///
/// let off = page.add_item(b"hello").unwrap();
/// assert_eq!(off, 1);
/// assert_eq!(page.item(off).unwrap(), b"hello");
/// ```
pub struct SlottedPage<B> {
    data: B,
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Creates a new slotted page view into the given buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than PAGE_HEADER_SIZE.
    #[inline]
    pub fn new(data: B) -> Self {
        assert!(
            data.as_ref().len() >= PAGE_HEADER_SIZE,
            "buffer too small for slotted page"
        );
        Self { data }
    }

    #[inline]
    fn header(&self) -> PageHeader<&[u8]> {
        PageHeader::new(self.data.as_ref())
    }

    /// Returns the raw page bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Returns the page size.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.data.as_ref().len()
    }

    /// Returns true if the page has never been initialized.
    #[inline]
    pub fn is_new(&self) -> bool {
        self.header().upper() == 0
    }

    /// Returns true if the page holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header().slot_count() == 0
    }

    /// Returns the page ID recorded in the header.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.header().page_id()
    }

    /// Returns the page flags.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        self.header().flags()
    }

    /// Returns the page LSN.
    #[inline]
    pub fn lsn(&self) -> Lsn {
        self.header().lsn()
    }

    /// Returns the highest item offset in use (0 when empty).
    #[inline]
    pub fn max_offset(&self) -> ItemOffset {
        self.header().slot_count()
    }

    /// Returns the number of redirect tombstones.
    #[inline]
    pub fn n_redirection(&self) -> u16 {
        self.header().n_redirection()
    }

    /// Returns the number of placeholder tombstones.
    #[inline]
    pub fn n_placeholder(&self) -> u16 {
        self.header().n_placeholder()
    }

    /// Returns the unfragmented space between the slot array and the item
    /// data. A new item needs its length plus one slot.
    #[inline]
    pub fn exact_free_space(&self) -> usize {
        let header = self.header();
        (header.upper() as usize).saturating_sub(header.lower() as usize)
    }

    /// Returns the offset in the buffer where a slot is stored.
    #[inline]
    fn slot_position(offset: ItemOffset) -> usize {
        PAGE_HEADER_SIZE + (offset as usize - 1) * SLOT_SIZE
    }

    /// Reads a slot from the page.
    pub fn slot(&self, offset: ItemOffset) -> Option<Slot> {
        if offset == INVALID_OFFSET || offset > self.max_offset() {
            return None;
        }
        let pos = Self::slot_position(offset);
        Some(Slot::from_bytes(&self.data.as_ref()[pos..pos + SLOT_SIZE]))
    }

    /// Returns the item data at an offset.
    pub fn item(&self, offset: ItemOffset) -> Option<&[u8]> {
        let slot = self.slot(offset)?;
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        self.data.as_ref().get(start..end)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    #[inline]
    fn header_mut(&mut self) -> PageHeader<&mut [u8]> {
        PageHeader::new(self.data.as_mut())
    }

    /// Returns the raw page bytes mutably.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Initializes the page, discarding any items.
    pub fn initialize(&mut self, page_id: PageId, flags: PageFlags) {
        self.header_mut().initialize(page_id, flags);
    }

    /// Sets the page flags.
    #[inline]
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.header_mut().set_flags(flags);
    }

    /// Sets the page LSN.
    #[inline]
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.header_mut().set_lsn(lsn);
    }

    /// Sets the redirect counter.
    #[inline]
    pub fn set_n_redirection(&mut self, n: u16) {
        self.header_mut().set_n_redirection(n);
    }

    /// Sets the placeholder counter.
    #[inline]
    pub fn set_n_placeholder(&mut self, n: u16) {
        self.header_mut().set_n_placeholder(n);
    }

    /// Computes and stores the page checksum.
    pub fn update_checksum(&mut self) {
        self.header_mut().update_checksum();
    }

    fn set_slot(&mut self, offset: ItemOffset, slot: Slot) {
        let pos = Self::slot_position(offset);
        self.data.as_mut()[pos..pos + SLOT_SIZE].copy_from_slice(&slot.to_bytes());
    }

    /// Returns the item data at an offset mutably.
    pub fn item_mut(&mut self, offset: ItemOffset) -> Option<&mut [u8]> {
        let slot = self.slot(offset)?;
        let start = slot.offset as usize;
        let end = start + slot.length as usize;
        self.data.as_mut().get_mut(start..end)
    }

    /// Appends an item with a new slot.
    ///
    /// Returns the new offset, or `None` if there's no space.
    pub fn add_item(&mut self, item: &[u8]) -> Option<ItemOffset> {
        if self.exact_free_space() < item.len() + SLOT_SIZE {
            return None;
        }
        let offset = self.max_offset().checked_add(1)?;
        let (lower, upper) = {
            let header = self.header();
            (header.lower() as usize, header.upper() as usize)
        };

        let start = upper - item.len();
        self.data.as_mut()[start..upper].copy_from_slice(item);

        let mut header = self.header_mut();
        header.set_slot_count(offset);
        header.set_lower((lower + SLOT_SIZE) as u16);
        header.set_upper(start as u16);
        self.set_slot(offset, Slot::new(start as u16, item.len() as u16));
        Some(offset)
    }

    /// Overwrites the item at an existing offset.
    ///
    /// When the length changes, the old data is squeezed out and the new
    /// data is placed at the top of the item area; other slots keep their
    /// offsets. Returns false if the offset is unused or the new item does
    /// not fit.
    pub fn replace_item(&mut self, offset: ItemOffset, item: &[u8]) -> bool {
        let Some(old) = self.slot(offset) else {
            return false;
        };
        let old_start = old.offset as usize;
        let old_len = old.length as usize;

        if old_len == item.len() {
            self.data.as_mut()[old_start..old_start + old_len].copy_from_slice(item);
            return true;
        }
        if self.exact_free_space() + old_len < item.len() {
            return false;
        }

        let upper = self.header().upper() as usize;

        // Close the hole left by the old item
        if old_len > 0 {
            self.data
                .as_mut()
                .copy_within(upper..old_start, upper + old_len);
            for other in 1..=self.max_offset() {
                if other == offset {
                    continue;
                }
                if let Some(mut slot) = self.slot(other) {
                    if (slot.offset as usize) < old_start && slot.length > 0 {
                        slot.offset += old_len as u16;
                        self.set_slot(other, slot);
                    }
                }
            }
        }
        let upper = upper + old_len;

        let start = upper - item.len();
        self.data.as_mut()[start..upper].copy_from_slice(item);
        self.header_mut().set_upper(start as u16);
        self.set_slot(offset, Slot::new(start as u16, item.len() as u16));
        true
    }
}

impl<B: AsRef<[u8]>> std::fmt::Debug for SlottedPage<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlottedPage")
            .field("page_id", &self.page_id())
            .field("flags", &self.flags())
            .field("items", &self.max_offset())
            .field("free", &self.exact_free_space())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_page(size: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; size];
        SlottedPage::new(&mut buffer[..]).initialize(PageId::new(3), PageFlags::LEAF);
        buffer
    }

    #[test]
    fn test_new_page_is_new() {
        let buffer = vec![0u8; 4096];
        let page = SlottedPage::new(&buffer[..]);
        assert!(page.is_new());

        let buffer = new_page(4096);
        let page = SlottedPage::new(&buffer[..]);
        assert!(!page.is_new());
        assert!(page.is_empty());
        assert_eq!(page.exact_free_space(), 4096 - PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_add_items() {
        let mut buffer = new_page(4096);
        let mut page = SlottedPage::new(&mut buffer[..]);

        assert_eq!(page.add_item(b"one"), Some(1));
        assert_eq!(page.add_item(b"two!"), Some(2));
        assert_eq!(page.max_offset(), 2);
        assert_eq!(page.item(1).unwrap(), b"one");
        assert_eq!(page.item(2).unwrap(), b"two!");
        assert!(page.item(0).is_none());
        assert!(page.item(3).is_none());
        assert_eq!(
            page.exact_free_space(),
            4096 - PAGE_HEADER_SIZE - 2 * SLOT_SIZE - 7
        );
    }

    #[test]
    fn test_add_item_full() {
        let mut buffer = new_page(4096);
        let mut page = SlottedPage::new(&mut buffer[..]);
        let big = vec![1u8; 4096 - PAGE_HEADER_SIZE - SLOT_SIZE];

        assert_eq!(page.add_item(&big), Some(1));
        assert_eq!(page.exact_free_space(), 0);
        assert_eq!(page.add_item(b""), None);
    }

    #[test]
    fn test_replace_item_shrink_and_grow() {
        let mut buffer = new_page(4096);
        let mut page = SlottedPage::new(&mut buffer[..]);
        page.add_item(b"aaaa").unwrap();
        page.add_item(b"bbbbbbbb").unwrap();
        page.add_item(b"cc").unwrap();
        let free = page.exact_free_space();

        assert!(page.replace_item(2, b"B"));
        assert_eq!(page.exact_free_space(), free + 7);
        assert_eq!(page.item(1).unwrap(), b"aaaa");
        assert_eq!(page.item(2).unwrap(), b"B");
        assert_eq!(page.item(3).unwrap(), b"cc");

        assert!(page.replace_item(1, b"a much longer item"));
        assert_eq!(page.item(1).unwrap(), b"a much longer item");
        assert_eq!(page.item(2).unwrap(), b"B");
        assert_eq!(page.item(3).unwrap(), b"cc");
        assert_eq!(page.max_offset(), 3);
    }

    #[test]
    fn test_replace_item_same_length() {
        let mut buffer = new_page(4096);
        let mut page = SlottedPage::new(&mut buffer[..]);
        page.add_item(b"xyz").unwrap();
        let free = page.exact_free_space();

        assert!(page.replace_item(1, b"abc"));
        assert_eq!(page.item(1).unwrap(), b"abc");
        assert_eq!(page.exact_free_space(), free);
        assert!(!page.replace_item(2, b"abc"));
    }

    #[test]
    fn test_replace_item_too_large() {
        let mut buffer = new_page(4096);
        let mut page = SlottedPage::new(&mut buffer[..]);
        page.add_item(b"x").unwrap();
        let big = vec![0u8; 4096];
        assert!(!page.replace_item(1, &big));
        assert_eq!(page.item(1).unwrap(), b"x");
    }

    #[test]
    fn test_item_mut() {
        let mut buffer = new_page(4096);
        let mut page = SlottedPage::new(&mut buffer[..]);
        page.add_item(b"hello").unwrap();
        page.item_mut(1).unwrap()[0] = b'j';
        assert_eq!(page.item(1).unwrap(), b"jello");
    }
}

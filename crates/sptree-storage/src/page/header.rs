//! Page header format.
//!
//! Every page starts with a 32-byte header.
//!
//! # Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       2   magic (0x5350 = "SP")
//!   2       2   flags
//!   4       4   page_id
//!   8       8   lsn (Log Sequence Number)
//!  16       4   checksum (CRC32 of page data, excluding this field)
//!  20       2   slot_count
//!  22       2   lower (end of slot array)
//!  24       2   upper (start of item data)
//!  26       2   n_redirection (redirect tombstones on the page)
//!  28       2   n_placeholder (placeholder tombstones on the page)
//!  30       2   reserved
//! ```
//!
//! An all-zero page (upper == 0) has never been initialized.

use sptree_common::types::{Lsn, PageId};

use super::checksum::compute_page_checksum;
use super::types::PageFlags;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Offset of the checksum field in the header.
const CHECKSUM_OFFSET: usize = 16;

/// Page header view.
///
/// Read accessors work on any byte buffer; setters need a mutable one.
///
/// # Example
///
/// ```rust
/// use sptree_storage::page::{PageFlags, PageHeader};
/// use sptree_common::types::PageId;
///
/// let mut buffer = vec![0u8; 4096];
/// let mut header = PageHeader::new(&mut buffer[..]);
/// header.initialize(PageId::new(1), PageFlags::LEAF);
/// assert_eq!(header.page_id(), PageId::new(1));
/// assert!(header.flags().is_leaf());
/// ```
#[derive(Debug)]
pub struct PageHeader<B> {
    data: B,
}

impl<B: AsRef<[u8]>> PageHeader<B> {
    /// Creates a new header view into the given buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than PAGE_HEADER_SIZE.
    #[inline]
    pub fn new(data: B) -> Self {
        assert!(
            data.as_ref().len() >= PAGE_HEADER_SIZE,
            "buffer too small for page header"
        );
        Self { data }
    }

    #[inline]
    fn read_u16(&self, at: usize) -> u16 {
        let d = self.data.as_ref();
        u16::from_le_bytes([d[at], d[at + 1]])
    }

    #[inline]
    fn read_u32(&self, at: usize) -> u32 {
        let d = self.data.as_ref();
        u32::from_le_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
    }

    // =========================================================================
    // Magic (offset 0, 2 bytes)
    // =========================================================================

    /// Returns the magic bytes.
    #[inline]
    pub fn magic(&self) -> u16 {
        self.read_u16(0)
    }

    /// Validates the magic bytes.
    #[inline]
    pub fn is_valid_magic(&self) -> bool {
        self.magic() == super::PAGE_MAGIC
    }

    // =========================================================================
    // Flags (offset 2, 2 bytes)
    // =========================================================================

    /// Returns the page flags.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.read_u16(2))
    }

    // =========================================================================
    // Page ID (offset 4, 4 bytes)
    // =========================================================================

    /// Returns the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId::new(self.read_u32(4))
    }

    // =========================================================================
    // LSN (offset 8, 8 bytes)
    // =========================================================================

    /// Returns the LSN of the last change record applied to the page.
    #[inline]
    pub fn lsn(&self) -> Lsn {
        let d = self.data.as_ref();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&d[8..16]);
        Lsn::new(u64::from_le_bytes(bytes))
    }

    // =========================================================================
    // Checksum (offset 16, 4 bytes)
    // =========================================================================

    /// Returns the stored checksum.
    #[inline]
    pub fn checksum(&self) -> u32 {
        self.read_u32(CHECKSUM_OFFSET)
    }

    /// Computes the checksum the page should carry.
    pub fn computed_checksum(&self) -> u32 {
        compute_page_checksum(self.data.as_ref(), CHECKSUM_OFFSET)
    }

    /// Verifies the page checksum.
    pub fn verify_checksum(&self) -> bool {
        self.checksum() == self.computed_checksum()
    }

    // =========================================================================
    // Slot directory (offsets 20-25)
    // =========================================================================

    /// Returns the number of slots.
    #[inline]
    pub fn slot_count(&self) -> u16 {
        self.read_u16(20)
    }

    /// Returns the end of the slot array.
    #[inline]
    pub fn lower(&self) -> u16 {
        self.read_u16(22)
    }

    /// Returns the start of the item data.
    #[inline]
    pub fn upper(&self) -> u16 {
        self.read_u16(24)
    }

    // =========================================================================
    // Tombstone counters (offsets 26-29)
    // =========================================================================

    /// Returns the number of redirect tombstones on the page.
    #[inline]
    pub fn n_redirection(&self) -> u16 {
        self.read_u16(26)
    }

    /// Returns the number of placeholder tombstones on the page.
    #[inline]
    pub fn n_placeholder(&self) -> u16 {
        self.read_u16(28)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> PageHeader<B> {
    #[inline]
    fn write_u16(&mut self, at: usize, value: u16) {
        self.data.as_mut()[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, at: usize, value: u32) {
        self.data.as_mut()[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Initializes an empty page with the given flags.
    pub fn initialize(&mut self, page_id: PageId, flags: PageFlags) {
        let page_size = self.data.as_ref().len();
        self.data.as_mut()[..PAGE_HEADER_SIZE].fill(0);
        self.write_u16(0, super::PAGE_MAGIC);
        self.set_flags(flags);
        self.write_u32(4, page_id.as_u32());
        self.set_lsn(Lsn::INVALID);
        self.set_slot_count(0);
        self.set_lower(PAGE_HEADER_SIZE as u16);
        // Item data grows down from the end of the page
        self.set_upper(page_size as u16);
    }

    /// Sets the page flags.
    #[inline]
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.write_u16(2, flags.bits());
    }

    /// Sets the LSN.
    #[inline]
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data.as_mut()[8..16].copy_from_slice(&lsn.as_u64().to_le_bytes());
    }

    /// Computes and stores the page checksum.
    ///
    /// Call this after all other modifications to the page are complete.
    pub fn update_checksum(&mut self) {
        let checksum = compute_page_checksum(self.data.as_ref(), CHECKSUM_OFFSET);
        self.write_u32(CHECKSUM_OFFSET, checksum);
    }

    /// Sets the number of slots.
    #[inline]
    pub fn set_slot_count(&mut self, count: u16) {
        self.write_u16(20, count);
    }

    /// Sets the end of the slot array.
    #[inline]
    pub fn set_lower(&mut self, lower: u16) {
        self.write_u16(22, lower);
    }

    /// Sets the start of the item data.
    #[inline]
    pub fn set_upper(&mut self, upper: u16) {
        self.write_u16(24, upper);
    }

    /// Sets the redirect counter.
    #[inline]
    pub fn set_n_redirection(&mut self, n: u16) {
        self.write_u16(26, n);
    }

    /// Sets the placeholder counter.
    #[inline]
    pub fn set_n_placeholder(&mut self, n: u16) {
        self.write_u16(28, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_initialize() {
        let mut buffer = vec![0xAAu8; 4096];
        let mut header = PageHeader::new(&mut buffer[..]);
        header.initialize(PageId::new(7), PageFlags::LEAF | PageFlags::NULLS);

        assert!(header.is_valid_magic());
        assert_eq!(header.page_id(), PageId::new(7));
        assert_eq!(header.flags(), PageFlags::LEAF | PageFlags::NULLS);
        assert_eq!(header.lsn(), Lsn::INVALID);
        assert_eq!(header.slot_count(), 0);
        assert_eq!(header.lower() as usize, PAGE_HEADER_SIZE);
        assert_eq!(header.upper(), 4096);
        assert_eq!(header.n_redirection(), 0);
        assert_eq!(header.n_placeholder(), 0);
    }

    #[test]
    fn test_header_lsn_and_checksum() {
        let mut buffer = vec![0u8; 4096];
        let mut header = PageHeader::new(&mut buffer[..]);
        header.initialize(PageId::new(1), PageFlags::empty());
        header.set_lsn(Lsn::new(99));
        header.update_checksum();

        assert_eq!(header.lsn(), Lsn::new(99));
        assert!(header.verify_checksum());

        buffer[200] = 1;
        assert!(!PageHeader::new(&buffer[..]).verify_checksum());
    }
}

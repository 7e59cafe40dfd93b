//! Page checksum utilities.

/// Computes a CRC32 checksum for the given data.
///
/// # Example
///
/// ```rust
/// use sptree_storage::page::compute_checksum;
///
/// let checksum = compute_checksum(b"leaf page");
/// assert_ne!(checksum, 0);
/// ```
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verifies that the checksum matches the data.
#[inline]
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}

/// Computes a checksum for a page, excluding the checksum field itself.
pub fn compute_page_checksum(page_data: &[u8], checksum_offset: usize) -> u32 {
    debug_assert!(checksum_offset + 4 <= page_data.len());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_data[..checksum_offset]);
    hasher.update(&page_data[checksum_offset + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_checksum_ignores_field() {
        let mut page = vec![7u8; 4096];
        let before = compute_page_checksum(&page, 16);
        page[16..20].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(compute_page_checksum(&page, 16), before);

        page[100] = 0;
        assert_ne!(compute_page_checksum(&page, 16), before);
    }

    #[test]
    fn test_verify_checksum() {
        let data = b"inner tuple";
        let checksum = compute_checksum(data);
        assert!(verify_checksum(data, checksum));
        assert!(!verify_checksum(data, checksum.wrapping_add(1)));
    }
}

//! Buffer manager errors.

use std::io;

use sptree_common::types::PageId;
use thiserror::Error;

/// Result type for buffer manager operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur during buffer manager operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum BufferError {
    /// Page beyond the end of the file.
    #[error("page {page_id} does not exist (file has {page_count} pages)")]
    PageOutOfRange { page_id: PageId, page_count: u32 },

    /// The file cannot grow any further.
    #[error("index file is full")]
    FileFull,

    /// I/O error during page read/write.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Checksum mismatch when reading page.
    #[error("checksum mismatch for page {page_id}: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        page_id: PageId,
        expected: u32,
        actual: u32,
    },

    /// File length is not a multiple of the page size.
    #[error("file size {size} is not a multiple of page size {page_size}")]
    TornFile { size: u64, page_size: usize },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl BufferError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::TornFile { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BufferError::PageOutOfRange {
            page_id: PageId::new(9),
            page_count: 3,
        };
        assert_eq!(err.to_string(), "page 9 does not exist (file has 3 pages)");

        let err = BufferError::ChecksumMismatch {
            page_id: PageId::new(1),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_corruption());
        assert!(!BufferError::FileFull.is_corruption());
    }
}

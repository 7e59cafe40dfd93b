//! Buffer manager configuration.

use sptree_common::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

use super::error::{BufferError, BufferResult};

/// Configuration for the buffer manager.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Whether to verify page checksums when loading from disk.
    pub verify_checksums: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            verify_checksums: true,
        }
    }
}

impl BufferConfig {
    /// Creates a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Enables or disables checksum verification on load.
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Creates a configuration for testing (small pages).
    pub fn for_testing() -> Self {
        Self::default().with_page_size(MIN_PAGE_SIZE)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BufferResult<()> {
        if !self.page_size.is_power_of_two() {
            return Err(BufferError::config("page_size must be a power of two"));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(BufferError::config(format!(
                "page_size must be between {} and {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }
}

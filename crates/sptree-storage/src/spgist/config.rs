//! Configuration for the space-partitioned tree index.

use sptree_common::constants::{
    DEFAULT_FILL_FACTOR, DEFAULT_MOVE_CHAIN_MAX_TUPLES, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
    MIN_FILL_FACTOR, MIN_PAGE_SIZE, PAGE_HEADER_SIZE,
};

use super::error::{SpGistError, SpGistResult};
use crate::buffer::BufferConfig;

/// Configuration for an index instance.
#[derive(Debug, Clone)]
pub struct SpGistConfig {
    /// Page size in bytes (default: 8KB).
    pub page_size: usize,

    /// Percentage of each page new tuples may fill (default: 80).
    pub fill_factor: u8,

    /// Chains with this many tuples or more are split rather than moved.
    pub move_chain_max_tuples: usize,
}

impl Default for SpGistConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            fill_factor: DEFAULT_FILL_FACTOR,
            move_chain_max_tuples: DEFAULT_MOVE_CHAIN_MAX_TUPLES,
        }
    }
}

impl SpGistConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the fill factor.
    pub fn with_fill_factor(mut self, fill_factor: u8) -> Self {
        self.fill_factor = fill_factor;
        self
    }

    /// Sets the chain length above which relocation is not attempted.
    pub fn with_move_chain_max_tuples(mut self, tuples: usize) -> Self {
        self.move_chain_max_tuples = tuples;
        self
    }

    /// Creates a configuration for testing (small pages, full fill).
    pub fn for_testing() -> Self {
        Self::default()
            .with_page_size(MIN_PAGE_SIZE)
            .with_fill_factor(100)
    }

    /// Bytes available for tuples on an empty page.
    #[inline]
    pub fn page_capacity(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    /// Slack added to every page request so pages keep room for growth.
    #[inline]
    pub fn target_free_space(&self) -> usize {
        self.page_size * (100 - self.fill_factor as usize) / 100
    }

    /// Chains occupying this many bytes or more are split rather than moved.
    #[inline]
    pub fn move_chain_max_bytes(&self) -> usize {
        self.page_capacity() / 2
    }

    /// Returns the matching buffer manager configuration.
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig::new().with_page_size(self.page_size)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SpGistResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(SpGistError::InvalidConfig(format!(
                "page_size {} must be a power of two between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.fill_factor < MIN_FILL_FACTOR || self.fill_factor > 100 {
            return Err(SpGistError::InvalidConfig(format!(
                "fill_factor {} must be between {} and 100",
                self.fill_factor, MIN_FILL_FACTOR
            )));
        }
        if self.move_chain_max_tuples == 0 {
            return Err(SpGistError::InvalidConfig(
                "move_chain_max_tuples must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpGistConfig::default();
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.fill_factor, 80);
        assert_eq!(config.page_capacity(), 8192 - 32);
        assert_eq!(config.target_free_space(), 1638);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = SpGistConfig::for_testing();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.target_free_space(), 0);
        assert_eq!(config.move_chain_max_bytes(), (4096 - 32) / 2);
        assert_eq!(config.buffer_config().page_size, 4096);
    }

    #[test]
    fn test_invalid_config() {
        assert!(SpGistConfig::new().with_fill_factor(5).validate().is_err());
        assert!(SpGistConfig::new().with_fill_factor(101).validate().is_err());
        assert!(SpGistConfig::new().with_page_size(3000).validate().is_err());
        assert!(SpGistConfig::new()
            .with_move_chain_max_tuples(0)
            .validate()
            .is_err());
    }
}

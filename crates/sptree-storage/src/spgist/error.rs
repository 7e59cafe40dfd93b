//! Error types for the insertion engine.
//!
//! Contention is not an error: an insertion that would have to wait on a
//! latch in an unsafe order reports `InsertOutcome::RetryRequested`.

use sptree_common::types::PageId;
use sptree_wal::WalError;
use thiserror::Error;

use crate::buffer::BufferError;

/// Result type for index operations.
pub type SpGistResult<T> = Result<T, SpGistError>;

/// Errors that can occur while inserting into the index.
#[derive(Debug, Error)]
pub enum SpGistError {
    /// The leaf tuple for a value cannot fit on any page.
    #[error("index row size {size} exceeds maximum {max}")]
    RowTooLarge {
        /// Size the leaf tuple would need.
        size: usize,
        /// Largest size a page can hold.
        max: usize,
    },

    /// An inner tuple grew beyond what a page can hold.
    #[error("inner tuple size {size} exceeds maximum {max}")]
    InnerTupleTooLarge {
        /// Size of the inner tuple.
        size: usize,
        /// Largest size a page can hold.
        max: usize,
    },

    /// On-page structure is inconsistent.
    #[error("corrupted index page {page_id}: {reason}")]
    Corrupted {
        /// Page where the corruption was detected.
        page_id: PageId,
        /// Description of corruption.
        reason: String,
    },

    /// The partitioning strategy broke its contract.
    #[error("partitioning strategy contract violation: {0}")]
    ContractViolation(String),

    /// An internal invariant failed.
    #[error("internal error: {0}")]
    Internal(String),

    /// The insertion was cancelled.
    #[error("insertion cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Buffer manager failure.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Change record could not be emitted.
    #[error(transparent)]
    Wal(#[from] WalError),
}

impl SpGistError {
    /// Creates a corruption error.
    pub fn corrupted(page_id: PageId, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            page_id,
            reason: reason.into(),
        }
    }

    /// Creates a contract violation error.
    pub fn contract(reason: impl Into<String>) -> Self {
        Self::ContractViolation(reason.into())
    }

    /// Creates an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Returns true for errors that indicate a bug or damaged structure
    /// rather than a rejected request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. } | Self::ContractViolation(_) | Self::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpGistError::RowTooLarge {
            size: 9000,
            max: 8160,
        };
        assert_eq!(err.to_string(), "index row size 9000 exceeds maximum 8160");
        assert!(!err.is_fatal());

        let err = SpGistError::corrupted(PageId::new(4), "bad chain");
        assert_eq!(err.to_string(), "corrupted index page 4: bad chain");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SpGistError::contract("AddNode on allTheSame tuple").is_fatal());
        assert!(SpGistError::internal("x").is_fatal());
        assert!(!SpGistError::Cancelled.is_fatal());
        assert!(!SpGistError::from(WalError::Closed).is_fatal());
    }
}

//! WAL error types.

use thiserror::Error;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur while encoding, decoding or emitting records.
#[derive(Debug, Error)]
pub enum WalError {
    /// Unknown record type byte.
    #[error("Unknown record type: {0}")]
    UnknownRecordType(u8),

    /// Record payload could not be decoded.
    #[error("Failed to deserialize change record: {reason}")]
    DeserializationError { reason: String },

    /// Record payload could not be encoded.
    #[error("Failed to serialize change record: {reason}")]
    SerializationError { reason: String },

    /// The log no longer accepts records.
    #[error("WAL is closed")]
    Closed,
}

impl WalError {
    /// Creates a deserialization error.
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::DeserializationError {
            reason: reason.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization_error(reason: impl Into<String>) -> Self {
        Self::SerializationError {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WalError::UnknownRecordType(99);
        assert_eq!(err.to_string(), "Unknown record type: 99");

        let err = WalError::deserialization_error("AddLeafPayload too short");
        assert!(err.to_string().contains("too short"));
    }
}

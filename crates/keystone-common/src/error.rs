//! Error types for KeystoneDB.

use thiserror::Error;

/// Result type alias using KeystoneError.
pub type Result<T> = std::result::Result<T, KeystoneError>;

/// Errors that can occur in KeystoneDB index operations.
#[derive(Debug, Error)]
pub enum KeystoneError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // Record store errors
    #[error("Record corrupted at position {position}: {reason}")]
    CorruptRecord { position: u64, reason: String },

    #[error("Record store missing: {0}")]
    StoreNotFound(String),

    // Node file errors
    #[error("Node corrupted at slot {slot}: {reason}")]
    CorruptNode { slot: i64, reason: String },

    #[error("Index structure corrupted: {0}")]
    CorruptIndex(String),

    // Key errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key type mismatch: expected {expected}, got {actual}")]
    KeyTypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    // Registry errors
    #[error("Unknown index type: {0}")]
    UnknownIndexType(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Unsupported operation: {op} on {index}")]
    Unsupported { op: &'static str, index: &'static str },

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: KeystoneError = io_err.into();
        assert!(matches!(err, KeystoneError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let serde_err = serde_json::from_str::<i64>("not a number").unwrap_err();
        let err: KeystoneError = serde_err.into();
        assert!(matches!(err, KeystoneError::Serde(_)));
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_corrupt_record_display() {
        let err = KeystoneError::CorruptRecord {
            position: 128,
            reason: "invalid JSON".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Record corrupted at position 128: invalid JSON"
        );
    }

    #[test]
    fn test_corrupt_node_display() {
        let err = KeystoneError::CorruptNode {
            slot: 7,
            reason: "short read".to_string(),
        };
        assert_eq!(err.to_string(), "Node corrupted at slot 7: short read");
    }

    #[test]
    fn test_key_errors_display() {
        assert_eq!(KeystoneError::KeyNotFound.to_string(), "Key not found");
        assert_eq!(KeystoneError::DuplicateKey.to_string(), "Duplicate key");

        let err = KeystoneError::KeyTypeMismatch {
            expected: "integer",
            actual: "spatial",
        };
        assert_eq!(
            err.to_string(),
            "Key type mismatch: expected integer, got spatial"
        );
    }

    #[test]
    fn test_registry_errors_display() {
        let err = KeystoneError::UnknownIndexType("gist".to_string());
        assert_eq!(err.to_string(), "Unknown index type: gist");

        let err = KeystoneError::IndexNotFound("idx_users_id".to_string());
        assert_eq!(err.to_string(), "Index not found: idx_users_id");

        let err = KeystoneError::Unsupported {
            op: "range_search",
            index: "hash",
        };
        assert_eq!(err.to_string(), "Unsupported operation: range_search on hash");
    }

    #[test]
    fn test_invalid_parameter_display() {
        let err = KeystoneError::InvalidParameter {
            name: "order".to_string(),
            value: "2".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parameter: order = 2");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(KeystoneError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KeystoneError>();
    }
}

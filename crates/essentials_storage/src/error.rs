//! Error types for the storage subsystem.
//!
//! Load and save failures are kept distinct so callers can decide whether to
//! fall back to a fresh document, retry a save, or abort.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Backing bytes were present but could not be turned into a document.
    #[error("Data load error: {0}")]
    Load(String),

    /// The repository rejected a write, or the document could not be serialized.
    #[error("Data save error: {0}")]
    Save(String),

    #[error("Data delete error: {0}")]
    Delete(String),

    /// A migration step failed while upgrading stored content.
    #[error("Migration from content version {from} failed: {reason}")]
    Migration { from: u32, reason: String },

    /// The stored content was written by a newer build than this one.
    #[error("Stored content version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// A value exists at a key's path but does not have the key's shape.
    #[error("Malformed value at '{path}': {reason}")]
    MalformedValue { path: String, reason: String },

    #[error("Query error: {0}")]
    Query(String),

    /// A key that cannot be mapped to a storage location.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Returns true for errors raised while turning stored bytes into a document.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            StorageError::Load(_)
                | StorageError::Migration { .. }
                | StorageError::UnsupportedVersion { .. }
        )
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_failure_classification() {
        assert!(StorageError::Load("bad json".to_string()).is_load_failure());
        assert!(StorageError::Migration { from: 1, reason: "x".to_string() }.is_load_failure());
        assert!(StorageError::UnsupportedVersion { found: 9, supported: 2 }.is_load_failure());
        assert!(!StorageError::Save("disk full".to_string()).is_load_failure());
    }

    #[test]
    fn test_error_messages() {
        let error = StorageError::UnsupportedVersion { found: 3, supported: 2 };
        let message = format!("{}", error);
        assert!(message.contains("3"));
        assert!(message.contains("supported version 2"));
    }
}

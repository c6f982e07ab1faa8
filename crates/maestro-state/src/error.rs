//! Error types for maestro-state

use thiserror::Error;

/// Errors raised by the storage traits and their implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The requested record does not exist.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A record with the same primary key already exists.
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    /// The backing store failed (connection, query, schema).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored document could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StorageError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, key: impl ToString) -> Self {
        StorageError::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// `true` for errors that describe a missing record rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = StorageError::not_found("build", 42);
        assert_eq!(err.to_string(), "build not found: 42");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_already_exists_display() {
        let err = StorageError::already_exists("subscription", "abc");
        assert_eq!(err.to_string(), "subscription already exists: abc");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_from_serde_json() {
        let bad: Result<u32, _> = serde_json::from_str("not json");
        let err: StorageError = bad.unwrap_err().into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}

//! Error types for the dependency flow engine.
//!
//! The variants follow how each failure is handled operationally: transient
//! failures are retried, decisive ones are discarded with a log, merge
//! conflicts need reconciliation, configuration errors fail fast.

use maestro_state::StorageError;
use thiserror::Error;

/// Errors produced by the flow engine and its remote collaborators.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A remote call failed in a way that may succeed later (5xx, timeout, rate limit).
    #[error("transient failure in {operation}: {reason}")]
    Transient { operation: String, reason: String },

    /// A remote call failed permanently (missing entity, auth). Retrying cannot help.
    #[error("decisive failure: {reason}")]
    Decisive { reason: String },

    /// The pull request cannot be merged or its branch cannot be fast-forwarded.
    #[error("merge conflict on {pr_url}: {reason}")]
    MergeConflict { pr_url: String, reason: String },

    /// Invalid configuration (unknown merge policy, malformed subscription).
    #[error("configuration error in '{field}': {reason}")]
    Configuration { field: String, reason: String },

    /// A broken internal invariant. These are bugs.
    #[error("invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl FlowError {
    pub fn transient(operation: impl Into<String>, reason: impl ToString) -> Self {
        FlowError::Transient {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decisive(reason: impl ToString) -> Self {
        FlowError::Decisive {
            reason: reason.to_string(),
        }
    }

    pub fn configuration(field: impl Into<String>, reason: impl ToString) -> Self {
        FlowError::Configuration {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invariant(reason: impl ToString) -> Self {
        FlowError::Invariant {
            reason: reason.to_string(),
        }
    }

    /// Whether a retry (with backoff or a retry work item) may succeed.
    ///
    /// Storage backend failures count as transient; a missing record does not.
    pub fn is_transient(&self) -> bool {
        match self {
            FlowError::Transient { .. } => true,
            FlowError::Storage(e) => matches!(e, StorageError::Backend(_)),
            _ => false,
        }
    }

    pub fn is_merge_conflict(&self) -> bool {
        matches!(self, FlowError::MergeConflict { .. })
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

/// Convenience result alias.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FlowError::transient("create_pull_request", "503").is_transient());
        assert!(FlowError::Storage(StorageError::Backend("down".into())).is_transient());
        assert!(!FlowError::Storage(StorageError::not_found("build", 1)).is_transient());
        assert!(!FlowError::decisive("404").is_transient());
        assert!(!FlowError::Cancelled.is_transient());
    }

    #[test]
    fn test_configuration_error_names_field() {
        let err = FlowError::configuration("merge_policies[0].name", "unknown policy 'Foo'");
        let msg = err.to_string();
        assert!(msg.contains("merge_policies[0].name"));
        assert!(msg.contains("unknown policy 'Foo'"));
    }

    #[test]
    fn test_merge_conflict_is_distinct() {
        let err = FlowError::MergeConflict {
            pr_url: "https://github.com/org/repo/pull/1".into(),
            reason: "not mergeable".into(),
        };
        assert!(err.is_merge_conflict());
        assert!(!err.is_transient());
    }
}

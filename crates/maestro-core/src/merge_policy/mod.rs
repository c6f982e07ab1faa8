//! Merge policy evaluation.
//!
//! A subscription (or a batched repository branch) lists named policies with
//! free-form properties. [`MergePolicyRegistry`] turns that configuration into
//! typed [`MergePolicy`] strategies, rejecting unknown names up front, and
//! [`evaluate_policies`] runs them against the current pull request state.

mod policies;
pub mod version;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coherency::CoherencyErrorDetails;
use crate::pr_description::DependencyUpdateSummary;
use crate::remote::{Commit, PullRequestCheck, Review};

pub use policies::{
    AllChecksSuccessfulPolicy, DontAutomergeDowngradesPolicy, MergePolicyRegistry,
    NoExtraCommitsPolicy, NoRequestedChangesPolicy, StandardPolicy, ValidateCoherencyPolicy,
    ALL_CHECKS_SUCCESSFUL, DONT_AUTOMERGE_DOWNGRADES, IGNORE_CHECKS_PROPERTY, NO_EXTRA_COMMITS,
    NO_REQUESTED_CHANGES, STANDARD, VALIDATE_COHERENCY,
};

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyConfigError {
    #[error("merge_policies[{index}]: unknown merge policy '{name}'")]
    UnknownPolicy { index: usize, name: String },

    #[error("merge_policies[{index}].{property}: {reason}")]
    InvalidProperty {
        index: usize,
        property: String,
        reason: String,
    },
}

impl From<PolicyConfigError> for crate::FlowError {
    fn from(err: PolicyConfigError) -> Self {
        let field = match &err {
            PolicyConfigError::UnknownPolicy { index, .. } => format!("merge_policies[{index}].name"),
            PolicyConfigError::InvalidProperty {
                index, property, ..
            } => format!("merge_policies[{index}].{property}"),
        };
        crate::FlowError::configuration(field, err)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicyEvaluationStatus {
    Pending,
    Success,
    DecisiveFailure,
    TransientFailure,
}

impl MergePolicyEvaluationStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::DecisiveFailure | Self::TransientFailure)
    }
}

/// Outcome of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyEvaluationResult {
    pub status: MergePolicyEvaluationStatus,
    pub title: String,
    pub message: String,
    pub policy_name: String,
    pub policy_display_name: String,
}

/// Outcome of a full evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicyEvaluationResults {
    pub results: Vec<MergePolicyEvaluationResult>,
}

impl MergePolicyEvaluationResults {
    /// At least one result, and all of them succeeded.
    pub fn succeeded(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.status == MergePolicyEvaluationStatus::Success)
    }

    pub fn pending(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.status == MergePolicyEvaluationStatus::Pending)
    }

    pub fn failed(&self) -> bool {
        self.results.iter().any(|r| r.status.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = &MergePolicyEvaluationResult> {
        self.results.iter().filter(|r| r.status.is_failure())
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a policy may look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePolicyContext {
    pub checks: Vec<PullRequestCheck>,
    pub reviews: Vec<Review>,
    pub commits: Vec<Commit>,
    /// Author of commits made by this service.
    pub bot_author: String,
    /// Dependency changes the pull request proposes.
    pub updates: Vec<DependencyUpdateSummary>,
    /// `None` when no coherency check has run.
    pub coherency_check_successful: Option<bool>,
    pub coherency_errors: Vec<CoherencyErrorDetails>,
}

/// A named merge policy strategy.
pub trait MergePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn evaluate(&self, context: &MergePolicyContext) -> MergePolicyEvaluationResult;

    fn result(
        &self,
        status: MergePolicyEvaluationStatus,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> MergePolicyEvaluationResult
    where
        Self: Sized,
    {
        MergePolicyEvaluationResult {
            status,
            title: title.into(),
            message: message.into(),
            policy_name: self.name().to_string(),
            policy_display_name: self.display_name().to_string(),
        }
    }
}

/// Run `policies` in order.
pub fn evaluate_policies(
    policies: &[Box<dyn MergePolicy>],
    context: &MergePolicyContext,
) -> MergePolicyEvaluationResults {
    MergePolicyEvaluationResults {
        results: policies.iter().map(|p| p.evaluate(context)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MergePolicyEvaluationStatus::*;

    fn results(statuses: &[MergePolicyEvaluationStatus]) -> MergePolicyEvaluationResults {
        MergePolicyEvaluationResults {
            results: statuses
                .iter()
                .map(|s| MergePolicyEvaluationResult {
                    status: *s,
                    title: String::new(),
                    message: String::new(),
                    policy_name: "P".into(),
                    policy_display_name: "P".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_empty_results_do_not_succeed() {
        let r = results(&[]);
        assert!(!r.succeeded());
        assert!(!r.pending());
        assert!(!r.failed());
    }

    #[test]
    fn test_pending_and_failed_are_independent() {
        let r = results(&[Pending, DecisiveFailure, Success]);
        assert!(r.pending());
        assert!(r.failed());
        assert!(!r.succeeded());
        assert_eq!(r.failures().count(), 1);
    }

    #[test]
    fn test_all_success_succeeds() {
        assert!(results(&[Success, Success]).succeeded());
        assert!(results(&[TransientFailure]).failed());
    }

    #[test]
    fn test_config_error_maps_to_flow_configuration() {
        let err: crate::FlowError = PolicyConfigError::UnknownPolicy {
            index: 2,
            name: "Bogus".into(),
        }
        .into();
        match err {
            crate::FlowError::Configuration { field, reason } => {
                assert_eq!(field, "merge_policies[2].name");
                assert!(reason.contains("Bogus"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! Abstract git provider used by the pull request updater.
//!
//! GitHub and Azure DevOps clients live outside this crate; the engine only
//! needs the operations below. [`fakes::FakeRemote`] is a scriptable
//! in-memory implementation for tests.

pub mod fakes;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coherency::{DependencyDetail, DependencyUpdate};
use crate::error::FlowResult;
use crate::merge_policy::MergePolicyEvaluationResults;

/// Prefix of the check runs this service publishes for its own merge policies.
pub const MERGE_POLICY_CHECK_PREFIX: &str = "maestro-policy-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    /// Completed without a conclusion (neutral, skipped).
    None,
    Pending,
    Success,
    Failure,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestCheck {
    pub name: String,
    pub status: CheckState,
    /// Set for check runs published by this service.
    #[serde(default)]
    pub is_maestro_merge_policy: bool,
}

impl PullRequestCheck {
    pub fn new(name: impl Into<String>, status: CheckState) -> Self {
        Self {
            name: name.into(),
            status,
            is_maestro_merge_policy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    Commented,
    ChangesRequested,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: String,
    pub state: ReviewState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub author: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Merged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub url: String,
    pub title: String,
    pub description: String,
    pub head_branch: String,
    pub base_branch: String,
    pub status: PrStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub description: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MergePullRequestParameters {
    pub squash_merge: bool,
    pub delete_source_branch: bool,
    /// Refuse to merge unless the head is still at this commit.
    pub commit_to_merge: Option<String>,
}

/// Git/PR provider operations needed by the engine.
///
/// Implementations report retryable failures as
/// [`FlowError::Transient`](crate::FlowError::Transient) and unmergeable pull
/// requests as [`FlowError::MergeConflict`](crate::FlowError::MergeConflict).
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    async fn get_latest_commit(&self, repository: &str, branch: &str) -> FlowResult<String>;

    /// Dependency manifest of `repository` at `commit`.
    async fn get_dependencies(
        &self,
        repository: &str,
        commit: &str,
    ) -> FlowResult<Vec<DependencyDetail>>;

    /// Create `branch` from `base_branch`, or leave it as is when it exists.
    async fn create_or_update_branch(
        &self,
        repository: &str,
        branch: &str,
        base_branch: &str,
    ) -> FlowResult<()>;

    async fn delete_branch(&self, repository: &str, branch: &str) -> FlowResult<()>;

    /// Write the dependency manifest changes to `branch` as one commit.
    /// Returns the new head commit.
    async fn commit_updates(
        &self,
        repository: &str,
        branch: &str,
        updates: &[DependencyUpdate],
        message: &str,
    ) -> FlowResult<String>;

    /// Returns the pull request URL.
    async fn create_pull_request(
        &self,
        repository: &str,
        pull_request: &NewPullRequest,
    ) -> FlowResult<String>;

    async fn update_pull_request(
        &self,
        pr_url: &str,
        title: &str,
        description: &str,
    ) -> FlowResult<()>;

    async fn get_pull_request(&self, pr_url: &str) -> FlowResult<PullRequest>;

    async fn merge_pull_request(
        &self,
        pr_url: &str,
        parameters: &MergePullRequestParameters,
    ) -> FlowResult<()>;

    async fn get_pull_request_checks(&self, pr_url: &str) -> FlowResult<Vec<PullRequestCheck>>;

    async fn get_pull_request_reviews(&self, pr_url: &str) -> FlowResult<Vec<Review>>;

    async fn get_pull_request_commits(&self, pr_url: &str) -> FlowResult<Vec<Commit>>;

    /// Publish merge policy results as `maestro-policy-*` check runs.
    async fn report_merge_policy_results(
        &self,
        pr_url: &str,
        results: &MergePolicyEvaluationResults,
    ) -> FlowResult<()>;
}

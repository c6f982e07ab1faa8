//! Placeholder git provider for a daemon without a configured remote.
//!
//! Every call fails with a configuration error, so remote-bound work items
//! are discarded with an error log instead of being retried. Graph jobs and
//! coherency bookkeeping that never touch a remote keep running.

use async_trait::async_trait;
use maestro_core::merge_policy::MergePolicyEvaluationResults;
use maestro_core::remote::{
    Commit, MergePullRequestParameters, NewPullRequest, PullRequest, PullRequestCheck, Review,
};
use maestro_core::{DependencyDetail, DependencyUpdate, FlowError, FlowResult, RemoteRepository};

#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredRemote;

impl UnconfiguredRemote {
    fn fail<T>(operation: &str) -> FlowResult<T> {
        Err(FlowError::configuration(
            "remote",
            format!("no git provider configured for {operation}"),
        ))
    }
}

#[async_trait]
impl RemoteRepository for UnconfiguredRemote {
    async fn get_latest_commit(&self, _repository: &str, _branch: &str) -> FlowResult<String> {
        Self::fail("get_latest_commit")
    }

    async fn get_dependencies(
        &self,
        _repository: &str,
        _commit: &str,
    ) -> FlowResult<Vec<DependencyDetail>> {
        Self::fail("get_dependencies")
    }

    async fn create_or_update_branch(
        &self,
        _repository: &str,
        _branch: &str,
        _base_branch: &str,
    ) -> FlowResult<()> {
        Self::fail("create_or_update_branch")
    }

    async fn delete_branch(&self, _repository: &str, _branch: &str) -> FlowResult<()> {
        Self::fail("delete_branch")
    }

    async fn commit_updates(
        &self,
        _repository: &str,
        _branch: &str,
        _updates: &[DependencyUpdate],
        _message: &str,
    ) -> FlowResult<String> {
        Self::fail("commit_updates")
    }

    async fn create_pull_request(
        &self,
        _repository: &str,
        _pull_request: &NewPullRequest,
    ) -> FlowResult<String> {
        Self::fail("create_pull_request")
    }

    async fn update_pull_request(
        &self,
        _pr_url: &str,
        _title: &str,
        _description: &str,
    ) -> FlowResult<()> {
        Self::fail("update_pull_request")
    }

    async fn get_pull_request(&self, _pr_url: &str) -> FlowResult<PullRequest> {
        Self::fail("get_pull_request")
    }

    async fn merge_pull_request(
        &self,
        _pr_url: &str,
        _parameters: &MergePullRequestParameters,
    ) -> FlowResult<()> {
        Self::fail("merge_pull_request")
    }

    async fn get_pull_request_checks(&self, _pr_url: &str) -> FlowResult<Vec<PullRequestCheck>> {
        Self::fail("get_pull_request_checks")
    }

    async fn get_pull_request_reviews(&self, _pr_url: &str) -> FlowResult<Vec<Review>> {
        Self::fail("get_pull_request_reviews")
    }

    async fn get_pull_request_commits(&self, _pr_url: &str) -> FlowResult<Vec<Commit>> {
        Self::fail("get_pull_request_commits")
    }

    async fn report_merge_policy_results(
        &self,
        _pr_url: &str,
        _results: &MergePolicyEvaluationResults,
    ) -> FlowResult<()> {
        Self::fail("report_merge_policy_results")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_call_is_a_configuration_error() {
        let remote = UnconfiguredRemote;
        let err = remote.get_latest_commit("r", "main").await.unwrap_err();
        assert!(matches!(err, FlowError::Configuration { .. }));
        assert!(!err.is_transient());
    }
}

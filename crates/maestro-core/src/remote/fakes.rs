//! Scriptable in-memory [`RemoteRepository`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::*;
use crate::error::FlowError;

/// Author used for commits made through [`RemoteRepository::commit_updates`].
pub const FAKE_BOT_AUTHOR: &str = "dotnet-maestro[bot]";

#[derive(Debug, Clone)]
struct FakePr {
    repository: String,
    pr: PullRequest,
    checks: Vec<PullRequestCheck>,
    reviews: Vec<Review>,
    mergeable: bool,
}

#[derive(Default)]
struct FakeState {
    latest_commits: HashMap<String, String>,
    manifests: HashMap<String, Vec<DependencyDetail>>,
    branches: HashMap<String, Vec<Commit>>,
    prs: HashMap<String, FakePr>,
    next_pr: u64,
    next_commit: u64,
    failures: HashMap<&'static str, VecDeque<FlowError>>,
    reported: HashMap<String, MergePolicyEvaluationResults>,
    calls: HashMap<&'static str, usize>,
}

fn branch_key(repository: &str, branch: &str) -> String {
    format!("{}@{}", repository.to_lowercase(), branch)
}

/// In-memory git provider. Every operation name can be scripted to fail
/// with [`FakeRemote::fail_next`].
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a call and pop a scripted failure for `operation`, if any.
    fn enter(&self, operation: &'static str) -> FlowResult<MutexGuard<'_, FakeState>> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;
        if let Some(err) = state.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    pub fn fail_next(&self, operation: &'static str, error: FlowError) {
        self.lock().failures.entry(operation).or_default().push_back(error);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn set_latest_commit(&self, repository: &str, branch: &str, sha: &str) {
        self.lock()
            .latest_commits
            .insert(branch_key(repository, branch), sha.to_string());
    }

    pub fn set_dependencies(&self, repository: &str, commit: &str, deps: Vec<DependencyDetail>) {
        self.lock()
            .manifests
            .insert(format!("{}@{}", repository.to_lowercase(), commit), deps);
    }

    pub fn set_checks(&self, pr_url: &str, checks: Vec<PullRequestCheck>) {
        if let Some(pr) = self.lock().prs.get_mut(pr_url) {
            pr.checks = checks;
        }
    }

    pub fn set_reviews(&self, pr_url: &str, reviews: Vec<Review>) {
        if let Some(pr) = self.lock().prs.get_mut(pr_url) {
            pr.reviews = reviews;
        }
    }

    pub fn set_mergeable(&self, pr_url: &str, mergeable: bool) {
        if let Some(pr) = self.lock().prs.get_mut(pr_url) {
            pr.mergeable = mergeable;
        }
    }

    /// Simulate the pull request being closed or merged outside the service.
    pub fn set_status(&self, pr_url: &str, status: PrStatus) {
        if let Some(pr) = self.lock().prs.get_mut(pr_url) {
            pr.pr.status = status;
        }
    }

    /// Push a commit to `branch` as someone other than the bot.
    pub fn push_commit(&self, repository: &str, branch: &str, author: &str) {
        let mut state = self.lock();
        state.next_commit += 1;
        let sha = format!("c{:04}", state.next_commit);
        state
            .branches
            .entry(branch_key(repository, branch))
            .or_default()
            .push(Commit {
                sha,
                author: author.to_string(),
                message: "manual change".to_string(),
            });
    }

    pub fn pull_request(&self, pr_url: &str) -> Option<PullRequest> {
        self.lock().prs.get(pr_url).map(|p| p.pr.clone())
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        let mut prs: Vec<PullRequest> = self.lock().prs.values().map(|p| p.pr.clone()).collect();
        prs.sort_by(|a, b| a.url.cmp(&b.url));
        prs
    }

    pub fn branch_exists(&self, repository: &str, branch: &str) -> bool {
        self.lock().branches.contains_key(&branch_key(repository, branch))
    }

    pub fn branch_commits(&self, repository: &str, branch: &str) -> Vec<Commit> {
        self.lock()
            .branches
            .get(&branch_key(repository, branch))
            .cloned()
            .unwrap_or_default()
    }

    pub fn reported_results(&self, pr_url: &str) -> Option<MergePolicyEvaluationResults> {
        self.lock().reported.get(pr_url).cloned()
    }

    fn pr_mut<'a>(state: &'a mut FakeState, pr_url: &str) -> FlowResult<&'a mut FakePr> {
        state
            .prs
            .get_mut(pr_url)
            .ok_or_else(|| FlowError::decisive(format!("pull request {pr_url} not found")))
    }
}

#[async_trait]
impl RemoteRepository for FakeRemote {
    async fn get_latest_commit(&self, repository: &str, branch: &str) -> FlowResult<String> {
        let state = self.enter("get_latest_commit")?;
        state
            .latest_commits
            .get(&branch_key(repository, branch))
            .cloned()
            .ok_or_else(|| FlowError::decisive(format!("branch {branch} not found in {repository}")))
    }

    async fn get_dependencies(
        &self,
        repository: &str,
        commit: &str,
    ) -> FlowResult<Vec<DependencyDetail>> {
        let state = self.enter("get_dependencies")?;
        Ok(state
            .manifests
            .get(&format!("{}@{}", repository.to_lowercase(), commit))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_or_update_branch(
        &self,
        repository: &str,
        branch: &str,
        _base_branch: &str,
    ) -> FlowResult<()> {
        let mut state = self.enter("create_or_update_branch")?;
        state.branches.entry(branch_key(repository, branch)).or_default();
        Ok(())
    }

    async fn delete_branch(&self, repository: &str, branch: &str) -> FlowResult<()> {
        let mut state = self.enter("delete_branch")?;
        state.branches.remove(&branch_key(repository, branch));
        Ok(())
    }

    async fn commit_updates(
        &self,
        repository: &str,
        branch: &str,
        _updates: &[DependencyUpdate],
        message: &str,
    ) -> FlowResult<String> {
        let mut state = self.enter("commit_updates")?;
        state.next_commit += 1;
        let sha = format!("c{:04}", state.next_commit);
        let commits = state
            .branches
            .get_mut(&branch_key(repository, branch))
            .ok_or_else(|| FlowError::decisive(format!("branch {branch} not found in {repository}")))?;
        commits.push(Commit {
            sha: sha.clone(),
            author: FAKE_BOT_AUTHOR.to_string(),
            message: message.to_string(),
        });
        Ok(sha)
    }

    async fn create_pull_request(
        &self,
        repository: &str,
        pull_request: &NewPullRequest,
    ) -> FlowResult<String> {
        let mut state = self.enter("create_pull_request")?;
        state.next_pr += 1;
        let url = format!("{}/pull/{}", repository.trim_end_matches('/'), state.next_pr);
        state.prs.insert(
            url.clone(),
            FakePr {
                repository: repository.to_string(),
                pr: PullRequest {
                    url: url.clone(),
                    title: pull_request.title.clone(),
                    description: pull_request.description.clone(),
                    head_branch: pull_request.head_branch.clone(),
                    base_branch: pull_request.base_branch.clone(),
                    status: PrStatus::Open,
                },
                checks: Vec::new(),
                reviews: Vec::new(),
                mergeable: true,
            },
        );
        Ok(url)
    }

    async fn update_pull_request(
        &self,
        pr_url: &str,
        title: &str,
        description: &str,
    ) -> FlowResult<()> {
        let mut state = self.enter("update_pull_request")?;
        let pr = Self::pr_mut(&mut state, pr_url)?;
        pr.pr.title = title.to_string();
        pr.pr.description = description.to_string();
        Ok(())
    }

    async fn get_pull_request(&self, pr_url: &str) -> FlowResult<PullRequest> {
        let mut state = self.enter("get_pull_request")?;
        Ok(Self::pr_mut(&mut state, pr_url)?.pr.clone())
    }

    async fn merge_pull_request(
        &self,
        pr_url: &str,
        parameters: &MergePullRequestParameters,
    ) -> FlowResult<()> {
        let mut state = self.enter("merge_pull_request")?;
        let (repository, head, mergeable) = {
            let pr = Self::pr_mut(&mut state, pr_url)?;
            (pr.repository.clone(), pr.pr.head_branch.clone(), pr.mergeable)
        };
        if !mergeable {
            return Err(FlowError::MergeConflict {
                pr_url: pr_url.to_string(),
                reason: "pull request is not mergeable".to_string(),
            });
        }
        let key = branch_key(&repository, &head);
        if let Some(expected) = &parameters.commit_to_merge {
            let tip = state.branches.get(&key).and_then(|c| c.last()).map(|c| c.sha.clone());
            if tip.as_deref() != Some(expected.as_str()) {
                return Err(FlowError::MergeConflict {
                    pr_url: pr_url.to_string(),
                    reason: format!("head moved past {expected}"),
                });
            }
        }
        Self::pr_mut(&mut state, pr_url)?.pr.status = PrStatus::Merged;
        if parameters.delete_source_branch {
            state.branches.remove(&key);
        }
        Ok(())
    }

    async fn get_pull_request_checks(&self, pr_url: &str) -> FlowResult<Vec<PullRequestCheck>> {
        let mut state = self.enter("get_pull_request_checks")?;
        Ok(Self::pr_mut(&mut state, pr_url)?.checks.clone())
    }

    async fn get_pull_request_reviews(&self, pr_url: &str) -> FlowResult<Vec<Review>> {
        let mut state = self.enter("get_pull_request_reviews")?;
        Ok(Self::pr_mut(&mut state, pr_url)?.reviews.clone())
    }

    async fn get_pull_request_commits(&self, pr_url: &str) -> FlowResult<Vec<Commit>> {
        let mut state = self.enter("get_pull_request_commits")?;
        let (repository, head) = {
            let pr = Self::pr_mut(&mut state, pr_url)?;
            (pr.repository.clone(), pr.pr.head_branch.clone())
        };
        Ok(state
            .branches
            .get(&branch_key(&repository, &head))
            .cloned()
            .unwrap_or_default())
    }

    async fn report_merge_policy_results(
        &self,
        pr_url: &str,
        results: &MergePolicyEvaluationResults,
    ) -> FlowResult<()> {
        let mut state = self.enter("report_merge_policy_results")?;
        Self::pr_mut(&mut state, pr_url)?;
        state.reported.insert(pr_url.to_string(), results.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "https://github.com/dotnet/sdk";

    async fn open_pr(remote: &FakeRemote) -> String {
        remote.create_or_update_branch(REPO, "darc-main-1", "main").await.unwrap();
        remote
            .create_pull_request(
                REPO,
                &NewPullRequest {
                    title: "t".into(),
                    description: "d".into(),
                    head_branch: "darc-main-1".into(),
                    base_branch: "main".into(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let remote = FakeRemote::new();
        remote.fail_next("get_dependencies", FlowError::transient("get_dependencies", "503"));
        assert!(remote.get_dependencies(REPO, "abc").await.unwrap_err().is_transient());
        assert!(remote.get_dependencies(REPO, "abc").await.unwrap().is_empty());
        assert_eq!(remote.calls("get_dependencies"), 2);
    }

    #[tokio::test]
    async fn test_unmergeable_pr_reports_conflict() {
        let remote = FakeRemote::new();
        let url = open_pr(&remote).await;
        remote.set_mergeable(&url, false);
        let err = remote
            .merge_pull_request(&url, &MergePullRequestParameters::default())
            .await
            .unwrap_err();
        assert!(err.is_merge_conflict());
        assert_eq!(remote.pull_request(&url).unwrap().status, PrStatus::Open);
    }

    #[tokio::test]
    async fn test_merge_deletes_branch_when_asked() {
        let remote = FakeRemote::new();
        let url = open_pr(&remote).await;
        remote
            .merge_pull_request(
                &url,
                &MergePullRequestParameters {
                    squash_merge: true,
                    delete_source_branch: true,
                    commit_to_merge: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(remote.pull_request(&url).unwrap().status, PrStatus::Merged);
        assert!(!remote.branch_exists(REPO, "darc-main-1"));
    }

    #[tokio::test]
    async fn test_pr_commits_follow_head_branch() {
        let remote = FakeRemote::new();
        let url = open_pr(&remote).await;
        remote.commit_updates(REPO, "darc-main-1", &[], "Update dependencies").await.unwrap();
        remote.push_commit(REPO, "darc-main-1", "someone");
        let commits = remote.get_pull_request_commits(&url).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].author, FAKE_BOT_AUTHOR);
        assert_eq!(commits[1].author, "someone");
    }
}

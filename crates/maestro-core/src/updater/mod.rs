//! Pull request updater: the per-actor state machine.
//!
//! One updater exists per [`ActorId`]. It turns incoming builds into commits
//! on a deterministic `darc-*` branch, opens or amends a single pull request,
//! re-evaluates merge policies on every reminder and merges once they pass.
//!
//! ```text
//! NoPullRequest -> PullRequestCreating -> PullRequestOpen(Updating | AwaitingChecks | Merging)
//!               -> Merged | Closed(Superseded | Failed)          (Error from anywhere)
//! ```
//!
//! The caller guarantees one operation at a time per actor (see
//! [`crate::scope`]); state is persisted between operations so any worker can
//! pick up the next one.

mod state;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use maestro_state::{
    ActorStateStore, Build, BuildStore, FlowKind, MergePolicyDefinition, Subscription,
    SubscriptionStore,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::codeflow::{VmrBackFlower, VmrForwardFlower};
use crate::coherency::{required_non_coherency_updates, CoherencyErrorDetails, CoherencyResolver};
use crate::error::{FlowError, FlowResult};
use crate::merge_policy::{MergePolicyContext, MergePolicyRegistry};
use crate::metrics::METRICS;
use crate::obs;
use crate::pr_description::{
    coherency_title, generate_title, merge_existing_with_incoming, parse_subscription_updates,
    set_coherency_section, update_description, CoherencyUpdateSummary, DependencyUpdateSummary,
    SubscriptionUpdateDescription,
};
use crate::queue::WorkItemQueue;
use crate::remote::{MergePullRequestParameters, NewPullRequest, PrStatus, RemoteRepository};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::work_item::{ReminderKind, WorkItem};

pub use state::{
    ActorId, ActorStateCache, ClosedReason, InProgressPullRequest, OpenPhase, SubscriptionPrUpdate,
    UpdateAssetsParameters, UpdaterState,
};

// ---------------------------------------------------------------------------
// Configuration and collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestUpdaterOptions {
    /// Delay between pull request checks.
    pub reminder_delay: Duration,
    /// Delay before batched updates are flushed.
    pub batch_delay: Duration,
    pub squash_merge: bool,
    pub delete_source_branch: bool,
    /// Re-apply attempts after a merge conflict before asking for a human.
    pub max_merge_conflict_retries: u32,
    /// Author of commits made by this service.
    pub bot_author: String,
    /// Backoff for individual remote calls.
    pub remote_retry: RetryPolicy,
}

impl Default for PullRequestUpdaterOptions {
    fn default() -> Self {
        Self {
            reminder_delay: Duration::from_secs(5 * 60),
            batch_delay: Duration::from_secs(5 * 60),
            squash_merge: true,
            delete_source_branch: true,
            max_merge_conflict_retries: 3,
            bot_author: "dotnet-maestro[bot]".to_string(),
            remote_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            },
        }
    }
}

/// Shared collaborators of every updater and work item processor.
#[derive(Clone)]
pub struct FlowServices {
    pub builds: Arc<dyn BuildStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub actor_states: Arc<dyn ActorStateStore>,
    pub remote: Arc<dyn RemoteRepository>,
    pub queue: Arc<dyn WorkItemQueue>,
    pub back_flower: Option<Arc<dyn VmrBackFlower>>,
    pub forward_flower: Option<Arc<dyn VmrForwardFlower>>,
    pub policies: Arc<MergePolicyRegistry>,
    pub options: PullRequestUpdaterOptions,
}

impl FlowServices {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        actor_states: Arc<dyn ActorStateStore>,
        remote: Arc<dyn RemoteRepository>,
        queue: Arc<dyn WorkItemQueue>,
    ) -> Self {
        Self {
            builds,
            subscriptions,
            actor_states,
            remote,
            queue,
            back_flower: None,
            forward_flower: None,
            policies: Arc::new(MergePolicyRegistry::default()),
            options: PullRequestUpdaterOptions::default(),
        }
    }

    pub fn with_back_flower(mut self, flower: Arc<dyn VmrBackFlower>) -> Self {
        self.back_flower = Some(flower);
        self
    }

    pub fn with_forward_flower(mut self, flower: Arc<dyn VmrForwardFlower>) -> Self {
        self.forward_flower = Some(flower);
        self
    }

    pub fn with_options(mut self, options: PullRequestUpdaterOptions) -> Self {
        self.options = options;
        self
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// The subscription is disabled.
    Disabled,
    /// Queued for the next batch flush.
    Batched,
    /// Nothing was pending.
    NoWork,
    /// The target is already up to date.
    NoChanges,
    Created { pr_url: String },
    Updated { pr_url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    NoPullRequest,
    Pending,
    PolicyFailed,
    Merged,
    Closed,
    MergeConflict { retries: u32 },
    NeedsManualAttention,
    /// The reminder was armed for a pull request the actor no longer tracks.
    Stale,
}

impl UpdateOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateOutcome::Disabled => "disabled",
            UpdateOutcome::Batched => "batched",
            UpdateOutcome::NoWork => "no_work",
            UpdateOutcome::NoChanges => "no_changes",
            UpdateOutcome::Created { .. } => "created",
            UpdateOutcome::Updated { .. } => "updated",
        }
    }
}

impl CheckOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            CheckOutcome::NoPullRequest => "no_pull_request",
            CheckOutcome::Pending => "pending",
            CheckOutcome::PolicyFailed => "policy_failed",
            CheckOutcome::Merged => "merged",
            CheckOutcome::Closed => "closed",
            CheckOutcome::MergeConflict { .. } => "merge_conflict",
            CheckOutcome::NeedsManualAttention => "needs_manual_attention",
            CheckOutcome::Stale => "stale",
        }
    }
}

/// Deterministic head branch: `darc-{target_branch}-{suffix}`.
pub fn pull_request_branch_name(actor: &ActorId, target_branch: &str, first_build: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(actor.key().as_bytes());
    hasher.update(first_build.to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("darc-{target_branch}-{}", &digest[..16])
}

/// One update resolved against the target, ready to be described.
struct AppliedUpdate {
    subscription: Subscription,
    build: Build,
    summaries: Vec<DependencyUpdateSummary>,
}

// ---------------------------------------------------------------------------
// Updater
// ---------------------------------------------------------------------------

pub struct PullRequestUpdater {
    actor: ActorId,
    services: FlowServices,
    cache: ActorStateCache,
}

impl PullRequestUpdater {
    pub fn new(actor: ActorId, services: FlowServices) -> Self {
        let cache = ActorStateCache::new(services.actor_states.clone(), &actor);
        Self {
            actor,
            services,
            cache,
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub async fn state(&self) -> FlowResult<UpdaterState> {
        self.cache.state().await
    }

    pub async fn in_progress(&self) -> FlowResult<Option<InProgressPullRequest>> {
        self.cache.in_progress().await
    }

    /// A new build for one of this actor's subscriptions.
    ///
    /// Batched actors queue the update for [`Self::process_pending_updates`];
    /// others apply it right away.
    pub async fn update_assets(&self, update: UpdateAssetsParameters) -> FlowResult<UpdateOutcome> {
        let result = self.update_assets_inner(update).await;
        self.record_failure(result).await
    }

    async fn update_assets_inner(&self, update: UpdateAssetsParameters) -> FlowResult<UpdateOutcome> {
        let subscription = self
            .services
            .subscriptions
            .get_subscription(update.subscription_id)
            .await?;
        if !subscription.enabled {
            info!(actor = %self.actor, subscription = %subscription.id, "subscription disabled, ignoring build");
            return Ok(UpdateOutcome::Disabled);
        }

        if self.actor.is_batched() {
            debug!(actor = %self.actor, build = update.build_id, "queueing batched update");
            self.cache.push_pending_update(update).await?;
            // Re-armed on every update so a lost flush is recovered.
            self.arm_flush_reminder().await?;
            return Ok(UpdateOutcome::Batched);
        }

        self.process_updates(vec![update]).await
    }

    /// Flush batched updates into one pull request. Returns
    /// [`UpdateOutcome::NoWork`] without side effects when nothing is pending.
    pub async fn process_pending_updates(&self) -> FlowResult<UpdateOutcome> {
        let result = async {
            let pending = self.cache.pending_updates().await?;
            if pending.is_empty() {
                return Ok(UpdateOutcome::NoWork);
            }
            let outcome = self.process_updates(pending).await?;
            self.cache.clear_pending_updates().await?;
            self.services
                .queue
                .unset_reminder(&ReminderKind::PullRequestUpdate.key(&self.actor))
                .await?;
            Ok(outcome)
        }
        .await;
        self.record_failure(result).await
    }

    /// Re-check the in-progress pull request and merge it once its policies
    /// pass. Reschedules itself while the pull request stays open.
    pub async fn check_pull_request(&self) -> FlowResult<CheckOutcome> {
        let result = self.check_pull_request_inner(None).await;
        self.record_failure(result).await
    }

    /// [`Self::check_pull_request`] for a reminder armed for `pr_url`. Ends
    /// with [`CheckOutcome::Stale`], without rescheduling, once the actor has
    /// moved on to another pull request.
    pub async fn check_pull_request_for(&self, pr_url: &str) -> FlowResult<CheckOutcome> {
        let result = self.check_pull_request_inner(Some(pr_url)).await;
        self.record_failure(result).await
    }

    // -----------------------------------------------------------------------
    // Update path
    // -----------------------------------------------------------------------

    async fn process_updates(&self, updates: Vec<UpdateAssetsParameters>) -> FlowResult<UpdateOutcome> {
        let Some(first) = updates.first() else {
            return Ok(UpdateOutcome::NoWork);
        };
        let first_subscription = self
            .services
            .subscriptions
            .get_subscription(first.subscription_id)
            .await?;
        let repository = first_subscription.target_repository.clone();
        let base_branch = first_subscription.target_branch.clone();

        let existing = self.open_pull_request().await?;
        let head_branch = match &existing {
            Some(pr) => pr.head_branch.clone(),
            None => pull_request_branch_name(&self.actor, &base_branch, first.build_id),
        };

        if existing.is_some() {
            self.set_state(UpdaterState::PullRequestOpen {
                phase: OpenPhase::Updating,
            })
            .await?;
        } else {
            self.set_state(UpdaterState::PullRequestCreating).await?;
            self.remote("create_or_update_branch", || {
                self.services
                    .remote
                    .create_or_update_branch(&repository, &head_branch, &base_branch)
            })
            .await?;
        }

        let mut applied: Vec<AppliedUpdate> = Vec::new();
        let mut coherency_updates: Vec<CoherencyUpdateSummary> = Vec::new();
        let mut coherency_errors: Vec<CoherencyErrorDetails> = Vec::new();
        let mut conflicted_files: Vec<String> = Vec::new();

        for update in &updates {
            let subscription = self
                .services
                .subscriptions
                .get_subscription(update.subscription_id)
                .await?;
            if !subscription.enabled {
                continue;
            }
            let build = self.services.builds.get_build(update.build_id).await?;

            let summaries = match subscription.flow_kind() {
                FlowKind::Dependency => {
                    let (summaries, coherency, errors) = self
                        .apply_dependency_update(&subscription, update, &repository, &base_branch, &head_branch)
                        .await?;
                    if summaries.is_empty() && coherency.is_empty() && errors.is_empty() {
                        debug!(actor = %self.actor, build = build.id, "no dependency changes for build");
                        continue;
                    }
                    coherency_updates.extend(coherency);
                    coherency_errors.extend(errors);
                    summaries
                }
                kind => {
                    let result = self
                        .apply_code_flow(kind, &subscription, &build, &head_branch)
                        .await?;
                    if !result.had_updates {
                        debug!(actor = %self.actor, build = build.id, "code flow produced no changes");
                        continue;
                    }
                    conflicted_files.extend(result.conflicted_files);
                    result.dependency_updates.iter().map(|u| u.summary()).collect()
                }
            };

            applied.push(AppliedUpdate {
                subscription,
                build,
                summaries,
            });
        }

        if applied.is_empty() {
            return self.finish_without_changes(existing, &updates, &repository, &head_branch).await;
        }

        let mut description = match &existing {
            Some(pr) => {
                self.remote("get_pull_request", || self.services.remote.get_pull_request(&pr.url))
                    .await?
                    .description
            }
            None => String::new(),
        };

        let mut all_summaries: Vec<DependencyUpdateSummary> = Vec::new();
        for a in &applied {
            let prior = parse_subscription_updates(&description, &a.subscription.id);
            let merged = merge_existing_with_incoming(&prior, &a.summaries);
            description = update_description(
                Some(&description),
                &SubscriptionUpdateDescription {
                    subscription_id: a.subscription.id,
                    source_repository: a.build.repository().to_string(),
                    build_id: a.build.id,
                    commit: a.build.commit.clone(),
                    branch: a.build.branch().to_string(),
                    updates: merged,
                },
            );
            all_summaries = merge_existing_with_incoming(&all_summaries, &a.summaries);
        }
        description = set_coherency_section(&description, &coherency_updates, &coherency_errors);

        let now = Utc::now();
        let is_new = existing.is_none();
        let mut pr = match existing {
            Some(mut pr) => {
                pr.required_updates = merge_existing_with_incoming(&pr.required_updates, &all_summaries);
                pr
            }
            None => InProgressPullRequest {
                url: String::new(),
                repository: repository.clone(),
                base_branch: base_branch.clone(),
                head_branch: head_branch.clone(),
                contained_subscriptions: Vec::new(),
                required_updates: all_summaries.clone(),
                coherency_check_successful: None,
                coherency_errors: Vec::new(),
                merge_policy_result: None,
                merge_conflict_retries: 0,
                needs_manual_attention: false,
                conflicted_files: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        };
        for a in &applied {
            pr.record_subscription(a.subscription.id, a.build.id);
        }
        pr.coherency_check_successful = Some(coherency_errors.is_empty());
        pr.coherency_errors = coherency_errors;
        pr.conflicted_files = conflicted_files;
        pr.updated_at = now;
        if !pr.conflicted_files.is_empty() {
            warn!(actor = %self.actor, files = ?pr.conflicted_files, "code flow left conflicts on the head branch");
        }

        let title = if pr.required_updates.is_empty() && !coherency_updates.is_empty() {
            coherency_title(&base_branch)
        } else {
            generate_title(&base_branch, &self.source_repositories(&pr, &applied).await?)
        };

        let outcome = if is_new {
            let request = NewPullRequest {
                title,
                description,
                head_branch: head_branch.clone(),
                base_branch: base_branch.clone(),
            };
            pr.url = self
                .remote("create_pull_request", || {
                    self.services.remote.create_pull_request(&repository, &request)
                })
                .await?;
            METRICS.inc_prs_created();
            obs::emit_pr_created(&self.actor.key(), &pr.url, pr.required_updates.len());
            UpdateOutcome::Created {
                pr_url: pr.url.clone(),
            }
        } else {
            self.remote("update_pull_request", || {
                self.services
                    .remote
                    .update_pull_request(&pr.url, &title, &description)
            })
            .await?;
            METRICS.inc_prs_updated();
            obs::emit_pr_updated(&self.actor.key(), &pr.url, pr.required_updates.len());
            UpdateOutcome::Updated {
                pr_url: pr.url.clone(),
            }
        };

        self.cache.set_in_progress(&pr).await?;
        self.set_state(UpdaterState::PullRequestOpen {
            phase: OpenPhase::AwaitingChecks,
        })
        .await?;
        self.arm_check_reminder(&pr.url).await?;
        Ok(outcome)
    }

    /// Classic flow: compute and commit manifest changes. Returns the direct
    /// updates, coherency updates and coherency errors.
    async fn apply_dependency_update(
        &self,
        subscription: &Subscription,
        update: &UpdateAssetsParameters,
        repository: &str,
        base_branch: &str,
        head_branch: &str,
    ) -> FlowResult<(
        Vec<DependencyUpdateSummary>,
        Vec<CoherencyUpdateSummary>,
        Vec<CoherencyErrorDetails>,
    )> {
        let base_sha = self
            .remote("get_latest_commit", || {
                self.services.remote.get_latest_commit(repository, base_branch)
            })
            .await?;
        let dependencies = self
            .remote("get_dependencies", || {
                self.services.remote.get_dependencies(repository, &base_sha)
            })
            .await?;

        let direct = required_non_coherency_updates(
            &update.source_repository,
            &update.source_sha,
            &update.assets,
            &dependencies,
            |name| subscription.is_asset_excluded(name),
        );
        let coherency = CoherencyResolver::new(self.services.remote.clone())
            .required_coherency_updates(&dependencies, &direct)
            .await?;

        let mut all = direct.clone();
        all.extend(coherency.updates.iter().cloned());
        if !all.is_empty() {
            let message = format!(
                "Update dependencies from {} build {}",
                update.source_repository, update.build_id
            );
            self.remote("commit_updates", || {
                self.services
                    .remote
                    .commit_updates(repository, head_branch, &all, &message)
            })
            .await?;
        }

        let coherency_summaries = coherency
            .updates
            .iter()
            .map(|u| CoherencyUpdateSummary {
                update: u.summary(),
                parent: u.to.coherent_parent.clone().unwrap_or_default(),
            })
            .collect();
        Ok((
            direct.iter().map(|u| u.summary()).collect(),
            coherency_summaries,
            coherency.errors,
        ))
    }

    async fn apply_code_flow(
        &self,
        kind: FlowKind,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
    ) -> FlowResult<crate::codeflow::CodeFlowResult> {
        match kind {
            FlowKind::Backflow => {
                let flower = self.services.back_flower.as_ref().ok_or_else(|| {
                    FlowError::configuration("source_directory", "no backflow implementation configured")
                })?;
                flower.flow_back(subscription, build, head_branch).await
            }
            FlowKind::ForwardFlow => {
                let flower = self.services.forward_flower.as_ref().ok_or_else(|| {
                    FlowError::configuration("target_directory", "no forward flow implementation configured")
                })?;
                flower.flow_forward(subscription, build, head_branch).await
            }
            FlowKind::Dependency => Err(FlowError::invariant("dependency flow routed to code flow")),
        }
    }

    async fn finish_without_changes(
        &self,
        existing: Option<InProgressPullRequest>,
        updates: &[UpdateAssetsParameters],
        repository: &str,
        head_branch: &str,
    ) -> FlowResult<UpdateOutcome> {
        if let Some(pr) = existing {
            self.set_state(UpdaterState::PullRequestOpen {
                phase: OpenPhase::AwaitingChecks,
            })
            .await?;
            self.arm_check_reminder(&pr.url).await?;
            return Ok(UpdateOutcome::NoChanges);
        }

        self.remote("delete_branch", || {
            self.services.remote.delete_branch(repository, head_branch)
        })
        .await?;
        for update in updates {
            self.services
                .subscriptions
                .set_last_applied_build(update.subscription_id, update.build_id)
                .await?;
        }
        self.set_state(UpdaterState::NoPullRequest).await?;
        info!(actor = %self.actor, "target already up to date");
        Ok(UpdateOutcome::NoChanges)
    }

    async fn source_repositories(
        &self,
        pr: &InProgressPullRequest,
        applied: &[AppliedUpdate],
    ) -> FlowResult<Vec<String>> {
        let mut repos: Vec<String> = Vec::new();
        for contained in &pr.contained_subscriptions {
            let repo = match applied.iter().find(|a| a.subscription.id == contained.subscription_id) {
                Some(a) => a.subscription.source_repository.clone(),
                None => {
                    self.services
                        .subscriptions
                        .get_subscription(contained.subscription_id)
                        .await?
                        .source_repository
                }
            };
            if !repos.iter().any(|r| r.eq_ignore_ascii_case(&repo)) {
                repos.push(repo);
            }
        }
        Ok(repos)
    }

    // -----------------------------------------------------------------------
    // Check path
    // -----------------------------------------------------------------------

    async fn check_pull_request_inner(&self, expected_pr_url: Option<&str>) -> FlowResult<CheckOutcome> {
        let Some(mut pr) = self.cache.in_progress().await? else {
            return Ok(CheckOutcome::NoPullRequest);
        };
        if let Some(expected) = expected_pr_url {
            if expected != pr.url {
                debug!(actor = %self.actor, reminder_pr = expected, current_pr = %pr.url, "dropping stale check reminder");
                return Ok(CheckOutcome::Stale);
            }
        }

        let remote_pr = self
            .remote("get_pull_request", || self.services.remote.get_pull_request(&pr.url))
            .await?;
        match remote_pr.status {
            PrStatus::Merged => {
                self.complete_merged(&pr).await?;
                return Ok(CheckOutcome::Merged);
            }
            PrStatus::Closed => {
                self.close_external(&pr).await?;
                return Ok(CheckOutcome::Closed);
            }
            PrStatus::Open => {}
        }

        if pr.needs_manual_attention {
            self.arm_check_reminder(&pr.url).await?;
            return Ok(CheckOutcome::NeedsManualAttention);
        }

        let definitions = self.merge_policy_definitions(&pr).await?;
        let context = self.policy_context(&pr).await?;
        let results = self.services.policies.evaluate(&definitions, &context)?;
        METRICS.inc_policy_evaluations();
        obs::emit_policy_evaluated(&self.actor.key(), &pr.url, &results);
        self.remote("report_merge_policy_results", || {
            self.services
                .remote
                .report_merge_policy_results(&pr.url, &results)
        })
        .await?;
        pr.merge_policy_result = Some(results.clone());

        if !results.succeeded() {
            self.cache.set_in_progress(&pr).await?;
            self.set_state(UpdaterState::PullRequestOpen {
                phase: OpenPhase::AwaitingChecks,
            })
            .await?;
            self.arm_check_reminder(&pr.url).await?;
            return Ok(if results.failed() {
                CheckOutcome::PolicyFailed
            } else {
                CheckOutcome::Pending
            });
        }

        self.cache.set_in_progress(&pr).await?;
        self.set_state(UpdaterState::PullRequestOpen {
            phase: OpenPhase::Merging,
        })
        .await?;

        let parameters = MergePullRequestParameters {
            squash_merge: self.services.options.squash_merge,
            delete_source_branch: self.services.options.delete_source_branch,
            commit_to_merge: None,
        };
        let merged = self
            .remote("merge_pull_request", || {
                self.services.remote.merge_pull_request(&pr.url, &parameters)
            })
            .await;

        match merged {
            Ok(()) => {
                self.complete_merged(&pr).await?;
                Ok(CheckOutcome::Merged)
            }
            Err(err) if err.is_merge_conflict() => self.handle_merge_conflict(pr, &err).await,
            Err(err) => Err(err),
        }
    }

    async fn handle_merge_conflict(
        &self,
        mut pr: InProgressPullRequest,
        err: &FlowError,
    ) -> FlowResult<CheckOutcome> {
        pr.merge_conflict_retries += 1;
        let exhausted = pr.merge_conflict_retries > self.services.options.max_merge_conflict_retries;
        obs::emit_pr_merge_conflict(&self.actor.key(), &pr.url, pr.merge_conflict_retries, exhausted);
        warn!(actor = %self.actor, pr_url = %pr.url, error = %err, "pull request could not be merged");

        pr.needs_manual_attention = exhausted;
        let retries = pr.merge_conflict_retries;
        self.cache.set_in_progress(&pr).await?;
        self.set_state(UpdaterState::PullRequestOpen {
            phase: OpenPhase::AwaitingChecks,
        })
        .await?;

        if exhausted {
            self.arm_check_reminder(&pr.url).await?;
            return Ok(CheckOutcome::NeedsManualAttention);
        }

        // Re-apply every contained build against the current branch tip.
        let mut reapply = Vec::new();
        for contained in &pr.contained_subscriptions {
            let build = self.services.builds.get_build(contained.build_id).await?;
            reapply.push(UpdateAssetsParameters {
                subscription_id: contained.subscription_id,
                build_id: build.id,
                source_repository: build.repository().to_string(),
                source_sha: build.commit.clone(),
                assets: build.assets.clone(),
                is_coherency_update: false,
            });
        }
        // Re-arms the check reminder.
        self.process_updates(reapply).await?;
        Ok(CheckOutcome::MergeConflict { retries })
    }

    async fn merge_policy_definitions(
        &self,
        pr: &InProgressPullRequest,
    ) -> FlowResult<Vec<MergePolicyDefinition>> {
        match &self.actor {
            ActorId::Batch { repository, branch } => Ok(self
                .services
                .subscriptions
                .get_repository_merge_policies(repository, branch)
                .await?),
            ActorId::Subscription { subscription_id } => {
                let id = pr
                    .contained_subscriptions
                    .first()
                    .map(|c| c.subscription_id)
                    .unwrap_or(*subscription_id);
                Ok(self
                    .services
                    .subscriptions
                    .get_subscription(id)
                    .await?
                    .policy
                    .merge_policies)
            }
        }
    }

    async fn policy_context(&self, pr: &InProgressPullRequest) -> FlowResult<MergePolicyContext> {
        let remote = &self.services.remote;
        let checks = self
            .remote("get_pull_request_checks", || remote.get_pull_request_checks(&pr.url))
            .await?;
        let reviews = self
            .remote("get_pull_request_reviews", || remote.get_pull_request_reviews(&pr.url))
            .await?;
        let commits = self
            .remote("get_pull_request_commits", || remote.get_pull_request_commits(&pr.url))
            .await?;
        Ok(MergePolicyContext {
            checks,
            reviews,
            commits,
            bot_author: self.services.options.bot_author.clone(),
            updates: pr.required_updates.clone(),
            coherency_check_successful: pr.coherency_check_successful,
            coherency_errors: pr.coherency_errors.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// The cached in-progress pull request if the remote still reports it
    /// open. Merged or closed pull requests are finalised on the way.
    async fn open_pull_request(&self) -> FlowResult<Option<InProgressPullRequest>> {
        let Some(pr) = self.cache.in_progress().await? else {
            return Ok(None);
        };
        let remote_pr = self
            .remote("get_pull_request", || self.services.remote.get_pull_request(&pr.url))
            .await?;
        match remote_pr.status {
            PrStatus::Open => Ok(Some(pr)),
            PrStatus::Merged => {
                self.complete_merged(&pr).await?;
                Ok(None)
            }
            PrStatus::Closed => {
                self.close_external(&pr).await?;
                Ok(None)
            }
        }
    }

    async fn complete_merged(&self, pr: &InProgressPullRequest) -> FlowResult<()> {
        for contained in &pr.contained_subscriptions {
            self.services
                .subscriptions
                .set_last_applied_build(contained.subscription_id, contained.build_id)
                .await?;
        }
        self.cache.clear_in_progress().await?;
        self.unset_check_reminder().await?;
        self.set_state(UpdaterState::Merged).await?;
        METRICS.inc_prs_merged();
        obs::emit_pr_merged(&self.actor.key(), &pr.url);
        Ok(())
    }

    async fn close_external(&self, pr: &InProgressPullRequest) -> FlowResult<()> {
        if let Err(err) = self
            .services
            .remote
            .delete_branch(&pr.repository, &pr.head_branch)
            .await
        {
            warn!(actor = %self.actor, branch = %pr.head_branch, error = %err, "failed to delete branch of closed pull request");
        }
        // A pull request given up on after conflicts counts as failed.
        let (reason, label) = if pr.needs_manual_attention {
            (ClosedReason::Failed, "failed")
        } else {
            (ClosedReason::Superseded, "superseded")
        };
        self.cache.clear_in_progress().await?;
        self.unset_check_reminder().await?;
        self.set_state(UpdaterState::Closed { reason }).await?;
        obs::emit_pr_closed(&self.actor.key(), &pr.url, label);
        Ok(())
    }

    async fn set_state(&self, state: UpdaterState) -> FlowResult<()> {
        debug!(actor = %self.actor, state = state.name(), "updater state");
        self.cache.set_state(&state).await
    }

    async fn arm_check_reminder(&self, pr_url: &str) -> FlowResult<()> {
        self.services
            .queue
            .set_reminder(
                &ReminderKind::PullRequestCheck.key(&self.actor),
                &WorkItem::check_reminder(self.actor.clone(), pr_url),
                self.services.options.reminder_delay,
            )
            .await
    }

    async fn unset_check_reminder(&self) -> FlowResult<()> {
        self.services
            .queue
            .unset_reminder(&ReminderKind::PullRequestCheck.key(&self.actor))
            .await
    }

    async fn arm_flush_reminder(&self) -> FlowResult<()> {
        let reminder = ReminderKind::PullRequestUpdate;
        self.services
            .queue
            .set_reminder(
                &reminder.key(&self.actor),
                &WorkItem::reminder(self.actor.clone(), reminder),
                self.services.options.batch_delay,
            )
            .await
    }

    /// Remote call with call-site backoff on transient failures.
    async fn remote<T, F, Fut>(&self, operation: &'static str, call: F) -> FlowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FlowResult<T>>,
    {
        retry_with_backoff(
            &self.services.options.remote_retry,
            call,
            FlowError::is_transient,
            |attempt, err, delay| {
                warn!(
                    actor = %self.actor,
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "remote call failed, retrying"
                );
            },
        )
        .await
    }

    /// Move to [`UpdaterState::Error`] on failures that retrying cannot fix.
    async fn record_failure<T>(&self, result: FlowResult<T>) -> FlowResult<T> {
        if let Err(err) = &result {
            if !err.is_transient() && !matches!(err, FlowError::Cancelled) {
                error!(actor = %self.actor, error = %err, "pull request updater failed");
                let state = UpdaterState::Error {
                    reason: err.to_string(),
                };
                if let Err(store_err) = self.cache.set_state(&state).await {
                    warn!(actor = %self.actor, error = %store_err, "failed to record error state");
                }
            }
        }
        result
    }
}

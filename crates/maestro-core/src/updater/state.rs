//! Persisted pull request updater state.
//!
//! Each actor keeps three records in the [`ActorStateStore`]: its lifecycle
//! state, the in-progress pull request (if any) and batched updates waiting
//! to be flushed. The in-progress record is a cache of remote state; the
//! remote stays authoritative.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use maestro_state::{repository_branch_key, ActorStateStore, Asset, BuildId, Subscription, SubscriptionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::coherency::CoherencyErrorDetails;
use crate::error::FlowResult;
use crate::merge_policy::MergePolicyEvaluationResults;
use crate::pr_description::DependencyUpdateSummary;

/// Identity of an updater: one non-batched subscription, or every batchable
/// subscription targeting a repository branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorId {
    Subscription { subscription_id: SubscriptionId },
    Batch { repository: String, branch: String },
}

impl ActorId {
    pub fn for_subscription(subscription: &Subscription) -> Self {
        if subscription.policy.batchable {
            ActorId::Batch {
                repository: subscription.target_repository.clone(),
                branch: subscription.target_branch.clone(),
            }
        } else {
            ActorId::Subscription {
                subscription_id: subscription.id,
            }
        }
    }

    /// Stable key used for leases and persisted state.
    pub fn key(&self) -> String {
        match self {
            ActorId::Subscription { subscription_id } => format!("subscription:{subscription_id}"),
            ActorId::Batch { repository, branch } => {
                format!("batch:{}", repository_branch_key(repository, branch))
            }
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, ActorId::Batch { .. })
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenPhase {
    Updating,
    AwaitingChecks,
    Merging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedReason {
    /// Closed outside the service without merging.
    Superseded,
    /// Given up on after exhausting conflict retries.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdaterState {
    #[default]
    NoPullRequest,
    PullRequestCreating,
    PullRequestOpen {
        phase: OpenPhase,
    },
    Merged,
    Closed {
        reason: ClosedReason,
    },
    Error {
        reason: String,
    },
}

impl UpdaterState {
    pub fn is_open(&self) -> bool {
        matches!(self, UpdaterState::PullRequestOpen { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpdaterState::NoPullRequest => "no_pull_request",
            UpdaterState::PullRequestCreating => "pull_request_creating",
            UpdaterState::PullRequestOpen { .. } => "pull_request_open",
            UpdaterState::Merged => "merged",
            UpdaterState::Closed { .. } => "closed",
            UpdaterState::Error { .. } => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Arguments of an update trigger. Also the serialized payload of retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAssetsParameters {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
    pub source_repository: String,
    pub source_sha: String,
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub is_coherency_update: bool,
}

/// A subscription and the build it contributed to an open pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPrUpdate {
    pub subscription_id: SubscriptionId,
    pub build_id: BuildId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressPullRequest {
    pub url: String,
    /// Target repository and branch the pull request merges into.
    pub repository: String,
    pub base_branch: String,
    pub head_branch: String,
    pub contained_subscriptions: Vec<SubscriptionPrUpdate>,
    pub required_updates: Vec<DependencyUpdateSummary>,
    #[serde(default)]
    pub coherency_check_successful: Option<bool>,
    #[serde(default)]
    pub coherency_errors: Vec<CoherencyErrorDetails>,
    /// Latest policy evaluation, as reported on the pull request.
    #[serde(default)]
    pub merge_policy_result: Option<MergePolicyEvaluationResults>,
    #[serde(default)]
    pub merge_conflict_retries: u32,
    #[serde(default)]
    pub needs_manual_attention: bool,
    #[serde(default)]
    pub conflicted_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InProgressPullRequest {
    /// Record `build_id` for `subscription_id`, replacing an older build.
    pub fn record_subscription(&mut self, subscription_id: SubscriptionId, build_id: BuildId) {
        match self
            .contained_subscriptions
            .iter_mut()
            .find(|s| s.subscription_id == subscription_id)
        {
            Some(existing) => existing.build_id = build_id,
            None => self.contained_subscriptions.push(SubscriptionPrUpdate {
                subscription_id,
                build_id,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Store wrapper
// ---------------------------------------------------------------------------

/// Typed access to one actor's records.
#[derive(Clone)]
pub struct ActorStateCache {
    store: Arc<dyn ActorStateStore>,
    prefix: String,
}

impl ActorStateCache {
    pub fn new(store: Arc<dyn ActorStateStore>, actor: &ActorId) -> Self {
        Self {
            store,
            prefix: actor.key(),
        }
    }

    fn key(&self, record: &str) -> String {
        format!("{}:{record}", self.prefix)
    }

    async fn get<T: DeserializeOwned>(&self, record: &str) -> FlowResult<Option<T>> {
        match self.store.get_state(&self.key(record)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize>(&self, record: &str, value: &T) -> FlowResult<()> {
        self.store
            .set_state(&self.key(record), serde_json::to_value(value)?)
            .await?;
        Ok(())
    }

    async fn remove(&self, record: &str) -> FlowResult<()> {
        self.store.remove_state(&self.key(record)).await?;
        Ok(())
    }

    pub async fn state(&self) -> FlowResult<UpdaterState> {
        Ok(self.get("state").await?.unwrap_or_default())
    }

    pub async fn set_state(&self, state: &UpdaterState) -> FlowResult<()> {
        self.set("state", state).await
    }

    pub async fn in_progress(&self) -> FlowResult<Option<InProgressPullRequest>> {
        self.get("pr").await
    }

    pub async fn set_in_progress(&self, pr: &InProgressPullRequest) -> FlowResult<()> {
        self.set("pr", pr).await
    }

    pub async fn clear_in_progress(&self) -> FlowResult<()> {
        self.remove("pr").await
    }

    pub async fn pending_updates(&self) -> FlowResult<Vec<UpdateAssetsParameters>> {
        Ok(self.get("pending").await?.unwrap_or_default())
    }

    /// Add an update to the batch. A newer build of the same subscription
    /// replaces the older one.
    pub async fn push_pending_update(&self, update: UpdateAssetsParameters) -> FlowResult<()> {
        let mut pending = self.pending_updates().await?;
        pending.retain(|p| p.subscription_id != update.subscription_id);
        pending.push(update);
        self.set("pending", &pending).await
    }

    pub async fn clear_pending_updates(&self) -> FlowResult<()> {
        self.remove("pending").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_state::fakes::MemoryActorStateStore;

    fn params(sub: SubscriptionId, build: BuildId) -> UpdateAssetsParameters {
        UpdateAssetsParameters {
            subscription_id: sub,
            build_id: build,
            source_repository: "https://github.com/dotnet/runtime".into(),
            source_sha: format!("sha{build}"),
            assets: vec![Asset::new("Foo", "1.0.0")],
            is_coherency_update: false,
        }
    }

    #[test]
    fn test_actor_id_for_batchable_subscription_groups_by_target() {
        let mut sub = Subscription::new(1, "https://github.com/a/a", "https://github.com/b/B", "Main");
        assert_eq!(ActorId::for_subscription(&sub).key(), format!("subscription:{}", sub.id));
        sub.policy.batchable = true;
        let actor = ActorId::for_subscription(&sub);
        assert!(actor.is_batched());
        assert_eq!(actor.key(), "batch:https://github.com/b/b@main");
    }

    #[test]
    fn test_actor_id_serializes_with_kind_tag() {
        let actor = ActorId::Batch {
            repository: "r".into(),
            branch: "main".into(),
        };
        let value = serde_json::to_value(&actor).unwrap();
        assert_eq!(value["kind"], "batch");
        let back: ActorId = serde_json::from_value(value).unwrap();
        assert_eq!(back, actor);
    }

    #[tokio::test]
    async fn test_pending_updates_keep_latest_build_per_subscription() {
        let actor = ActorId::Batch {
            repository: "r".into(),
            branch: "main".into(),
        };
        let cache = ActorStateCache::new(Arc::new(MemoryActorStateStore::new()), &actor);
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        cache.push_pending_update(params(a, 1)).await.unwrap();
        cache.push_pending_update(params(b, 2)).await.unwrap();
        cache.push_pending_update(params(a, 3)).await.unwrap();

        let pending = cache.pending_updates().await.unwrap();
        let builds: Vec<BuildId> = pending.iter().map(|p| p.build_id).collect();
        assert_eq!(builds, vec![2, 3]);

        cache.clear_pending_updates().await.unwrap();
        assert!(cache.pending_updates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_defaults_to_no_pull_request() {
        let actor = ActorId::Subscription {
            subscription_id: uuid::Uuid::new_v4(),
        };
        let cache = ActorStateCache::new(Arc::new(MemoryActorStateStore::new()), &actor);
        assert_eq!(cache.state().await.unwrap(), UpdaterState::NoPullRequest);
        cache
            .set_state(&UpdaterState::PullRequestOpen {
                phase: OpenPhase::AwaitingChecks,
            })
            .await
            .unwrap();
        assert!(cache.state().await.unwrap().is_open());
    }
}

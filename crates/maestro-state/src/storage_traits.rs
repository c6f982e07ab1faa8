//! Storage traits for the Build Asset Registry.
//!
//! The dependency flow engine only talks to these traits. Implementations:
//! [`crate::fakes`] for tests and [`crate::surreal_store::SurrealBarStore`]
//! for the daemon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::*;

/// Result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// BuildStore
// ---------------------------------------------------------------------------

/// Builds, their channel assignments, timings and coherency info.
///
/// Semantics:
/// - `add_build` rejects a duplicate id with `AlreadyExists`.
/// - `get_build` returns `NotFound` for an unknown id.
/// - `get_builds_in_channel` returns builds produced at or after `since`,
///   newest first.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn add_build(&self, build: Build) -> StorageResult<()>;

    async fn get_build(&self, id: BuildId) -> StorageResult<Build>;

    async fn add_build_to_channel(&self, build_id: BuildId, channel_id: ChannelId)
        -> StorageResult<()>;

    async fn get_builds_in_channel(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Build>>;

    /// Replace the recorded timing for `(repository, branch)`.
    async fn set_build_time(&self, time: BuildTime) -> StorageResult<()>;

    async fn list_build_times(&self) -> StorageResult<Vec<BuildTime>>;

    /// Replace the incoherency list computed for a build.
    async fn set_build_incoherencies(
        &self,
        build_id: BuildId,
        incoherencies: Vec<BuildIncoherence>,
    ) -> StorageResult<()>;

    async fn get_build_incoherencies(&self, build_id: BuildId)
        -> StorageResult<Vec<BuildIncoherence>>;
}

// ---------------------------------------------------------------------------
// ChannelStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn add_channel(&self, channel: Channel) -> StorageResult<()>;

    async fn get_channel(&self, id: ChannelId) -> StorageResult<Channel>;

    /// All channels ordered by id.
    async fn list_channels(&self) -> StorageResult<Vec<Channel>>;

    /// Adding the same `(repository, branch, channel)` twice is a no-op.
    async fn add_default_channel(&self, default_channel: DefaultChannel) -> StorageResult<()>;

    async fn list_default_channels(&self) -> StorageResult<Vec<DefaultChannel>>;
}

// ---------------------------------------------------------------------------
// SubscriptionStore
// ---------------------------------------------------------------------------

/// Subscriptions and the merge policies of batched repository branches.
///
/// The engine mutates a subscription only through `set_last_applied_build`.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert or replace a subscription by id.
    async fn upsert_subscription(&self, subscription: Subscription) -> StorageResult<()>;

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Subscription>;

    async fn list_subscriptions(&self) -> StorageResult<Vec<Subscription>>;

    async fn set_last_applied_build(
        &self,
        id: SubscriptionId,
        build_id: BuildId,
    ) -> StorageResult<()>;

    /// Merge policies for a batched `(repository, branch)` group.
    async fn set_repository_merge_policies(
        &self,
        repository: &str,
        branch: &str,
        policies: Vec<MergePolicyDefinition>,
    ) -> StorageResult<()>;

    /// Returns an empty list when nothing is configured.
    async fn get_repository_merge_policies(
        &self,
        repository: &str,
        branch: &str,
    ) -> StorageResult<Vec<MergePolicyDefinition>>;
}

// ---------------------------------------------------------------------------
// LongestBuildPathStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LongestBuildPathStore: Send + Sync {
    async fn add_longest_build_path(&self, path: LongestBuildPath) -> StorageResult<()>;

    /// Most recent snapshot for the channel by `report_date`.
    async fn latest_longest_build_path(
        &self,
        channel_id: ChannelId,
    ) -> StorageResult<Option<LongestBuildPath>>;
}

// ---------------------------------------------------------------------------
// ActorStateStore
// ---------------------------------------------------------------------------

/// Key/value documents owned by a pull request updater (in-progress PR,
/// pending batched updates).
///
/// Values are opaque JSON so the engine can evolve its state shapes without
/// touching the storage layer.
#[async_trait]
pub trait ActorStateStore: Send + Sync {
    async fn get_state(&self, key: &str) -> StorageResult<Option<serde_json::Value>>;

    async fn set_state(&self, key: &str, value: serde_json::Value) -> StorageResult<()>;

    /// Removing a missing key is not an error.
    async fn remove_state(&self, key: &str) -> StorageResult<()>;
}

/// Key used for repository/branch scoped records. Case-insensitive.
pub fn repository_branch_key(repository: &str, branch: &str) -> String {
    format!("{}@{}", repository.to_lowercase(), branch.to_lowercase())
}

//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryBarStore` (builds, channels, subscriptions, longest build
//! paths) and `MemoryActorStateStore` that satisfy the trait contracts
//! without any external dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
}

// ---------------------------------------------------------------------------
// MemoryBarStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BarTables {
    builds: BTreeMap<BuildId, Build>,
    build_channels: Vec<(BuildId, ChannelId)>,
    build_times: BTreeMap<String, BuildTime>,
    incoherencies: HashMap<BuildId, Vec<BuildIncoherence>>,
    channels: BTreeMap<ChannelId, Channel>,
    default_channels: Vec<DefaultChannel>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    repository_policies: HashMap<String, Vec<MergePolicyDefinition>>,
    longest_paths: Vec<LongestBuildPath>,
}

/// In-memory Build Asset Registry behind a single `Mutex`.
#[derive(Debug, Default)]
pub struct MemoryBarStore {
    tables: Mutex<BarTables>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryBarStore {
    async fn add_build(&self, build: Build) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        if t.builds.contains_key(&build.id) {
            return Err(StorageError::already_exists("build", build.id));
        }
        t.builds.insert(build.id, build);
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> StorageResult<Build> {
        let t = lock(&self.tables)?;
        t.builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("build", id))
    }

    async fn add_build_to_channel(
        &self,
        build_id: BuildId,
        channel_id: ChannelId,
    ) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        if !t.builds.contains_key(&build_id) {
            return Err(StorageError::not_found("build", build_id));
        }
        if !t.channels.contains_key(&channel_id) {
            return Err(StorageError::not_found("channel", channel_id));
        }
        if !t.build_channels.contains(&(build_id, channel_id)) {
            t.build_channels.push((build_id, channel_id));
        }
        Ok(())
    }

    async fn get_builds_in_channel(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Build>> {
        let t = lock(&self.tables)?;
        let mut builds: Vec<Build> = t
            .build_channels
            .iter()
            .filter(|(_, c)| *c == channel_id)
            .filter_map(|(b, _)| t.builds.get(b))
            .filter(|b| b.date_produced >= since)
            .cloned()
            .collect();
        builds.sort_by(|a, b| b.date_produced.cmp(&a.date_produced));
        Ok(builds)
    }

    async fn set_build_time(&self, time: BuildTime) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        t.build_times
            .insert(repository_branch_key(&time.repository, &time.branch), time);
        Ok(())
    }

    async fn list_build_times(&self) -> StorageResult<Vec<BuildTime>> {
        let t = lock(&self.tables)?;
        Ok(t.build_times.values().cloned().collect())
    }

    async fn set_build_incoherencies(
        &self,
        build_id: BuildId,
        incoherencies: Vec<BuildIncoherence>,
    ) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        if !t.builds.contains_key(&build_id) {
            return Err(StorageError::not_found("build", build_id));
        }
        t.incoherencies.insert(build_id, incoherencies);
        Ok(())
    }

    async fn get_build_incoherencies(
        &self,
        build_id: BuildId,
    ) -> StorageResult<Vec<BuildIncoherence>> {
        let t = lock(&self.tables)?;
        Ok(t.incoherencies.get(&build_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ChannelStore for MemoryBarStore {
    async fn add_channel(&self, channel: Channel) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        if t.channels.contains_key(&channel.id) {
            return Err(StorageError::already_exists("channel", channel.id));
        }
        t.channels.insert(channel.id, channel);
        Ok(())
    }

    async fn get_channel(&self, id: ChannelId) -> StorageResult<Channel> {
        let t = lock(&self.tables)?;
        t.channels
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("channel", id))
    }

    async fn list_channels(&self) -> StorageResult<Vec<Channel>> {
        let t = lock(&self.tables)?;
        Ok(t.channels.values().cloned().collect())
    }

    async fn add_default_channel(&self, default_channel: DefaultChannel) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        if !t.channels.contains_key(&default_channel.channel_id) {
            return Err(StorageError::not_found("channel", default_channel.channel_id));
        }
        if !t.default_channels.contains(&default_channel) {
            t.default_channels.push(default_channel);
        }
        Ok(())
    }

    async fn list_default_channels(&self) -> StorageResult<Vec<DefaultChannel>> {
        let t = lock(&self.tables)?;
        Ok(t.default_channels.clone())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryBarStore {
    async fn upsert_subscription(&self, subscription: Subscription) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        t.subscriptions.insert(subscription.id, subscription);
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Subscription> {
        let t = lock(&self.tables)?;
        t.subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("subscription", id))
    }

    async fn list_subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        let t = lock(&self.tables)?;
        Ok(t.subscriptions.values().cloned().collect())
    }

    async fn set_last_applied_build(
        &self,
        id: SubscriptionId,
        build_id: BuildId,
    ) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        let sub = t
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| StorageError::not_found("subscription", id))?;
        sub.last_applied_build = Some(build_id);
        Ok(())
    }

    async fn set_repository_merge_policies(
        &self,
        repository: &str,
        branch: &str,
        policies: Vec<MergePolicyDefinition>,
    ) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        t.repository_policies
            .insert(repository_branch_key(repository, branch), policies);
        Ok(())
    }

    async fn get_repository_merge_policies(
        &self,
        repository: &str,
        branch: &str,
    ) -> StorageResult<Vec<MergePolicyDefinition>> {
        let t = lock(&self.tables)?;
        Ok(t.repository_policies
            .get(&repository_branch_key(repository, branch))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl LongestBuildPathStore for MemoryBarStore {
    async fn add_longest_build_path(&self, path: LongestBuildPath) -> StorageResult<()> {
        let mut t = lock(&self.tables)?;
        t.longest_paths.push(path);
        Ok(())
    }

    async fn latest_longest_build_path(
        &self,
        channel_id: ChannelId,
    ) -> StorageResult<Option<LongestBuildPath>> {
        let t = lock(&self.tables)?;
        Ok(t.longest_paths
            .iter()
            .filter(|p| p.channel_id == channel_id)
            .max_by_key(|p| p.report_date)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryActorStateStore
// ---------------------------------------------------------------------------

/// In-memory actor state keyed by string.
#[derive(Debug, Default)]
pub struct MemoryActorStateStore {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryActorStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActorStateStore for MemoryActorStateStore {
    async fn get_state(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    async fn set_state(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        lock(&self.entries)?.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_state(&self, key: &str) -> StorageResult<()> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }
}

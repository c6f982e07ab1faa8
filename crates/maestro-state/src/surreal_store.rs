//! SurrealDB-backed Build Asset Registry.
//!
//! Uses the row types in [`crate::schema`] for persistence, converting to and
//! from [`crate::model`] types at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::model::*;
use crate::schema::*;
use crate::storage_traits::*;

/// SurrealDB implementation of every storage trait in this crate.
#[derive(Clone)]
pub struct SurrealBarStore {
    db: Surreal<Any>,
}

impl SurrealBarStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `maestro/bar`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url).await?;
        db.use_ns("maestro").use_db("bar").await?;
        migrations::init_schema(&db).await?;

        info!(url = %url, "SurrealBarStore connected");
        Ok(Self { db })
    }

    async fn select<R, K>(&self, sql: &str, key: K) -> StorageResult<Vec<R>>
    where
        R: DeserializeOwned,
        K: Serialize + Send + 'static,
    {
        let mut res = self.db.query(sql.to_owned()).bind(("key", key)).await?;
        let rows: Vec<R> = res.take(0)?;
        Ok(rows)
    }

    async fn select_all<R: DeserializeOwned>(&self, sql: &str) -> StorageResult<Vec<R>> {
        let mut res = self.db.query(sql.to_owned()).await?;
        let rows: Vec<R> = res.take(0)?;
        Ok(rows)
    }

    async fn insert<R>(&self, table: &'static str, row: R) -> StorageResult<()>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let _created: Option<R> = self.db.create(table).content(row).await?;
        Ok(())
    }

    /// Delete-then-create on the row's unique lookup column.
    async fn replace<R, K>(
        &self,
        table: &'static str,
        column: &str,
        key: K,
        row: R,
    ) -> StorageResult<()>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        K: Serialize + Send + 'static,
    {
        let sql = format!("DELETE {table} WHERE {column} = $key");
        self.db.query(sql).bind(("key", key)).await?;
        self.insert(table, row).await
    }

    async fn fetch_build_row(&self, id: BuildId) -> StorageResult<Option<BuildRow>> {
        let rows: Vec<BuildRow> = self
            .select("SELECT * FROM builds WHERE build_id = $key", id)
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_subscription(&self, id: SubscriptionId) -> StorageResult<Subscription> {
        let rows: Vec<SubscriptionRow> = self
            .select(
                "SELECT * FROM subscriptions WHERE subscription_id = $key",
                id.to_string(),
            )
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("subscription", id))?;
        from_document(row.document)
    }
}

#[async_trait]
impl BuildStore for SurrealBarStore {
    async fn add_build(&self, build: Build) -> StorageResult<()> {
        if self.fetch_build_row(build.id).await?.is_some() {
            return Err(StorageError::already_exists("build", build.id));
        }
        debug!(build_id = build.id, "creating build");
        let row = BuildRow {
            id: None,
            build_id: build.id,
            repository: build.repository().to_string(),
            date_produced: build.date_produced,
            document: to_document(&build)?,
        };
        self.insert("builds", row).await
    }

    async fn get_build(&self, id: BuildId) -> StorageResult<Build> {
        let row = self
            .fetch_build_row(id)
            .await?
            .ok_or_else(|| StorageError::not_found("build", id))?;
        from_document(row.document)
    }

    async fn add_build_to_channel(
        &self,
        build_id: BuildId,
        channel_id: ChannelId,
    ) -> StorageResult<()> {
        self.get_build(build_id).await?;
        self.get_channel(channel_id).await?;

        let mut res = self
            .db
            .query("SELECT * FROM build_channels WHERE build_id = $build AND channel_id = $channel")
            .bind(("build", build_id))
            .bind(("channel", channel_id))
            .await?;
        let existing: Vec<BuildChannelRow> = res.take(0)?;
        if !existing.is_empty() {
            return Ok(());
        }
        let row = BuildChannelRow {
            id: None,
            build_id,
            channel_id,
        };
        self.insert("build_channels", row).await
    }

    async fn get_builds_in_channel(
        &self,
        channel_id: ChannelId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Build>> {
        let links: Vec<BuildChannelRow> = self
            .select(
                "SELECT * FROM build_channels WHERE channel_id = $key",
                channel_id,
            )
            .await?;

        let mut builds = Vec::with_capacity(links.len());
        for link in links {
            if let Some(row) = self.fetch_build_row(link.build_id).await? {
                if row.date_produced >= since {
                    builds.push(from_document::<Build>(row.document)?);
                }
            }
        }
        builds.sort_by(|a, b| b.date_produced.cmp(&a.date_produced));
        Ok(builds)
    }

    async fn set_build_time(&self, time: BuildTime) -> StorageResult<()> {
        let key = repository_branch_key(&time.repository, &time.branch);
        let row = BuildTimeRow {
            id: None,
            key: key.clone(),
            document: to_document(&time)?,
        };
        self.replace("build_times", "key", key, row).await
    }

    async fn list_build_times(&self) -> StorageResult<Vec<BuildTime>> {
        let rows: Vec<BuildTimeRow> = self
            .select_all("SELECT * FROM build_times ORDER BY key ASC")
            .await?;
        rows.into_iter().map(|r| from_document(r.document)).collect()
    }

    async fn set_build_incoherencies(
        &self,
        build_id: BuildId,
        incoherencies: Vec<BuildIncoherence>,
    ) -> StorageResult<()> {
        self.get_build(build_id).await?;
        let row = BuildIncoherenceRow {
            id: None,
            build_id,
            document: to_document(&incoherencies)?,
        };
        self.replace("build_incoherencies", "build_id", build_id, row)
            .await
    }

    async fn get_build_incoherencies(
        &self,
        build_id: BuildId,
    ) -> StorageResult<Vec<BuildIncoherence>> {
        let rows: Vec<BuildIncoherenceRow> = self
            .select(
                "SELECT * FROM build_incoherencies WHERE build_id = $key",
                build_id,
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => from_document(row.document),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl ChannelStore for SurrealBarStore {
    async fn add_channel(&self, channel: Channel) -> StorageResult<()> {
        let existing: Vec<ChannelRow> = self
            .select("SELECT * FROM channels WHERE channel_id = $key", channel.id)
            .await?;
        if !existing.is_empty() {
            return Err(StorageError::already_exists("channel", channel.id));
        }
        let row = ChannelRow {
            id: None,
            channel_id: channel.id,
            document: to_document(&channel)?,
        };
        self.insert("channels", row).await
    }

    async fn get_channel(&self, id: ChannelId) -> StorageResult<Channel> {
        let rows: Vec<ChannelRow> = self
            .select("SELECT * FROM channels WHERE channel_id = $key", id)
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::not_found("channel", id))?;
        from_document(row.document)
    }

    async fn list_channels(&self) -> StorageResult<Vec<Channel>> {
        let rows: Vec<ChannelRow> = self
            .select_all("SELECT * FROM channels ORDER BY channel_id ASC")
            .await?;
        rows.into_iter().map(|r| from_document(r.document)).collect()
    }

    async fn add_default_channel(&self, default_channel: DefaultChannel) -> StorageResult<()> {
        self.get_channel(default_channel.channel_id).await?;
        let key = format!(
            "{}#{}",
            repository_branch_key(&default_channel.repository, &default_channel.branch),
            default_channel.channel_id
        );
        let row = DefaultChannelRow {
            id: None,
            key: key.clone(),
            document: to_document(&default_channel)?,
        };
        self.replace("default_channels", "key", key, row).await
    }

    async fn list_default_channels(&self) -> StorageResult<Vec<DefaultChannel>> {
        let rows: Vec<DefaultChannelRow> = self
            .select_all("SELECT * FROM default_channels ORDER BY key ASC")
            .await?;
        rows.into_iter().map(|r| from_document(r.document)).collect()
    }
}

#[async_trait]
impl SubscriptionStore for SurrealBarStore {
    async fn upsert_subscription(&self, subscription: Subscription) -> StorageResult<()> {
        let key = subscription.id.to_string();
        let row = SubscriptionRow {
            id: None,
            subscription_id: key.clone(),
            document: to_document(&subscription)?,
        };
        self.replace("subscriptions", "subscription_id", key, row)
            .await
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Subscription> {
        self.fetch_subscription(id).await
    }

    async fn list_subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = self
            .select_all("SELECT * FROM subscriptions ORDER BY subscription_id ASC")
            .await?;
        rows.into_iter().map(|r| from_document(r.document)).collect()
    }

    async fn set_last_applied_build(
        &self,
        id: SubscriptionId,
        build_id: BuildId,
    ) -> StorageResult<()> {
        let mut subscription = self.fetch_subscription(id).await?;
        subscription.last_applied_build = Some(build_id);
        self.upsert_subscription(subscription).await
    }

    async fn set_repository_merge_policies(
        &self,
        repository: &str,
        branch: &str,
        policies: Vec<MergePolicyDefinition>,
    ) -> StorageResult<()> {
        let key = repository_branch_key(repository, branch);
        let row = RepositoryPolicyRow {
            id: None,
            key: key.clone(),
            document: to_document(&policies)?,
        };
        self.replace("repository_merge_policies", "key", key, row)
            .await
    }

    async fn get_repository_merge_policies(
        &self,
        repository: &str,
        branch: &str,
    ) -> StorageResult<Vec<MergePolicyDefinition>> {
        let rows: Vec<RepositoryPolicyRow> = self
            .select(
                "SELECT * FROM repository_merge_policies WHERE key = $key",
                repository_branch_key(repository, branch),
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => from_document(row.document),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl LongestBuildPathStore for SurrealBarStore {
    async fn add_longest_build_path(&self, path: LongestBuildPath) -> StorageResult<()> {
        let row = LongestBuildPathRow {
            id: None,
            channel_id: path.channel_id,
            best_case_minutes: path.best_case_minutes,
            worst_case_minutes: path.worst_case_minutes,
            contributing_repositories: path.contributing_repositories,
            report_date: path.report_date,
        };
        self.insert("longest_build_paths", row).await
    }

    async fn latest_longest_build_path(
        &self,
        channel_id: ChannelId,
    ) -> StorageResult<Option<LongestBuildPath>> {
        let rows: Vec<LongestBuildPathRow> = self
            .select(
                "SELECT * FROM longest_build_paths WHERE channel_id = $key \
                 ORDER BY report_date DESC LIMIT 1",
                channel_id,
            )
            .await?;
        Ok(rows.into_iter().next().map(|r| LongestBuildPath {
            channel_id: r.channel_id,
            best_case_minutes: r.best_case_minutes,
            worst_case_minutes: r.worst_case_minutes,
            contributing_repositories: r.contributing_repositories,
            report_date: r.report_date,
        }))
    }
}

#[async_trait]
impl ActorStateStore for SurrealBarStore {
    async fn get_state(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let rows: Vec<ActorStateRow> = self
            .select("SELECT * FROM actor_states WHERE key = $key", key.to_string())
            .await?;
        Ok(rows.into_iter().next().map(|r| r.document))
    }

    async fn set_state(&self, key: &str, value: serde_json::Value) -> StorageResult<()> {
        let row = ActorStateRow {
            id: None,
            key: key.to_string(),
            document: value,
        };
        self.replace("actor_states", "key", key.to_string(), row)
            .await
    }

    async fn remove_state(&self, key: &str) -> StorageResult<()> {
        self.db
            .query("DELETE actor_states WHERE key = $key")
            .bind(("key", key.to_string()))
            .await?;
        Ok(())
    }
}

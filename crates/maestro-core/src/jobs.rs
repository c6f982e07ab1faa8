//! Periodic graph jobs: longest build path snapshots and the dependency
//! cycle health check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use maestro_state::{
    BuildStore, ChannelId, ChannelStore, DefaultChannel, LongestBuildPath, LongestBuildPathStore,
    Subscription, SubscriptionStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FlowResult;
use crate::flow_graph::{is_interesting_node, DependencyFlowGraph, GraphBuildOptions};
use crate::obs;

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HealthResult {
    Passed,
    /// Each cycle lists repository identifiers in flow order.
    Failed { cycles: Vec<Vec<String>> },
}

impl HealthResult {
    pub fn passed(&self) -> bool {
        matches!(self, HealthResult::Passed)
    }
}

/// Report product dependency cycles. Tooling-only edges never count.
pub fn check_product_dependency_cycles(
    default_channels: &[DefaultChannel],
    subscriptions: &[Subscription],
    options: &GraphBuildOptions,
) -> HealthResult {
    let options = GraphBuildOptions {
        include_arcade: false,
        ..options.clone()
    };
    let graph = DependencyFlowGraph::build(default_channels, subscriptions, &[], &options);
    let cycles = graph.find_cycles();
    if cycles.is_empty() {
        HealthResult::Passed
    } else {
        for cycle in &cycles {
            warn!(cycle = %cycle.join(" -> "), "product dependency cycle");
        }
        HealthResult::Failed { cycles }
    }
}

/// Computes and stores the longest build path of each channel.
pub struct LongestBuildPathJob {
    channels: Arc<dyn ChannelStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    builds: Arc<dyn BuildStore>,
    paths: Arc<dyn LongestBuildPathStore>,
    options: GraphBuildOptions,
}

impl LongestBuildPathJob {
    pub fn new(
        channels: Arc<dyn ChannelStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        builds: Arc<dyn BuildStore>,
        paths: Arc<dyn LongestBuildPathStore>,
        options: GraphBuildOptions,
    ) -> Self {
        Self {
            channels,
            subscriptions,
            builds,
            paths,
            options,
        }
    }

    /// Run over every channel.
    pub async fn run(&self, now: DateTime<Utc>) -> FlowResult<Vec<LongestBuildPath>> {
        let channels: Vec<ChannelId> = self
            .channels
            .list_channels()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        self.run_for_channels(&channels, now).await
    }

    /// Run over `channel_ids`. Channels whose pruned graph is empty are
    /// skipped and produce no snapshot.
    pub async fn run_for_channels(
        &self,
        channel_ids: &[ChannelId],
        now: DateTime<Utc>,
    ) -> FlowResult<Vec<LongestBuildPath>> {
        let default_channels = self.channels.list_default_channels().await?;
        let subscriptions = self.subscriptions.list_subscriptions().await?;
        let build_times = self.builds.list_build_times().await?;

        let mut written = Vec::new();
        for &channel_id in channel_ids {
            let mut graph =
                DependencyFlowGraph::build(&default_channels, &subscriptions, &build_times, &self.options);
            graph.prune(
                |node| is_interesting_node(channel_id, node),
                |edge| self.options.is_interesting_edge(edge),
            );
            if graph.is_empty() {
                debug!(channel_id, "no repositories publish to channel, skipping");
                continue;
            }

            graph.mark_back_edges();
            graph.calculate_longest_build_paths();
            let Some(summary) = graph.mark_longest_build_path() else {
                continue;
            };

            let path = LongestBuildPath {
                channel_id,
                best_case_minutes: summary.best_case_minutes,
                worst_case_minutes: summary.worst_case_minutes,
                contributing_repositories: summary.contributing_repositories(),
                report_date: now,
            };
            self.paths.add_longest_build_path(path.clone()).await?;
            obs::emit_longest_path(
                channel_id,
                path.best_case_minutes,
                path.worst_case_minutes,
                &path.contributing_repositories,
            );
            written.push(path);
        }

        info!(channels = channel_ids.len(), written = written.len(), "longest build path job finished");
        Ok(written)
    }

    /// [`check_product_dependency_cycles`] over the current stores.
    pub async fn product_dependency_cycles(&self) -> FlowResult<HealthResult> {
        let default_channels = self.channels.list_default_channels().await?;
        let subscriptions = self.subscriptions.list_subscriptions().await?;
        Ok(check_product_dependency_cycles(
            &default_channels,
            &subscriptions,
            &self.options,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use maestro_state::fakes::MemoryBarStore;
    use maestro_state::{BuildTime, Channel};

    const RUNTIME: &str = "https://github.com/dotnet/runtime";
    const SDK: &str = "https://github.com/dotnet/sdk";
    const ARCADE: &str = "https://github.com/dotnet/arcade";

    fn default_channel(repository: &str, channel_id: ChannelId) -> DefaultChannel {
        DefaultChannel {
            repository: repository.into(),
            branch: "main".into(),
            channel_id,
        }
    }

    async fn seeded() -> Arc<MemoryBarStore> {
        let bar = Arc::new(MemoryBarStore::new());
        for id in [1, 2] {
            bar.add_channel(Channel {
                id,
                name: format!("channel {id}"),
                classification: "product".into(),
            })
            .await
            .unwrap();
        }
        for repo in [RUNTIME, SDK, ARCADE] {
            bar.add_default_channel(default_channel(repo, 1)).await.unwrap();
        }
        bar.upsert_subscription(Subscription::new(1, RUNTIME, SDK, "main"))
            .await
            .unwrap();
        bar.upsert_subscription(Subscription::new(1, ARCADE, RUNTIME, "main"))
            .await
            .unwrap();
        for (repo, minutes) in [(RUNTIME, 120.0), (SDK, 60.0), (ARCADE, 30.0)] {
            bar.set_build_time(BuildTime {
                repository: repo.into(),
                branch: "main".into(),
                official_build_minutes: minutes,
                pr_build_minutes: minutes / 2.0,
            })
            .await
            .unwrap();
        }
        bar
    }

    fn job(bar: &Arc<MemoryBarStore>) -> LongestBuildPathJob {
        LongestBuildPathJob::new(
            bar.clone(),
            bar.clone(),
            bar.clone(),
            bar.clone(),
            GraphBuildOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_longest_path_is_persisted_per_channel() {
        let bar = seeded().await;
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let written = job(&bar).run(now).await.unwrap();

        // Channel 2 has no publishers and is skipped.
        assert_eq!(written.len(), 1);
        let latest = bar.latest_longest_build_path(1).await.unwrap().unwrap();
        assert_eq!(latest.worst_case_minutes, 210.0);
        assert_eq!(
            latest.contributing_repositories,
            format!("{ARCADE}@main;{RUNTIME}@main;{SDK}@main")
        );
        assert_eq!(latest.report_date, now);
        assert!(bar.latest_longest_build_path(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycle_health_ignores_toolset_edges() {
        let bar = seeded().await;
        // SDK flows back into arcade: a cycle only through the toolset.
        bar.upsert_subscription(Subscription::new(1, SDK, ARCADE, "main"))
            .await
            .unwrap();
        assert!(job(&bar).product_dependency_cycles().await.unwrap().passed());

        // SDK flowing back into runtime is a product cycle.
        bar.upsert_subscription(Subscription::new(1, SDK, RUNTIME, "main"))
            .await
            .unwrap();
        match job(&bar).product_dependency_cycles().await.unwrap() {
            HealthResult::Failed { cycles } => {
                assert_eq!(cycles.len(), 1);
                assert!(cycles[0].iter().any(|r| r.contains("runtime")));
            }
            HealthResult::Passed => panic!("expected a product cycle"),
        }
    }
}

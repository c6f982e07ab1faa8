//! maestrod - Maestro dependency flow daemon
//!
//! Hosts the work item worker pool, the scheduled subscription sweeps and
//! the periodic graph jobs (longest build path snapshots, product
//! dependency cycle health) until Ctrl-C.

mod config;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use maestro_core::telemetry::init_tracing;
use maestro_core::{
    ActorScopeManager, FlowServices, HealthResult, LongestBuildPathJob, MemoryWorkItemQueue,
    RetryPolicy, SubscriptionTriggerer, TriggerSchedule, WorkItemDispatcher, WorkerPool, METRICS,
};
use maestro_state::SurrealBarStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::remote::UnconfiguredRemote;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json, config.log_level);

    let store = Arc::new(
        SurrealBarStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open store at {}", config.database_url))?,
    );
    let queue = Arc::new(MemoryWorkItemQueue::new());
    warn!("no git provider configured; remote-bound work items will be discarded");

    let services = FlowServices::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(UnconfiguredRemote),
        queue.clone(),
    );
    let dispatcher = Arc::new(WorkItemDispatcher::new(
        services,
        Arc::new(ActorScopeManager::new()),
        RetryPolicy::default(),
    ));
    let pool = WorkerPool::new(dispatcher, config.worker_pool_options());

    let triggerer = SubscriptionTriggerer::new(store.clone(), store.clone(), queue)
        .with_repositories_without_asset_locations(config.repos_without_asset_locations.clone());

    let job = LongestBuildPathJob::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store,
        config.graph_options(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(err) => error!(error = %err, "failed to listen for Ctrl-C, shutting down"),
            }
            cancel.cancel();
        }
    });

    info!(
        workers = pool.options().workers,
        database = %config.database_url,
        "maestrod started"
    );

    let graph_jobs = run_graph_jobs(&job, config.graph_job_interval(), &cancel);
    let sweeps = run_subscription_sweeps(&triggerer, config.trigger_poll_interval(), &cancel);
    tokio::join!(pool.run(cancel.clone()), graph_jobs, sweeps);

    METRICS.flush();
    info!("maestrod stopped");
    Ok(())
}

/// Run the graph jobs every `interval` until cancelled.
async fn run_graph_jobs(
    job: &LongestBuildPathJob,
    interval: Option<Duration>,
    cancel: &CancellationToken,
) {
    let Some(interval) = interval else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        run_graph_jobs_once(job).await;
    }
}

/// Check every `poll` whether a scheduled subscription sweep is due and run it.
async fn run_subscription_sweeps(
    triggerer: &SubscriptionTriggerer,
    poll: Option<Duration>,
    cancel: &CancellationToken,
) {
    let Some(poll) = poll else {
        return;
    };
    let mut schedule = TriggerSchedule::starting_at(chrono::Utc::now());
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for frequency in schedule.due(chrono::Utc::now()) {
            match triggerer.trigger(frequency).await {
                Ok(count) => info!(frequency = %frequency, count, "subscription sweep finished"),
                Err(err) => error!(frequency = %frequency, error = %err, "subscription sweep failed"),
            }
        }
    }
}

async fn run_graph_jobs_once(job: &LongestBuildPathJob) {
    match job.run(chrono::Utc::now()).await {
        Ok(paths) => info!(channels = paths.len(), "longest build paths updated"),
        Err(err) => error!(error = %err, "longest build path job failed"),
    }
    match job.product_dependency_cycles().await {
        Ok(HealthResult::Passed) => info!("no product dependency cycles"),
        Ok(HealthResult::Failed { cycles }) => {
            warn!(cycles = cycles.len(), "product dependency cycles detected")
        }
        Err(err) => error!(error = %err, "dependency cycle check failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::GraphBuildOptions;
    use maestro_state::fakes::MemoryBarStore;

    #[tokio::test(start_paused = true)]
    async fn test_graph_jobs_stop_on_cancel() {
        let bar = Arc::new(MemoryBarStore::new());
        let job = LongestBuildPathJob::new(
            bar.clone(),
            bar.clone(),
            bar.clone(),
            bar,
            GraphBuildOptions::default(),
        );
        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            }
        };
        tokio::join!(
            run_graph_jobs(&job, Some(Duration::from_secs(1)), &cancel),
            stopper
        );
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_sweeps_stop_on_cancel() {
        let bar = Arc::new(MemoryBarStore::new());
        let triggerer =
            SubscriptionTriggerer::new(bar.clone(), bar, Arc::new(MemoryWorkItemQueue::new()));
        let cancel = CancellationToken::new();
        let stopper = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(300)).await;
                cancel.cancel();
            }
        };
        tokio::join!(
            run_subscription_sweeps(&triggerer, Some(Duration::from_secs(60)), &cancel),
            stopper
        );
        assert!(cancel.is_cancelled());
        run_subscription_sweeps(&triggerer, None, &CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_disabled_graph_jobs_return_immediately() {
        let bar = Arc::new(MemoryBarStore::new());
        let job = LongestBuildPathJob::new(
            bar.clone(),
            bar.clone(),
            bar.clone(),
            bar,
            GraphBuildOptions::default(),
        );
        run_graph_jobs(&job, None, &CancellationToken::new()).await;
    }
}

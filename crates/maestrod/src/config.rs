//! Command-line and environment configuration.

use std::time::Duration;

use clap::Parser;
use maestro_core::{GraphBuildOptions, WorkerPoolOptions};
use tracing::Level;

#[derive(Parser, Debug, Clone)]
#[command(name = "maestrod")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Maestro dependency flow daemon", long_about = None)]
pub struct Config {
    /// Worker count (default: available parallelism)
    #[arg(long, env = "MAESTRO_WORKERS")]
    pub workers: Option<usize>,

    /// Pause after finding the queue empty, in milliseconds
    #[arg(long = "queue-poll-ms", env = "MAESTRO_QUEUE_EMPTY_DELAY_MS", default_value_t = 5000)]
    pub queue_empty_delay_ms: u64,

    /// How long a received message stays invisible to other workers
    #[arg(long, env = "MAESTRO_VISIBILITY_TIMEOUT_SECS", default_value_t = 60)]
    pub visibility_timeout_secs: u64,

    /// Deliveries before a message is dead-lettered
    #[arg(long = "max-retries", env = "MAESTRO_MAX_WORK_ITEM_RETRIES", default_value_t = 5)]
    pub max_work_item_retries: u32,

    /// Interval between longest build path and cycle health runs, in seconds (0 disables)
    #[arg(long, env = "MAESTRO_GRAPH_JOB_INTERVAL_SECS", default_value_t = 3600)]
    pub graph_job_interval_secs: u64,

    /// How often the scheduled subscription sweeps check whether they are due, in seconds (0 disables)
    #[arg(long, env = "MAESTRO_TRIGGER_POLL_SECS", default_value_t = 60)]
    pub trigger_poll_secs: u64,

    /// Repositories whose builds flow even without published asset locations
    #[arg(long = "allow-without-asset-locations", env = "MAESTRO_REPOS_WITHOUT_ASSET_LOCATIONS", value_delimiter = ',')]
    pub repos_without_asset_locations: Vec<String>,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "MAESTRO_LOG_JSON")]
    pub log_json: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "MAESTRO_LOG_LEVEL", default_value = "info")]
    pub log_level: Level,

    /// SurrealDB endpoint: mem://, surrealkv://path or ws://host
    #[arg(long, env = "SURREALDB_URL", default_value = "mem://")]
    pub database_url: String,
}

impl Config {
    pub fn worker_pool_options(&self) -> WorkerPoolOptions {
        let defaults = WorkerPoolOptions::default();
        WorkerPoolOptions {
            workers: self.workers.unwrap_or(defaults.workers).max(1),
            queue_empty_delay: Duration::from_millis(self.queue_empty_delay_ms),
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            max_work_item_retries: self.max_work_item_retries,
        }
    }

    pub fn graph_job_interval(&self) -> Option<Duration> {
        (self.graph_job_interval_secs > 0).then(|| Duration::from_secs(self.graph_job_interval_secs))
    }

    pub fn trigger_poll_interval(&self) -> Option<Duration> {
        (self.trigger_poll_secs > 0).then(|| Duration::from_secs(self.trigger_poll_secs))
    }

    pub fn graph_options(&self) -> GraphBuildOptions {
        GraphBuildOptions::default()
    }
}

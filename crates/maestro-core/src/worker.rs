//! Worker pool consuming the work item queue.
//!
//! Each worker takes one message at a time: receive, dispatch, delete on
//! success. Failed messages are left invisible until their visibility timeout
//! runs out and are redelivered; a message delivered more than
//! `max_work_item_retries` times, or one that cannot be parsed, is deleted
//! and logged as dead-lettered. While a handler runs its message's visibility
//! is renewed every half visibility timeout, so slow handlers (lease waits,
//! call-site backoff) are not redelivered to a second worker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::dispatch::{DispatchOutcome, WorkItemDispatcher};
use crate::error::{FlowError, FlowResult};
use crate::metrics::METRICS;
use crate::obs::{self, WorkItemSpan};
use crate::queue::{QueueMessage, WorkItemQueue};
use crate::work_item::WorkItem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolOptions {
    pub workers: usize,
    /// Pause after finding the queue empty.
    pub queue_empty_delay: Duration,
    pub visibility_timeout: Duration,
    pub max_work_item_retries: u32,
}

impl Default for WorkerPoolOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            queue_empty_delay: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(60),
            max_work_item_retries: 5,
        }
    }
}

/// What one worker iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStep {
    Idle,
    Processed(DispatchOutcome),
    DeadLettered { reason: String },
    /// Handling failed; the message comes back after its visibility timeout.
    LeftForRedelivery,
    Cancelled,
}

#[derive(Clone)]
pub struct WorkerPool {
    dispatcher: Arc<WorkItemDispatcher>,
    queue: Arc<dyn WorkItemQueue>,
    options: WorkerPoolOptions,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<WorkItemDispatcher>, options: WorkerPoolOptions) -> Self {
        let queue = dispatcher.services().queue.clone();
        Self {
            dispatcher,
            queue,
            options,
        }
    }

    pub fn options(&self) -> &WorkerPoolOptions {
        &self.options
    }

    /// Run `options.workers` loops until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let workers = self.options.workers.max(1);
        info!(workers, "worker pool starting");

        let handles = (0..workers).map(|worker| {
            let pool = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run_worker(worker, cancel).await })
        });
        for result in join_all(handles).await {
            if let Err(err) = result {
                error!(error = %err, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        debug!(worker, "worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.step(&cancel).await {
                Ok(WorkerStep::Cancelled) => break,
                Ok(WorkerStep::Idle) => {
                    if !self.pause(&cancel).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(worker, error = %err, "queue operation failed");
                    if !self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Sleep for the queue-empty delay. Returns false if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.options.queue_empty_delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Receive and handle at most one message.
    pub async fn step(&self, cancel: &CancellationToken) -> FlowResult<WorkerStep> {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(WorkerStep::Cancelled),
            received = self.queue.receive(self.options.visibility_timeout) => received?,
        };
        let Some(message) = received else {
            return Ok(WorkerStep::Idle);
        };

        if message.dequeue_count > self.options.max_work_item_retries {
            let reason = format!("delivered {} times", message.dequeue_count);
            return self.dead_letter(&message, reason).await;
        }

        let item = match WorkItem::from_json(&message.body) {
            Ok(item) => item,
            Err(err) => return self.dead_letter(&message, format!("unreadable work item: {err}")).await,
        };

        let id = item.id.to_string();
        let span = WorkItemSpan::span(&id, item.type_name());
        let handling = self
            .dispatcher
            .process_work_item(&item, cancel)
            .instrument(span);
        let result = self.renewing_visibility(&message, handling).await;

        match result {
            Ok(outcome) => {
                self.queue.delete(message.id, &message.pop_receipt).await?;
                METRICS.inc_work_items_processed();
                if matches!(outcome, DispatchOutcome::DeadLettered { .. }) {
                    METRICS.inc_work_items_dead_lettered();
                }
                obs::emit_work_item_completed(&id, item.type_name(), outcome.name());
                Ok(WorkerStep::Processed(outcome))
            }
            Err(FlowError::Cancelled) => Ok(WorkerStep::Cancelled),
            Err(err) => {
                METRICS.inc_work_items_failed();
                warn!(
                    work_item_id = %id,
                    work_item_type = item.type_name(),
                    dequeue_count = message.dequeue_count,
                    error = %err,
                    "work item failed, leaving it for redelivery"
                );
                Ok(WorkerStep::LeftForRedelivery)
            }
        }
    }

    /// Drive `work` to completion, renewing the visibility of `message`.
    async fn renewing_visibility<T>(&self, message: &QueueMessage, work: impl Future<Output = T>) -> T {
        tokio::pin!(work);
        let timeout = self.options.visibility_timeout;
        let period = (timeout / 2).max(Duration::from_secs(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut renewing = true;
        loop {
            tokio::select! {
                biased;
                out = &mut work => return out,
                _ = renew.tick(), if renewing => {
                    if let Err(err) = self
                        .queue
                        .renew_visibility(message.id, &message.pop_receipt, timeout)
                        .await
                    {
                        warn!(message_id = %message.id, error = %err, "failed to renew message visibility");
                        renewing = false;
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: String) -> FlowResult<WorkerStep> {
        self.queue.delete(message.id, &message.pop_receipt).await?;
        METRICS.inc_work_items_dead_lettered();
        obs::emit_work_item_dead_lettered(&message.id.to_string(), message.dequeue_count, &reason);
        Ok(WorkerStep::DeadLettered { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use maestro_state::fakes::{MemoryActorStateStore, MemoryBarStore};
    use maestro_state::{Asset, Build, BuildSource, BuildStore};

    use crate::queue::MemoryWorkItemQueue;
    use crate::remote::fakes::FakeRemote;
    use crate::retry::RetryPolicy;
    use crate::scope::ActorScopeManager;
    use crate::updater::FlowServices;

    struct Harness {
        bar: Arc<MemoryBarStore>,
        remote: Arc<FakeRemote>,
        queue: Arc<MemoryWorkItemQueue>,
        scopes: Arc<ActorScopeManager>,
        pool: WorkerPool,
    }

    fn harness(max_work_item_retries: u32) -> Harness {
        let bar = Arc::new(MemoryBarStore::new());
        let remote = Arc::new(FakeRemote::new());
        let queue = Arc::new(MemoryWorkItemQueue::new());
        let services = FlowServices::new(
            bar.clone(),
            bar.clone(),
            Arc::new(MemoryActorStateStore::new()),
            remote.clone(),
            queue.clone(),
        );
        let scopes = Arc::new(ActorScopeManager::new());
        let dispatcher = Arc::new(WorkItemDispatcher::new(
            services,
            scopes.clone(),
            RetryPolicy::default(),
        ));
        let pool = WorkerPool::new(
            dispatcher,
            WorkerPoolOptions {
                workers: 2,
                queue_empty_delay: Duration::from_millis(10),
                visibility_timeout: Duration::from_secs(60),
                max_work_item_retries,
            },
        );
        Harness {
            bar,
            remote,
            queue,
            scopes,
            pool,
        }
    }

    async fn add_build(bar: &MemoryBarStore, id: i64) {
        bar.add_build(Build {
            id,
            commit: format!("sha{id}"),
            source: BuildSource::GitHub {
                repository: "https://github.com/dotnet/runtime".into(),
                branch: "main".into(),
            },
            assets: vec![Asset::new("Foo", "1.0.0")],
            dependencies: vec![],
            released: false,
            date_produced: chrono::Utc::now(),
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_is_idle() {
        let h = harness(5);
        let step = h.pool.step(&CancellationToken::new()).await.unwrap();
        assert_eq!(step, WorkerStep::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_item_is_deleted() {
        let h = harness(5);
        add_build(&h.bar, 3).await;
        h.queue
            .produce(&WorkItem::build_coherency_info(3), Duration::ZERO)
            .await
            .unwrap();

        let step = h.pool.step(&CancellationToken::new()).await.unwrap();
        assert!(matches!(step, WorkerStep::Processed(DispatchOutcome::Completed { .. })));
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_message_is_dead_lettered() {
        let h = harness(5);
        h.queue.produce_raw("{\"type\":\"Nope\"}");
        let step = h.pool.step(&CancellationToken::new()).await.unwrap();
        assert!(matches!(step, WorkerStep::DeadLettered { .. }));
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_is_redelivered_then_dead_lettered() {
        let h = harness(1);
        add_build(&h.bar, 4).await;
        h.remote
            .fail_next("get_dependencies", FlowError::transient("get_dependencies", "503"));
        h.queue
            .produce(&WorkItem::build_coherency_info(4), Duration::ZERO)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(h.pool.step(&cancel).await.unwrap(), WorkerStep::LeftForRedelivery);
        // Still invisible.
        assert_eq!(h.pool.step(&cancel).await.unwrap(), WorkerStep::Idle);

        tokio::time::advance(Duration::from_secs(61)).await;
        let step = h.pool.step(&cancel).await.unwrap();
        assert!(matches!(step, WorkerStep::DeadLettered { .. }));
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_drains_queue_and_stops_on_cancel() {
        let h = harness(5);
        for id in 10..14 {
            add_build(&h.bar, id).await;
            h.queue
                .produce(&WorkItem::build_coherency_info(id), Duration::ZERO)
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let pool = h.pool.clone();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { pool.run(cancel).await }
        });

        for _ in 0..100 {
            if h.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.queue.is_empty());

        cancel.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_keeps_its_message_invisible() {
        let h = harness(5);
        let actor = crate::updater::ActorId::Subscription {
            subscription_id: uuid::Uuid::nil(),
        };
        let lease = h.scopes.acquire(&actor.key()).await;
        h.queue
            .produce(
                &WorkItem::reminder(actor, crate::work_item::ReminderKind::PullRequestCheck),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let other_worker = async {
            // Well past the 60s visibility timeout.
            tokio::time::sleep(Duration::from_secs(140)).await;
            let redelivered = h.queue.receive(Duration::from_secs(60)).await.unwrap();
            drop(lease);
            redelivered
        };
        let (step, redelivered) = tokio::join!(h.pool.step(&cancel), other_worker);

        assert!(redelivered.is_none(), "message was handed to a second worker");
        assert!(matches!(
            step.unwrap(),
            WorkerStep::Processed(DispatchOutcome::Completed { .. })
        ));
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_step_keeps_message() {
        let h = harness(5);
        add_build(&h.bar, 5).await;
        h.queue
            .produce(&WorkItem::build_coherency_info(5), Duration::ZERO)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(h.pool.step(&cancel).await.unwrap(), WorkerStep::Cancelled);
        assert_eq!(h.queue.len(), 1);
    }
}

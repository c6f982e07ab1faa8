//! Queue-driven runs: worker pool, dispatcher and updater together.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use maestro_core::remote::fakes::FakeRemote;
use maestro_core::remote::{CheckState, PrStatus, PullRequestCheck};
use maestro_core::{
    ActorScopeManager, DependencyDetail, DispatchOutcome, FlowError, FlowServices,
    MemoryWorkItemQueue, PullRequestUpdaterOptions, RetryPolicy, WorkItem, WorkItemDispatcher,
    WorkItemKind, WorkItemQueue, WorkerPool, WorkerPoolOptions, WorkerStep,
};
use maestro_state::fakes::{MemoryActorStateStore, MemoryBarStore};
use maestro_state::{
    Asset, Build, BuildSource, BuildStore, MergePolicyDefinition, Subscription, SubscriptionStore,
};
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "https://github.com/dotnet/runtime";
const TARGET: &str = "https://github.com/dotnet/sdk";

struct Pipeline {
    bar: Arc<MemoryBarStore>,
    remote: Arc<FakeRemote>,
    queue: Arc<MemoryWorkItemQueue>,
    pool: WorkerPool,
    subscription: Subscription,
}

async fn pipeline() -> Pipeline {
    let bar = Arc::new(MemoryBarStore::new());
    let remote = Arc::new(FakeRemote::new());
    let queue = Arc::new(MemoryWorkItemQueue::new());

    let services = FlowServices::new(
        bar.clone(),
        bar.clone(),
        Arc::new(MemoryActorStateStore::new()),
        remote.clone(),
        queue.clone(),
    )
    .with_options(PullRequestUpdaterOptions {
        remote_retry: RetryPolicy::none(),
        ..PullRequestUpdaterOptions::default()
    });
    let dispatcher = Arc::new(WorkItemDispatcher::new(
        services,
        Arc::new(ActorScopeManager::new()),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        },
    ));
    let pool = WorkerPool::new(
        dispatcher,
        WorkerPoolOptions {
            workers: 1,
            queue_empty_delay: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(60),
            max_work_item_retries: 5,
        },
    );

    remote.set_latest_commit(TARGET, "main", "base1");
    remote.set_dependencies(
        TARGET,
        "base1",
        vec![DependencyDetail::new("Foo", "0.9.0", SOURCE, "old")],
    );

    let mut subscription = Subscription::new(1, SOURCE, TARGET, "main");
    subscription.policy.merge_policies = vec![MergePolicyDefinition::named("AllChecksSuccessful")];
    bar.upsert_subscription(subscription.clone()).await.unwrap();
    bar.add_build(Build {
        id: 1,
        commit: "src1".into(),
        source: BuildSource::GitHub {
            repository: SOURCE.into(),
            branch: "main".into(),
        },
        assets: vec![Asset::new("Foo", "1.0.0")],
        dependencies: vec![],
        released: false,
        date_produced: Utc::now(),
    })
    .await
    .unwrap();

    Pipeline {
        bar,
        remote,
        queue,
        pool,
        subscription,
    }
}

fn completed(step: WorkerStep) -> String {
    match step {
        WorkerStep::Processed(DispatchOutcome::Completed { detail }) => detail,
        other => panic!("expected a completed work item, got {other:?}"),
    }
}

// ---- happy path ----

#[tokio::test(start_paused = true)]
async fn build_to_merge_through_the_queue() {
    let p = pipeline().await;
    let cancel = CancellationToken::new();
    p.queue
        .produce(&WorkItem::update_subscription(p.subscription.id, 1), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(completed(p.pool.step(&cancel).await.unwrap()), "created");
    let url = p.remote.pull_requests()[0].url.clone();

    // The check reminder is not visible before the reminder delay.
    assert_eq!(p.pool.step(&cancel).await.unwrap(), WorkerStep::Idle);
    p.remote
        .set_checks(&url, vec![PullRequestCheck::new("build", CheckState::Success)]);
    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

    assert_eq!(completed(p.pool.step(&cancel).await.unwrap()), "merged");
    assert_eq!(p.remote.pull_request(&url).unwrap().status, PrStatus::Merged);
    assert_eq!(
        p.bar
            .get_subscription(p.subscription.id)
            .await
            .unwrap()
            .last_applied_build,
        Some(1)
    );
    assert!(p.queue.is_empty());
}

// ---- failures ----

#[tokio::test(start_paused = true)]
async fn transient_failure_is_replayed_as_retry_item() {
    let p = pipeline().await;
    let cancel = CancellationToken::new();
    p.remote
        .fail_next("get_latest_commit", FlowError::transient("get_latest_commit", "503"));
    p.queue
        .produce(&WorkItem::update_subscription(p.subscription.id, 1), Duration::ZERO)
        .await
        .unwrap();

    let step = p.pool.step(&cancel).await.unwrap();
    assert_eq!(
        step,
        WorkerStep::Processed(DispatchOutcome::RetryScheduled { attempt: 2 })
    );
    let queued = p.queue.snapshot();
    assert_eq!(queued.len(), 1);
    match &queued[0].kind {
        WorkItemKind::SubscriptionRetry(retry) => {
            assert_eq!(retry.subscription_id, p.subscription.id);
            assert_eq!(retry.attempt, 2);
        }
        other => panic!("expected a subscription retry, got {other:?}"),
    }

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(completed(p.pool.step(&cancel).await.unwrap()), "created");
    assert_eq!(p.remote.pull_requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_build_is_discarded() {
    let p = pipeline().await;
    p.queue
        .produce(&WorkItem::update_subscription(p.subscription.id, 99), Duration::ZERO)
        .await
        .unwrap();

    let step = p.pool.step(&CancellationToken::new()).await.unwrap();
    assert!(matches!(
        step,
        WorkerStep::Processed(DispatchOutcome::Discarded { .. })
    ));
    assert!(p.queue.is_empty());
    assert!(p.remote.pull_requests().is_empty());
}

//! Work item dispatch.
//!
//! [`WorkItemDispatcher::process_work_item`] routes an item on its `type`
//! tag, takes the actor lease, runs the updater method and turns failures
//! into an outcome:
//!
//! | failure                         | outcome                                  |
//! |---------------------------------|------------------------------------------|
//! | transient                       | retry work item, or dead letter          |
//! | decisive, configuration, 404    | discarded with an error log              |
//! | invariant                       | `Err`, the message is redelivered        |
//! | cancelled                       | `Err(Cancelled)`, the message is kept    |

use std::sync::Arc;

use maestro_state::{BuildIncoherence, SubscriptionId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::coherency::CoherencyResolver;
use crate::error::{FlowError, FlowResult};
use crate::obs;
use crate::retry::RetryPolicy;
use crate::scope::ActorScopeManager;
use crate::updater::{ActorId, FlowServices, PullRequestUpdater, UpdateAssetsParameters};
use crate::work_item::{
    ActorMethod, PullRequestRetryWorkItem, ReminderKind, SubscriptionRetryWorkItem, WorkItem,
    WorkItemKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed { detail: String },
    /// Nothing to do, e.g. a disabled subscription.
    Skipped { reason: String },
    RetryScheduled { attempt: u32 },
    Discarded { reason: String },
    DeadLettered { reason: String },
}

impl DispatchOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchOutcome::Completed { .. } => "completed",
            DispatchOutcome::Skipped { .. } => "skipped",
            DispatchOutcome::RetryScheduled { .. } => "retry_scheduled",
            DispatchOutcome::Discarded { .. } => "discarded",
            DispatchOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// A resolved updater invocation.
#[derive(Debug, Clone)]
struct ActorCall {
    actor: ActorId,
    method: ActorMethod,
    arguments: serde_json::Value,
    /// Attempts made so far, counting the one about to run.
    attempt: u32,
    /// Set when the trigger came from a subscription rather than an actor;
    /// its retries are subscription retries.
    subscription_id: Option<SubscriptionId>,
}

enum Route {
    Actor(ActorCall),
    BuildCoherency(i64),
    Skip(String),
}

pub struct WorkItemDispatcher {
    services: FlowServices,
    scopes: Arc<ActorScopeManager>,
    retry: RetryPolicy,
}

impl WorkItemDispatcher {
    pub fn new(services: FlowServices, scopes: Arc<ActorScopeManager>, retry: RetryPolicy) -> Self {
        Self {
            services,
            scopes,
            retry,
        }
    }

    pub fn services(&self) -> &FlowServices {
        &self.services
    }

    pub async fn process_work_item(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> FlowResult<DispatchOutcome> {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }

        let route = match self.route(item).await {
            Ok(route) => route,
            Err(err) => return classify(item, err),
        };

        match route {
            Route::Skip(reason) => {
                info!(work_item_id = %item.id, reason = %reason, "work item skipped");
                Ok(DispatchOutcome::Skipped { reason })
            }
            Route::BuildCoherency(build_id) => {
                let result = tokio::select! {
                    result = self.record_build_coherency(build_id) => result,
                    _ = cancel.cancelled() => Err(FlowError::Cancelled),
                };
                match result {
                    Ok(count) => Ok(DispatchOutcome::Completed {
                        detail: format!("{count} incoherencies"),
                    }),
                    Err(err) => classify(item, err),
                }
            }
            Route::Actor(call) => {
                let actor_key = call.actor.key();
                let _lease = tokio::select! {
                    lease = self.scopes.acquire(&actor_key) => lease,
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                };
                let result = tokio::select! {
                    result = self.invoke(&call) => result,
                    _ = cancel.cancelled() => Err(FlowError::Cancelled),
                };
                match result {
                    Ok(detail) => Ok(DispatchOutcome::Completed { detail }),
                    Err(err) if err.is_transient() => self.schedule_retry(item, &call, &err).await,
                    Err(err) => classify(item, err),
                }
            }
        }
    }

    async fn route(&self, item: &WorkItem) -> FlowResult<Route> {
        match &item.kind {
            WorkItemKind::UpdateSubscription(w) => {
                self.subscription_update(w.subscription_id, w.build_id, false).await
            }
            WorkItemKind::CodeFlow(w) => {
                self.subscription_update(w.subscription_id, w.build_id, true).await
            }
            WorkItemKind::PullRequestReminder(w) => Ok(Route::Actor(ActorCall {
                actor: w.actor_id.clone(),
                method: match w.reminder {
                    ReminderKind::PullRequestCheck => ActorMethod::CheckPullRequest,
                    ReminderKind::PullRequestUpdate => ActorMethod::ProcessPendingUpdates,
                },
                arguments: w
                    .pr_url
                    .clone()
                    .map_or(serde_json::Value::Null, serde_json::Value::String),
                attempt: 1,
                subscription_id: None,
            })),
            WorkItemKind::PullRequestRetry(w) => Ok(Route::Actor(ActorCall {
                actor: w.actor_id.clone(),
                method: w.method,
                arguments: w.arguments.clone(),
                attempt: w.attempt,
                subscription_id: None,
            })),
            WorkItemKind::SubscriptionRetry(w) => {
                let subscription = self
                    .services
                    .subscriptions
                    .get_subscription(w.subscription_id)
                    .await?;
                Ok(Route::Actor(ActorCall {
                    actor: ActorId::for_subscription(&subscription),
                    method: w.method,
                    arguments: w.arguments.clone(),
                    attempt: w.attempt,
                    subscription_id: Some(w.subscription_id),
                }))
            }
            WorkItemKind::BuildCoherencyInfo(w) => Ok(Route::BuildCoherency(w.build_id)),
        }
    }

    async fn subscription_update(
        &self,
        subscription_id: SubscriptionId,
        build_id: i64,
        code_flow: bool,
    ) -> FlowResult<Route> {
        let subscription = self
            .services
            .subscriptions
            .get_subscription(subscription_id)
            .await?;
        if code_flow && !subscription.is_code_flow() {
            return Err(FlowError::configuration(
                "source_directory",
                format!("subscription {subscription_id} is not a code flow subscription"),
            ));
        }
        if !subscription.enabled {
            return Ok(Route::Skip(format!("subscription {subscription_id} is disabled")));
        }

        let build = self.services.builds.get_build(build_id).await?;
        let parameters = UpdateAssetsParameters {
            subscription_id,
            build_id,
            source_repository: build.repository().to_string(),
            source_sha: build.commit.clone(),
            assets: build.assets.clone(),
            is_coherency_update: false,
        };
        Ok(Route::Actor(ActorCall {
            actor: ActorId::for_subscription(&subscription),
            method: ActorMethod::UpdateAssets,
            arguments: serde_json::to_value(&parameters)?,
            attempt: 1,
            subscription_id: Some(subscription_id),
        }))
    }

    async fn invoke(&self, call: &ActorCall) -> FlowResult<String> {
        debug!(actor = %call.actor, method = call.method.as_str(), attempt = call.attempt, "invoking updater");
        let updater = PullRequestUpdater::new(call.actor.clone(), self.services.clone());
        match call.method {
            ActorMethod::UpdateAssets => {
                let parameters: UpdateAssetsParameters = serde_json::from_value(call.arguments.clone())?;
                Ok(updater.update_assets(parameters).await?.name().to_string())
            }
            ActorMethod::ProcessPendingUpdates => {
                Ok(updater.process_pending_updates().await?.name().to_string())
            }
            // A check armed for one pull request carries its URL.
            ActorMethod::CheckPullRequest => {
                let outcome = match call.arguments.as_str() {
                    Some(pr_url) => updater.check_pull_request_for(pr_url).await?,
                    None => updater.check_pull_request().await?,
                };
                Ok(outcome.name().to_string())
            }
        }
    }

    async fn schedule_retry(
        &self,
        item: &WorkItem,
        call: &ActorCall,
        err: &FlowError,
    ) -> FlowResult<DispatchOutcome> {
        if !self.retry.allows_another(call.attempt) {
            obs::emit_work_item_dead_lettered(&item.id.to_string(), call.attempt, err);
            return Ok(DispatchOutcome::DeadLettered {
                reason: err.to_string(),
            });
        }

        let attempt = call.attempt + 1;
        let kind = match call.subscription_id {
            Some(subscription_id) => WorkItemKind::SubscriptionRetry(SubscriptionRetryWorkItem {
                subscription_id,
                method: call.method,
                arguments: call.arguments.clone(),
                attempt,
            }),
            None => WorkItemKind::PullRequestRetry(PullRequestRetryWorkItem {
                actor_id: call.actor.clone(),
                method: call.method,
                arguments: call.arguments.clone(),
                attempt,
            }),
        };
        let retry = WorkItem::new(kind);
        self.services
            .queue
            .produce(&retry, self.retry.delay_for(call.attempt))
            .await?;
        obs::emit_work_item_retry(retry.type_name(), call.method.as_str(), attempt, err);
        Ok(DispatchOutcome::RetryScheduled { attempt })
    }

    /// Store the unresolved coherency conflicts of a build's own manifest.
    async fn record_build_coherency(&self, build_id: i64) -> FlowResult<usize> {
        let build = self.services.builds.get_build(build_id).await?;
        let dependencies = self
            .services
            .remote
            .get_dependencies(build.repository(), &build.commit)
            .await?;
        let outcome = CoherencyResolver::new(self.services.remote.clone())
            .required_coherency_updates(&dependencies, &[])
            .await?;

        let incoherencies: Vec<BuildIncoherence> = outcome
            .errors
            .iter()
            .filter_map(|e| {
                dependencies
                    .iter()
                    .find(|d| d.name.eq_ignore_ascii_case(&e.dependency))
                    .map(|d| BuildIncoherence {
                        name: d.name.clone(),
                        version: d.version.clone(),
                        repository: d.repo_uri.clone(),
                        commit: d.commit.clone(),
                    })
            })
            .collect();
        let count = incoherencies.len();
        self.services
            .builds
            .set_build_incoherencies(build_id, incoherencies)
            .await?;
        Ok(count)
    }
}

/// Outcome for a failure that a retry work item cannot fix.
fn classify(item: &WorkItem, err: FlowError) -> FlowResult<DispatchOutcome> {
    match err {
        FlowError::Cancelled | FlowError::Invariant { .. } => Err(err),
        err if err.is_transient() => Err(err),
        err => {
            error!(
                work_item_id = %item.id,
                work_item_type = item.type_name(),
                error = %err,
                "discarding work item"
            );
            Ok(DispatchOutcome::Discarded {
                reason: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use maestro_state::fakes::{MemoryActorStateStore, MemoryBarStore};
    use maestro_state::{Asset, Build, BuildSource, BuildStore, Subscription, SubscriptionStore};

    use crate::coherency::DependencyDetail;
    use crate::queue::{MemoryWorkItemQueue, WorkItemQueue};
    use crate::remote::fakes::FakeRemote;

    const SOURCE: &str = "https://github.com/dotnet/runtime";
    const TARGET: &str = "https://github.com/dotnet/sdk";

    struct Harness {
        bar: Arc<MemoryBarStore>,
        remote: Arc<FakeRemote>,
        queue: Arc<MemoryWorkItemQueue>,
        dispatcher: WorkItemDispatcher,
    }

    fn harness(retry: RetryPolicy) -> Harness {
        let bar = Arc::new(MemoryBarStore::new());
        let remote = Arc::new(FakeRemote::new());
        let queue = Arc::new(MemoryWorkItemQueue::new());
        let mut options = crate::updater::PullRequestUpdaterOptions::default();
        options.remote_retry = RetryPolicy::none();
        let services = FlowServices::new(
            bar.clone(),
            bar.clone(),
            Arc::new(MemoryActorStateStore::new()),
            remote.clone(),
            queue.clone(),
        )
        .with_options(options);
        let dispatcher = WorkItemDispatcher::new(services, Arc::new(ActorScopeManager::new()), retry);
        Harness {
            bar,
            remote,
            queue,
            dispatcher,
        }
    }

    fn build(id: i64) -> Build {
        Build {
            id,
            commit: format!("src{id}"),
            source: BuildSource::GitHub {
                repository: SOURCE.into(),
                branch: "main".into(),
            },
            assets: vec![Asset::new("Foo", "1.0.0")],
            dependencies: vec![],
            released: false,
            date_produced: chrono::Utc::now(),
        }
    }

    async fn seed(h: &Harness) -> Subscription {
        let sub = Subscription::new(1, SOURCE, TARGET, "main");
        h.bar.upsert_subscription(sub.clone()).await.unwrap();
        h.bar.add_build(build(1)).await.unwrap();
        h.remote.set_latest_commit(TARGET, "main", "base1");
        h.remote.set_dependencies(
            TARGET,
            "base1",
            vec![DependencyDetail::new("Foo", "0.9.0", SOURCE, "old")],
        );
        sub
    }

    #[tokio::test]
    async fn test_update_subscription_opens_pull_request() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let item = WorkItem::update_subscription(sub.id, 1);
        let outcome = h
            .dispatcher
            .process_work_item(&item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                detail: "created".into()
            }
        );
        assert_eq!(h.remote.pull_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_subscription_is_discarded() {
        let h = harness(RetryPolicy::default());
        let item = WorkItem::update_subscription(uuid::Uuid::new_v4(), 1);
        let outcome = h
            .dispatcher
            .process_work_item(&item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.name(), "discarded");
    }

    #[tokio::test]
    async fn test_code_flow_requires_code_flow_subscription() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let outcome = h
            .dispatcher
            .process_work_item(&WorkItem::code_flow(sub.id, 1), &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Discarded { reason } => assert!(reason.contains("code flow")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_schedules_subscription_retry() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        h.remote
            .fail_next("create_pull_request", FlowError::transient("create_pull_request", "503"));

        let outcome = h
            .dispatcher
            .process_work_item(&WorkItem::update_subscription(sub.id, 1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::RetryScheduled { attempt: 2 });

        let queued = h.queue.snapshot();
        assert_eq!(queued.len(), 1);
        match &queued[0].kind {
            WorkItemKind::SubscriptionRetry(retry) => {
                assert_eq!(retry.subscription_id, sub.id);
                assert_eq!(retry.method, ActorMethod::UpdateAssets);
                assert_eq!(retry.attempt, 2);
                let args: UpdateAssetsParameters = serde_json::from_value(retry.arguments.clone()).unwrap();
                assert_eq!(args.build_id, 1);
            }
            other => panic!("unexpected work item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_replays_method_and_succeeds() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let args = serde_json::to_value(UpdateAssetsParameters {
            subscription_id: sub.id,
            build_id: 1,
            source_repository: SOURCE.into(),
            source_sha: "src1".into(),
            assets: vec![Asset::new("Foo", "1.0.0")],
            is_coherency_update: false,
        })
        .unwrap();
        let item = WorkItem::new(WorkItemKind::SubscriptionRetry(SubscriptionRetryWorkItem {
            subscription_id: sub.id,
            method: ActorMethod::UpdateAssets,
            arguments: args,
            attempt: 2,
        }));
        let outcome = h
            .dispatcher
            .process_work_item(&item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.name(), "completed");
        assert_eq!(h.remote.pull_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered() {
        let h = harness(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let sub = seed(&h).await;
        let actor = ActorId::for_subscription(&sub);
        h.remote
            .fail_next("create_or_update_branch", FlowError::transient("create_or_update_branch", "timeout"));
        let args = serde_json::to_value(UpdateAssetsParameters {
            subscription_id: sub.id,
            build_id: 1,
            source_repository: SOURCE.into(),
            source_sha: "src1".into(),
            assets: vec![Asset::new("Foo", "1.0.0")],
            is_coherency_update: false,
        })
        .unwrap();
        let item = WorkItem::new(WorkItemKind::PullRequestRetry(PullRequestRetryWorkItem {
            actor_id: actor,
            method: ActorMethod::UpdateAssets,
            arguments: args,
            attempt: 2,
        }));
        let outcome = h
            .dispatcher
            .process_work_item(&item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.name(), "dead_lettered");
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_is_observed() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .dispatcher
            .process_work_item(&WorkItem::update_subscription(sub.id, 1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Cancelled));
        assert!(h.remote.pull_requests().is_empty());
    }

    #[tokio::test]
    async fn test_reminder_without_pull_request_completes() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let item = WorkItem::reminder(ActorId::for_subscription(&sub), ReminderKind::PullRequestCheck);
        let outcome = h
            .dispatcher
            .process_work_item(&item, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                detail: "no_pull_request".into()
            }
        );
    }

    #[tokio::test]
    async fn test_check_reminder_for_replaced_pull_request_is_stale() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let actor = ActorId::for_subscription(&sub);
        h.dispatcher
            .process_work_item(&WorkItem::update_subscription(sub.id, 1), &CancellationToken::new())
            .await
            .unwrap();
        let queued = h.queue.snapshot();
        assert_eq!(queued.len(), 1);

        let outcome = h
            .dispatcher
            .process_work_item(
                &WorkItem::check_reminder(actor, "https://github.com/dotnet/sdk/pull/999"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                detail: "stale".into()
            }
        );
        // The live chain is left alone.
        assert_eq!(h.queue.snapshot(), queued);
    }

    #[tokio::test]
    async fn test_build_coherency_info_records_incoherencies() {
        let h = harness(RetryPolicy::default());
        h.bar.add_build(build(7)).await.unwrap();
        h.remote.set_dependencies(
            SOURCE,
            "src7",
            vec![
                DependencyDetail::new("Parent", "2.0.0", "https://github.com/dotnet/arcade", "p1"),
                DependencyDetail::new("Child", "1.0.0", TARGET, "c1").with_coherent_parent("Parent"),
            ],
        );
        // The parent's manifest does not list Child.
        h.remote
            .set_dependencies("https://github.com/dotnet/arcade", "p1", vec![]);

        let outcome = h
            .dispatcher
            .process_work_item(&WorkItem::build_coherency_info(7), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.name(), "completed");
        let stored = h.bar.get_build_incoherencies(7).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "Child");
    }

    #[tokio::test]
    async fn test_same_actor_is_serialized() {
        let h = harness(RetryPolicy::default());
        let sub = seed(&h).await;
        let actor = ActorId::for_subscription(&sub);
        let lease = h.dispatcher.scopes.acquire(&actor.key()).await;

        let item = WorkItem::update_subscription(sub.id, 1);
        let cancel = CancellationToken::new();
        let run = h.dispatcher.process_work_item(&item, &cancel);
        tokio::pin!(run);
        let raced = tokio::time::timeout(Duration::from_millis(50), &mut run).await;
        assert!(raced.is_err(), "dispatch must wait for the actor lease");

        drop(lease);
        let outcome = run.await.unwrap();
        assert_eq!(outcome.name(), "completed");
    }
}

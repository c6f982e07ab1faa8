//! Maestro Core Library
//!
//! Dependency flow engine: builds flow from source repositories into their
//! subscribers through dependency update pull requests.
//!
//! - [`flow_graph`]: repository dependency graph, back edges, longest build path
//! - [`merge_policy`]: named merge policies and their evaluation
//! - [`updater`]: per-actor pull request state machine
//! - [`dispatch`] / [`worker`]: work item routing and the queue consumer pool
//! - [`jobs`]: longest build path snapshots and cycle health
//! - [`trigger`]: subscription updates for new builds and scheduled sweeps

pub mod codeflow;
pub mod coherency;
pub mod dispatch;
pub mod error;
pub mod flow_graph;
pub mod jobs;
pub mod merge_policy;
pub mod metrics;
pub mod obs;
pub mod pr_description;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scope;
pub mod telemetry;
pub mod trigger;
pub mod updater;
pub mod validation;
pub mod work_item;
pub mod worker;

pub use error::{FlowError, FlowResult};

pub use codeflow::{CodeFlowResult, VmrBackFlower, VmrForwardFlower};
pub use coherency::{
    required_non_coherency_updates, CoherencyErrorDetails, CoherencyOutcome, CoherencyResolver,
    DependencyDetail, DependencyType, DependencyUpdate,
};
pub use dispatch::{DispatchOutcome, WorkItemDispatcher};
pub use flow_graph::{
    is_interesting_node, DependencyFlowGraph, FlowEdge, FlowNode, GraphBuildOptions, GraphError,
    LongestPathSummary,
};
pub use jobs::{check_product_dependency_cycles, HealthResult, LongestBuildPathJob};
pub use merge_policy::{
    MergePolicy, MergePolicyContext, MergePolicyEvaluationResult, MergePolicyEvaluationResults,
    MergePolicyEvaluationStatus, MergePolicyRegistry, PolicyConfigError,
};
pub use metrics::METRICS;
pub use pr_description::DependencyUpdateSummary;
pub use queue::{MemoryWorkItemQueue, QueueMessage, WorkItemQueue};
pub use remote::RemoteRepository;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scope::{ActorLease, ActorScopeManager};
pub use trigger::{next_fire, SubscriptionTriggerer, TriggerSchedule};
pub use updater::{
    ActorId, CheckOutcome, FlowServices, PullRequestUpdater, PullRequestUpdaterOptions,
    UpdateAssetsParameters, UpdateOutcome, UpdaterState,
};
pub use validation::validate_subscription;
pub use work_item::{ActorMethod, ReminderKind, WorkItem, WorkItemKind};
pub use worker::{WorkerPool, WorkerPoolOptions, WorkerStep};

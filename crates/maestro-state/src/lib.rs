//! Maestro-State: Build Asset Registry storage
//!
//! Persistence for the dependency flow engine: builds and their assets,
//! channels, subscriptions, longest-build-path snapshots, and per-actor
//! pull request state.
//!
//! ## Key Components
//!
//! - [`storage_traits`]: the async traits the engine depends on
//! - [`fakes`]: in-memory implementations for tests
//! - [`SurrealBarStore`]: SurrealDB implementation used by the daemon

mod error;
pub mod fakes;
mod migrations;
pub mod model;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use model::{
    Asset, AssetLocation, Build, BuildId, BuildIncoherence, BuildRef, BuildSource, BuildTime,
    Channel, ChannelId, DefaultChannel, FlowKind, LocationType, LongestBuildPath, MergePolicyDefinition,
    Subscription, SubscriptionId, SubscriptionPolicy, UpdateFrequency,
};
pub use storage_traits::{
    repository_branch_key, ActorStateStore, BuildStore, ChannelStore, LongestBuildPathStore,
    StorageResult, SubscriptionStore,
};
pub use surreal_store::SurrealBarStore;

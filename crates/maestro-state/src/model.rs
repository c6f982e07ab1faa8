//! Build Asset Registry records.
//!
//! These are the persisted entities the dependency flow engine reads:
//! builds and the assets they produced, channels, subscriptions between
//! repositories, and periodic longest-build-path snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type BuildId = i64;
pub type ChannelId = i64;
pub type SubscriptionId = Uuid;

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Where a feed or container location lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    None,
    NugetFeed,
    Container,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLocation {
    pub location: String,
    pub kind: LocationType,
}

/// A versioned artifact produced by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub non_shipping: bool,
    #[serde(default)]
    pub locations: Vec<AssetLocation>,
}

impl Asset {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            non_shipping: false,
            locations: Vec::new(),
        }
    }
}

/// Another build consumed by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRef {
    pub build_id: BuildId,
    pub is_product: bool,
    pub time_to_inclusion_minutes: f64,
}

/// Source address of a build. GitHub and Azure DevOps forms are exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum BuildSource {
    GitHub {
        repository: String,
        branch: String,
    },
    AzureDevOps {
        repository: String,
        branch: String,
    },
}

impl BuildSource {
    pub fn repository(&self) -> &str {
        match self {
            BuildSource::GitHub { repository, .. } | BuildSource::AzureDevOps { repository, .. } => {
                repository
            }
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            BuildSource::GitHub { branch, .. } | BuildSource::AzureDevOps { branch, .. } => branch,
        }
    }
}

/// An immutable record of a completed build. Only `released` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub commit: String,
    pub source: BuildSource,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub dependencies: Vec<BuildRef>,
    #[serde(default)]
    pub released: bool,
    pub date_produced: DateTime<Utc>,
}

impl Build {
    pub fn repository(&self) -> &str {
        self.source.repository()
    }

    pub fn branch(&self) -> &str {
        self.source.branch()
    }

    /// Whether any asset was published somewhere consumers can fetch it.
    /// Build-local `/artifacts` drops don't count.
    pub fn has_published_assets(&self) -> bool {
        self.assets.iter().any(|asset| {
            asset
                .locations
                .iter()
                .any(|l| l.kind != LocationType::None && !l.location.ends_with("/artifacts"))
        })
    }
}

/// Average build durations for a repository branch, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTime {
    pub repository: String,
    pub branch: String,
    pub official_build_minutes: f64,
    pub pr_build_minutes: f64,
}

/// A dependency of a build whose versions are not mutually coherent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIncoherence {
    pub name: String,
    pub version: String,
    pub repository: String,
    pub commit: String,
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub classification: String,
}

/// Builds of `branch` in `repository` are published to `channel_id` by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultChannel {
    pub repository: String,
    pub branch: String,
    pub channel_id: ChannelId,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateFrequency {
    None,
    EveryBuild,
    EveryDay,
    TwiceDaily,
    EveryWeek,
}

impl UpdateFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateFrequency::None => "none",
            UpdateFrequency::EveryBuild => "everyBuild",
            UpdateFrequency::EveryDay => "everyDay",
            UpdateFrequency::TwiceDaily => "twiceDaily",
            UpdateFrequency::EveryWeek => "everyWeek",
        }
    }
}

impl fmt::Display for UpdateFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(UpdateFrequency::None),
            "everybuild" => Ok(UpdateFrequency::EveryBuild),
            "everyday" => Ok(UpdateFrequency::EveryDay),
            "twicedaily" => Ok(UpdateFrequency::TwiceDaily),
            "everyweek" => Ok(UpdateFrequency::EveryWeek),
            other => Err(format!("unknown update frequency '{other}'")),
        }
    }
}

/// A named merge policy with its free-form properties.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergePolicyDefinition {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl MergePolicyDefinition {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPolicy {
    pub batchable: bool,
    pub update_frequency: UpdateFrequency,
    #[serde(default)]
    pub merge_policies: Vec<MergePolicyDefinition>,
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self {
            batchable: false,
            update_frequency: UpdateFrequency::EveryBuild,
            merge_policies: Vec::new(),
        }
    }
}

/// How a subscription moves changes into its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Classic version-file update.
    Dependency,
    /// VMR to product repository.
    Backflow,
    /// Product repository to VMR.
    ForwardFlow,
}

/// A rule describing how builds on a channel flow into a target repository branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel_id: ChannelId,
    pub source_repository: String,
    pub target_repository: String,
    pub target_branch: String,
    pub enabled: bool,
    #[serde(default)]
    pub source_enabled: bool,
    #[serde(default)]
    pub source_directory: Option<String>,
    #[serde(default)]
    pub target_directory: Option<String>,
    #[serde(default)]
    pub policy: SubscriptionPolicy,
    #[serde(default)]
    pub excluded_assets: Vec<String>,
    #[serde(default)]
    pub last_applied_build: Option<BuildId>,
    #[serde(default)]
    pub pull_request_failure_notification_tags: Option<String>,
}

impl Subscription {
    pub fn new(
        channel_id: ChannelId,
        source_repository: impl Into<String>,
        target_repository: impl Into<String>,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            source_repository: source_repository.into(),
            target_repository: target_repository.into(),
            target_branch: target_branch.into(),
            enabled: true,
            source_enabled: false,
            source_directory: None,
            target_directory: None,
            policy: SubscriptionPolicy::default(),
            excluded_assets: Vec::new(),
            last_applied_build: None,
            pull_request_failure_notification_tags: None,
        }
    }

    pub fn flow_kind(&self) -> FlowKind {
        if self.source_directory.as_deref().is_some_and(|d| !d.is_empty()) {
            FlowKind::Backflow
        } else if self.target_directory.as_deref().is_some_and(|d| !d.is_empty()) {
            FlowKind::ForwardFlow
        } else {
            FlowKind::Dependency
        }
    }

    pub fn is_code_flow(&self) -> bool {
        self.flow_kind() != FlowKind::Dependency
    }

    /// Case-insensitive match against the excluded asset list.
    pub fn is_asset_excluded(&self, asset_name: &str) -> bool {
        self.excluded_assets
            .iter()
            .any(|a| a.eq_ignore_ascii_case(asset_name))
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Snapshot written once per longest-build-path run; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongestBuildPath {
    pub channel_id: ChannelId,
    pub best_case_minutes: f64,
    pub worst_case_minutes: f64,
    pub contributing_repositories: String,
    pub report_date: DateTime<Utc>,
}

//! Dependency update selection and coherency resolution.
//!
//! A repository's dependencies are either updated directly from an incoming
//! build's assets, or (when they declare a coherent parent) pinned to whatever
//! version their parent was built against. [`required_non_coherency_updates`]
//! handles the first case, [`CoherencyResolver`] the second.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use maestro_state::Asset;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, FlowResult};
use crate::pr_description::DependencyUpdateSummary;
use crate::remote::RemoteRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    #[default]
    Product,
    Toolset,
}

/// A dependency as recorded in a repository's dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDetail {
    pub name: String,
    pub version: String,
    pub repo_uri: String,
    pub commit: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub kind: DependencyType,
    /// Name of the dependency whose build inputs this one must match.
    #[serde(default)]
    pub coherent_parent: Option<String>,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl DependencyDetail {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        repo_uri: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            repo_uri: repo_uri.into(),
            commit: commit.into(),
            pinned: false,
            kind: DependencyType::Product,
            coherent_parent: None,
            locations: Vec::new(),
        }
    }

    pub fn with_coherent_parent(mut self, parent: impl Into<String>) -> Self {
        self.coherent_parent = Some(parent.into());
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    fn has_coherent_parent(&self) -> bool {
        self.coherent_parent
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }

    fn same_source(&self, other: &DependencyDetail) -> bool {
        self.version == other.version
            && self.commit == other.commit
            && self.repo_uri.eq_ignore_ascii_case(&other.repo_uri)
    }
}

/// A single dependency moving from one version to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyUpdate {
    pub from: DependencyDetail,
    pub to: DependencyDetail,
}

impl DependencyUpdate {
    pub fn summary(&self) -> DependencyUpdateSummary {
        DependencyUpdateSummary::new(&self.to.name, &self.from.version, &self.to.version)
    }
}

/// A coherency conflict that could not be resolved automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherencyErrorDetails {
    pub dependency: String,
    pub error: String,
    pub potential_solutions: Vec<String>,
}

/// Result of strict coherency resolution. Errors are data, not failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherencyOutcome {
    pub updates: Vec<DependencyUpdate>,
    pub errors: Vec<CoherencyErrorDetails>,
}

impl CoherencyOutcome {
    pub fn is_coherent(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Match incoming assets against current dependencies that have no coherent
/// parent.
///
/// Pinned, excluded and already up-to-date dependencies are skipped. When a
/// build publishes several assets with the same name, the first one wins.
pub fn required_non_coherency_updates<F>(
    source_repository: &str,
    source_commit: &str,
    assets: &[Asset],
    dependencies: &[DependencyDetail],
    is_excluded: F,
) -> Vec<DependencyUpdate>
where
    F: Fn(&str) -> bool,
{
    let mut updates = Vec::new();
    for dependency in dependencies {
        if dependency.has_coherent_parent() || dependency.pinned {
            continue;
        }
        let Some(asset) = assets
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(&dependency.name))
        else {
            continue;
        };
        if is_excluded(&asset.name) {
            debug!(asset = %asset.name, "asset excluded from update");
            continue;
        }

        let mut to = dependency.clone();
        to.name = asset.name.clone();
        to.version = asset.version.clone();
        to.commit = source_commit.to_string();
        to.repo_uri = source_repository.to_string();
        to.locations = asset.locations.iter().map(|l| l.location.clone()).collect();

        if dependency.same_source(&to) {
            continue;
        }
        updates.push(DependencyUpdate {
            from: dependency.clone(),
            to,
        });
    }
    updates
}

/// Strict coherency resolver.
///
/// Reads each coherent parent's own dependency manifest at the parent's
/// `repo@commit` to learn which version of the child it was built with.
pub struct CoherencyResolver {
    remote: Arc<dyn RemoteRepository>,
}

impl CoherencyResolver {
    pub fn new(remote: Arc<dyn RemoteRepository>) -> Self {
        Self { remote }
    }

    /// Coherency updates needed after `applied` has been applied to
    /// `dependencies`.
    ///
    /// A coherent parent naming a dependency that does not exist is a
    /// configuration error. Missing entries in a parent's manifest are
    /// reported as [`CoherencyErrorDetails`].
    pub async fn required_coherency_updates(
        &self,
        dependencies: &[DependencyDetail],
        applied: &[DependencyUpdate],
    ) -> FlowResult<CoherencyOutcome> {
        // Current view: manifest with the incoming updates layered on top.
        let mut current: Vec<DependencyDetail> = dependencies.to_vec();
        for update in applied {
            if let Some(slot) = current
                .iter_mut()
                .find(|d| d.name.eq_ignore_ascii_case(&update.from.name))
            {
                *slot = update.to.clone();
            }
        }

        let originals: HashMap<String, DependencyDetail> = dependencies
            .iter()
            .map(|d| (d.name.to_lowercase(), d.clone()))
            .collect();

        let leaves: Vec<String> = current
            .iter()
            .filter(|d| d.has_coherent_parent())
            .filter(|d| {
                !current.iter().any(|o| {
                    o.coherent_parent
                        .as_deref()
                        .is_some_and(|p| p.eq_ignore_ascii_case(&d.name))
                })
            })
            .map(|d| d.name.clone())
            .collect();

        let mut outcome = CoherencyOutcome::default();
        if leaves.is_empty() {
            return Ok(outcome);
        }

        let mut manifests: HashMap<(String, String), Vec<DependencyDetail>> = HashMap::new();

        for leaf in leaves {
            let chain = coherency_chain(&current, &leaf)?;

            // chain is leaf..head; walk head-down so each child sees its
            // parent's resolved commit.
            for pair in chain.windows(2).rev() {
                let (child_name, parent_name) = (&pair[0], &pair[1]);
                let Some(child) = find(&current, child_name).cloned() else {
                    break;
                };
                if child.pinned {
                    break;
                }
                let Some(parent) = find(&current, parent_name).cloned() else {
                    break;
                };

                let cache_key = (parent.repo_uri.to_lowercase(), parent.commit.clone());
                if !manifests.contains_key(&cache_key) {
                    let deps = self
                        .remote
                        .get_dependencies(&parent.repo_uri, &parent.commit)
                        .await?;
                    manifests.insert(cache_key.clone(), deps);
                }
                let parent_manifest = manifests.get(&cache_key).map(Vec::as_slice).unwrap_or(&[]);

                let Some(expected) = find(parent_manifest, &child.name) else {
                    outcome.errors.push(missing_in_parent(&child, &parent));
                    break;
                };

                let mut to = child.clone();
                to.version = expected.version.clone();
                to.commit = expected.commit.clone();
                to.repo_uri = expected.repo_uri.clone();
                if child.same_source(&to) {
                    continue;
                }

                if let Some(slot) = current
                    .iter_mut()
                    .find(|d| d.name.eq_ignore_ascii_case(&child.name))
                {
                    *slot = to.clone();
                }
                let from = originals
                    .get(&child.name.to_lowercase())
                    .cloned()
                    .unwrap_or(child);
                outcome
                    .updates
                    .retain(|u: &DependencyUpdate| !u.to.name.eq_ignore_ascii_case(&to.name));
                outcome.updates.push(DependencyUpdate { from, to });
            }
        }

        Ok(outcome)
    }
}

fn find<'a>(deps: &'a [DependencyDetail], name: &str) -> Option<&'a DependencyDetail> {
    deps.iter().find(|d| d.name.eq_ignore_ascii_case(name))
}

/// Names from `leaf` up to the head of its coherency tree, leaf first.
fn coherency_chain(current: &[DependencyDetail], leaf: &str) -> FlowResult<Vec<String>> {
    let mut chain = vec![leaf.to_string()];
    let mut seen: HashSet<String> = HashSet::from([leaf.to_lowercase()]);
    let mut name = leaf.to_string();

    while let Some(dep) = find(current, &name) {
        let Some(parent_name) = dep.coherent_parent.as_deref().filter(|p| !p.trim().is_empty())
        else {
            break;
        };
        if find(current, parent_name).is_none() {
            return Err(FlowError::configuration(
                format!("{}.coherent_parent", dep.name),
                format!("dependency {} has non-existent parent dependency {parent_name}", dep.name),
            ));
        }
        if !seen.insert(parent_name.to_lowercase()) {
            return Err(FlowError::configuration(
                format!("{}.coherent_parent", dep.name),
                format!("coherent parent chain of {leaf} loops through {parent_name}"),
            ));
        }
        chain.push(parent_name.to_string());
        name = parent_name.to_string();
    }
    Ok(chain)
}

fn missing_in_parent(child: &DependencyDetail, parent: &DependencyDetail) -> CoherencyErrorDetails {
    CoherencyErrorDetails {
        dependency: child.name.clone(),
        error: format!(
            "{} @ {} does not contain dependency {}",
            parent.repo_uri, parent.commit, child.name
        ),
        potential_solutions: vec![
            format!("Add the dependency to {}.", parent.repo_uri),
            "Pin the dependency.".to_string(),
            "Remove the CoherentParentDependency attribute.".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fakes::FakeRemote;

    const RUNTIME: &str = "https://github.com/dotnet/runtime";
    const SDK: &str = "https://github.com/dotnet/sdk";

    #[test]
    fn test_non_coherency_updates_match_by_name() {
        let deps = vec![
            DependencyDetail::new("Foo", "0.9.0", RUNTIME, "old"),
            DependencyDetail::new("Bar", "1.0.0", RUNTIME, "old").pinned(),
            DependencyDetail::new("Baz", "1.0.0", RUNTIME, "old").with_coherent_parent("Foo"),
            DependencyDetail::new("Qux", "2.0.0", RUNTIME, "new"),
        ];
        let assets = vec![
            Asset::new("foo", "1.0.0"),
            Asset::new("Foo", "9.9.9"),
            Asset::new("Bar", "2.0.0"),
            Asset::new("Baz", "2.0.0"),
            Asset::new("Qux", "2.0.0"),
        ];
        let updates = required_non_coherency_updates(RUNTIME, "new", &assets, &deps, |_| false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].from.version, "0.9.0");
        assert_eq!(updates[0].to.version, "1.0.0");
        assert_eq!(updates[0].to.commit, "new");
    }

    #[test]
    fn test_non_coherency_updates_honor_exclusions() {
        let deps = vec![DependencyDetail::new("Foo", "0.9.0", RUNTIME, "old")];
        let assets = vec![Asset::new("Foo", "1.0.0")];
        let updates = required_non_coherency_updates(RUNTIME, "new", &assets, &deps, |n| n == "Foo");
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn test_coherent_child_follows_parent_manifest() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_dependencies(
            SDK,
            "sdk-new",
            vec![DependencyDetail::new("Child", "5.0.1", RUNTIME, "rt-501")],
        );
        let deps = vec![
            DependencyDetail::new("Parent", "1.0.0", SDK, "sdk-old"),
            DependencyDetail::new("Child", "5.0.0", RUNTIME, "rt-500").with_coherent_parent("Parent"),
        ];
        let applied = required_non_coherency_updates(
            SDK,
            "sdk-new",
            &[Asset::new("Parent", "1.1.0")],
            &deps,
            |_| false,
        );

        let outcome = CoherencyResolver::new(remote)
            .required_coherency_updates(&deps, &applied)
            .await
            .unwrap();
        assert!(outcome.is_coherent());
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(outcome.updates[0].from.version, "5.0.0");
        assert_eq!(outcome.updates[0].to.version, "5.0.1");
        assert_eq!(outcome.updates[0].to.commit, "rt-501");
    }

    #[tokio::test]
    async fn test_missing_child_in_parent_is_reported() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_dependencies(SDK, "sdk-old", vec![]);
        let deps = vec![
            DependencyDetail::new("Parent", "1.0.0", SDK, "sdk-old"),
            DependencyDetail::new("Child", "5.0.0", RUNTIME, "rt-500").with_coherent_parent("Parent"),
        ];
        let outcome = CoherencyResolver::new(remote)
            .required_coherency_updates(&deps, &[])
            .await
            .unwrap();
        assert!(!outcome.is_coherent());
        assert_eq!(outcome.errors[0].dependency, "Child");
        assert_eq!(outcome.errors[0].potential_solutions.len(), 3);
        assert_eq!(
            outcome.errors[0].potential_solutions[0],
            format!("Add the dependency to {SDK}.")
        );
    }

    #[tokio::test]
    async fn test_pinned_child_is_left_alone() {
        let remote = Arc::new(FakeRemote::new());
        let deps = vec![
            DependencyDetail::new("Parent", "1.0.0", SDK, "sdk-old"),
            DependencyDetail::new("Child", "5.0.0", RUNTIME, "rt-500")
                .with_coherent_parent("Parent")
                .pinned(),
        ];
        let outcome = CoherencyResolver::new(remote)
            .required_coherency_updates(&deps, &[])
            .await
            .unwrap();
        assert_eq!(outcome, CoherencyOutcome::default());
    }

    #[tokio::test]
    async fn test_unknown_parent_is_configuration_error() {
        let remote = Arc::new(FakeRemote::new());
        let deps = vec![DependencyDetail::new("Child", "5.0.0", RUNTIME, "rt")
            .with_coherent_parent("Ghost")];
        let err = CoherencyResolver::new(remote)
            .required_coherency_updates(&deps, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Configuration { .. }));
        assert!(err.to_string().contains("Ghost"));
    }
}

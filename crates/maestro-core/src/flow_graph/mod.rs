//! Dependency flow graph over repository branches.
//!
//! Nodes are `(repository, branch)` pairs; an edge `A → B` means a
//! subscription flows builds of `A` into `B`. Subscriptions legitimately form
//! cycles, so nodes and edges live in flat arenas owned by the graph and refer
//! to each other by index.
//!
//! Typical use:
//!
//! ```ignore
//! let mut graph = DependencyFlowGraph::build(&defaults, &subs, &times, &options);
//! graph.prune(|n| n.output_channels.contains(&channel), |e| options.is_interesting_edge(e));
//! graph.mark_back_edges();
//! graph.calculate_longest_build_paths();
//! graph.mark_longest_build_path();
//! ```

mod analysis;

use std::collections::{HashMap, HashSet};

use maestro_state::{BuildTime, ChannelId, DefaultChannel, Subscription, UpdateFrequency};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use analysis::LongestPathSummary;

pub type NodeIndex = usize;
pub type EdgeIndex = usize;

/// Repository producing shared build tooling. Edges out of it are tooling-only.
pub const DEFAULT_TOOLSET_REPOSITORY: &str = "https://github.com/dotnet/arcade";

/// Malformed graph input. These indicate a caller bug and are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node key: {key}")]
    DuplicateNode { key: String },

    #[error("edge references unknown node: {key}")]
    DanglingEdge { key: String },
}

/// Case-insensitive identity of a node.
pub fn node_key(repository: &str, branch: &str) -> String {
    format!("{}@{}", repository.to_lowercase(), branch.to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub repository: String,
    pub branch: String,
    /// Official build duration in minutes.
    pub official_build_time: f64,
    /// PR validation build duration in minutes.
    pub pr_build_time: f64,
    pub best_case_path_time: f64,
    pub worst_case_path_time: f64,
    pub on_longest_build_path: bool,
    pub input_channels: Vec<ChannelId>,
    pub output_channels: Vec<ChannelId>,
    incoming: Vec<EdgeIndex>,
    outgoing: Vec<EdgeIndex>,
}

impl FlowNode {
    fn new(repository: &str, branch: &str) -> Self {
        Self {
            repository: repository.to_string(),
            branch: branch.to_string(),
            official_build_time: 0.0,
            pr_build_time: 0.0,
            best_case_path_time: 0.0,
            worst_case_path_time: 0.0,
            on_longest_build_path: false,
            input_channels: Vec::new(),
            output_channels: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        node_key(&self.repository, &self.branch)
    }

    /// Display id, `repository@branch` with original casing.
    pub fn id(&self) -> String {
        format!("{}@{}", self.repository, self.branch)
    }

    pub fn incoming_edges(&self) -> &[EdgeIndex] {
        &self.incoming
    }

    pub fn outgoing_edges(&self) -> &[EdgeIndex] {
        &self.outgoing
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub subscription: Subscription,
    pub on_longest_build_path: bool,
    pub back_edge: bool,
    /// Flow from the shared toolset repository rather than product code.
    pub tooling_only: bool,
}

/// Inputs that shape graph construction and pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphBuildOptions {
    /// Window of build history, in days, used for build times.
    pub days: u32,
    /// Keep edges sourced from the toolset repository.
    pub include_arcade: bool,
    /// Populate node build times; zero otherwise.
    pub include_build_times: bool,
    pub include_disabled_subscriptions: bool,
    /// Frequencies kept by [`GraphBuildOptions::is_interesting_edge`]. Empty keeps all.
    pub included_frequencies: Vec<UpdateFrequency>,
    pub toolset_repositories: Vec<String>,
}

impl Default for GraphBuildOptions {
    fn default() -> Self {
        Self {
            days: 7,
            include_arcade: true,
            include_build_times: true,
            include_disabled_subscriptions: false,
            included_frequencies: Vec::new(),
            toolset_repositories: vec![DEFAULT_TOOLSET_REPOSITORY.to_string()],
        }
    }
}

impl GraphBuildOptions {
    pub fn is_toolset(&self, repository: &str) -> bool {
        self.toolset_repositories
            .iter()
            .any(|t| t.eq_ignore_ascii_case(repository))
    }

    /// Edge predicate for [`DependencyFlowGraph::prune`].
    pub fn is_interesting_edge(&self, edge: &FlowEdge) -> bool {
        if !self.include_disabled_subscriptions && !edge.subscription.enabled {
            return false;
        }
        self.included_frequencies.is_empty()
            || self
                .included_frequencies
                .contains(&edge.subscription.policy.update_frequency)
    }
}

/// Node predicate keeping nodes that publish to `channel_id`.
pub fn is_interesting_node(channel_id: ChannelId, node: &FlowNode) -> bool {
    node.output_channels.contains(&channel_id)
}

/// Arena-backed dependency flow graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyFlowGraph {
    nodes: Vec<FlowNode>,
    edges: Vec<FlowEdge>,
    index: HashMap<String, NodeIndex>,
    back_edges_marked: bool,
}

impl DependencyFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from default channels and subscriptions.
    ///
    /// Every default channel becomes a node publishing to its channel. Every
    /// enabled subscription (or every subscription, with
    /// `include_disabled_subscriptions`) becomes one edge per default-channel
    /// branch of its source repository on the subscribed channel.
    pub fn build(
        default_channels: &[DefaultChannel],
        subscriptions: &[Subscription],
        build_times: &[BuildTime],
        options: &GraphBuildOptions,
    ) -> Self {
        let mut graph = Self::new();
        let times: HashMap<String, &BuildTime> = build_times
            .iter()
            .map(|t| (node_key(&t.repository, &t.branch), t))
            .collect();

        for dc in default_channels {
            let idx = graph.get_or_create(&dc.repository, &dc.branch);
            let node = &mut graph.nodes[idx];
            if !node.output_channels.contains(&dc.channel_id) {
                node.output_channels.push(dc.channel_id);
            }
        }

        for sub in subscriptions {
            if !sub.enabled && !options.include_disabled_subscriptions {
                continue;
            }
            if !options.include_arcade && options.is_toolset(&sub.source_repository) {
                continue;
            }
            let to = graph.get_or_create(&sub.target_repository, &sub.target_branch);
            let sources: Vec<&DefaultChannel> = default_channels
                .iter()
                .filter(|d| {
                    d.channel_id == sub.channel_id
                        && d.repository.eq_ignore_ascii_case(&sub.source_repository)
                })
                .collect();
            if sources.is_empty() {
                debug!(subscription = %sub.id, "no default channel for subscription source");
            }
            for dc in sources {
                let from = graph.get_or_create(&dc.repository, &dc.branch);
                let tooling_only = options.is_toolset(&sub.source_repository);
                graph.push_edge(from, to, sub.clone(), tooling_only);
            }
        }

        if options.include_build_times {
            for node in &mut graph.nodes {
                if let Some(t) = times.get(&node.key()) {
                    node.official_build_time = t.official_build_minutes;
                    node.pr_build_time = t.pr_build_minutes;
                }
            }
        }

        graph
    }

    /// Add a node with build times. Fails if the key already exists.
    pub fn add_node(
        &mut self,
        repository: &str,
        branch: &str,
        official_build_time: f64,
        pr_build_time: f64,
    ) -> Result<NodeIndex, GraphError> {
        let key = node_key(repository, branch);
        if self.index.contains_key(&key) {
            return Err(GraphError::DuplicateNode { key });
        }
        let idx = self.get_or_create(repository, branch);
        self.nodes[idx].official_build_time = official_build_time;
        self.nodes[idx].pr_build_time = pr_build_time;
        Ok(idx)
    }

    /// Add an edge between existing nodes identified by key.
    pub fn add_edge(
        &mut self,
        from_key: &str,
        to_key: &str,
        subscription: Subscription,
    ) -> Result<EdgeIndex, GraphError> {
        let from = self.lookup(from_key)?;
        let to = self.lookup(to_key)?;
        Ok(self.push_edge(from, to, subscription, false))
    }

    fn lookup(&self, key: &str) -> Result<NodeIndex, GraphError> {
        self.index
            .get(&key.to_lowercase())
            .copied()
            .ok_or_else(|| GraphError::DanglingEdge {
                key: key.to_string(),
            })
    }

    fn get_or_create(&mut self, repository: &str, branch: &str) -> NodeIndex {
        let key = node_key(repository, branch);
        if let Some(idx) = self.index.get(&key) {
            return *idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(FlowNode::new(repository, branch));
        self.index.insert(key, idx);
        idx
    }

    fn push_edge(
        &mut self,
        from: NodeIndex,
        to: NodeIndex,
        subscription: Subscription,
        tooling_only: bool,
    ) -> EdgeIndex {
        let idx = self.edges.len();
        let channel = subscription.channel_id;
        self.edges.push(FlowEdge {
            from,
            to,
            subscription,
            on_longest_build_path: false,
            back_edge: false,
            tooling_only,
        });
        self.nodes[from].outgoing.push(idx);
        self.nodes[to].incoming.push(idx);
        if !self.nodes[to].input_channels.contains(&channel) {
            self.nodes[to].input_channels.push(channel);
        }
        self.back_edges_marked = false;
        idx
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }

    pub fn node(&self, idx: NodeIndex) -> &FlowNode {
        &self.nodes[idx]
    }

    pub fn edge(&self, idx: EdgeIndex) -> &FlowEdge {
        &self.edges[idx]
    }

    /// Case-insensitive lookup by `repository@branch`.
    pub fn find_node(&self, key: &str) -> Option<&FlowNode> {
        self.index.get(&key.to_lowercase()).map(|i| &self.nodes[*i])
    }

    pub fn node_index(&self, key: &str) -> Option<NodeIndex> {
        self.index.get(&key.to_lowercase()).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keep only interesting nodes and everything upstream of them through
    /// interesting edges. Nodes reachable only through excluded edges are
    /// dropped together with all edges not walked.
    pub fn prune<N, E>(&mut self, is_interesting_node: N, is_interesting_edge: E)
    where
        N: Fn(&FlowNode) -> bool,
        E: Fn(&FlowEdge) -> bool,
    {
        let mut kept_nodes: HashSet<NodeIndex> = HashSet::new();
        let mut kept_edges: HashSet<EdgeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = Vec::new();

        for (idx, node) in self.nodes.iter().enumerate() {
            if !is_interesting_node(node) {
                continue;
            }
            stack.push(idx);
            while let Some(current) = stack.pop() {
                if !kept_nodes.insert(current) {
                    continue;
                }
                for &e in &self.nodes[current].incoming {
                    let edge = &self.edges[e];
                    if is_interesting_edge(edge) {
                        kept_edges.insert(e);
                        stack.push(edge.from);
                    }
                }
            }
        }

        self.retain(&kept_nodes, &kept_edges);
    }

    /// Rebuild the arenas keeping the given node and edge indices.
    fn retain(&mut self, kept_nodes: &HashSet<NodeIndex>, kept_edges: &HashSet<EdgeIndex>) {
        let old_nodes = std::mem::take(&mut self.nodes);
        let old_edges = std::mem::take(&mut self.edges);
        self.index.clear();

        let mut remap: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        for (old_idx, mut node) in old_nodes.into_iter().enumerate() {
            if !kept_nodes.contains(&old_idx) {
                continue;
            }
            node.incoming.clear();
            node.outgoing.clear();
            node.input_channels.clear();
            let new_idx = self.nodes.len();
            self.index.insert(node.key(), new_idx);
            self.nodes.push(node);
            remap.insert(old_idx, new_idx);
        }

        for (old_idx, edge) in old_edges.into_iter().enumerate() {
            if !kept_edges.contains(&old_idx) {
                continue;
            }
            let (Some(&from), Some(&to)) = (remap.get(&edge.from), remap.get(&edge.to)) else {
                continue;
            };
            let new_idx = self.push_edge(from, to, edge.subscription, edge.tooling_only);
            self.edges[new_idx].back_edge = edge.back_edge;
            self.edges[new_idx].on_longest_build_path = edge.on_longest_build_path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(channel: ChannelId, source: &str, target: &str) -> Subscription {
        Subscription::new(channel, source, target, "main")
    }

    fn dc(repo: &str, channel: ChannelId) -> DefaultChannel {
        DefaultChannel {
            repository: repo.to_string(),
            branch: "main".to_string(),
            channel_id: channel,
        }
    }

    #[test]
    fn test_build_creates_one_edge_per_enabled_subscription() {
        let defaults = vec![dc("a", 1), dc("b", 1), dc("c", 1)];
        let mut disabled = sub(1, "b", "c");
        disabled.enabled = false;
        let subs = vec![sub(1, "a", "b"), disabled];

        let graph = DependencyFlowGraph::build(&defaults, &subs, &[], &GraphBuildOptions::default());
        assert_eq!(graph.nodes().len(), 3);
        assert_eq!(graph.edges().len(), 1);
        let e = graph.edge(0);
        assert_eq!(graph.node(e.from).repository, "a");
        assert_eq!(graph.node(e.to).repository, "b");
    }

    #[test]
    fn test_build_includes_disabled_when_requested() {
        let defaults = vec![dc("a", 1), dc("b", 1)];
        let mut disabled = sub(1, "a", "b");
        disabled.enabled = false;
        let options = GraphBuildOptions {
            include_disabled_subscriptions: true,
            ..Default::default()
        };
        let graph = DependencyFlowGraph::build(&defaults, &[disabled], &[], &options);
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_node_keys_are_case_insensitive() {
        let defaults = vec![dc("https://github.com/Org/A", 1)];
        let subs = vec![Subscription::new(1, "https://github.com/org/a", "https://github.com/ORG/A", "MAIN")];
        let graph = DependencyFlowGraph::build(&defaults, &subs, &[], &GraphBuildOptions::default());
        assert_eq!(graph.nodes().len(), 1);
        assert!(graph.find_node("https://github.com/org/a@main").is_some());
    }

    #[test]
    fn test_build_times_applied_only_when_enabled() {
        let defaults = vec![dc("a", 1)];
        let times = vec![BuildTime {
            repository: "a".into(),
            branch: "main".into(),
            official_build_minutes: 30.0,
            pr_build_minutes: 20.0,
        }];
        let graph = DependencyFlowGraph::build(&defaults, &[], &times, &GraphBuildOptions::default());
        assert_eq!(graph.node(0).official_build_time, 30.0);
        assert_eq!(graph.node(0).pr_build_time, 20.0);

        let options = GraphBuildOptions {
            include_build_times: false,
            ..Default::default()
        };
        let graph = DependencyFlowGraph::build(&defaults, &[], &times, &options);
        assert_eq!(graph.node(0).official_build_time, 0.0);
    }

    #[test]
    fn test_toolset_edges_flagged_or_dropped() {
        let arcade = DEFAULT_TOOLSET_REPOSITORY;
        let defaults = vec![dc(arcade, 1), dc("b", 1)];
        let subs = vec![sub(1, arcade, "b")];

        let graph = DependencyFlowGraph::build(&defaults, &subs, &[], &GraphBuildOptions::default());
        assert!(graph.edge(0).tooling_only);

        let options = GraphBuildOptions {
            include_arcade: false,
            ..Default::default()
        };
        let graph = DependencyFlowGraph::build(&defaults, &subs, &[], &options);
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn test_add_node_rejects_duplicate_key() {
        let mut graph = DependencyFlowGraph::new();
        graph.add_node("a", "main", 0.0, 0.0).unwrap();
        let err = graph.add_node("A", "Main", 0.0, 0.0).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode { key: "a@main".into() });
    }

    #[test]
    fn test_add_edge_rejects_dangling_reference() {
        let mut graph = DependencyFlowGraph::new();
        graph.add_node("a", "main", 0.0, 0.0).unwrap();
        let err = graph.add_edge("a@main", "b@main", sub(1, "a", "b")).unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { .. }));
    }

    #[test]
    fn test_prune_keeps_upstream_of_interesting_nodes() {
        // a -> b -> c, d -> c (d's subscription is weekly), e isolated
        let defaults = vec![dc("a", 1), dc("b", 1), dc("c", 2), dc("d", 1), dc("e", 1)];
        let mut weekly = sub(1, "d", "c");
        weekly.policy.update_frequency = UpdateFrequency::EveryWeek;
        let subs = vec![sub(1, "a", "b"), sub(1, "b", "c"), weekly];
        let mut graph = DependencyFlowGraph::build(&defaults, &subs, &[], &GraphBuildOptions::default());

        let options = GraphBuildOptions {
            included_frequencies: vec![UpdateFrequency::EveryBuild],
            ..Default::default()
        };
        graph.prune(|n| is_interesting_node(2, n), |e| options.is_interesting_edge(e));

        let mut repos: Vec<&str> = graph.nodes().iter().map(|n| n.repository.as_str()).collect();
        repos.sort();
        assert_eq!(repos, vec!["a", "b", "c"]);
        assert_eq!(graph.edges().len(), 2);
        // Indices are consistent after rebuilding the arenas.
        for edge in graph.edges() {
            assert!(graph.node(edge.to).incoming_edges().iter().any(|&i| graph.edge(i) == edge));
        }
    }

    #[test]
    fn test_prune_with_no_interesting_nodes_empties_graph() {
        let defaults = vec![dc("a", 1), dc("b", 1)];
        let mut graph =
            DependencyFlowGraph::build(&defaults, &[sub(1, "a", "b")], &[], &GraphBuildOptions::default());
        graph.prune(|_| false, |_| true);
        assert!(graph.is_empty());
        assert!(graph.edges().is_empty());
    }
}

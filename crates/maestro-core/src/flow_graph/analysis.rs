//! Back-edge marking, path times, longest build path and cycle reporting.
//!
//! Every traversal visits nodes in lexical key order and outgoing edges in
//! target-key order so results are deterministic for a given input.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DependencyFlowGraph, EdgeIndex, NodeIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    OnStack,
    Done,
}

/// Result of [`DependencyFlowGraph::mark_longest_build_path`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongestPathSummary {
    pub best_case_minutes: f64,
    pub worst_case_minutes: f64,
    /// Node ids along the path, most upstream first.
    pub nodes: Vec<String>,
}

impl LongestPathSummary {
    pub fn contributing_repositories(&self) -> String {
        self.nodes.join(";")
    }
}

impl DependencyFlowGraph {
    fn nodes_in_key_order(&self) -> Vec<NodeIndex> {
        let mut order: Vec<NodeIndex> = (0..self.nodes.len()).collect();
        order.sort_by_key(|&i| self.nodes[i].key());
        order
    }

    fn sorted_outgoing(&self, include: impl Fn(EdgeIndex) -> bool) -> Vec<Vec<EdgeIndex>> {
        self.nodes
            .iter()
            .map(|n| {
                let mut out: Vec<EdgeIndex> =
                    n.outgoing.iter().copied().filter(|&e| include(e)).collect();
                out.sort_by_key(|&e| (self.nodes[self.edges[e].to].key(), e));
                out
            })
            .collect()
    }

    fn is_forward(&self, e: EdgeIndex) -> bool {
        !self.edges[e].back_edge
    }

    /// Forward product edge; toolset flow does not lengthen build paths.
    fn counts_toward_path(&self, e: EdgeIndex) -> bool {
        self.is_forward(e) && !self.edges[e].tooling_only
    }

    /// A node that only feeds others through tooling-only edges.
    fn is_tooling_node(&self, i: NodeIndex) -> bool {
        let outgoing = &self.nodes[i].outgoing;
        !outgoing.is_empty() && outgoing.iter().all(|&e| self.edges[e].tooling_only)
    }

    /// Mark every edge that closes a cycle during DFS as a back edge.
    ///
    /// After this, forward edges form a DAG.
    pub fn mark_back_edges(&mut self) {
        for edge in &mut self.edges {
            edge.back_edge = false;
        }
        let outgoing = self.sorted_outgoing(|_| true);
        let mut state = vec![Visit::New; self.nodes.len()];

        for root in self.nodes_in_key_order() {
            if state[root] != Visit::New {
                continue;
            }
            state[root] = Visit::OnStack;
            let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];

            while let Some(&(node, pos)) = stack.last() {
                if pos >= outgoing[node].len() {
                    state[node] = Visit::Done;
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let e = outgoing[node][pos];
                let to = self.edges[e].to;
                match state[to] {
                    Visit::OnStack => {
                        self.edges[e].back_edge = true;
                        debug!(
                            from = %self.nodes[node].id(),
                            to = %self.nodes[to].id(),
                            "marked back edge"
                        );
                    }
                    Visit::New => {
                        state[to] = Visit::OnStack;
                        stack.push((to, 0));
                    }
                    Visit::Done => {}
                }
            }
        }
        self.back_edges_marked = true;
    }

    /// Compute best and worst case path times for every node.
    ///
    /// `best = pr_build_time + max(best of forward predecessors, 0)` and
    /// `worst = official_build_time + max(worst of forward predecessors, 0)`,
    /// processed in topological order of forward edges. Predecessors over
    /// tooling-only edges do not count. Back edges are marked first if
    /// needed, so cyclic input always terminates.
    pub fn calculate_longest_build_paths(&mut self) {
        if !self.back_edges_marked {
            self.mark_back_edges();
        }

        let mut in_degree: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| n.incoming.iter().filter(|&&e| self.is_forward(e)).count())
            .collect();

        let mut ready: BTreeSet<(String, NodeIndex)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] == 0)
            .map(|(i, n)| (n.key(), i))
            .collect();

        let mut processed = 0usize;
        while let Some(entry) = ready.pop_first() {
            let idx = entry.1;
            let (best_pred, worst_pred) = self.nodes[idx]
                .incoming
                .iter()
                .filter(|&&e| self.counts_toward_path(e))
                .map(|&e| &self.nodes[self.edges[e].from])
                .fold((0.0_f64, 0.0_f64), |(b, w), p| {
                    (b.max(p.best_case_path_time), w.max(p.worst_case_path_time))
                });

            let node = &mut self.nodes[idx];
            node.best_case_path_time = node.pr_build_time + best_pred;
            node.worst_case_path_time = node.official_build_time + worst_pred;
            processed += 1;

            let successors: Vec<NodeIndex> = self.nodes[idx]
                .outgoing
                .iter()
                .filter(|&&e| self.is_forward(e))
                .map(|&e| self.edges[e].to)
                .collect();
            for to in successors {
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    ready.insert((self.nodes[to].key(), to));
                }
            }
        }
        debug_assert_eq!(processed, self.nodes.len(), "forward edges must form a DAG");
    }

    /// Mark the chain ending at the node with the greatest worst-case path
    /// time, walking backward through the predecessor that contributed the
    /// maximum. Ties go to the lexically smaller node key. Toolset nodes
    /// never start the path and tooling-only edges are never walked.
    ///
    /// Returns `None` when no product node exists.
    pub fn mark_longest_build_path(&mut self) -> Option<LongestPathSummary> {
        for node in &mut self.nodes {
            node.on_longest_build_path = false;
        }
        for edge in &mut self.edges {
            edge.on_longest_build_path = false;
        }

        let start = self
            .nodes_in_key_order()
            .into_iter()
            .filter(|&i| !self.is_tooling_node(i))
            .fold(None, |best: Option<NodeIndex>, i| match best {
                Some(b) if self.nodes[b].worst_case_path_time >= self.nodes[i].worst_case_path_time => {
                    Some(b)
                }
                _ => Some(i),
            })?;

        self.nodes[start].on_longest_build_path = true;
        let mut path = vec![self.nodes[start].id()];
        let mut current = start;

        loop {
            let mut candidates: Vec<EdgeIndex> = self.nodes[current]
                .incoming
                .iter()
                .copied()
                .filter(|&e| self.counts_toward_path(e))
                .collect();
            candidates.sort_by_key(|&e| (self.nodes[self.edges[e].from].key(), e));

            let chosen = candidates.into_iter().fold(None, |best: Option<EdgeIndex>, e| {
                match best {
                    Some(b)
                        if self.nodes[self.edges[b].from].worst_case_path_time
                            >= self.nodes[self.edges[e].from].worst_case_path_time =>
                    {
                        Some(b)
                    }
                    _ => Some(e),
                }
            });
            let Some(e) = chosen else { break };

            let from = self.edges[e].from;
            if self.nodes[from].on_longest_build_path {
                break;
            }
            self.edges[e].on_longest_build_path = true;
            self.nodes[from].on_longest_build_path = true;
            path.push(self.nodes[from].id());
            current = from;
        }

        path.reverse();
        Some(LongestPathSummary {
            best_case_minutes: self.nodes[start].best_case_path_time,
            worst_case_minutes: self.nodes[start].worst_case_path_time,
            nodes: path,
        })
    }

    /// Cycles over product edges (tooling-only edges excluded), as lists of
    /// repository identifiers in flow order. Empty means no cycles.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let outgoing = self.sorted_outgoing(|e| !self.edges[e].tooling_only);
        let mut state = vec![Visit::New; self.nodes.len()];
        let mut cycles = Vec::new();

        for root in self.nodes_in_key_order() {
            if state[root] != Visit::New {
                continue;
            }
            state[root] = Visit::OnStack;
            let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];

            while let Some(&(node, pos)) = stack.last() {
                if pos >= outgoing[node].len() {
                    state[node] = Visit::Done;
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let to = self.edges[outgoing[node][pos]].to;
                match state[to] {
                    Visit::OnStack => {
                        let start = stack.iter().position(|(n, _)| *n == to).unwrap_or(0);
                        cycles.push(
                            stack[start..]
                                .iter()
                                .map(|(n, _)| self.nodes[*n].repository.clone())
                                .collect(),
                        );
                    }
                    Visit::New => {
                        state[to] = Visit::OnStack;
                        stack.push((to, 0));
                    }
                    Visit::Done => {}
                }
            }
        }
        cycles
    }
}

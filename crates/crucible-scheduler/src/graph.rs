//! The project dependency graph and the ordered dependency runner.
//!
//! The graph is rebuilt wholesale whenever project configuration
//! changes and is immutable between rebuilds: the engine swaps a fresh
//! `Arc<DependencyGraph>` in atomically, so readers always see a
//! complete (possibly stale) graph, never a partially-built one.

use crucible_core::error::{Error, Result};
use crucible_core::ids::ProjectId;
use crucible_core::result::BuildResult;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// Directed multigraph over projects; an edge means "upstream triggers
/// downstream when the upstream result meets the edge's threshold".
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<ProjectId, BuildResult>,
    index: HashMap<ProjectId, NodeIndex>,
    names: HashMap<ProjectId, String>,
}

impl DependencyGraph {
    /// The graph used before the first rebuild: no projects, no edges.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, project: ProjectId) -> bool {
        self.index.contains_key(&project)
    }

    pub fn name(&self, project: ProjectId) -> Option<&str> {
        self.names.get(&project).map(String::as_str)
    }

    /// Direct upstream projects of `project`.
    pub fn upstream(&self, project: ProjectId) -> Vec<ProjectId> {
        self.neighbors(project, Direction::Incoming)
    }

    /// Direct downstream projects with their trigger thresholds.
    pub fn downstream(&self, project: ProjectId) -> Vec<(ProjectId, BuildResult)> {
        let Some(&idx) = self.index.get(&project) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (self.graph[e.target()], *e.weight()))
            .collect()
    }

    pub fn transitive_upstream(&self, project: ProjectId) -> HashSet<ProjectId> {
        self.transitive(project, Direction::Incoming)
    }

    pub fn transitive_downstream(&self, project: ProjectId) -> HashSet<ProjectId> {
        self.transitive(project, Direction::Outgoing)
    }

    /// Projects with zero upstream dependencies, in registration order.
    pub fn top_level(&self) -> Vec<ProjectId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx])
            .collect()
    }

    fn neighbors(&self, project: ProjectId, dir: Direction) -> Vec<ProjectId> {
        let Some(&idx) = self.index.get(&project) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        self.graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n])
            .filter(|p| seen.insert(*p))
            .collect()
    }

    fn transitive(&self, project: ProjectId, dir: Direction) -> HashSet<ProjectId> {
        let mut out = HashSet::new();
        let mut stack = vec![project];
        while let Some(p) = stack.pop() {
            for n in self.neighbors(p, dir) {
                if out.insert(n) {
                    stack.push(n);
                }
            }
        }
        out
    }
}

/// Builds a fresh graph from project configuration. Cycles are a
/// configuration error, rejected here so traversal never needs guards.
#[derive(Debug, Default)]
pub struct DependencyGraphBuilder {
    graph: DiGraph<ProjectId, BuildResult>,
    index: HashMap<ProjectId, NodeIndex>,
    names: HashMap<ProjectId, String>,
}

impl DependencyGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&mut self, project: ProjectId, name: impl Into<String>) {
        self.ensure(project);
        self.names.insert(project, name.into());
    }

    pub fn add_dependency(
        &mut self,
        upstream: ProjectId,
        downstream: ProjectId,
        threshold: BuildResult,
    ) {
        let up = self.ensure(upstream);
        let down = self.ensure(downstream);
        self.graph.add_edge(up, down, threshold);
    }

    fn ensure(&mut self, project: ProjectId) -> NodeIndex {
        match self.index.get(&project) {
            Some(&idx) => idx,
            None => {
                let idx = self.graph.add_node(project);
                self.index.insert(project, idx);
                idx
            }
        }
    }

    pub fn build(self) -> Result<DependencyGraph> {
        if let Err(cycle) = toposort(&self.graph, None) {
            let culprit = self.graph[cycle.node_id()];
            let name = self
                .names
                .get(&culprit)
                .cloned()
                .unwrap_or_else(|| culprit.to_string());
            return Err(Error::CyclicDependency { cycle: name });
        }
        Ok(DependencyGraph {
            graph: self.graph,
            index: self.index,
            names: self.names,
        })
    }
}

/// Visits every project downstream of the top-level roots in an order
/// where each project appears after all of its upstream dependencies.
///
/// When a project reachable via several paths is encountered again, its
/// earlier occurrence is removed and it is re-appended at the deeper
/// position (the "longest path" rule), so diamonds resolve with the
/// join point last. Assumes a DAG; cycles were rejected at build time.
#[derive(Debug, Default)]
pub struct DependencyRunner;

impl DependencyRunner {
    pub fn ordered(graph: &DependencyGraph) -> Vec<ProjectId> {
        let mut out = Vec::new();
        for root in graph.top_level() {
            Self::visit(graph, root, &mut out);
        }
        out
    }

    fn visit(graph: &DependencyGraph, project: ProjectId, out: &mut Vec<ProjectId>) {
        if let Some(pos) = out.iter().position(|&p| p == project) {
            out.remove(pos);
        }
        out.push(project);
        for (downstream, _) in graph.downstream(project) {
            Self::visit(graph, downstream, out);
        }
    }

    /// Apply `f` once per project, in dependency order.
    pub fn run(graph: &DependencyGraph, mut f: impl FnMut(ProjectId)) {
        for project in Self::ordered(graph) {
            f(project);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pos(order: &[ProjectId], p: ProjectId) -> usize {
        order.iter().position(|&x| x == p).unwrap()
    }

    #[test]
    fn test_diamond_longest_path() {
        // A -> B -> D and A -> C -> C2 -> D: D must land after C2.
        let (a, b, c, c2, d) = (
            ProjectId::new(),
            ProjectId::new(),
            ProjectId::new(),
            ProjectId::new(),
            ProjectId::new(),
        );
        let mut builder = DependencyGraphBuilder::new();
        builder.add_dependency(a, b, BuildResult::Success);
        builder.add_dependency(b, d, BuildResult::Success);
        builder.add_dependency(a, c, BuildResult::Success);
        builder.add_dependency(c, c2, BuildResult::Success);
        builder.add_dependency(c2, d, BuildResult::Success);
        let graph = builder.build().unwrap();

        let order = DependencyRunner::ordered(&graph);
        assert_eq!(order.len(), 5);
        assert!(pos(&order, d) > pos(&order, c2));
        assert!(pos(&order, d) > pos(&order, b));
        assert!(pos(&order, c2) > pos(&order, c));
        assert!(pos(&order, b) > pos(&order, a));
    }

    #[test]
    fn test_every_edge_orders_upstream_first() {
        let ids: Vec<ProjectId> = (0..6).map(|_| ProjectId::new()).collect();
        let mut builder = DependencyGraphBuilder::new();
        let edges = [(0, 1), (0, 2), (1, 3), (2, 3), (3, 4), (1, 5), (5, 3)];
        for (u, d) in edges {
            builder.add_dependency(ids[u], ids[d], BuildResult::Success);
        }
        let graph = builder.build().unwrap();
        let order = DependencyRunner::ordered(&graph);
        for (u, d) in edges {
            assert!(pos(&order, ids[d]) > pos(&order, ids[u]));
        }
    }

    #[test]
    fn test_cycle_rejected_at_build_time() {
        let (a, b) = (ProjectId::new(), ProjectId::new());
        let mut builder = DependencyGraphBuilder::new();
        builder.add_project(a, "a");
        builder.add_project(b, "b");
        builder.add_dependency(a, b, BuildResult::Success);
        builder.add_dependency(b, a, BuildResult::Success);
        assert!(matches!(
            builder.build(),
            Err(Error::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_transitive_closure() {
        let (a, b, c) = (ProjectId::new(), ProjectId::new(), ProjectId::new());
        let mut builder = DependencyGraphBuilder::new();
        builder.add_dependency(a, b, BuildResult::Success);
        builder.add_dependency(b, c, BuildResult::Success);
        let graph = builder.build().unwrap();
        assert!(graph.transitive_upstream(c).contains(&a));
        assert!(graph.transitive_downstream(a).contains(&c));
        assert_eq!(graph.top_level(), vec![a]);
    }
}

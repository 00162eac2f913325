//! Arena-backed dependency graph.
//!
//! Nodes refer to each other by [`NodeId`]. A node's `scope` is the
//! installation unit whose `modules/` directory holds it (`None` is the
//! project root); `parent` is the first requester and only serves
//! diagnostics.

use std::collections::HashSet;
use std::sync::Arc;

use crate::endpoint::{PackageIdentifier, PackageMetadata};
use crate::version::PackageVersion;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub id: NodeId,
    pub identifier: PackageIdentifier,
    pub version: PackageVersion,
    pub metadata: Arc<PackageMetadata>,
    pub parent: Option<NodeId>,
    pub scope: Option<NodeId>,
    /// Constraint of the request that created the node.
    pub requested: String,
    pub children: Vec<NodeId>,
    /// Only reachable through devDependencies of the project.
    pub dev: bool,
}

impl ResolvedNode {
    pub fn name(&self) -> &str {
        &self.identifier.name
    }
}

/// A direct dependency of the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEdge {
    pub name: String,
    pub node: NodeId,
    pub dev: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ResolvedNode>,
    roots: Vec<RootEdge>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        identifier: PackageIdentifier,
        metadata: Arc<PackageMetadata>,
        parent: Option<NodeId>,
        scope: Option<NodeId>,
        requested: &str,
    ) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(ResolvedNode {
            id,
            version: metadata.version.clone(),
            identifier,
            metadata,
            parent,
            scope,
            requested: requested.to_string(),
            children: Vec::new(),
            dev: false,
        });
        id
    }

    pub fn add_edge(&mut self, from: Option<NodeId>, to: NodeId, dev: bool) {
        match from {
            Some(from) => {
                if let Some(node) = self.nodes.get_mut(from)
                    && !node.children.contains(&to)
                {
                    node.children.push(to);
                }
            }
            None => {
                let name = self.nodes[to].name().to_string();
                if !self.roots.iter().any(|r| r.node == to) {
                    self.roots.push(RootEdge { name, node: to, dev });
                }
            }
        }
    }

    pub fn node(&self, id: NodeId) -> &ResolvedNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[ResolvedNode] {
        &self.nodes
    }

    pub fn roots(&self) -> &[RootEdge] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node named `name` installed directly in `scope`.
    pub fn find_in_scope(&self, scope: Option<NodeId>, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.scope == scope && n.name() == name)
            .map(|n| n.id)
    }

    /// Scopes searched by a requester, nearest first: its own nested
    /// modules, then the scope it lives in, up to the project root.
    pub fn lookup_chain(&self, requester: Option<NodeId>) -> Vec<Option<NodeId>> {
        let mut chain = vec![requester];
        let mut current = requester;
        while let Some(id) = current {
            current = self.nodes[id].scope;
            chain.push(current);
        }
        chain
    }

    /// Nearest node named `name` visible from `requester`.
    pub fn nearest_visible(&self, requester: Option<NodeId>, name: &str) -> Option<NodeId> {
        self.lookup_chain(requester)
            .into_iter()
            .find_map(|scope| self.find_in_scope(scope, name))
    }

    /// Names from the root down to `node`, following first requesters.
    pub fn requester_chain(&self, node: Option<NodeId>) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = node;
        while let Some(id) = current {
            chain.push(self.nodes[id].name().to_string());
            current = self.nodes[id].parent;
        }
        chain.reverse();
        chain
    }

    /// Path of nodes from `from` to `to` along dependency edges, both ends included.
    pub fn path_between(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        let mut stack = vec![vec![from]];
        let mut seen = HashSet::new();
        while let Some(path) = stack.pop() {
            let Some(&last) = path.last() else {
                continue;
            };
            if last == to {
                return Some(path);
            }
            if !seen.insert(last) {
                continue;
            }
            for &child in self.nodes[last].children.iter().rev() {
                let mut next = path.clone();
                next.push(child);
                stack.push(next);
            }
        }
        None
    }

    /// Depth of a node's installation: 1 for the project's `modules/`.
    pub fn depth(&self, id: NodeId) -> usize {
        self.lookup_chain(Some(id)).len() - 1
    }

    /// Mark nodes reachable only through dev root edges.
    pub fn mark_dev(&mut self) {
        let mut prod = HashSet::new();
        let mut stack: Vec<NodeId> = self
            .roots
            .iter()
            .filter(|r| !r.dev)
            .map(|r| r.node)
            .collect();
        while let Some(id) = stack.pop() {
            if prod.insert(id) {
                stack.extend(self.nodes[id].children.iter().copied());
            }
        }
        for node in &mut self.nodes {
            node.dev = !prod.contains(&node.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::test_util::meta;

    fn add(graph: &mut DependencyGraph, name: &str, parent: Option<NodeId>, scope: Option<NodeId>) -> NodeId {
        let id = graph.add_node(
            PackageIdentifier::from_entry(name, "*"),
            Arc::new(meta(name, "1.0.0")),
            parent,
            scope,
            "*",
        );
        graph.add_edge(parent, id, false);
        id
    }

    #[test]
    fn test_nearest_visible_walks_scopes() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, "a", None, None);
        let shared = add(&mut graph, "shared", None, None);
        let b = add(&mut graph, "b", Some(a), Some(a));
        let nested = add(&mut graph, "shared", Some(b), Some(b));

        assert_eq!(graph.lookup_chain(Some(b)), vec![Some(b), Some(a), None]);
        assert_eq!(graph.nearest_visible(Some(a), "shared"), Some(shared));
        assert_eq!(graph.nearest_visible(Some(b), "shared"), Some(nested));
        assert_eq!(graph.nearest_visible(None, "b"), None);
        assert_eq!(graph.depth(b), 2);
        assert_eq!(graph.depth(a), 1);
        assert_eq!(graph.requester_chain(Some(b)), vec!["a", "b"]);
    }

    #[test]
    fn test_path_between() {
        let mut graph = DependencyGraph::new();
        let a = add(&mut graph, "a", None, None);
        let b = add(&mut graph, "b", Some(a), Some(a));
        let c = add(&mut graph, "c", Some(b), Some(b));

        assert_eq!(graph.path_between(a, c), Some(vec![a, b, c]));
        assert_eq!(graph.path_between(c, a), None);
    }

    #[test]
    fn test_mark_dev() {
        let mut graph = DependencyGraph::new();
        let prod = add(&mut graph, "prod", None, None);
        let shared = add(&mut graph, "shared", Some(prod), Some(prod));

        let tool = graph.add_node(
            PackageIdentifier::from_entry("tool", "*"),
            Arc::new(meta("tool", "1.0.0")),
            None,
            None,
            "*",
        );
        graph.add_edge(None, tool, true);
        let helper = add(&mut graph, "helper", Some(tool), Some(tool));
        graph.add_edge(Some(tool), shared, false);

        graph.mark_dev();
        assert!(!graph.node(prod).dev);
        assert!(!graph.node(shared).dev);
        assert!(graph.node(tool).dev);
        assert!(graph.node(helper).dev);
        assert_eq!(graph.roots().len(), 2);
    }
}

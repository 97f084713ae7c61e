//! In-process graph store for tests and dry runs

use super::{EdgeKind, EdgeUpsert, GraphStore, NodeKind, NodeUpsert, Props};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Edge identity: (kind, from, to)
pub type EdgeId = (EdgeKind, String, String);

/// Merged graph contents
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, (NodeKind, Props)>,
    pub edges: BTreeMap<EdgeId, Props>,
}

impl GraphSnapshot {
    pub fn nodes_of(&self, kind: NodeKind) -> usize {
        self.nodes.values().filter(|(k, _)| *k == kind).count()
    }

    pub fn edges_of(&self, kind: EdgeKind) -> usize {
        self.edges.keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub fn has_edge(&self, kind: EdgeKind, from: &str, to: &str) -> bool {
        self.edges
            .contains_key(&(kind, from.to_string(), to.to_string()))
    }
}

#[derive(Debug, Default)]
struct Inner {
    graph: GraphSnapshot,
    node_upserts: usize,
    edge_upserts: usize,
    /// Node writes allowed before failures start
    fail_nodes_after: Option<usize>,
}

/// Graph store backed by ordered maps
///
/// Merges exactly like the real store: properties overwrite, keys never
/// duplicate. Failure injection simulates an outage partway through a run.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    inner: Mutex<Inner>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every node write after the next `n` succeed.
    pub fn fail_nodes_after(&self, n: usize) {
        self.inner.lock().unwrap().fail_nodes_after = Some(n);
    }

    pub fn clear_failure(&self) {
        self.inner.lock().unwrap().fail_nodes_after = None;
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.inner.lock().unwrap().graph.clone()
    }

    /// Successful node writes so far
    pub fn node_upserts(&self) -> usize {
        self.inner.lock().unwrap().node_upserts
    }

    /// Successful edge writes so far
    pub fn edge_upserts(&self) -> usize {
        self.inner.lock().unwrap().edge_upserts
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node: &NodeUpsert) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.fail_nodes_after {
            if remaining == 0 {
                return Err(Error::Graph("injected failure".to_string()));
            }
            inner.fail_nodes_after = Some(remaining - 1);
        }

        let entry = inner
            .graph
            .nodes
            .entry(node.key.clone())
            .or_insert_with(|| (node.kind, Props::new()));
        // A placeholder created by an edge takes the real label
        entry.0 = node.kind;
        for (k, v) in &node.props {
            entry.1.insert(k.clone(), v.clone());
        }
        inner.node_upserts += 1;
        Ok(())
    }

    async fn upsert_edge(&self, edge: &EdgeUpsert) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let props = inner
            .graph
            .edges
            .entry((edge.kind, edge.from.clone(), edge.to.clone()))
            .or_default();
        for (k, v) in &edge.props {
            props.insert(k.clone(), v.clone());
        }
        inner.edge_upserts += 1;
        Ok(())
    }
}

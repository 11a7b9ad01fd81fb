//! Wait-For Graph Diagnostics
//!
//! Builds a "who waits for whom" graph from status snapshots. Ricart-Agrawala
//! never forms a cycle on a single resource; a cycle here means an application
//! is nesting resources in inconsistent orders, or a protocol bug.

use crate::engine::{MutexEngine, MutexError};
use crate::network::{PeerNetwork, StatusResponse};
use crate::request::ProcessId;
use crate::state_machine::ResourceStatus;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A directed graph: an edge `waiter -> holder` means `holder` has deferred
/// a request from `waiter`.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    graph: DiGraph<ProcessId, ()>,
    node_map: HashMap<ProcessId, NodeIndex>,
}

impl WaitForGraph {
    /// Creates a new, empty wait-for graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph from process-wide status snapshots.
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a StatusResponse>) -> Self {
        let mut graph = Self::new();
        for status in statuses {
            for waiter in &status.pending_requests {
                graph.add_wait(waiter, &status.process_id);
            }
        }
        graph
    }

    /// Builds the graph from per-resource snapshots, keyed by the process
    /// each snapshot was taken on.
    pub fn from_resource_statuses<'a>(
        statuses: impl IntoIterator<Item = (&'a ProcessId, &'a ResourceStatus)>,
    ) -> Self {
        let mut graph = Self::new();
        for (holder, status) in statuses {
            for waiter in &status.deferred {
                graph.add_wait(waiter, holder);
            }
        }
        graph
    }

    /// Records that `waiter` is waiting on `holder`.
    pub fn add_wait(&mut self, waiter: &ProcessId, holder: &ProcessId) {
        let waiter_idx = self.node(waiter);
        let holder_idx = self.node(holder);
        self.graph.update_edge(waiter_idx, holder_idx, ());
    }

    /// Removes a dependency once the grant is given or the request withdrawn.
    pub fn remove_wait(&mut self, waiter: &ProcessId, holder: &ProcessId) {
        if let (Some(&w), Some(&h)) = (self.node_map.get(waiter), self.node_map.get(holder)) {
            if let Some(edge) = self.graph.find_edge(w, h) {
                self.graph.remove_edge(edge);
            }
        }
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns true if a cycle exists.
    pub fn detect_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Processes on some cycle, sorted. Empty when the graph is acyclic.
    pub fn deadlocked(&self) -> Vec<ProcessId> {
        let mut stuck: Vec<_> = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || scc.iter().any(|&n| self.graph.contains_edge(n, n)))
            .flatten()
            .map(|n| self.graph[n].clone())
            .collect();
        stuck.sort();
        stuck
    }

    fn node(&mut self, id: &ProcessId) -> NodeIndex {
        if let Some(&idx) = self.node_map.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.node_map.insert(id.clone(), idx);
        idx
    }
}

/// Collects status from a process and its peers to look for wait cycles.
pub struct DeadlockDetector<'a, N> {
    engine: &'a MutexEngine<N>,
}

impl<'a, N: PeerNetwork + 'static> DeadlockDetector<'a, N> {
    pub fn new(engine: &'a MutexEngine<N>) -> Self {
        Self { engine }
    }

    /// Snapshots every process. Unreachable peers are skipped.
    pub async fn probe(&self) -> Result<WaitForGraph, MutexError> {
        let mut statuses = vec![self.engine.process_status()];
        for peer in self.engine.peers() {
            match self.engine.query_peer_status(peer, None).await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Skipping peer in deadlock probe");
                }
            }
        }
        Ok(WaitForGraph::from_statuses(&statuses))
    }

    pub async fn check_deadlock(&self) -> Result<bool, MutexError> {
        let graph = self.probe().await?;
        let stuck = graph.deadlocked();
        if !stuck.is_empty() {
            tracing::warn!(processes = ?stuck, "Wait-for cycle detected");
        }
        Ok(!stuck.is_empty())
    }
}

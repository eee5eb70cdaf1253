//! Node Registry
//!
//! Tracks per-node liveness and injected faults. The fault flag is set by
//! an explicit kill and always wins over what a connectivity probe says.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::NodeId;
use crate::store::StoreSet;

/// Reported liveness of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "ONLINE"),
            NodeStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// State of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Node identity
    pub id: NodeId,
    /// Effective status (offline when killed or unreachable)
    pub status: NodeStatus,
    /// Set by kill, cleared by recover
    pub fault_injected: bool,
    /// Result of the last connectivity probe (true until probed)
    pub reachable: bool,
    /// Error from the last failed probe
    pub last_error: Option<String>,
    /// When the node was last probed
    pub last_check: Option<DateTime<Utc>>,
}

impl NodeState {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Online,
            fault_injected: false,
            reachable: true,
            last_error: None,
            last_check: None,
        }
    }

    fn refresh_status(&mut self) {
        self.status = if self.fault_injected || !self.reachable {
            NodeStatus::Offline
        } else {
            NodeStatus::Online
        };
    }
}

/// Registry of the three nodes
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, NodeState>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create a registry with every node online
    pub fn new() -> Self {
        let nodes = NodeId::ALL
            .iter()
            .map(|id| (*id, NodeState::new(*id)))
            .collect();

        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Inject a fault. Returns false if the node was already killed.
    pub async fn mark_failed(&self, node: NodeId) -> bool {
        let mut nodes = self.nodes.write().await;
        let state = nodes.entry(node).or_insert_with(|| NodeState::new(node));
        let changed = !state.fault_injected;
        state.fault_injected = true;
        state.refresh_status();
        if changed {
            tracing::info!("Node {} killed (fault injected)", node);
        }
        changed
    }

    /// Clear an injected fault. Returns false if the node was not killed.
    pub async fn mark_recovered(&self, node: NodeId) -> bool {
        let mut nodes = self.nodes.write().await;
        let state = nodes.entry(node).or_insert_with(|| NodeState::new(node));
        let changed = state.fault_injected;
        state.fault_injected = false;
        state.refresh_status();
        if changed {
            tracing::info!("Node {} recovered (fault cleared)", node);
        }
        changed
    }

    /// Whether operations may be routed to this node
    pub async fn is_available(&self, node: NodeId) -> bool {
        !self.is_fault_injected(node).await
    }

    pub async fn is_fault_injected(&self, node: NodeId) -> bool {
        let nodes = self.nodes.read().await;
        nodes.get(&node).map(|n| n.fault_injected).unwrap_or(false)
    }

    /// Record the outcome of a connectivity probe
    pub async fn record_probe(&self, node: NodeId, outcome: std::result::Result<(), String>) {
        let mut nodes = self.nodes.write().await;
        let state = nodes.entry(node).or_insert_with(|| NodeState::new(node));
        let was_reachable = state.reachable;
        state.last_check = Some(Utc::now());
        match outcome {
            Ok(()) => {
                state.reachable = true;
                state.last_error = None;
                if !was_reachable {
                    tracing::info!("Node {} is reachable again", node);
                }
            }
            Err(e) => {
                if was_reachable {
                    tracing::warn!("Node {} failed connectivity probe: {}", node, e);
                }
                state.reachable = false;
                state.last_error = Some(e);
            }
        }
        state.refresh_status();
    }

    /// Get one node's state
    pub async fn get(&self, node: NodeId) -> Option<NodeState> {
        self.nodes.read().await.get(&node).cloned()
    }

    /// Current state of every node, without probing
    pub async fn snapshot(&self) -> BTreeMap<NodeId, NodeState> {
        self.nodes.read().await.clone()
    }

    /// Probe every store and return the resulting states
    pub async fn health_check(&self, stores: &StoreSet) -> BTreeMap<NodeId, NodeState> {
        let probes = NodeId::ALL.iter().map(|node| async move {
            let outcome = stores.get(*node).ping().await.map_err(|e| e.to_string());
            (*node, outcome)
        });

        for (node, outcome) in futures::future::join_all(probes).await {
            self.record_probe(node, outcome).await;
        }

        self.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_kill_and_recover_are_idempotent() {
        let registry = NodeRegistry::new();
        assert!(registry.is_available(NodeId::FragmentA).await);

        assert!(registry.mark_failed(NodeId::FragmentA).await);
        assert!(!registry.mark_failed(NodeId::FragmentA).await);
        assert!(!registry.is_available(NodeId::FragmentA).await);
        assert!(registry.is_available(NodeId::Master).await);
        assert!(registry.is_available(NodeId::FragmentB).await);

        assert!(registry.mark_recovered(NodeId::FragmentA).await);
        assert!(!registry.mark_recovered(NodeId::FragmentA).await);
        assert!(registry.is_available(NodeId::FragmentA).await);
    }

    #[tokio::test]
    async fn test_fault_flag_overrides_reachable_probe() {
        let stores = StoreSet::in_memory("trans_id", "date");
        let registry = NodeRegistry::new();
        registry.mark_failed(NodeId::FragmentB).await;

        let states = registry.health_check(&stores).await;
        let b = &states[&NodeId::FragmentB];
        assert!(b.reachable);
        assert!(b.fault_injected);
        assert_eq!(b.status, NodeStatus::Offline);
        assert!(b.last_check.is_some());
        assert_eq!(states[&NodeId::Master].status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_offline_but_stays_available() {
        let fragment_a = Arc::new(MemoryStore::new(NodeId::FragmentA, "trans_id", "date"));
        let stores = StoreSet::new(
            Arc::new(MemoryStore::new(NodeId::Master, "trans_id", "date")),
            fragment_a.clone(),
            Arc::new(MemoryStore::new(NodeId::FragmentB, "trans_id", "date")),
        );
        let registry = NodeRegistry::new();

        fragment_a.set_reachable(false);
        let states = registry.health_check(&stores).await;
        assert_eq!(states[&NodeId::FragmentA].status, NodeStatus::Offline);
        assert!(states[&NodeId::FragmentA].last_error.is_some());
        // Only injected faults gate routing
        assert!(registry.is_available(NodeId::FragmentA).await);

        fragment_a.set_reachable(true);
        let states = registry.health_check(&stores).await;
        assert_eq!(states[&NodeId::FragmentA].status, NodeStatus::Online);
    }
}

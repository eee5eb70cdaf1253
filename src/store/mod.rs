//! Store Module
//!
//! The per-node connection abstraction. The coordinator never looks inside
//! a store: it executes an operation and gets rows or an affected-row count
//! back, or a store error.

mod mariadb;
mod memory;

pub use mariadb::MariaDbStore;
pub use memory::{MemoryStore, Row};

use std::sync::Arc;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::FragStoreConfig;
use crate::error::Result;
use crate::lock::RecordKey;
use crate::node::NodeId;
use crate::operation::{IsolationLevel, Operation};

/// Result of executing an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows {
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
    },
    Affected {
        affected_rows: u64,
    },
}

impl QueryOutcome {
    /// One-line description for the operation log
    pub fn summary(&self) -> String {
        match self {
            QueryOutcome::Rows { rows } => format!("{} row(s) returned", rows.len()),
            QueryOutcome::Affected { affected_rows } => format!("{} row(s) affected", affected_rows),
        }
    }
}

/// Connection to one node's row store
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Node this store belongs to
    fn node(&self) -> NodeId;

    /// Execute an operation at the given isolation level
    async fn execute(&self, op: &Operation, isolation: IsolationLevel) -> Result<QueryOutcome>;

    /// Read back the partition date of a record
    async fn partition_value(&self, key: &RecordKey) -> Result<Option<NaiveDate>>;

    /// Probe connectivity
    async fn ping(&self) -> Result<()>;
}

/// The stores of all three nodes
#[derive(Clone)]
pub struct StoreSet {
    master: Arc<dyn NodeStore>,
    fragment_a: Arc<dyn NodeStore>,
    fragment_b: Arc<dyn NodeStore>,
}

impl StoreSet {
    pub fn new(
        master: Arc<dyn NodeStore>,
        fragment_a: Arc<dyn NodeStore>,
        fragment_b: Arc<dyn NodeStore>,
    ) -> Self {
        Self {
            master,
            fragment_a,
            fragment_b,
        }
    }

    /// In-process stores for every node
    pub fn in_memory(key_column: &str, partition_column: &str) -> Self {
        Self::new(
            Arc::new(MemoryStore::new(NodeId::Master, key_column, partition_column)),
            Arc::new(MemoryStore::new(NodeId::FragmentA, key_column, partition_column)),
            Arc::new(MemoryStore::new(NodeId::FragmentB, key_column, partition_column)),
        )
    }

    /// MariaDB pools for every node. Pools connect lazily so a node that is
    /// down at startup shows up as offline instead of aborting the process.
    pub fn connect(config: &FragStoreConfig) -> Result<Self> {
        let open = |node: NodeId| -> Result<Arc<dyn NodeStore>> {
            Ok(Arc::new(MariaDbStore::new(
                node,
                config.nodes.get(node),
                &config.fragmentation,
            )?))
        };

        Ok(Self::new(
            open(NodeId::Master)?,
            open(NodeId::FragmentA)?,
            open(NodeId::FragmentB)?,
        ))
    }

    /// Store of one node
    pub fn get(&self, node: NodeId) -> &Arc<dyn NodeStore> {
        match node {
            NodeId::Master => &self.master,
            NodeId::FragmentA => &self.fragment_a,
            NodeId::FragmentB => &self.fragment_b,
        }
    }
}

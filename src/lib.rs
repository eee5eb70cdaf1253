//! FragStore - Fragmented MariaDB Simulator
//!
//! Simulates a horizontally-fragmented MariaDB deployment made of one master
//! node and two fragment nodes, to demonstrate replication, isolation levels,
//! locking and failure recovery.
//!
//! # Architecture
//!
//! Every client operation goes through the transaction coordinator. Writes
//! take a per-key write lock, are applied to the node they were sent to and
//! are then replicated eagerly: master writes go to the fragment that owns
//! the record's date, fragment writes go to the master. Reads are admitted
//! according to their isolation level.
//!
//! # Features
//!
//! - Per-key write exclusion with bounded, notification-based waits
//! - Isolation-aware read admission (dirty reads at READ_UNCOMMITTED)
//! - Date-based horizontal fragmentation
//! - Replication ledger with replay when a killed node recovers
//! - Fault injection (kill/recover) per node
//! - HTTP API and `fragctl` command line client

pub mod config;
pub mod error;
pub mod node;
pub mod operation;
pub mod lock;
pub mod store;
pub mod replication;
pub mod coordinator;
pub mod api;

pub use config::FragStoreConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::FragStoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::{NodeId, NodeRegistry, NodeState};
    pub use crate::operation::{IsolationLevel, Operation, OperationKind};
    pub use crate::lock::{LockManager, ReadGate, RecordKey};
    pub use crate::store::{NodeStore, QueryOutcome, StoreSet};
    pub use crate::replication::{ReplicationEngine, ReplicationEntry, ReplicationLedger};
    pub use crate::coordinator::{ExecuteResponse, TransactionCoordinator};
}

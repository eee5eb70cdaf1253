//! Replication Module
//!
//! Fragmentation-aware eager replication of writes between the master and
//! the fragments, plus the ledger used to replay failed attempts when a
//! node recovers.

mod engine;
mod fragmentation;
mod ledger;

pub use engine::ReplicationEngine;
pub use fragmentation::FragmentationRule;
pub use ledger::{
    LedgerStats, ReplayReport, ReplicationEntry, ReplicationLedger, ReplicationStatus, TargetStats,
};

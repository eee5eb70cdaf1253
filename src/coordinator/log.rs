//! Operation Log
//!
//! Bounded history of executed operations, one entry per terminal state.
//! Entries are immutable once appended.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::node::NodeId;
use crate::operation::{IsolationLevel, OperationKind};

/// Final status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Committed,
    Failed,
}

/// One executed operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: u64,
    pub transaction_id: String,
    pub node: NodeId,
    pub kind: OperationKind,
    pub isolation: IsolationLevel,
    pub query: String,
    pub status: OperationStatus,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub result_summary: Option<String>,
    pub replication_ids: Vec<u64>,
    pub lock_wait_ms: u64,
    /// Transaction whose write this one overwrote (last writer wins)
    pub overwrote: Option<String>,
    pub dirty_read: bool,
}

/// Bounded operation history. Oldest entries are evicted first.
pub struct OperationLog {
    entries: RwLock<VecDeque<OperationLogEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an entry, assigning its id
    pub async fn append(&self, mut entry: OperationLogEntry) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entry.id = id;

        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: Option<usize>) -> Vec<OperationLogEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop every entry, returning how many were removed
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tx: &str) -> OperationLogEntry {
        OperationLogEntry {
            id: 0,
            transaction_id: tx.to_string(),
            node: NodeId::Master,
            kind: OperationKind::Read,
            isolation: IsolationLevel::default(),
            query: "SELECT 1".into(),
            status: OperationStatus::Committed,
            error: None,
            error_code: None,
            started_at: Utc::now(),
            duration_ms: 0,
            result_summary: None,
            replication_ids: Vec::new(),
            lock_wait_ms: 0,
            overwrote: None,
            dirty_read: false,
        }
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let log = OperationLog::new(2);
        log.append(entry("tx-1")).await;
        log.append(entry("tx-2")).await;
        log.append(entry("tx-3")).await;

        let recent = log.recent(None).await;
        let ids: Vec<&str> = recent.iter().map(|e| e.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["tx-3", "tx-2"]);
        assert_eq!(log.recent(Some(1)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let log = OperationLog::new(10);
        log.append(entry("tx-1")).await;
        assert_eq!(log.clear().await, 1);
        assert_eq!(log.len().await, 0);
        // Ids keep increasing after a clear
        assert_eq!(log.append(entry("tx-2")).await, 2);
    }
}

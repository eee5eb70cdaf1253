//! Replication Ledger
//!
//! In-memory record of every replication attempt. Failed attempts stay in
//! the ledger until their target recovers and replays them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::Error;
use crate::lock::{LockManager, RecordKey, WriteOwner};
use crate::node::{NodeId, NodeRegistry};
use crate::operation::{IsolationLevel, Operation};
use crate::store::StoreSet;

/// Status of a replication entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    Pending,
    Replicated,
    Failed,
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationStatus::Pending => write!(f, "pending"),
            ReplicationStatus::Replicated => write!(f, "replicated"),
            ReplicationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One replication attempt of a write to one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEntry {
    pub id: u64,
    pub transaction_id: String,
    pub source: NodeId,
    pub target: NodeId,
    pub key: RecordKey,
    pub operation: Operation,
    pub status: ReplicationStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl ReplicationEntry {
    /// New pending entry. The id is assigned when the entry is recorded.
    pub fn pending(
        transaction_id: &str,
        source: NodeId,
        target: NodeId,
        key: RecordKey,
        operation: Operation,
    ) -> Self {
        Self {
            id: 0,
            transaction_id: transaction_id.to_string(),
            source,
            target,
            key,
            operation,
            status: ReplicationStatus::Pending,
            error: None,
            timestamp: Utc::now(),
            recovered_at: None,
        }
    }

    /// Pending -> replicated
    pub fn mark_replicated(&mut self) {
        if self.status == ReplicationStatus::Pending {
            self.status = ReplicationStatus::Replicated;
            self.error = None;
        }
    }

    /// Pending -> failed, or failed -> failed with a newer error.
    /// A replicated entry never goes back to failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.status != ReplicationStatus::Replicated {
            self.status = ReplicationStatus::Failed;
            self.error = Some(error.into());
        }
    }

    /// Failed -> replicated, through replay only
    fn mark_recovered(&mut self, at: DateTime<Utc>) {
        if self.status == ReplicationStatus::Failed {
            self.status = ReplicationStatus::Replicated;
            self.error = None;
            self.recovered_at = Some(at);
        }
    }
}

/// Summary of a replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed_replays: usize,
    pub total_processed: usize,
}

/// Entry counts for one target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStats {
    pub pending: usize,
    pub replicated: usize,
    pub failed: usize,
}

/// Ledger counts by status and by target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub replicated: usize,
    pub failed: usize,
    pub recovered: usize,
    pub by_target: BTreeMap<NodeId, TargetStats>,
}

/// Append-only ledger of replication attempts
pub struct ReplicationLedger {
    entries: RwLock<Vec<ReplicationEntry>>,
    next_id: AtomicU64,
    /// One replay pass per target at a time
    replaying: BTreeMap<NodeId, Mutex<()>>,
}

impl ReplicationLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            replaying: NodeId::ALL.iter().map(|n| (*n, Mutex::new(()))).collect(),
        }
    }

    /// Append an entry, assigning its id
    pub async fn record(&self, mut entry: ReplicationEntry) -> ReplicationEntry {
        let mut entries = self.entries.write().await;
        entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entries.push(entry.clone());
        entry
    }

    /// Record `entry` as failed because its target is faulted. The fault
    /// flag is checked again with the ledger locked: recovery clears the flag
    /// before replay reads the failures, so the entry is either seen by that
    /// replay or not recorded at all. Returns `None` when the target is
    /// available and the caller should apply the entry instead.
    pub async fn record_offline(&self, entry: &ReplicationEntry, registry: &NodeRegistry) -> Option<ReplicationEntry> {
        let mut entries = self.entries.write().await;
        if registry.is_available(entry.target).await {
            return None;
        }

        let mut entry = entry.clone();
        entry.mark_failed(Error::NodeOffline(entry.target).to_string());
        entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entries.push(entry.clone());
        Some(entry)
    }

    /// All entries in append order
    pub async fn entries(&self) -> Vec<ReplicationEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: u64) -> Option<ReplicationEntry> {
        self.entries.read().await.iter().find(|e| e.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Failed entries targeting `node`, in append order
    pub async fn pending_failures_for(&self, node: NodeId) -> Vec<ReplicationEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.target == node && e.status == ReplicationStatus::Failed)
            .cloned()
            .collect()
    }

    async fn update(&self, id: u64, f: impl FnOnce(&mut ReplicationEntry)) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            f(entry);
        }
    }

    /// Reapply every failed entry targeting `node`. Each reapply holds the
    /// write lock of the entry's key. There is no conflict detection: a
    /// replayed write can overwrite state committed after it.
    pub async fn replay(&self, node: NodeId, stores: &StoreSet, locks: &Arc<LockManager>) -> ReplayReport {
        // Concurrent recovers of one node must not reapply the same entries
        let _replaying = match self.replaying.get(&node) {
            Some(guard) => Some(guard.lock().await),
            None => None,
        };
        let failures = self.pending_failures_for(node).await;
        let mut report = ReplayReport::default();

        if failures.is_empty() {
            return report;
        }

        tracing::info!("Replaying {} failed replication(s) to {}", failures.len(), node);
        let store = stores.get(node);

        for entry in failures {
            report.total_processed += 1;

            let owner = WriteOwner {
                transaction_id: format!("replay-{}", entry.id),
                node,
            };
            let outcome = match locks.acquire(entry.key.clone(), owner).await {
                Ok(lock) => {
                    let result = store.execute(&entry.operation, IsolationLevel::default()).await;
                    drop(lock);
                    result
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(_) => {
                    report.replayed += 1;
                    let now = Utc::now();
                    self.update(entry.id, |e| e.mark_recovered(now)).await;
                    tracing::debug!(
                        "Replayed entry {} ({}) to {}",
                        entry.id, entry.transaction_id, node
                    );
                }
                Err(e) => {
                    report.failed_replays += 1;
                    tracing::warn!("Replay of entry {} to {} failed: {}", entry.id, node, e);
                    let reason = e.to_string();
                    self.update(entry.id, |entry| entry.mark_failed(reason)).await;
                }
            }
        }

        tracing::info!(
            "Replay to {} finished: {} replayed, {} failed",
            node, report.replayed, report.failed_replays
        );
        report
    }

    /// Counts by status and by target
    pub async fn stats(&self) -> LedgerStats {
        let entries = self.entries.read().await;
        let mut stats = LedgerStats {
            total: entries.len(),
            ..Default::default()
        };

        for entry in entries.iter() {
            let target = stats.by_target.entry(entry.target).or_default();
            match entry.status {
                ReplicationStatus::Pending => {
                    stats.pending += 1;
                    target.pending += 1;
                }
                ReplicationStatus::Replicated => {
                    stats.replicated += 1;
                    target.replicated += 1;
                }
                ReplicationStatus::Failed => {
                    stats.failed += 1;
                    target.failed += 1;
                }
            }
            if entry.recovered_at.is_some() {
                stats.recovered += 1;
            }
        }

        stats
    }
}

impl Default for ReplicationLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NodeStore};
    use std::time::Duration;

    fn op(sql: &str) -> Operation {
        Operation::parse(sql).unwrap()
    }

    fn failed_entry(tx: &str, target: NodeId, sql: &str) -> ReplicationEntry {
        let operation = op(sql);
        let key = operation.record_key("trans_id");
        let mut entry = ReplicationEntry::pending(tx, NodeId::Master, target, key, operation);
        entry.mark_failed("Node fragmentA is offline");
        entry
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut entry = failed_entry("tx-1", NodeId::FragmentA, "DELETE FROM trans WHERE trans_id = 1");
        assert_eq!(entry.status, ReplicationStatus::Failed);

        entry.mark_failed("still down");
        assert_eq!(entry.error.as_deref(), Some("still down"));

        // Only replay may move failed to replicated
        entry.mark_replicated();
        assert_eq!(entry.status, ReplicationStatus::Failed);

        entry.mark_recovered(Utc::now());
        assert_eq!(entry.status, ReplicationStatus::Replicated);
        assert!(entry.recovered_at.is_some());
        assert!(entry.error.is_none());

        entry.mark_failed("late error");
        assert_eq!(entry.status, ReplicationStatus::Replicated);
    }

    #[tokio::test]
    async fn test_record_assigns_increasing_ids() {
        let ledger = ReplicationLedger::new();
        let a = ledger
            .record(failed_entry("tx-1", NodeId::FragmentA, "DELETE FROM trans WHERE trans_id = 1"))
            .await;
        let b = ledger
            .record(failed_entry("tx-2", NodeId::FragmentB, "DELETE FROM trans WHERE trans_id = 2"))
            .await;
        assert!(b.id > a.id);
        assert_eq!(ledger.pending_failures_for(NodeId::FragmentA).await.len(), 1);
        assert_eq!(ledger.get(b.id).await.unwrap().transaction_id, "tx-2");
    }

    #[tokio::test]
    async fn test_replay_applies_in_append_order() {
        let fragment_a = Arc::new(MemoryStore::new(NodeId::FragmentA, "trans_id", "date"));
        let stores = StoreSet::new(
            Arc::new(MemoryStore::new(NodeId::Master, "trans_id", "date")),
            fragment_a.clone(),
            Arc::new(MemoryStore::new(NodeId::FragmentB, "trans_id", "date")),
        );
        let locks = Arc::new(LockManager::new(Duration::from_millis(100)));
        let ledger = ReplicationLedger::new();

        ledger
            .record(failed_entry(
                "tx-1",
                NodeId::FragmentA,
                "INSERT INTO trans (trans_id, date, amount) VALUES (1, '1995-03-01', 10)",
            ))
            .await;
        ledger
            .record(failed_entry(
                "tx-2",
                NodeId::FragmentA,
                "UPDATE trans SET amount = 20 WHERE trans_id = 1",
            ))
            .await;

        let report = ledger.replay(NodeId::FragmentA, &stores, &locks).await;
        assert_eq!(
            report,
            ReplayReport {
                replayed: 2,
                failed_replays: 0,
                total_processed: 2,
            }
        );

        let row = fragment_a.row("trans", "1").await.unwrap();
        assert_eq!(row["amount"], crate::operation::Value::Int(20));
        assert!(ledger.pending_failures_for(NodeId::FragmentA).await.is_empty());
        assert!(locks.active_markers().is_empty());

        let stats = ledger.stats().await;
        assert_eq!(stats.replicated, 2);
        assert_eq!(stats.recovered, 2);
    }

    #[tokio::test]
    async fn test_failed_replay_keeps_entry_failed_with_new_error() {
        let fragment_b = Arc::new(MemoryStore::new(NodeId::FragmentB, "trans_id", "date"));
        fragment_b.set_reachable(false);
        let stores = StoreSet::new(
            Arc::new(MemoryStore::new(NodeId::Master, "trans_id", "date")),
            Arc::new(MemoryStore::new(NodeId::FragmentA, "trans_id", "date")),
            fragment_b,
        );
        let locks = Arc::new(LockManager::new(Duration::from_millis(100)));
        let ledger = ReplicationLedger::new();
        let entry = ledger
            .record(failed_entry("tx-1", NodeId::FragmentB, "DELETE FROM trans WHERE trans_id = 1"))
            .await;

        let report = ledger.replay(NodeId::FragmentB, &stores, &locks).await;
        assert_eq!(report.failed_replays, 1);
        assert_eq!(report.replayed, 0);

        let entry = ledger.get(entry.id).await.unwrap();
        assert_eq!(entry.status, ReplicationStatus::Failed);
        assert!(entry.error.unwrap().contains("Connection refused"));
        assert!(entry.recovered_at.is_none());
    }

    #[tokio::test]
    async fn test_replay_overwrites_newer_state() {
        let fragment_a = Arc::new(MemoryStore::new(NodeId::FragmentA, "trans_id", "date"));
        let stores = StoreSet::new(
            Arc::new(MemoryStore::new(NodeId::Master, "trans_id", "date")),
            fragment_a.clone(),
            Arc::new(MemoryStore::new(NodeId::FragmentB, "trans_id", "date")),
        );
        let locks = Arc::new(LockManager::new(Duration::from_millis(100)));
        let ledger = ReplicationLedger::new();

        let insert = op("INSERT INTO trans (trans_id, date, amount) VALUES (1, '1995-03-01', 5)");
        fragment_a.execute(&insert, IsolationLevel::default()).await.unwrap();

        // Missed while fragment A was down
        ledger
            .record(failed_entry("tx-old", NodeId::FragmentA, "UPDATE trans SET amount = 10 WHERE trans_id = 1"))
            .await;

        // Newer write lands directly once A is reachable again
        let newer = op("UPDATE trans SET amount = 30 WHERE trans_id = 1");
        fragment_a.execute(&newer, IsolationLevel::default()).await.unwrap();

        let report = ledger.replay(NodeId::FragmentA, &stores, &locks).await;
        assert_eq!(report.replayed, 1);

        // No conflict detection: the stale value wins
        let row = fragment_a.row("trans", "1").await.unwrap();
        assert_eq!(row["amount"], crate::operation::Value::Int(10));
    }

    #[tokio::test]
    async fn test_record_offline_rechecks_fault_flag() {
        let registry = NodeRegistry::new();
        let ledger = ReplicationLedger::new();
        let operation = op("DELETE FROM trans WHERE trans_id = 404");
        let entry = ReplicationEntry::pending(
            "tx-1",
            NodeId::Master,
            NodeId::FragmentA,
            operation.record_key("trans_id"),
            operation,
        );

        assert!(ledger.record_offline(&entry, &registry).await.is_none());
        assert_eq!(ledger.len().await, 0);

        registry.mark_failed(NodeId::FragmentA).await;
        let recorded = ledger.record_offline(&entry, &registry).await.unwrap();
        assert_eq!(recorded.status, ReplicationStatus::Failed);
        assert_eq!(recorded.error.as_deref(), Some("Node fragmentA is offline"));
        assert_eq!(ledger.pending_failures_for(NodeId::FragmentA).await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_replays_apply_each_entry_once() {
        let fragment_a = Arc::new(MemoryStore::new(NodeId::FragmentA, "trans_id", "date"));
        fragment_a.set_write_delay(Duration::from_millis(50));
        let stores = StoreSet::new(
            Arc::new(MemoryStore::new(NodeId::Master, "trans_id", "date")),
            fragment_a.clone(),
            Arc::new(MemoryStore::new(NodeId::FragmentB, "trans_id", "date")),
        );
        let locks = Arc::new(LockManager::new(Duration::from_secs(2)));
        let ledger = ReplicationLedger::new();
        ledger
            .record(failed_entry(
                "tx-1",
                NodeId::FragmentA,
                "INSERT INTO trans (trans_id, date, amount) VALUES (1, '1995-03-01', 10)",
            ))
            .await;

        let (first, second) = tokio::join!(
            ledger.replay(NodeId::FragmentA, &stores, &locks),
            ledger.replay(NodeId::FragmentA, &stores, &locks),
        );

        assert_eq!(first.replayed + second.replayed, 1);
        assert_eq!(first.failed_replays + second.failed_replays, 0);
        assert_eq!(fragment_a.history().await.len(), 1);
        assert_eq!(ledger.stats().await.recovered, 1);
    }

    #[tokio::test]
    async fn test_stats_by_target() {
        let ledger = ReplicationLedger::new();
        let mut ok = ReplicationEntry::pending(
            "tx-1",
            NodeId::Master,
            NodeId::FragmentB,
            RecordKey::row("trans", "1"),
            op("DELETE FROM trans WHERE trans_id = 1"),
        );
        ok.mark_replicated();
        ledger.record(ok).await;
        ledger
            .record(failed_entry("tx-2", NodeId::FragmentA, "DELETE FROM trans WHERE trans_id = 2"))
            .await;

        let stats = ledger.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_target[&NodeId::FragmentB].replicated, 1);
        assert_eq!(stats.by_target[&NodeId::FragmentA].failed, 1);
    }
}

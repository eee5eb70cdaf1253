//! Replication Engine
//!
//! Eager, per-write replication following the fragmentation rule. Writes on
//! the master go to the fragment owning the record; writes on a fragment go
//! to the master. Only the fragmented table is routed by date: master writes
//! to any other table go to both fragments. Failures are recorded, never
//! raised.

use std::sync::Arc;
use chrono::NaiveDate;
use futures::future::join_all;

use super::{FragmentationRule, ReplicationEntry, ReplicationLedger};
use crate::config::FragmentationConfig;
use crate::lock::RecordKey;
use crate::node::{NodeId, NodeRegistry};
use crate::operation::{IsolationLevel, Operation};
use crate::store::StoreSet;

/// Applies committed writes to their replication targets
pub struct ReplicationEngine {
    rule: FragmentationRule,
    table: String,
    partition_column: String,
    registry: Arc<NodeRegistry>,
    stores: StoreSet,
    ledger: Arc<ReplicationLedger>,
}

impl ReplicationEngine {
    pub fn new(
        config: &FragmentationConfig,
        registry: Arc<NodeRegistry>,
        stores: StoreSet,
        ledger: Arc<ReplicationLedger>,
    ) -> Self {
        Self {
            rule: FragmentationRule::from_config(config),
            table: config.table.clone(),
            partition_column: config.partition_column.clone(),
            registry,
            stores,
            ledger,
        }
    }

    pub fn rule(&self) -> &FragmentationRule {
        &self.rule
    }

    /// Whether `key` belongs to the table split across the fragments
    pub fn is_fragmented(&self, key: &RecordKey) -> bool {
        key.table.eq_ignore_ascii_case(&self.table)
    }

    /// Partition date of the record a write touches. The value carried by
    /// the operation wins; otherwise it is read back from the source store.
    /// Must run before the write is applied so deletes still find the row.
    /// Records outside the fragmented table have no partition.
    pub async fn resolve_partition(&self, source: NodeId, op: &Operation, key: &RecordKey) -> Option<NaiveDate> {
        if !self.is_fragmented(key) {
            return None;
        }
        if let Some(date) = op.partition_value(&self.partition_column) {
            return Some(date);
        }
        if source.is_fragment() || key.is_table_wide() {
            return None;
        }

        match self.stores.get(source).partition_value(key).await {
            Ok(date) => date,
            Err(e) => {
                tracing::warn!("Could not read back partition of {} on {}: {}", key, source, e);
                None
            }
        }
    }

    /// Replicate a write applied on `source` to its targets. Targets are
    /// attempted concurrently; each attempt is appended to the ledger as
    /// soon as its outcome is known.
    pub async fn replicate(
        &self,
        source: NodeId,
        transaction_id: &str,
        op: &Operation,
        key: &RecordKey,
        partition: Option<NaiveDate>,
    ) -> Vec<ReplicationEntry> {
        if !op.is_write() {
            return Vec::new();
        }

        let targets = self.rule.targets(source, partition);
        tracing::debug!("Replicating {} from {} to {:?}", transaction_id, source, targets);

        let attempts = targets.into_iter().map(|target| {
            let entry = ReplicationEntry::pending(transaction_id, source, target, key.clone(), op.clone());
            self.apply_to(entry)
        });
        join_all(attempts).await
    }

    async fn apply_to(&self, mut entry: ReplicationEntry) -> ReplicationEntry {
        let target = entry.target;

        if let Some(recorded) = self.ledger.record_offline(&entry, &self.registry).await {
            tracing::warn!(
                "Replication of {} to {} skipped: node offline",
                entry.transaction_id, target
            );
            return recorded;
        }

        match self
            .stores
            .get(target)
            .execute(&entry.operation, IsolationLevel::default())
            .await
        {
            Ok(_) => entry.mark_replicated(),
            Err(e) => {
                tracing::warn!("Replication of {} to {} failed: {}", entry.transaction_id, target, e);
                entry.mark_failed(e.to_string());
            }
        }
        self.ledger.record(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::replication::ReplicationStatus;
    use crate::store::{MemoryStore, NodeStore};

    struct Fixture {
        engine: ReplicationEngine,
        registry: Arc<NodeRegistry>,
        ledger: Arc<ReplicationLedger>,
        master: Arc<MemoryStore>,
        fragment_a: Arc<MemoryStore>,
        fragment_b: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let master = Arc::new(MemoryStore::new(NodeId::Master, "trans_id", "date"));
        let fragment_a = Arc::new(MemoryStore::new(NodeId::FragmentA, "trans_id", "date"));
        let fragment_b = Arc::new(MemoryStore::new(NodeId::FragmentB, "trans_id", "date"));
        let stores = StoreSet::new(master.clone(), fragment_a.clone(), fragment_b.clone());
        let registry = Arc::new(NodeRegistry::new());
        let ledger = Arc::new(ReplicationLedger::new());
        let engine = ReplicationEngine::new(
            &FragmentationConfig::default(),
            Arc::clone(&registry),
            stores,
            Arc::clone(&ledger),
        );
        Fixture {
            engine,
            registry,
            ledger,
            master,
            fragment_a,
            fragment_b,
        }
    }

    async fn write(f: &Fixture, source: NodeId, tx: &str, sql: &str) -> Vec<ReplicationEntry> {
        let op = Operation::parse(sql).unwrap();
        let key = op.record_key("trans_id");
        let partition = f.engine.resolve_partition(source, &op, &key).await;
        let store: &MemoryStore = match source {
            NodeId::Master => f.master.as_ref(),
            NodeId::FragmentA => f.fragment_a.as_ref(),
            NodeId::FragmentB => f.fragment_b.as_ref(),
        };
        store.execute(&op, IsolationLevel::default()).await.unwrap();
        f.engine.replicate(source, tx, &op, &key, partition).await
    }

    #[tokio::test]
    async fn test_insert_routes_by_carried_date() {
        let f = fixture();
        let entries = write(
            &f,
            NodeId::Master,
            "tx-1",
            "INSERT INTO trans (trans_id, date, amount) VALUES (1, '1996-05-15', 100)",
        )
        .await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, NodeId::FragmentA);
        assert_eq!(entries[0].status, ReplicationStatus::Replicated);
        assert!(f.fragment_a.row("trans", "1").await.is_some());
        assert_eq!(f.fragment_b.len("trans").await, 0);
    }

    #[tokio::test]
    async fn test_update_reads_partition_back_from_master() {
        let f = fixture();
        write(
            &f,
            NodeId::Master,
            "tx-1",
            "INSERT INTO trans (trans_id, date, amount) VALUES (2, '1998-02-01', 5)",
        )
        .await;
        let entries = write(&f, NodeId::Master, "tx-2", "UPDATE trans SET amount = 7 WHERE trans_id = 2").await;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, NodeId::FragmentB);
        assert_eq!(entries[0].status, ReplicationStatus::Replicated);
    }

    #[tokio::test]
    async fn test_unresolved_partition_targets_both_fragments() {
        let f = fixture();
        let entries = write(&f, NodeId::Master, "tx-1", "DELETE FROM trans WHERE trans_id = 404").await;
        let targets: Vec<NodeId> = entries.iter().map(|e| e.target).collect();
        assert_eq!(targets, vec![NodeId::FragmentA, NodeId::FragmentB]);
        assert_eq!(f.ledger.len().await, 2);
    }

    #[tokio::test]
    async fn test_fragment_write_replicates_to_master() {
        let f = fixture();
        let entries = write(
            &f,
            NodeId::FragmentB,
            "tx-1",
            "INSERT INTO trans (trans_id, date) VALUES (3, '1998-01-01')",
        )
        .await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, NodeId::Master);
        assert!(f.master.row("trans", "3").await.is_some());
    }

    #[tokio::test]
    async fn test_offline_target_fails_without_attempt() {
        let f = fixture();
        f.registry.mark_failed(NodeId::FragmentA).await;

        let entries = write(
            &f,
            NodeId::Master,
            "tx-1",
            "INSERT INTO trans (trans_id, date) VALUES (4, '1995-01-01')",
        )
        .await;

        assert_eq!(entries[0].status, ReplicationStatus::Failed);
        assert_eq!(entries[0].error.as_deref(), Some("Node fragmentA is offline"));
        assert!(f.fragment_a.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_entry_recorded_before_slow_target_finishes() {
        let f = fixture();
        f.registry.mark_failed(NodeId::FragmentA).await;
        f.fragment_b.set_write_delay(Duration::from_millis(200));

        let op = Operation::parse("UPDATE trans SET amount = 1 WHERE trans_id = 404").unwrap();
        let key = op.record_key("trans_id");
        let (entries, early) = tokio::join!(
            f.engine.replicate(NodeId::Master, "tx-1", &op, &key, None),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.ledger.pending_failures_for(NodeId::FragmentA).await
            },
        );

        assert_eq!(early.len(), 1);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, early[0].id);
    }

    #[tokio::test]
    async fn test_other_tables_replicate_to_both_fragments() {
        let f = fixture();
        let entries = write(
            &f,
            NodeId::Master,
            "tx-1",
            "INSERT INTO audit (trans_id, date, note) VALUES (1, '1996-05-15', 'x')",
        )
        .await;

        let targets: Vec<NodeId> = entries.iter().map(|e| e.target).collect();
        assert_eq!(targets, vec![NodeId::FragmentA, NodeId::FragmentB]);
        assert!(f.fragment_a.row("audit", "1").await.is_some());
        assert!(f.fragment_b.row("audit", "1").await.is_some());
    }

    #[tokio::test]
    async fn test_read_produces_no_entries() {
        let f = fixture();
        let op = Operation::parse("SELECT * FROM trans WHERE trans_id = 1").unwrap();
        let key = op.record_key("trans_id");
        let entries = f.engine.replicate(NodeId::Master, "tx-1", &op, &key, None).await;
        assert!(entries.is_empty());
        assert_eq!(f.ledger.len().await, 0);
    }
}

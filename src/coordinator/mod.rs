//! Transaction Coordinator
//!
//! Runs one client operation through the pipeline:
//!
//! ```text
//! Start -> AvailabilityCheck -> Rejected
//!                            -> Admitted -> Gate -> Applying -> Committed
//!                            -> Admitted -> Lock -> Applying -> Replicating -> Committed
//!                                                            -> Aborted (store error)
//! ```
//!
//! Every terminal state appends exactly one entry to the operation log.

mod log;

pub use log::{OperationLog, OperationLogEntry, OperationStatus};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

use crate::config::{CoordinatorConfig, FragStoreConfig, FragmentationConfig};
use crate::error::{Error, Result};
use crate::lock::{LockManager, ReadGate, RecordKey, WriteMarker, WriteOwner};
use crate::node::{NodeId, NodeRegistry, NodeState};
use crate::operation::{IsolationLevel, Operation, OperationKind};
use crate::replication::{
    FragmentationRule, LedgerStats, ReplicationEngine, ReplicationEntry, ReplicationLedger,
    ReplicationStatus,
};
use crate::store::{QueryOutcome, StoreSet};

/// Per-target replication result returned to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSummary {
    pub entry_id: u64,
    pub target: NodeId,
    pub status: ReplicationStatus,
    pub error: Option<String>,
}

impl From<&ReplicationEntry> for ReplicationSummary {
    fn from(entry: &ReplicationEntry) -> Self {
        Self {
            entry_id: entry.id,
            target: entry.target,
            status: entry.status,
            error: entry.error.clone(),
        }
    }
}

/// Response of a committed operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub transaction_id: String,
    pub node: NodeId,
    pub kind: OperationKind,
    pub isolation: IsolationLevel,
    pub result: QueryOutcome,
    pub replication: Vec<ReplicationSummary>,
    /// Time spent waiting for the write marker or for read admission
    pub lock_wait_ms: u64,
    /// Transaction this write waited behind and overwrote (last writer wins)
    pub overwrote: Option<String>,
    /// Read ran while a write on the same key was in flight
    pub dirty_read: bool,
    pub duration_ms: u64,
}

/// Result of kill or recover
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeActionResponse {
    pub node: NodeId,
    /// False when the node was already in the requested state
    pub changed: bool,
    pub state: Option<NodeState>,
}

/// Result of recover, including the replay pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverResponse {
    pub node: NodeId,
    pub changed: bool,
    pub replayed: usize,
    pub failed_replays: usize,
    pub total_processed: usize,
}

/// Outcome details that go into the log entry
#[derive(Default)]
struct Trace {
    lock_wait_ms: u64,
    overwrote: Option<String>,
    dirty_read: bool,
    replication_ids: Vec<u64>,
}

/// Orchestrates reads and writes across the three nodes
pub struct TransactionCoordinator {
    key_column: String,
    health_interval: Duration,
    registry: Arc<NodeRegistry>,
    locks: Arc<LockManager>,
    gate: ReadGate,
    ledger: Arc<ReplicationLedger>,
    engine: ReplicationEngine,
    stores: StoreSet,
    log: OperationLog,
}

impl TransactionCoordinator {
    pub fn new(config: &FragStoreConfig, stores: StoreSet) -> Self {
        Self::with_settings(&config.fragmentation, &config.coordinator, stores)
    }

    pub fn with_settings(
        fragmentation: &FragmentationConfig,
        coordinator: &CoordinatorConfig,
        stores: StoreSet,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        let locks = Arc::new(LockManager::new(coordinator.lock_timeout()));
        let ledger = Arc::new(ReplicationLedger::new());
        let engine = ReplicationEngine::new(
            fragmentation,
            Arc::clone(&registry),
            stores.clone(),
            Arc::clone(&ledger),
        );

        Self {
            key_column: fragmentation.key_column.clone(),
            health_interval: coordinator.health_check_interval(),
            gate: ReadGate::new(Arc::clone(&locks)),
            registry,
            locks,
            ledger,
            engine,
            stores,
            log: OperationLog::new(coordinator.max_log_entries),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn rule(&self) -> &FragmentationRule {
        self.engine.rule()
    }

    /// Execute one operation on `node`
    pub async fn execute(&self, node: NodeId, query: &str, isolation: IsolationLevel) -> Result<ExecuteResponse> {
        let op = Operation::parse(query)?;
        let transaction_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = std::time::Instant::now();
        let mut trace = Trace::default();

        let outcome = self
            .run(node, &transaction_id, &op, isolation, &mut trace)
            .await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        let (status, error, error_code, result_summary) = match &outcome {
            Ok(result) => (OperationStatus::Committed, None, None, Some(result.summary())),
            Err(e) => {
                if let Error::LockTimeout { waited_ms, .. } | Error::ReadTimeout { waited_ms, .. } = e {
                    trace.lock_wait_ms = *waited_ms;
                }
                (
                    OperationStatus::Failed,
                    Some(e.to_string()),
                    Some(e.code().to_string()),
                    None,
                )
            }
        };

        self.log
            .append(OperationLogEntry {
                id: 0,
                transaction_id: transaction_id.clone(),
                node,
                kind: op.kind,
                isolation,
                query: op.summary().to_string(),
                status,
                error,
                error_code,
                started_at,
                duration_ms,
                result_summary,
                replication_ids: trace.replication_ids.clone(),
                lock_wait_ms: trace.lock_wait_ms,
                overwrote: trace.overwrote.clone(),
                dirty_read: trace.dirty_read,
            })
            .await;

        let result = outcome?;
        let replication = self.replication_summaries(&trace.replication_ids).await;

        Ok(ExecuteResponse {
            transaction_id,
            node,
            kind: op.kind,
            isolation,
            result,
            replication,
            lock_wait_ms: trace.lock_wait_ms,
            overwrote: trace.overwrote,
            dirty_read: trace.dirty_read,
            duration_ms,
        })
    }

    async fn run(
        &self,
        node: NodeId,
        transaction_id: &str,
        op: &Operation,
        isolation: IsolationLevel,
        trace: &mut Trace,
    ) -> Result<QueryOutcome> {
        if !self.registry.is_available(node).await {
            tracing::debug!("Rejected {} on {}: node offline", transaction_id, node);
            return Err(Error::NodeOffline(node));
        }

        let key = op.record_key(&self.key_column);
        match op.kind {
            OperationKind::Read => self.run_read(node, op, &key, isolation, trace).await,
            OperationKind::Write => {
                self.run_write(node, transaction_id, op, &key, isolation, trace)
                    .await
            }
        }
    }

    async fn run_read(
        &self,
        node: NodeId,
        op: &Operation,
        key: &RecordKey,
        isolation: IsolationLevel,
        trace: &mut Trace,
    ) -> Result<QueryOutcome> {
        let admission = self.gate.admit(key, isolation).await?;
        trace.lock_wait_ms = admission.waited.as_millis() as u64;
        trace.dirty_read = admission.dirty;

        self.stores.get(node).execute(op, isolation).await
    }

    async fn run_write(
        &self,
        node: NodeId,
        transaction_id: &str,
        op: &Operation,
        key: &RecordKey,
        isolation: IsolationLevel,
        trace: &mut Trace,
    ) -> Result<QueryOutcome> {
        let owner = WriteOwner {
            transaction_id: transaction_id.to_string(),
            node,
        };
        let lock = self.locks.acquire(key.clone(), owner).await?;
        trace.lock_wait_ms = lock.waited().as_millis() as u64;
        trace.overwrote = lock.contended_with().map(|o| o.transaction_id.clone());

        // Resolved before applying so a delete can still read the row back
        let partition = self.engine.resolve_partition(node, op, key).await;

        let result = match self.stores.get(node).execute(op, isolation).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Write {} on {} failed: {}", transaction_id, node, e);
                lock.release();
                return Err(e);
            }
        };

        if let Some(previous) = &trace.overwrote {
            tracing::info!(
                "Write {} on {} overwrote transaction {} (last writer wins)",
                transaction_id, key, previous
            );
        }

        let entries = self
            .engine
            .replicate(node, transaction_id, op, key, partition)
            .await;
        trace.replication_ids = entries.iter().map(|e| e.id).collect();

        lock.release();
        Ok(result)
    }

    async fn replication_summaries(&self, ids: &[u64]) -> Vec<ReplicationSummary> {
        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.ledger.get(*id).await {
                summaries.push(ReplicationSummary::from(&entry));
            }
        }
        summaries
    }

    /// Inject a fault: the node rejects operations and replication targets
    /// until recovered. Idempotent.
    pub async fn kill(&self, node: NodeId) -> NodeActionResponse {
        let changed = self.registry.mark_failed(node).await;
        NodeActionResponse {
            node,
            changed,
            state: self.registry.get(node).await,
        }
    }

    /// Clear the fault flag and replay failed replications to the node
    pub async fn recover(&self, node: NodeId) -> RecoverResponse {
        let changed = self.registry.mark_recovered(node).await;
        let report = self.ledger.replay(node, &self.stores, &self.locks).await;
        RecoverResponse {
            node,
            changed,
            replayed: report.replayed,
            failed_replays: report.failed_replays,
            total_processed: report.total_processed,
        }
    }

    /// Probe every node and return the resulting states
    pub async fn health(&self) -> BTreeMap<NodeId, NodeState> {
        self.registry.health_check(&self.stores).await
    }

    /// Current node states without probing
    pub async fn node_states(&self) -> BTreeMap<NodeId, NodeState> {
        self.registry.snapshot().await
    }

    pub async fn ledger(&self) -> Vec<ReplicationEntry> {
        self.ledger.entries().await
    }

    pub async fn ledger_stats(&self) -> LedgerStats {
        self.ledger.stats().await
    }

    pub fn locks(&self) -> Vec<WriteMarker> {
        self.locks.active_markers()
    }

    pub async fn logs(&self, limit: Option<usize>) -> Vec<OperationLogEntry> {
        self.log.recent(limit).await
    }

    pub async fn clear_logs(&self) -> usize {
        self.log.clear().await
    }

    /// Probe stores on an interval so `last_check` and reachability stay
    /// current. Fault flags are not touched.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(coordinator.health_interval);
            loop {
                ticker.tick().await;
                // Reachability transitions are logged by the registry
                coordinator.health().await;
            }
        })
    }

    /// Time of the last connectivity probe of `node`
    pub async fn last_check(&self, node: NodeId) -> Option<DateTime<Utc>> {
        self.registry.get(node).await.and_then(|s| s.last_check)
    }
}

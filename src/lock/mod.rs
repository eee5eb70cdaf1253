//! Lock Module
//!
//! Per-key write exclusion and isolation-aware read admission.
//!
//! Every in-flight write holds an active write marker on its record key.
//! A second writer on an overlapping key waits until the marker is released
//! or the lock timeout elapses. A table-wide key overlaps every row key of
//! its table. Waiters are woken by notification on release. Locks are
//! advisory and local to this process.

mod gate;

pub use gate::{ReadAdmission, ReadGate};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::node::NodeId;

/// Identifier of a logical row: the unit of locking and replication targeting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    /// Row id, or `None` for statements that do not pin a single row
    pub id: Option<String>,
}

impl RecordKey {
    pub fn row(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: Some(id.into()),
        }
    }

    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: None,
        }
    }

    pub fn is_table_wide(&self) -> bool {
        self.id.is_none()
    }

    /// Whether a write on `self` and an access to `other` touch a common row.
    /// A table-wide key overlaps every key of its table.
    pub fn overlaps(&self, other: &RecordKey) -> bool {
        self.table == other.table
            && (self.is_table_wide() || other.is_table_wide() || self.id == other.id)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.table, id),
            None => write!(f, "{}/*", self.table),
        }
    }
}

/// Requester holding or waiting for a write marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOwner {
    pub transaction_id: String,
    pub node: NodeId,
}

/// Active write marker: at most one per key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteMarker {
    pub key: RecordKey,
    pub owner: WriteOwner,
    pub started_at: DateTime<Utc>,
}

/// Per-key write lock manager
pub struct LockManager {
    markers: Mutex<HashMap<RecordKey, WriteMarker>>,
    released: Notify,
    timeout: Duration,
}

impl LockManager {
    /// Create a lock manager whose waits are bounded by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            markers: Mutex::new(HashMap::new()),
            released: Notify::new(),
            timeout,
        }
    }

    /// Bound on acquire and read admission waits
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn markers(&self) -> MutexGuard<'_, HashMap<RecordKey, WriteMarker>> {
        // The map is never left half-updated, so a poisoned lock is still usable
        self.markers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Oldest marker overlapping `key` held by a transaction other than `owner`
    fn blocker<'a>(
        markers: &'a HashMap<RecordKey, WriteMarker>,
        key: &RecordKey,
        owner: Option<&str>,
    ) -> Option<&'a WriteMarker> {
        markers
            .values()
            .filter(|m| m.key.overlaps(key) && Some(m.owner.transaction_id.as_str()) != owner)
            .min_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)))
    }

    /// Acquire the write marker for `key`, waiting while another
    /// transaction holds an overlapping one.
    pub async fn acquire(self: &Arc<Self>, key: RecordKey, owner: WriteOwner) -> Result<WriteLock> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut contended_with: Option<WriteOwner> = None;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before inspecting the map so a release in between is not missed
            notified.as_mut().enable();

            {
                let mut markers = self.markers();
                let blocker = Self::blocker(&markers, &key, Some(owner.transaction_id.as_str()))
                    .map(|m| m.owner.clone());
                match blocker {
                    None if markers.contains_key(&key) => {
                        // Already held by this transaction
                        return Ok(WriteLock {
                            manager: Arc::clone(self),
                            key,
                            waited: started.elapsed(),
                            contended_with,
                            held: false,
                        });
                    }
                    Some(holder) => {
                        if contended_with.as_ref() != Some(&holder) {
                            tracing::debug!(
                                "Write on {} by {} waiting for transaction {}",
                                key, owner.transaction_id, holder.transaction_id
                            );
                        }
                        contended_with = Some(holder);
                    }
                    None => {
                        markers.insert(
                            key.clone(),
                            WriteMarker {
                                key: key.clone(),
                                owner,
                                started_at: Utc::now(),
                            },
                        );
                        return Ok(WriteLock {
                            manager: Arc::clone(self),
                            key,
                            waited: started.elapsed(),
                            contended_with,
                            held: true,
                        });
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let holder = contended_with
                    .map(|o| o.transaction_id)
                    .unwrap_or_default();
                tracing::warn!("Lock timeout on {} (held by {})", key, holder);
                return Err(Error::LockTimeout {
                    key,
                    holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Remove the marker for `key` and wake waiters. Returns the removed marker.
    pub fn release(&self, key: &RecordKey) -> Option<WriteMarker> {
        let removed = self.markers().remove(key);
        if removed.is_some() {
            self.released.notify_waiters();
        }
        removed
    }

    /// Wait until no marker overlaps `key`. Returns how long it waited, or
    /// `None` if the deadline passed first.
    pub(crate) async fn wait_until_clear(&self, key: &RecordKey, deadline: Instant) -> Option<Duration> {
        let started = Instant::now();
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_locked(key) {
                return Some(started.elapsed());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Whether any in-flight write overlaps `key`
    pub fn is_locked(&self, key: &RecordKey) -> bool {
        Self::blocker(&self.markers(), key, None).is_some()
    }

    /// Marker currently held on `key`
    pub fn marker(&self, key: &RecordKey) -> Option<WriteMarker> {
        self.markers().get(key).cloned()
    }

    /// All active markers, oldest first
    pub fn active_markers(&self) -> Vec<WriteMarker> {
        let mut markers: Vec<WriteMarker> = self.markers().values().cloned().collect();
        markers.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.key.cmp(&b.key)));
        markers
    }
}

/// Held write marker. Released on drop.
pub struct WriteLock {
    manager: Arc<LockManager>,
    key: RecordKey,
    waited: Duration,
    contended_with: Option<WriteOwner>,
    /// False when the same transaction already held the marker
    held: bool,
}

impl WriteLock {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Time spent waiting for the marker
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Last transaction this writer waited behind. Its write was committed
    /// first and is overwritten by ours (last writer wins).
    pub fn contended_with(&self) -> Option<&WriteOwner> {
        self.contended_with.as_ref()
    }

    /// Release explicitly
    pub fn release(self) {}
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if self.held {
            self.manager.release(&self.key);
        }
    }
}

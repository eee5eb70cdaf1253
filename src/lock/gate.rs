//! Read Gate
//!
//! Decides whether a read may run while a write on an overlapping key is in
//! flight. A table-wide read overlaps every row write of its table.
//! READ_UNCOMMITTED reads proceed (dirty read). All stricter levels
//! share one policy: wait for the marker to clear, bounded by the lock
//! timeout.

use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::time::Instant;

use super::{LockManager, RecordKey};
use crate::error::{Error, Result};
use crate::operation::IsolationLevel;

/// Outcome of read admission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReadAdmission {
    /// Time spent waiting for an in-flight write
    pub waited: Duration,
    /// The read ran while a write on the key was in flight
    pub dirty: bool,
}

/// Isolation-aware read admission
pub struct ReadGate {
    locks: Arc<LockManager>,
}

impl ReadGate {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self { locks }
    }

    /// Admit a read on `key` at `isolation`
    pub async fn admit(&self, key: &RecordKey, isolation: IsolationLevel) -> Result<ReadAdmission> {
        if !self.locks.is_locked(key) {
            return Ok(ReadAdmission::default());
        }

        if !isolation.waits_for_writers() {
            tracing::debug!("Dirty read on {} at {}", key, isolation);
            return Ok(ReadAdmission {
                waited: Duration::ZERO,
                dirty: true,
            });
        }

        let started = Instant::now();
        let deadline = started + self.locks.timeout();
        match self.locks.wait_until_clear(key, deadline).await {
            Some(waited) => Ok(ReadAdmission {
                waited,
                dirty: false,
            }),
            None => {
                tracing::warn!("Read on {} at {} timed out behind in-flight write", key, isolation);
                Err(Error::ReadTimeout {
                    key: key.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::WriteOwner;
    use crate::node::NodeId;

    fn setup(timeout_ms: u64) -> (Arc<LockManager>, ReadGate) {
        let locks = Arc::new(LockManager::new(Duration::from_millis(timeout_ms)));
        let gate = ReadGate::new(Arc::clone(&locks));
        (locks, gate)
    }

    fn writer() -> WriteOwner {
        WriteOwner {
            transaction_id: "writer".into(),
            node: NodeId::Master,
        }
    }

    #[tokio::test]
    async fn test_unlocked_key_admits_every_level() {
        let (_, gate) = setup(50);
        let key = RecordKey::row("trans", "1");
        for level in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            let admission = gate.admit(&key, level).await.unwrap();
            assert_eq!(admission, ReadAdmission::default());
        }
    }

    #[tokio::test]
    async fn test_read_uncommitted_does_not_wait() {
        let (locks, gate) = setup(5_000);
        let key = RecordKey::row("trans", "1");
        let _write = locks.acquire(key.clone(), writer()).await.unwrap();

        let started = std::time::Instant::now();
        let admission = gate.admit(&key, IsolationLevel::ReadUncommitted).await.unwrap();
        assert!(admission.dirty);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_strict_levels_time_out_behind_writer() {
        let (locks, gate) = setup(40);
        let key = RecordKey::row("trans", "1");
        let _write = locks.acquire(key.clone(), writer()).await.unwrap();

        for level in [
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            let err = gate.admit(&key, level).await.unwrap_err();
            assert!(matches!(err, Error::ReadTimeout { waited_ms, .. } if waited_ms >= 30));
        }
    }

    #[tokio::test]
    async fn test_strict_read_proceeds_after_release() {
        let (locks, gate) = setup(2_000);
        let key = RecordKey::row("trans", "1");
        let write = locks.acquire(key.clone(), writer()).await.unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(write);
        });

        let admission = gate.admit(&key, IsolationLevel::Serializable).await.unwrap();
        assert!(!admission.dirty);
        assert!(admission.waited >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_table_wide_read_waits_for_row_write() {
        let (locks, gate) = setup(2_000);
        let write = locks.acquire(RecordKey::row("trans", "9001"), writer()).await.unwrap();
        let scan = RecordKey::table("trans");

        let dirty = gate.admit(&scan, IsolationLevel::ReadUncommitted).await.unwrap();
        assert!(dirty.dirty);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(write);
        });

        let admission = gate.admit(&scan, IsolationLevel::Serializable).await.unwrap();
        assert!(!admission.dirty);
        assert!(admission.waited >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_row_read_waits_for_table_wide_write() {
        let (locks, gate) = setup(40);
        let _write = locks.acquire(RecordKey::table("trans"), writer()).await.unwrap();

        let err = gate
            .admit(&RecordKey::row("trans", "1"), IsolationLevel::ReadCommitted)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadTimeout { .. }));

        let other = gate
            .admit(&RecordKey::row("accounts", "1"), IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        assert_eq!(other, ReadAdmission::default());
    }
}

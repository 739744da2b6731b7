//! In-memory [`ShardBackend`] for the test suites.
//!
//! `MockShard` keeps a raw backend keyspace so tests can assert on the
//! exact cells a real backend would hold. It can be taken down to simulate
//! an unreachable backend and scripted to report WATCH conflicts.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::{ErrorKind, RedisError};

use crate::backend::{ReadSlot, ShardBackend, WriteOutcome, WritePlan};
use crate::error::ShardError;
use crate::id::ShardId;
use crate::key::{SHARD_ID_KEY, WrappedKey};

#[derive(Debug, Default)]
pub struct MockShard {
    store: DashMap<Vec<u8>, Vec<u8>>,
    down: AtomicBool,
    conflicts: AtomicUsize,
    last_save: AtomicI64,
    replica_writes: AtomicUsize,
    drop_writes: AtomicUsize,
    write_timestamps: Mutex<Vec<i64>>,
}

impl MockShard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the backend going away: every operation fails with a
    /// connection error until the shard is brought back.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// The next `count` write transactions report a WATCH conflict before
    /// applying anything.
    pub fn script_conflicts(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn set_last_save(&self, seconds: i64) {
        self.last_save.store(seconds, Ordering::SeqCst);
    }

    /// Direct keyspace access, bypassing the transaction path.
    pub fn raw(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.store.get(key).map(|cell| cell.value().clone())
    }

    /// Direct keyspace seeding, bypassing the transaction path.
    pub fn insert_raw(&self, key: &[u8], value: &[u8]) {
        self.store.insert(key.to_vec(), value.to_vec());
    }

    /// Write transactions that carried a replica payload.
    pub fn replica_writes(&self) -> usize {
        self.replica_writes.load(Ordering::SeqCst)
    }

    /// Write transactions that only ran the delete pass.
    pub fn drop_writes(&self) -> usize {
        self.drop_writes.load(Ordering::SeqCst)
    }

    pub fn reset_write_counts(&self) {
        self.replica_writes.store(0, Ordering::SeqCst);
        self.drop_writes.store(0, Ordering::SeqCst);
    }

    /// Timestamps of every replica write attempted, conflicted ones
    /// included, in arrival order.
    pub fn write_timestamps(&self) -> Vec<i64> {
        self.write_timestamps
            .lock()
            .expect("timestamp log poisoned")
            .clone()
    }

    fn reachable(&self) -> Result<(), ShardError> {
        if self.down.load(Ordering::SeqCst) {
            Err(ShardError::Connection(RedisError::from((
                ErrorKind::Io,
                "mock shard is down",
            ))))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ShardBackend for MockShard {
    async fn adopt_id(&self, candidate: ShardId) -> Result<ShardId, ShardError> {
        self.reachable()?;
        let entry = self
            .store
            .entry(SHARD_ID_KEY.as_bytes().to_vec())
            .or_insert_with(|| candidate.as_str().as_bytes().to_vec());
        Ok(ShardId::from_wire(entry.value()))
    }

    async fn db_size(&self) -> Result<u64, ShardError> {
        self.reachable()?;
        Ok(self.store.len() as u64)
    }

    async fn ping(&self) -> bool {
        self.reachable().is_ok()
    }

    async fn last_save(&self) -> Result<i64, ShardError> {
        self.reachable()?;
        Ok(self.last_save.load(Ordering::SeqCst))
    }

    async fn read(&self, key: &WrappedKey) -> Result<ReadSlot, ShardError> {
        self.reachable()?;
        Ok(ReadSlot {
            data: self.raw(key.data()).map(Bytes::from),
            timestamp: self.raw(key.timestamp()).map(Bytes::from),
            db_size: self.store.len() as u64,
        })
    }

    async fn write(
        &self,
        key: &WrappedKey,
        plan: WritePlan<'_>,
    ) -> Result<WriteOutcome, ShardError> {
        self.reachable()?;
        if let WritePlan::Put { timestamp, .. } = plan {
            self.write_timestamps
                .lock()
                .expect("timestamp log poisoned")
                .push(timestamp);
        }
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok()
        {
            return Ok(WriteOutcome::Conflict);
        }
        let existed = self.store.remove(key.data()).is_some();
        self.store.remove(key.timestamp());
        match plan {
            WritePlan::Put { value, timestamp } => {
                self.replica_writes.fetch_add(1, Ordering::SeqCst);
                if let Some(value) = value {
                    self.store.insert(key.data().to_vec(), value.to_vec());
                }
                self.store.insert(
                    key.timestamp().to_vec(),
                    timestamp.to_string().into_bytes(),
                );
            }
            WritePlan::Drop => {
                self.drop_writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(WriteOutcome::Applied {
            existed,
            db_size: self.store.len() as u64,
        })
    }
}

//! The shard registry and the replicated read/write engine.
//!
//! `Cluster` owns every attached shard. Writes fan out to all shards in
//! ascending cached-DBSIZE order: the first `replicaness` backends that
//! accept the transaction store the value with its logical timestamp, and
//! every other backend still runs the delete pass so a stale copy from an
//! earlier placement can never resurface. Reads poll all shards and return
//! the copy with the greatest timestamp. A WATCH conflict anywhere aborts
//! the attempt and restarts it with a strictly later timestamp, which is
//! what makes the surviving write win.
//!
//! Registry state sits behind a short-held mutex; backend I/O never runs
//! under the lock.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use crate::backend::{Endpoint, ReadSlot, RedisShard, ShardBackend, WriteOutcome, WritePlan};
use crate::error::ShardError;
use crate::id::ShardId;
use crate::key::WrappedKey;

/// Microseconds since the Unix epoch; the logical version of every write.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// One attached backend: identity, endpoint, live connection and the last
/// DBSIZE observed on it. The cached size is only a load hint.
#[derive(Clone)]
pub struct Shard {
    id: ShardId,
    endpoint: Endpoint,
    backend: Arc<dyn ShardBackend>,
    db_size: u64,
}

impl Shard {
    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn db_size(&self) -> u64 {
        self.db_size
    }
}

/// Outcome of one replicated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    /// Shards that accepted the write as replicas.
    pub replicas: usize,
    /// Whether the data key existed on at least one shard beforehand.
    pub existed: bool,
}

struct ClusterState {
    shards: Vec<Shard>,
    replicaness: usize,
}

/// The shard registry and replicated key-value engine.
pub struct Cluster {
    state: Mutex<ClusterState>,
}

impl Cluster {
    /// Creates an empty cluster with the given desired replica count
    /// (clamped to at least one).
    pub fn new(replicaness: usize) -> Self {
        Cluster {
            state: Mutex::new(ClusterState {
                shards: Vec::new(),
                replicaness: replicaness.max(1),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("shard registry lock poisoned")
    }

    /// Connects to a backend and registers it as a shard.
    pub async fn add_shard(&self, endpoint: Endpoint) -> Result<ShardId, ShardError> {
        let backend = RedisShard::open(&endpoint)?;
        self.attach(Arc::new(backend), endpoint).await
    }

    /// Registers an already constructed backend connection.
    ///
    /// Bootstraps the shard identity from the backend itself, so re-adding
    /// the same backend replaces its previous record instead of growing the
    /// registry. Exposed separately from [`Cluster::add_shard`] so test
    /// suites can attach in-memory backends.
    pub async fn attach(
        &self,
        backend: Arc<dyn ShardBackend>,
        endpoint: Endpoint,
    ) -> Result<ShardId, ShardError> {
        let id = backend.adopt_id(ShardId::generate()).await?;
        let db_size = backend.db_size().await?;
        let shard = Shard {
            id: id.clone(),
            endpoint,
            backend,
            db_size,
        };
        let mut state = self.state();
        match state.shards.iter_mut().find(|s| s.id == id) {
            Some(existing) => *existing = shard,
            None => state.shards.push(shard),
        }
        Ok(id)
    }

    /// Drops a shard from the registry. Not on the wire surface.
    pub fn remove_shard(&self, id: &ShardId) -> bool {
        let mut state = self.state();
        let before = state.shards.len();
        state.shards.retain(|shard| shard.id != *id);
        state.shards.len() != before
    }

    pub fn shard_count(&self) -> usize {
        self.state().shards.len()
    }

    /// A snapshot of the attached shards, in registry order.
    pub fn shards(&self) -> Vec<Shard> {
        self.state().shards.clone()
    }

    pub fn replicaness(&self) -> usize {
        self.state().replicaness
    }

    /// Updates the desired replica count; returns whether the attached
    /// shards cover it. Validation of the raw input happens at the wire
    /// layer.
    pub fn set_replicaness(&self, replicaness: usize) -> bool {
        let mut state = self.state();
        state.replicaness = replicaness;
        replicaness <= state.shards.len()
    }

    /// Whether a PING to the shard succeeds right now.
    pub async fn is_shard_alive(&self, id: &ShardId) -> bool {
        let backend = {
            let state = self.state();
            state
                .shards
                .iter()
                .find(|shard| shard.id == *id)
                .map(|shard| Arc::clone(&shard.backend))
        };
        match backend {
            Some(backend) => backend.ping().await,
            None => false,
        }
    }

    /// One character per attached shard, in registry order: `.` if the
    /// shard answers a PING, `F` otherwise.
    pub async fn statuses(&self) -> String {
        let mut status = String::new();
        for (_, backend) in self.shards_snapshot() {
            status.push(if backend.ping().await { '.' } else { 'F' });
        }
        status
    }

    /// The greatest LASTSAVE over all reachable shards, 0 for none.
    pub async fn last_save(&self) -> i64 {
        let mut latest = 0;
        for (id, backend) in self.shards_snapshot() {
            match backend.last_save().await {
                Ok(saved) => latest = latest.max(saved),
                Err(error) => warn!(shard = %id, error = %error, "shard skipped for LASTSAVE"),
            }
        }
        latest
    }

    /// Reads a user key, reconciling the copies held by the shards: the
    /// data paired with the greatest timestamp wins, first seen winning
    /// ties. Returns `None` when no shard holds the key or the winning
    /// copy is a deletion tombstone.
    pub async fn get(&self, key: &[u8]) -> Option<Bytes> {
        let wrapped = WrappedKey::wrap(key);
        let mut best_timestamp = 0;
        let mut winner: Option<Option<Bytes>> = None;
        for (id, backend) in self.shards_snapshot() {
            match backend.read(&wrapped).await {
                Ok(ReadSlot {
                    data,
                    timestamp,
                    db_size,
                }) => {
                    self.update_db_size(&id, db_size);
                    let timestamp = parse_timestamp(timestamp.as_deref());
                    if timestamp > best_timestamp {
                        best_timestamp = timestamp;
                        winner = Some(data);
                    }
                }
                Err(error) => warn!(shard = %id, error = %error, "shard skipped during read"),
            }
        }
        winner.flatten()
    }

    /// Replicates a write (or, with `value` of `None`, a delete) across the
    /// cluster per the timestamped last-writer-wins scheme.
    pub async fn set(&self, key: &[u8], value: Option<&[u8]>) -> WriteReport {
        let wrapped = WrappedKey::wrap(key);
        let mut last_timestamp = 0;
        'attempt: loop {
            // One timestamp per attempt, strictly later than the previous
            // attempt's even under clock-resolution ties.
            let timestamp = now_micros().max(last_timestamp + 1);
            last_timestamp = timestamp;
            let replicaness = self.replicaness();
            let mut remaining = replicaness;
            let mut existed = false;
            for (id, backend) in self.shards_by_load() {
                let plan = if remaining > 0 {
                    WritePlan::Put { value, timestamp }
                } else {
                    WritePlan::Drop
                };
                match backend.write(&wrapped, plan).await {
                    Ok(WriteOutcome::Applied {
                        existed: held_key,
                        db_size,
                    }) => {
                        self.update_db_size(&id, db_size);
                        existed |= held_key;
                        if remaining > 0 {
                            remaining -= 1;
                        }
                    }
                    Ok(WriteOutcome::Conflict) => {
                        debug!(shard = %id, "write conflict, restarting attempt");
                        continue 'attempt;
                    }
                    Err(error) => {
                        warn!(shard = %id, error = %error, "shard skipped during write");
                    }
                }
            }
            return WriteReport {
                replicas: replicaness - remaining,
                existed,
            };
        }
    }

    /// Deletes a user key on every shard; true when the key existed on at
    /// least one of them.
    pub async fn del(&self, key: &[u8]) -> bool {
        self.set(key, None).await.existed
    }

    /// Shards in registry order. Backends are cloned out so no I/O runs
    /// under the registry lock.
    fn shards_snapshot(&self) -> Vec<(ShardId, Arc<dyn ShardBackend>)> {
        self.state()
            .shards
            .iter()
            .map(|shard| (shard.id.clone(), Arc::clone(&shard.backend)))
            .collect()
    }

    /// Shards in ascending cached-DBSIZE order; ties keep registry order.
    fn shards_by_load(&self) -> Vec<(ShardId, Arc<dyn ShardBackend>)> {
        let state = self.state();
        let mut ordered: Vec<&Shard> = state.shards.iter().collect();
        ordered.sort_by_key(|shard| shard.db_size);
        ordered
            .into_iter()
            .map(|shard| (shard.id.clone(), Arc::clone(&shard.backend)))
            .collect()
    }

    fn update_db_size(&self, id: &ShardId, db_size: u64) {
        let mut state = self.state();
        if let Some(shard) = state.shards.iter_mut().find(|shard| shard.id == *id) {
            shard.db_size = db_size;
        }
    }
}

/// Decimal timestamp cell to its integer value; absent or unparseable
/// cells count as 0.
fn parse_timestamp(raw: Option<&[u8]>) -> i64 {
    raw.and_then(|bytes| std::str::from_utf8(bytes).ok())
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mock::MockShard;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("localhost", port, 0)
    }

    async fn put(cluster: &Cluster, key: &[u8], value: &[u8]) -> WriteReport {
        cluster.set(key, Some(value)).await
    }

    async fn cluster_with_mocks(
        replicaness: usize,
        count: usize,
    ) -> (Cluster, Vec<Arc<MockShard>>) {
        let cluster = Cluster::new(replicaness);
        let mut mocks = Vec::new();
        for index in 0..count {
            let mock = Arc::new(MockShard::new());
            cluster
                .attach(mock.clone(), endpoint(6380 + index as u16))
                .await
                .expect("attach mock shard");
            mocks.push(mock);
        }
        (cluster, mocks)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (cluster, _mocks) = cluster_with_mocks(1, 1).await;
        let report = put(&cluster, b"foo", b"bar").await;
        assert_eq!(report.replicas, 1);
        assert!(!report.existed);
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"bar".as_ref()));
    }

    #[tokio::test]
    async fn test_get_absent_key() {
        let (cluster, _mocks) = cluster_with_mocks(1, 1).await;
        assert_eq!(cluster.get(b"nop").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_reports_existing_key() {
        let (cluster, _mocks) = cluster_with_mocks(1, 1).await;
        put(&cluster, b"foo", b"bar").await;
        let report = put(&cluster, b"foo", b"baz").await;
        assert!(report.existed);
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"baz".as_ref()));
    }

    #[tokio::test]
    async fn test_replica_holds_both_cells() {
        let (cluster, mocks) = cluster_with_mocks(1, 1).await;
        put(&cluster, b"foo", b"bar").await;
        assert_eq!(mocks[0].raw(b"rc:foo").as_deref(), Some(b"bar".as_ref()));
        assert!(mocks[0].raw(b"rc:foo:ts").is_some());
    }

    #[tokio::test]
    async fn test_delete_leaves_timestamp_tombstone() {
        let (cluster, mocks) = cluster_with_mocks(1, 1).await;
        put(&cluster, b"foo", b"bar").await;
        assert!(cluster.del(b"foo").await);
        assert_eq!(cluster.get(b"foo").await, None);
        // The data cell is gone; the timestamp cell shadows stale copies.
        assert_eq!(mocks[0].raw(b"rc:foo"), None);
        assert!(mocks[0].raw(b"rc:foo:ts").is_some());
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_counts_nothing() {
        let (cluster, _mocks) = cluster_with_mocks(1, 1).await;
        assert!(!cluster.del(b"nop").await);
    }

    #[tokio::test]
    async fn test_extra_shards_get_delete_pass() {
        let (cluster, mocks) = cluster_with_mocks(1, 2).await;
        // Plant a stale copy where the write will not be placed.
        mocks[0].insert_raw(b"rc:foo", b"stale");
        mocks[0].insert_raw(b"rc:foo:ts", b"1");
        // Mock 0 now carries the larger DBSIZE, so the fresh write goes to
        // mock 1 and mock 0 only gets the delete pass.
        put(&cluster, b"other", b"x").await;
        put(&cluster, b"foo", b"fresh").await;
        assert_eq!(mocks[0].raw(b"rc:foo"), None);
        assert_eq!(mocks[0].raw(b"rc:foo:ts"), None);
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"fresh".as_ref()));
    }

    #[tokio::test]
    async fn test_placement_prefers_smallest_shard() {
        let (cluster, mocks) = cluster_with_mocks(1, 2).await;
        // Grow mock 0 so mock 1 reports the smaller cached DBSIZE.
        mocks[0].insert_raw(b"ballast:1", b"x");
        mocks[0].insert_raw(b"ballast:2", b"x");
        put(&cluster, b"seed", b"x").await;
        mocks[0].reset_write_counts();
        mocks[1].reset_write_counts();
        put(&cluster, b"foo", b"bar").await;
        assert_eq!(mocks[1].replica_writes(), 1);
        assert_eq!(mocks[0].replica_writes(), 0);
        assert_eq!(mocks[0].drop_writes(), 1);
    }

    #[tokio::test]
    async fn test_down_shard_is_skipped_and_write_still_succeeds() {
        let (cluster, mocks) = cluster_with_mocks(2, 2).await;
        mocks[1].set_down(true);
        let report = put(&cluster, b"foo", b"bar").await;
        assert_eq!(report.replicas, 1);
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"bar".as_ref()));
    }

    #[tokio::test]
    async fn test_write_against_empty_or_dead_cluster_fails() {
        let (cluster, mocks) = cluster_with_mocks(1, 1).await;
        mocks[0].set_down(true);
        let report = put(&cluster, b"foo", b"bar").await;
        assert_eq!(report.replicas, 0);
    }

    #[tokio::test]
    async fn test_stale_replica_never_wins_after_reattach() {
        // Replicaness 2, shard 1 goes down, the key is rewritten, the
        // shard comes back holding the stale copy.
        let (cluster, mocks) = cluster_with_mocks(2, 2).await;
        put(&cluster, b"foo", b"bar").await;
        mocks[1].set_down(true);
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"bar".as_ref()));
        let report = put(&cluster, b"foo", b"baz").await;
        assert_eq!(report.replicas, 1);
        mocks[1].set_down(false);
        // The stale "bar" on mock 1 carries the older timestamp.
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"baz".as_ref()));
        // The next write's delete pass scrubs it for good.
        put(&cluster, b"foo", b"qux").await;
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"qux".as_ref()));
    }

    #[tokio::test]
    async fn test_conflict_restarts_with_increasing_timestamp() {
        let (cluster, mocks) = cluster_with_mocks(1, 1).await;
        mocks[0].script_conflicts(2);
        let report = put(&cluster, b"foo", b"bar").await;
        assert_eq!(report.replicas, 1);
        let timestamps = mocks[0].write_timestamps();
        assert_eq!(timestamps.len(), 3);
        assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"bar".as_ref()));
    }

    #[tokio::test]
    async fn test_unparseable_timestamp_counts_as_zero() {
        let (cluster, mocks) = cluster_with_mocks(1, 2).await;
        put(&cluster, b"foo", b"bar").await;
        // Corrupt the loser shard's cells; garbage must never outrank a
        // real timestamp.
        let loser = if mocks[0].raw(b"rc:foo").is_some() { 1 } else { 0 };
        mocks[loser].insert_raw(b"rc:foo", b"garbage");
        mocks[loser].insert_raw(b"rc:foo:ts", b"not-a-number");
        assert_eq!(cluster.get(b"foo").await.as_deref(), Some(b"bar".as_ref()));
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_per_backend() {
        let cluster = Cluster::new(1);
        let mock = Arc::new(MockShard::new());
        let first = cluster.attach(mock.clone(), endpoint(6380)).await.unwrap();
        let second = cluster.attach(mock.clone(), endpoint(6380)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cluster.shard_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_shard() {
        let cluster = Cluster::new(1);
        let mock = Arc::new(MockShard::new());
        let id = cluster.attach(mock, endpoint(6380)).await.unwrap();
        assert!(cluster.remove_shard(&id));
        assert!(!cluster.remove_shard(&id));
        assert_eq!(cluster.shard_count(), 0);
    }

    #[tokio::test]
    async fn test_statuses() {
        let (cluster, mocks) = cluster_with_mocks(1, 3).await;
        mocks[1].set_down(true);
        assert_eq!(cluster.statuses().await, ".F.");
    }

    #[tokio::test]
    async fn test_last_save_takes_the_maximum() {
        let (cluster, mocks) = cluster_with_mocks(1, 3).await;
        mocks[0].set_last_save(100);
        mocks[1].set_last_save(300);
        mocks[2].set_last_save(200);
        mocks[1].set_down(true);
        // The freshest reachable shard wins; the down one is skipped.
        assert_eq!(cluster.last_save().await, 200);
    }

    #[tokio::test]
    async fn test_last_save_empty_cluster() {
        let cluster = Cluster::new(1);
        assert_eq!(cluster.last_save().await, 0);
    }

    #[tokio::test]
    async fn test_set_replicaness_coverage() {
        let (cluster, _mocks) = cluster_with_mocks(1, 2).await;
        assert!(cluster.set_replicaness(2));
        assert!(!cluster.set_replicaness(3));
        assert_eq!(cluster.replicaness(), 3);
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp(Some(b"1369405000123456".as_slice())),
            1369405000123456
        );
        assert_eq!(parse_timestamp(Some(b" 42 ".as_slice())), 42);
        assert_eq!(parse_timestamp(Some(b"garbage".as_slice())), 0);
        assert_eq!(parse_timestamp(Some(b"\xff\xfe".as_slice())), 0);
        assert_eq!(parse_timestamp(None), 0);
    }

    #[tokio::test]
    async fn test_is_shard_alive() {
        let cluster = Cluster::new(1);
        let mock = Arc::new(MockShard::new());
        let id = cluster.attach(mock.clone(), endpoint(6380)).await.unwrap();
        assert!(cluster.is_shard_alive(&id).await);
        mock.set_down(true);
        assert!(!cluster.is_shard_alive(&id).await);
        assert!(!cluster.is_shard_alive(&ShardId::generate()).await);
    }

    #[tokio::test]
    async fn test_db_size_cache_follows_writes() {
        let (cluster, _mocks) = cluster_with_mocks(1, 1).await;
        put(&cluster, b"foo", b"bar").await;
        let shards = cluster.shards();
        assert_eq!(shards.len(), 1);
        // Shard id cell plus the data and timestamp cells.
        assert_eq!(shards[0].db_size(), 3);
        assert_eq!(shards[0].endpoint(), &endpoint(6380));
    }
}

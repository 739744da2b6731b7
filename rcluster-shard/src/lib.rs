//! Shard registry and replicated key-value engine for the rcluster proxy.
//!
//! Data lands on plain Redis-compatible backends. Each backend is wrapped
//! in a [`ShardBackend`] connection with a stable identity bootstrapped
//! from the backend itself; [`Cluster`] owns the attached shards and
//! implements the timestamped last-writer-wins replication over them.

pub mod backend;
pub mod cluster;
pub mod error;
pub mod id;
pub mod key;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use backend::{Endpoint, ReadSlot, RedisShard, ShardBackend, WriteOutcome, WritePlan};
pub use cluster::{Cluster, Shard, WriteReport, now_micros};
pub use error::ShardError;
pub use id::ShardId;
pub use key::{SHARD_ID_KEY, WrappedKey};

//! Backend connections and the operations the engine runs against them.
//!
//! `RedisShard` talks RESP2 to one backend through a multiplexed
//! [`ConnectionManager`], established lazily on first use; reconnect policy
//! is delegated to the client library. Everything the engine needs sits
//! behind the [`ShardBackend`] trait so the test suites can substitute an
//! in-memory shard.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use redis::{Client, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tracing::trace;

use crate::error::ShardError;
use crate::id::ShardId;
use crate::key::{SHARD_ID_KEY, WrappedKey};

/// Network endpoint of one backend: host, port and database index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    db: u32,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, db: u32) -> Self {
        Endpoint {
            host: host.into(),
            port,
            db,
        }
    }

    fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.db)
    }
}

/// What the write transaction stores after its unconditional delete pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePlan<'a> {
    /// Drop any stale copy; this shard is past the replica count.
    Drop,
    /// Store a replica: the value bytes plus the logical timestamp, or a
    /// timestamp-only tombstone when the value is `None`.
    Put {
        value: Option<&'a [u8]>,
        timestamp: i64,
    },
}

/// Result of one shard's write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// EXEC aborted: a watched key changed between WATCH and EXEC.
    Conflict,
    /// EXEC went through.
    Applied {
        /// Whether the data key existed on this shard before the delete.
        existed: bool,
        /// DBSIZE observed inside the transaction.
        db_size: u64,
    },
}

/// One shard's view of a wrapped key, plus the DBSIZE observed in the same
/// pipeline. The timestamp cell is kept raw; the engine parses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSlot {
    pub data: Option<Bytes>,
    pub timestamp: Option<Bytes>,
    pub db_size: u64,
}

/// Engine-facing surface of one backend connection.
#[async_trait]
pub trait ShardBackend: Send + Sync {
    /// Proposes `candidate` as this backend's stable identifier with a
    /// set-if-absent on the reserved key, then adopts whichever identifier
    /// the backend ends up holding.
    async fn adopt_id(&self, candidate: ShardId) -> Result<ShardId, ShardError>;

    /// Current DBSIZE.
    async fn db_size(&self) -> Result<u64, ShardError>;

    /// Liveness probe; false on any failure.
    async fn ping(&self) -> bool;

    /// Backend LASTSAVE, seconds since epoch.
    async fn last_save(&self) -> Result<i64, ShardError>;

    /// Reads both cells of the wrapped key and DBSIZE in one pipelined
    /// transaction.
    async fn read(&self, key: &WrappedKey) -> Result<ReadSlot, ShardError>;

    /// Runs the guarded write transaction: watch both cells, delete both,
    /// apply the plan, observe DBSIZE.
    async fn write(&self, key: &WrappedKey, plan: WritePlan<'_>)
    -> Result<WriteOutcome, ShardError>;
}

/// Production [`ShardBackend`] over a real Redis-compatible server.
pub struct RedisShard {
    client: Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisShard {
    /// Creates the client for `endpoint`. The connection itself is
    /// established lazily on the first operation.
    pub fn open(endpoint: &Endpoint) -> Result<Self, ShardError> {
        Ok(RedisShard {
            client: Client::open(endpoint.url()).map_err(ShardError::from)?,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, ShardError> {
        let manager = self
            .connection
            .get_or_try_init(|| {
                trace!("initialize backend connection manager");
                self.client.get_connection_manager()
            })
            .await
            .map_err(ShardError::from)?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl ShardBackend for RedisShard {
    async fn adopt_id(&self, candidate: ShardId) -> Result<ShardId, ShardError> {
        let mut con = self.connection().await?;
        let stored: bool = redis::cmd("SETNX")
            .arg(SHARD_ID_KEY)
            .arg(candidate.as_str())
            .query_async(&mut con)
            .await
            .map_err(ShardError::from)?;
        if stored {
            return Ok(candidate);
        }
        let existing: Vec<u8> = redis::cmd("GET")
            .arg(SHARD_ID_KEY)
            .query_async(&mut con)
            .await
            .map_err(ShardError::from)?;
        Ok(ShardId::from_wire(&existing))
    }

    async fn db_size(&self) -> Result<u64, ShardError> {
        let mut con = self.connection().await?;
        redis::cmd("DBSIZE")
            .query_async(&mut con)
            .await
            .map_err(ShardError::from)
    }

    async fn ping(&self) -> bool {
        let Ok(mut con) = self.connection().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut con)
            .await
            .is_ok()
    }

    async fn last_save(&self) -> Result<i64, ShardError> {
        let mut con = self.connection().await?;
        redis::cmd("LASTSAVE")
            .query_async(&mut con)
            .await
            .map_err(ShardError::from)
    }

    async fn read(&self, key: &WrappedKey) -> Result<ReadSlot, ShardError> {
        let mut con = self.connection().await?;
        let (data, timestamp, db_size): (Option<Vec<u8>>, Option<Vec<u8>>, u64) = redis::pipe()
            .atomic()
            .get(key.data())
            .get(key.timestamp())
            .cmd("DBSIZE")
            .query_async(&mut con)
            .await
            .map_err(ShardError::from)?;
        Ok(ReadSlot {
            data: data.map(Bytes::from),
            timestamp: timestamp.map(Bytes::from),
            db_size,
        })
    }

    async fn write(
        &self,
        key: &WrappedKey,
        plan: WritePlan<'_>,
    ) -> Result<WriteOutcome, ShardError> {
        let mut con = self.connection().await?;
        // The whole WATCH..EXEC sequence goes out as one pipelined batch,
        // which keeps one in-flight command per connection even though the
        // manager is shared across requests.
        let mut pipe = redis::pipe();
        pipe.cmd("WATCH")
            .arg(key.data())
            .arg(key.timestamp())
            .ignore();
        pipe.cmd("MULTI").ignore();
        pipe.cmd("DEL").arg(key.data()).ignore();
        pipe.cmd("DEL").arg(key.timestamp()).ignore();
        if let WritePlan::Put { value, timestamp } = plan {
            if let Some(value) = value {
                pipe.cmd("SET").arg(key.data()).arg(value).ignore();
            }
            pipe.cmd("SET").arg(key.timestamp()).arg(timestamp).ignore();
        }
        pipe.cmd("DBSIZE").ignore();
        pipe.cmd("EXEC");
        // EXEC replies with the queued results, or nil when a watched key
        // changed underneath the transaction.
        let (exec,): (Option<Vec<redis::Value>>,) = pipe
            .query_async(&mut con)
            .await
            .map_err(ShardError::from)?;
        let Some(results) = exec else {
            return Ok(WriteOutcome::Conflict);
        };
        let deleted: i64 = decode_result(results.first())?;
        let db_size: u64 = decode_result(results.last())?;
        Ok(WriteOutcome::Applied {
            existed: deleted > 0,
            db_size,
        })
    }
}

fn decode_result<T: redis::FromRedisValue + Default>(
    value: Option<&redis::Value>,
) -> Result<T, ShardError> {
    value
        .map(redis::FromRedisValue::from_redis_value_ref)
        .transpose()
        .map_err(redis::RedisError::from)
        .map_err(ShardError::from)
        .map(Option::unwrap_or_default)
}

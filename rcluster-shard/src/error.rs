//! Error types for shard operations.

use redis::RedisError;
use thiserror::Error;

/// Error type for operations against one backend.
///
/// The split matters to the engine: connection failures are recoverable
/// (the shard is skipped for the current operation and surfaces as `F` in
/// the INFO status string), anything else is an internal fault.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Network interaction error: the backend is unreachable or the
    /// connection dropped mid-operation.
    #[error("shard connection error: {0}")]
    Connection(#[source] RedisError),

    /// A backend failure that is not a connectivity problem.
    #[error("shard backend error: {0}")]
    Backend(#[source] RedisError),
}

impl ShardError {
    /// Whether the failure is a connectivity problem rather than a fault
    /// in the request itself.
    pub fn is_connection(&self) -> bool {
        matches!(self, ShardError::Connection(_))
    }
}

impl From<RedisError> for ShardError {
    fn from(error: RedisError) -> Self {
        if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_io_error()
            || error.is_timeout()
        {
            ShardError::Connection(error)
        } else {
            ShardError::Backend(error)
        }
    }
}

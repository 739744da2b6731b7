//! Command-level error types.

use bytes::Bytes;
use rcluster_shard::ShardError;
use thiserror::Error;

/// How a command handler fails.
///
/// `Command` is the original-flavoured control flow: the carried bytes go
/// to the client verbatim as an error reply and the connection stays open.
/// Everything else is an internal fault, logged and reported generically.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Sent to the client verbatim as an error reply.
    #[error("{}", String::from_utf8_lossy(.0))]
    Command(Bytes),

    /// Any other handler failure.
    #[error(transparent)]
    Internal(#[from] ShardError),
}

impl HandlerError {
    pub fn command(message: impl Into<Bytes>) -> Self {
        HandlerError::Command(message.into())
    }

    /// Arity or argument-parse failure, `ERR Expected> <usage>`.
    pub fn usage(usage: &str) -> Self {
        HandlerError::Command(format!("ERR Expected> {usage}").into())
    }
}

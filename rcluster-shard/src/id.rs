//! Stable shard identity.
//!
//! A shard proposes a locally generated identifier to its backend on first
//! contact and adopts whatever the backend ends up holding, so the same
//! logical shard keeps the same id across reconnects. The wire form is the
//! 32-character lowercase hex rendering of 16 random bytes; peers never
//! parse it, so an id adopted from the backend is kept verbatim.

use std::fmt;

use smol_str::SmolStr;
use uuid::Uuid;

/// Identifier of one attached backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardId(SmolStr);

impl ShardId {
    /// Generates a fresh candidate identifier (UUID-v4, hex form).
    pub fn generate() -> Self {
        Self(SmolStr::from(Uuid::new_v4().simple().to_string()))
    }

    /// Adopts an identifier exactly as stored on a backend.
    pub fn from_wire(bytes: &[u8]) -> Self {
        Self(SmolStr::from(String::from_utf8_lossy(bytes)))
    }

    /// The wire form sent in replies and stored under the reserved key.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for ShardId {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(SmolStr::new(s))
    }
}

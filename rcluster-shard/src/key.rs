//! Backend key namespace.
//!
//! Every user-visible key `K` is backed by two keys on each shard: `rc:K`
//! for the value bytes and `rc:K:ts` for the decimal microseconds-since-
//! epoch of the last write. The pair is written atomically inside one
//! transaction and deleted together when overwritten. `rcluster:shard:id`
//! holds the shard's stable identifier. Any other backend key is outside
//! the proxy's namespace and ignored.

/// Reserved backend key holding a shard's stable identifier.
pub const SHARD_ID_KEY: &str = "rcluster:shard:id";

const DATA_PREFIX: &[u8] = b"rc:";
const TIMESTAMP_SUFFIX: &[u8] = b":ts";

/// The pair of backend keys backing one user key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WrappedKey {
    data: Vec<u8>,
    timestamp: Vec<u8>,
}

impl WrappedKey {
    /// Derives the backend key pair for a user key. Binary-clean: the user
    /// key may contain any bytes.
    pub fn wrap(key: &[u8]) -> Self {
        let mut data = Vec::with_capacity(DATA_PREFIX.len() + key.len());
        data.extend_from_slice(DATA_PREFIX);
        data.extend_from_slice(key);
        let mut timestamp = Vec::with_capacity(data.len() + TIMESTAMP_SUFFIX.len());
        timestamp.extend_from_slice(&data);
        timestamp.extend_from_slice(TIMESTAMP_SUFFIX);
        WrappedKey { data, timestamp }
    }

    /// The backend key holding the value bytes, `rc:<K>`.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The backend key holding the logical timestamp, `rc:<K>:ts`.
    #[inline]
    pub fn timestamp(&self) -> &[u8] {
        &self.timestamp
    }
}

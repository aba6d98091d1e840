//! Error type shared by every layer of the persistence engine.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Persistence errors.
///
/// Payloads are plain strings so the error stays `Clone` and can be handed
/// to every waiter of a session's readiness channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),

    /// The handle was opened under an older schema generation
    #[error("Stale store handle: generation {handle}, current {current}")]
    Stale { handle: u64, current: u64 },

    /// A write kept hitting stale handles until the retry budget ran out
    #[error("Write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The whole store was erased and no session re-opened it
    #[error("{op}() cannot be called after the store was erased")]
    Erased { op: &'static str },

    /// The namespace was erased and no session re-opened it
    #[error("{op}() cannot be called after namespace '{namespace}' was erased")]
    NamespaceErased { op: &'static str, namespace: String },

    /// The namespace has no partitions in the current schema
    #[error("Unknown namespace: {0}")]
    UnknownNamespace(String),

    /// The schema upgrade callback failed
    #[error("Schema upgrade to generation {generation} failed: {reason}")]
    Upgrade { generation: u64, reason: String },

    /// Requested generation is older than the stored one
    #[error("Requested generation {requested} is older than stored generation {stored}")]
    VersionConflict { requested: u64, stored: u64 },

    /// LZ4 decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The CRDT document rejected an update or a subscription
    #[error("Document error: {0}")]
    Document(String),

    /// The session was destroyed before the operation could run
    #[error("Session '{0}' has been destroyed")]
    Destroyed(String),
}

impl PersistError {
    /// Whether the error is recoverable by refreshing the store handle.
    pub fn is_stale(&self) -> bool {
        matches!(self, PersistError::Stale { .. })
    }
}

impl From<rocksdb::Error> for PersistError {
    fn from(e: rocksdb::Error) -> Self {
        PersistError::Database(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        PersistError::Database(format!("lock poisoned: {e}"))
    }
}

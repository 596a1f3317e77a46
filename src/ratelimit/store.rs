//! Counter store trait for abstracting in-memory and persistent record storage.

use async_trait::async_trait;
use thiserror::Error;

use super::counter::WindowRecord;

/// Errors raised by counter store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem or other I/O failure
    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be decoded
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The operation did not complete within the configured bound
    #[error("store operation timed out after {0} ms")]
    Timeout(u64),

    /// The store could not run the operation at all
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The update applied by [`CounterStore::update`].
pub type RecordUpdate = dyn Fn(Option<WindowRecord>) -> WindowRecord + Send + Sync;

/// A record before and after one atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// The stored record the update observed, if any
    pub previous: Option<WindowRecord>,
    /// The record the update persisted
    pub current: WindowRecord,
}

/// Persistence for window records, keyed by identifier.
///
/// Both operations must be atomic per key: an `update` for a key never
/// interleaves with another `update` or a `purge_before` touching the same
/// key. Operations on different keys should not block each other.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically read the record for `key`, apply `op`, and persist the result.
    async fn update(&self, key: &str, op: &RecordUpdate) -> StoreResult<Transition>;

    /// Remove every record whose window opened before `cutoff` (epoch seconds).
    ///
    /// Returns the number of records removed.
    async fn purge_before(&self, cutoff: i64) -> StoreResult<usize>;

    /// Read the record for `key` without modifying it.
    ///
    /// Not used on the admission path; for inspection and tests.
    async fn get(&self, key: &str) -> StoreResult<Option<WindowRecord>>;

    /// Number of records currently held.
    ///
    /// Not used on the admission path; for inspection and tests.
    async fn len(&self) -> StoreResult<usize>;
}

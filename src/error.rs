//! Error taxonomy for the core pipeline.
//!
//! Every concern gets its own enum so call sites can match narrowly, and a
//! root [`CoreError`] ties them together for code that crosses concerns (the
//! dashboard aggregator, the batch loader). Sentinel variants such as
//! [`CacheError::Miss`] stay matchable through arbitrary wrapping depth: the
//! `#[from]` chain never collapses a miss into an opaque string.

use thiserror::Error;

/// Errors raised by the tiered cache (C2).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key not present, or present but expired.
    #[error("cache miss for key {0}")]
    Miss(String),

    /// Transport-level failure talking to the KV store.
    #[error("cache backend error during {op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: redis::RedisError,
    },

    /// Stored bytes failed to decode or failed checksum verification.
    #[error("corrupt cache entry at key {0}")]
    CorruptEntry(String),

    /// Value failed to encode; fatal to the single call that produced it.
    #[error("failed to encode value for key {0}: {1}")]
    EncodeFailed(String, serde_json::Error),

    /// Caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Per-operation deadline exceeded.
    #[error("operation timed out")]
    Timeout,
}

impl CacheError {
    /// True if this error (at any wrapping depth via [`CoreError`]) is a miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::Miss(_))
    }
}

/// Errors raised by the invalidation bus (C3).
#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("atomic_update exhausted retries on key {0}")]
    AtomicUpdateExhausted(String),

    #[error("publish failed: {0}")]
    PublishFailed(redis::RedisError),

    #[error("subscribe failed: {0}")]
    SubscribeFailed(redis::RedisError),
}

/// Errors raised by the batch loader (C4).
#[derive(Debug, Error, Clone)]
pub enum LoaderError {
    /// The user-supplied `batch_fn` failed for the whole batch.
    #[error("batch load failed: {0}")]
    BatchFailed(String),

    /// This waiter's context was cancelled; other waiters in the batch are unaffected.
    #[error("load cancelled")]
    Cancelled,

    /// The loader's internal channel was dropped before a result arrived.
    #[error("loader dispatch lost")]
    Dispatch,
}

/// Errors raised by the snapshot store and validator directory (C5/C6).
#[derive(Debug, Error)]
pub enum DbError {
    #[error("row not found")]
    NotFound,

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("identity already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported aggregation interval: {0}")]
    UnsupportedInterval(String),

    #[error("invalid filter: {0}")]
    BadFilter(String),

    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

/// Errors raised by the dashboard aggregator (C8).
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("required sub-query {0} missing from dashboard snapshot")]
    MissingRequired(&'static str),

    #[error("sub-query {0} failed: {1}")]
    SubQueryFailed(&'static str, String),

    /// Distinguished from [`DashboardError::SubQueryFailed`] so `snapshot()`
    /// can tell a deadline miss apart from a query error when deciding
    /// whether best-effort mode applies.
    #[error("sub-query {0} timed out")]
    SubQueryTimedOut(&'static str),
}

/// Crate-wide error, used by code that spans more than one concern.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Invalidation(#[from] InvalidationError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Dashboard(#[from] DashboardError),
}

impl CoreError {
    /// True if this error is, at any wrapping depth, a cache miss (P6).
    pub fn is_cache_miss(&self) -> bool {
        match self {
            CoreError::Cache(e) => e.is_miss(),
            CoreError::Invalidation(InvalidationError::Cache(e)) => e.is_miss(),
            _ => false,
        }
    }
}

/// Result alias for crate-spanning code.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

//! # Shared Store Adapter
//!
//! Thin abstraction over the external key/value store used by the rate
//! limiter and the distributed circuit breaker. The store supports GET, SET,
//! EXPIRE, atomic counters, and atomic multi-key writes.
//!
//! Every call is bounded by a short deadline: the store is advisory for the
//! hot path (rate limiting fails open, distributed breaker state falls back
//! to local), so a slow store must never stall admission decisions.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Deadline applied to every store round-trip
pub const STORE_DEADLINE: Duration = Duration::from_millis(50);

/// Errors surfaced by the shared store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("store call exceeded {}ms deadline", STORE_DEADLINE.as_millis())]
    Deadline,

    #[error("unexpected value for key {key}: {message}")]
    BadValue { key: String, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability contract for the shared key/value store
///
/// Implementations must make `incr` atomic and `set_many_with_expiry` a
/// single all-or-nothing write.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a key; `None` when absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a key without expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Write a key with a time-to-live.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment an integer counter, returning the new value.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Set a time-to-live on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically write several keys, all carrying the same expiry.
    async fn set_many_with_expiry(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Liveness probe used by the readiness endpoint.
    async fn ping(&self) -> StoreResult<()>;
}

/// Read a key and parse it as an integer, treating absence as `None`.
pub async fn get_i64(store: &dyn SharedStore, key: &str) -> StoreResult<Option<i64>> {
    match store.get(key).await? {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|e| StoreError::BadValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

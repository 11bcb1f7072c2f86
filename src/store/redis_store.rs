//! # Redis-backed Shared Store
//!
//! Production implementation of [`SharedStore`] over a Redis-compatible
//! server, using a lazily established [`ConnectionManager`] that reconnects
//! on its own. Connection setup failures do not abort the process: callers
//! see `StoreError::Unavailable` and apply their per-call degradation
//! policy (fail-open rate limiting, fail-local breakers).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::RwLock;
use tracing::info;

use super::{SharedStore, StoreError, StoreResult, STORE_DEADLINE};

/// Redis implementation of the shared store
pub struct RedisStore {
    client: Client,
    manager: RwLock<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Create a store for the given connection URL.
    ///
    /// No connection is attempted here; the first call establishes one under
    /// the store deadline.
    pub fn new(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
        })
    }

    /// Get a handle to the connection manager, establishing it if needed.
    async fn conn(&self) -> StoreResult<ConnectionManager> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(manager.clone());
        }

        let mut slot = self.manager.write().await;
        // Another task may have connected while we waited for the write lock.
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }

        let manager = deadline(ConnectionManager::new(self.client.clone()))
            .await?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("shared store connection established");
        *slot = Some(manager.clone());
        Ok(manager)
    }
}

/// Bound a store future by the global deadline.
async fn deadline<F, T>(fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(STORE_DEADLINE, fut)
        .await
        .map_err(|_| StoreError::Deadline)
}

fn store_err(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        deadline(conn.get::<_, Option<String>>(key))
            .await?
            .map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        deadline(conn.set::<_, _, ()>(key, value))
            .await?
            .map_err(store_err)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        deadline(conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()))
            .await?
            .map_err(store_err)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        deadline(conn.incr::<_, _, i64>(key, 1i64))
            .await?
            .map_err(store_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        deadline(conn.expire::<_, ()>(key, ttl.as_secs() as i64))
            .await?
            .map_err(store_err)
    }

    async fn set_many_with_expiry(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set(key, value).ignore();
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        deadline(pipe.query_async::<_, ()>(&mut conn))
            .await?
            .map_err(store_err)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        deadline(redis::cmd("PING").query_async::<_, String>(&mut conn))
            .await?
            .map_err(store_err)
            .map(|_| ())
    }
}

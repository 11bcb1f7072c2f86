//! # In-memory Shared Store
//!
//! Test double for [`SharedStore`]. Honors expiry and atomic increments, and
//! can be flipped into a failing mode to exercise the fail-open paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{SharedStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

/// DashMap-backed store with expiry semantics
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<String, Entry>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn read_live(&self, key: &str) -> Option<String> {
        // The shard guard from `get` must be released before `remove`.
        {
            let entry = self.data.get(key)?;
            if entry.live() {
                return Some(entry.value.clone());
            }
        }
        self.data.remove(key);
        None
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        Ok(self.read_live(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_available()?;
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.check_available()?;
        let mut entry = self.data.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        if !entry.live() {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let current: i64 = entry.value.parse().map_err(|_| StoreError::BadValue {
            key: key.to_string(),
            message: "counter is not an integer".to_string(),
        })?;
        entry.value = (current + 1).to_string();
        Ok(current + 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn set_many_with_expiry(
        &self,
        entries: &[(String, String)],
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check_available()?;
        let expires_at = Some(Instant::now() + ttl);
        for (key, value) in entries {
            self.data.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_is_sequential() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.incr("c").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn expiry_hides_values() {
        let store = MemoryStore::new();
        store
            .set_with_expiry("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_counter_restarts_from_zero() {
        let store = MemoryStore::new();
        store.incr("c").await.unwrap();
        store.expire("c", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failing_mode_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_failing(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn multi_write_applies_all_entries() {
        let store = MemoryStore::new();
        let entries = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        store
            .set_many_with_expiry(&entries, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.get("b").await.unwrap(), Some("2".to_string()));
    }
}

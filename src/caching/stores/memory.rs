//! # In-Memory Store
//!
//! A process-local [`KvStore`] backed by `DashMap`. Expired entries are dropped lazily on
//! access and in bulk by [`InMemoryStore::purge_expired`], which a store built with
//! [`InMemoryStore::with_cleanup_interval`] runs periodically in the background.
//!
//! Only suitable when a single process serves all traffic; otherwise use the Redis store
//! so breaker and limiter state is shared.

use super::KvStore;
use crate::caching::CacheResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory store implementation
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that sweeps expired entries every `cleanup_interval`.
    ///
    /// The sweep task holds only a weak reference and exits once every handle to the
    /// store is dropped. A zero interval disables it. Must be called within a tokio runtime.
    pub fn with_cleanup_interval(cleanup_interval: Duration) -> Self {
        let store = Self::new();
        if !cleanup_interval.is_zero() {
            let entries = Arc::downgrade(&store.entries);
            tokio::spawn(cleanup_loop(entries, cleanup_interval));
        }
        store
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries)
    }
}

fn purge(entries: &DashMap<String, StoredValue>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, stored| !stored.is_expired(now));
    let purged = before.saturating_sub(entries.len());
    if purged > 0 {
        debug!("Purged {} expired store entries", purged);
    }
    purged
}

async fn cleanup_loop(entries: Weak<DashMap<String, StoredValue>>, cleanup_interval: Duration) {
    let mut ticker = interval(cleanup_interval);
    loop {
        ticker.tick().await;
        match entries.upgrade() {
            Some(entries) => {
                purge(&entries);
            }
            None => break,
        }
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(stored) if !stored.is_expired(now) => return Ok(Some(stored.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, stored| stored.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };

        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn has(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::StoreExt;

    #[tokio::test]
    async fn test_basic_operations() {
        let store = InMemoryStore::new();

        store.set("key", b"value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some(b"value".to_vec()));
        assert!(store.has("key").await.unwrap());

        assert!(store.delete("key").await.unwrap());
        assert!(!store.delete("key").await.unwrap());
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let store = InMemoryStore::new();
        store.set("short", b"x", Duration::from_millis(10)).await.unwrap();
        store.set("forever", b"y", Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(!store.has("short").await.unwrap());
        assert_eq!(store.get("forever").await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryStore::new();
        store.set("a", b"1", Duration::from_millis(5)).await.unwrap();
        store.set("b", b"2", Duration::from_millis(5)).await.unwrap();
        store.set("c", b"3", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_background_cleanup_reclaims_unread_entries() {
        let store = InMemoryStore::with_cleanup_interval(Duration::from_millis(10));
        for i in 0..1000 {
            store
                .set(&format!("client_{}", i), b"1", Duration::from_millis(5))
                .await
                .unwrap();
        }
        store.set("kept", b"1", Duration::ZERO).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.get("kept").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_with_the_store() {
        let store = InMemoryStore::with_cleanup_interval(Duration::from_millis(5));
        let entries = Arc::downgrade(&store.entries);
        drop(store);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(entries.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = InMemoryStore::new();
        store
            .set_json("state", &vec![1u32, 2, 3], Duration::from_secs(5))
            .await
            .unwrap();
        let decoded: Option<Vec<u32>> = store.get_json("state").await.unwrap();
        assert_eq!(decoded, Some(vec![1, 2, 3]));

        store.set("garbage", b"{not json", Duration::from_secs(5)).await.unwrap();
        let decoded: Option<Vec<u32>> = store.get_json("garbage").await.unwrap();
        assert_eq!(decoded, None);
    }
}

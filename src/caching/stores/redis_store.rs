//! # Redis Store
//!
//! A [`KvStore`] shared by every dispatcher process, backed by a Redis connection manager
//! that reconnects transparently.

use super::KvStore;
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Redis store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,

    /// Key prefix for all entries
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "dispatcher:".to_string(),
        }
    }
}

/// Redis store implementation
#[derive(Clone)]
pub struct RedisStore {
    config: RedisStoreConfig,
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.config.url)
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(config: RedisStoreConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(CacheError::Redis)?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(CacheError::Redis)?;

        info!("Connected to Redis store at {}", config.url);
        Ok(Self {
            config,
            connection_manager,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection_manager.clone();
        let value: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection_manager.clone();
        let full_key = self.full_key(key);

        if ttl.is_zero() {
            conn.set::<_, _, ()>(&full_key, value).await?;
        } else {
            // Sub-second TTLs round up so the entry is never written already expired
            let seconds = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(&full_key, value, seconds).await?;
        }

        debug!("Set Redis key: {} with TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn has(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection_manager.clone();
        let exists: bool = conn.exists(self.full_key(key)).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection_manager.clone();
        let deleted: i64 = conn.del(self.full_key(key)).await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "dispatcher:");
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis at localhost:6379
    async fn test_basic_operations() {
        let store = RedisStore::new(RedisStoreConfig::default()).await.unwrap();

        store.set("test_key", b"test_value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("test_key").await.unwrap(), Some(b"test_value".to_vec()));
        assert!(store.has("test_key").await.unwrap());
        assert!(store.delete("test_key").await.unwrap());
        assert!(!store.has("test_key").await.unwrap());
    }
}

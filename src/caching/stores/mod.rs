//! # Key-Value Store Module
//!
//! The store contract consumed by the resilience middleware and the route collection,
//! with in-memory and Redis-based implementations.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use super::CacheResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Store handle shared between middleware instances
pub type SharedStore = Arc<dyn KvStore>;

/// Trait for key-value store implementations
///
/// A `ttl` of zero means the entry never expires.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    /// Get a value from the store
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value with TTL
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Check if a key exists
    async fn has(&self, key: &str) -> CacheResult<bool>;

    /// Delete a value, reporting whether it existed
    async fn delete(&self, key: &str) -> CacheResult<bool>;
}

/// JSON helpers on top of any [`KvStore`]
#[async_trait]
pub trait StoreExt: KvStore {
    /// Read and decode a JSON value. Undecodable entries are treated as absent.
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Discarding undecodable store entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Encode and write a JSON value
    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, ttl).await
    }
}

impl<S: KvStore + ?Sized> StoreExt for S {}

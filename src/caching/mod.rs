//! # Caching System Module
//!
//! Shared state for the resilience middleware. Circuit breaker, rate limiter, response
//! cache and the route collection all keep their state in a [`KvStore`] rather than in
//! process memory, because requests may be served by independent worker processes.
//!
//! ## Architecture
//! 1. **Stores**: the `KvStore` contract plus in-memory and Redis implementations
//! 2. **Key generation**: hashed, prefixed keys so arbitrary identifiers stay short
//! 3. **Response cache middleware**: replays stored `GET` responses
//!
//! Every read-modify-write sequence against a store is non-atomic. Under concurrency two
//! requests may read the same state and one update overwrites the other, which can
//! under-count failures or requests. This is accepted: state is best-effort.

pub mod key_generator;
pub mod middleware;
pub mod stores;

pub use key_generator::hashed_key;
pub use middleware::{CachedResponse, ResponseCacheConfig, ResponseCacheMiddleware};
pub use stores::{InMemoryStore, KvStore, RedisStore, RedisStoreConfig, SharedStore, StoreExt};

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

//! Key-value cache with versioned collection keys.
//!
//! ```text
//! detail:      product:{tenant}:{id}                     deleted on every write
//! collection:  products:{tenant}:{filterHash}:v{counter} orphaned by counter bump, expires by TTL
//! search:      search:{tenant}:{queryHash}:v{p}.{c}      moves with both counters, short TTL
//! ```
//!
//! There is no pattern delete anywhere: a write bumps the tenant's
//! `(tenant, type)` counter and readers simply stop asking for the old keys.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod counter;
pub mod in_memory;
pub mod keys;
pub mod manager;
#[cfg(feature = "redis")]
pub mod redis;

pub use counter::{InMemoryVersionCounters, PostgresVersionCounters, VersionCounterStore};
pub use in_memory::InMemoryCache;
pub use keys::CacheKey;
pub use manager::VersionedCacheManager;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache command failed: {0}")]
    Command(String),
}

/// Raw string cache. Values are serialized JSON produced by the manager.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[async_trait]
impl<C> CacheBackend for Arc<C>
where
    C: CacheBackend + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        (**self).delete(key).await
    }
}

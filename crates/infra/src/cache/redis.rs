//! Redis-backed cache and version counters (feature `redis`).
//!
//! - Values: `SET key value PX ttl`
//! - Counters: `INCR cachever:{tenant}:{type}` (atomic across processes)

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use marketplace_core::{EntityType, TenantId};

use super::{CacheBackend, CacheError, VersionCounterStore};

fn map_redis_error(operation: &str, err: redis::RedisError) -> CacheError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        CacheError::Unavailable(format!("{operation}: {err}"))
    } else {
        CacheError::Command(format!("{operation} failed: {err}"))
    }
}

async fn connect(redis_url: &str) -> Result<ConnectionManager, CacheError> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| CacheError::Unavailable(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| map_redis_error("connect", e))
}

/// Cache backend on a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("GET", e))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("SET", e))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("DEL", e))
    }
}

#[derive(Clone)]
pub struct RedisVersionCounters {
    conn: ConnectionManager,
}

impl RedisVersionCounters {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }

    fn key(tenant_id: TenantId, entity_type: EntityType) -> String {
        format!("cachever:{}:{}", tenant_id, entity_type.as_str())
    }
}

#[async_trait]
impl VersionCounterStore for RedisVersionCounters {
    async fn current(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(Self::key(tenant_id, entity_type))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("GET", e))?;
        Ok(value.unwrap_or(0))
    }

    async fn bump(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR")
            .arg(Self::key(tenant_id, entity_type))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("INCR", e))
    }
}

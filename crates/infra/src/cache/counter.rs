//! Per `(tenant, entity type)` cache version counters.
//!
//! The counter lives in a shared store so that every process sees a bump. A
//! counter only ever increases.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use marketplace_core::{EntityType, TenantId};

use super::CacheError;

#[async_trait]
pub trait VersionCounterStore: Send + Sync {
    /// Current counter (0 if never bumped).
    async fn current(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError>;

    /// Atomically increment and return the new value.
    async fn bump(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError>;
}

#[async_trait]
impl<S> VersionCounterStore for Arc<S>
where
    S: VersionCounterStore + ?Sized,
{
    async fn current(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        (**self).current(tenant_id, entity_type).await
    }

    async fn bump(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        (**self).bump(tenant_id, entity_type).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryVersionCounters {
    counters: Mutex<HashMap<(TenantId, EntityType), u64>>,
    unavailable: AtomicBool,
}

impl InMemoryVersionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("counter store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VersionCounterStore for InMemoryVersionCounters {
    async fn current(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        self.check_available()?;
        let counters = self
            .counters
            .lock()
            .map_err(|_| CacheError::Command("lock poisoned".to_string()))?;
        Ok(counters.get(&(tenant_id, entity_type)).copied().unwrap_or(0))
    }

    async fn bump(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        self.check_available()?;
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| CacheError::Command("lock poisoned".to_string()))?;
        let counter = counters.entry((tenant_id, entity_type)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

/// Counters as rows of `cache_version_counters`, incremented with an upsert.
#[derive(Debug, Clone)]
pub struct PostgresVersionCounters {
    pool: Arc<PgPool>,
}

impl PostgresVersionCounters {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CacheError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            CacheError::Unavailable(format!("{operation}: {err}"))
        }
        other => CacheError::Command(format!("{operation}: {other}")),
    }
}

#[async_trait]
impl VersionCounterStore for PostgresVersionCounters {
    async fn current(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        let row = sqlx::query(
            "SELECT counter FROM cache_version_counters WHERE tenant_id = $1 AND entity_type = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(entity_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("counter.current", e))?;

        match row {
            Some(row) => {
                let counter: i64 = row
                    .try_get("counter")
                    .map_err(|e| map_sqlx_error("counter.current", e))?;
                Ok(counter as u64)
            }
            None => Ok(0),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn bump(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        let row = sqlx::query(
            r#"
            INSERT INTO cache_version_counters (tenant_id, entity_type, counter)
            VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, entity_type)
            DO UPDATE SET counter = cache_version_counters.counter + 1
            RETURNING counter
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(entity_type.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("counter.bump", e))?;

        let counter: i64 = row
            .try_get("counter")
            .map_err(|e| map_sqlx_error("counter.bump", e))?;
        Ok(counter as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_are_per_tenant_and_type() {
        let counters = InMemoryVersionCounters::new();
        let a = TenantId::new();
        let b = TenantId::new();

        assert_eq!(counters.current(a, EntityType::Product).await.unwrap(), 0);
        assert_eq!(counters.bump(a, EntityType::Product).await.unwrap(), 1);
        assert_eq!(counters.bump(a, EntityType::Product).await.unwrap(), 2);
        assert_eq!(counters.current(a, EntityType::Category).await.unwrap(), 0);
        assert_eq!(counters.current(b, EntityType::Product).await.unwrap(), 0);
    }
}

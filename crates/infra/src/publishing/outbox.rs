//! Durable per-tenant queue of committed events awaiting delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use marketplace_core::TenantId;
use marketplace_events::DomainEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    #[error("outbox unavailable: {0}")]
    Unavailable(String),

    #[error("outbox backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Enqueue order; relay order within a tenant.
    pub seq: u64,
    pub tenant_id: TenantId,
    pub event: DomainEvent,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-tenant FIFO of undelivered events. Every committed event passes
/// through it; delivery acks the entry.
///
/// Enqueue is idempotent on the event id: re-enqueueing an event that is
/// already pending is a no-op.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(&self, event: &DomainEvent) -> Result<(), OutboxError>;

    async fn has_pending(&self, tenant_id: TenantId) -> Result<bool, OutboxError>;

    async fn pending_tenants(&self) -> Result<Vec<TenantId>, OutboxError>;

    /// Oldest `limit` entries of the tenant, in enqueue order.
    async fn peek(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn ack(&self, tenant_id: TenantId, seq: u64) -> Result<(), OutboxError>;

    async fn pending_count(&self) -> Result<usize, OutboxError>;
}

#[async_trait]
impl<O> OutboxStore for Arc<O>
where
    O: OutboxStore + ?Sized,
{
    async fn enqueue(&self, event: &DomainEvent) -> Result<(), OutboxError> {
        (**self).enqueue(event).await
    }

    async fn has_pending(&self, tenant_id: TenantId) -> Result<bool, OutboxError> {
        (**self).has_pending(tenant_id).await
    }

    async fn pending_tenants(&self) -> Result<Vec<TenantId>, OutboxError> {
        (**self).pending_tenants().await
    }

    async fn peek(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        (**self).peek(tenant_id, limit).await
    }

    async fn ack(&self, tenant_id: TenantId, seq: u64) -> Result<(), OutboxError> {
        (**self).ack(tenant_id, seq).await
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        (**self).pending_count().await
    }
}

#[derive(Debug, Default)]
struct OutboxState {
    next_seq: u64,
    entries: BTreeMap<u64, OutboxEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    state: Mutex<OutboxState>,
    unavailable: AtomicBool,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, OutboxState>, OutboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutboxError::Unavailable("outbox unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| OutboxError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn enqueue(&self, event: &DomainEvent) -> Result<(), OutboxError> {
        let mut state = self.lock()?;
        if state.entries.values().any(|e| e.event.id == event.id) {
            return Ok(());
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.insert(
            seq,
            OutboxEntry {
                seq,
                tenant_id: event.tenant_id,
                event: event.clone(),
                enqueued_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn has_pending(&self, tenant_id: TenantId) -> Result<bool, OutboxError> {
        Ok(self.lock()?.entries.values().any(|e| e.tenant_id == tenant_id))
    }

    async fn pending_tenants(&self) -> Result<Vec<TenantId>, OutboxError> {
        let tenants: BTreeSet<TenantId> = self.lock()?.entries.values().map(|e| e.tenant_id).collect();
        Ok(tenants.into_iter().collect())
    }

    async fn peek(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        Ok(self
            .lock()?
            .entries
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ack(&self, tenant_id: TenantId, seq: u64) -> Result<(), OutboxError> {
        let mut state = self.lock()?;
        if state.entries.get(&seq).is_some_and(|e| e.tenant_id == tenant_id) {
            state.entries.remove(&seq);
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        Ok(self.lock()?.entries.len())
    }
}

/// Outbox rows in `catalog_outbox`, ordered by a `BIGSERIAL`.
#[derive(Debug, Clone)]
pub struct PostgresOutbox {
    pool: Arc<PgPool>,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            OutboxError::Unavailable(format!("{operation}: {err}"))
        }
        other => OutboxError::Backend(format!("{operation}: {other}")),
    }
}

/// Append `event` to `catalog_outbox` on any executor, so a store can stage
/// it inside the transaction that commits the change.
pub(crate) async fn insert_outbox_row<'e, E>(executor: E, event: &DomainEvent) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let json = serde_json::to_value(event).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO catalog_outbox (tenant_id, event_id, event)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, event_id) DO NOTHING
        "#,
    )
    .bind(event.tenant_id.as_uuid())
    .bind(event.id)
    .bind(&json)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, event_id = %event.id), err)]
    async fn enqueue(&self, event: &DomainEvent) -> Result<(), OutboxError> {
        insert_outbox_row(&*self.pool, event)
            .await
            .map_err(|e| map_sqlx_error("outbox.enqueue", e))
    }

    async fn has_pending(&self, tenant_id: TenantId) -> Result<bool, OutboxError> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM catalog_outbox WHERE tenant_id = $1) AS pending")
            .bind(tenant_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox.has_pending", e))?;
        row.try_get("pending")
            .map_err(|e| map_sqlx_error("outbox.has_pending", e))
    }

    async fn pending_tenants(&self) -> Result<Vec<TenantId>, OutboxError> {
        let rows = sqlx::query("SELECT DISTINCT tenant_id FROM catalog_outbox ORDER BY tenant_id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox.pending_tenants", e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("tenant_id")
                    .map(TenantId::from_uuid)
                    .map_err(|e| map_sqlx_error("outbox.pending_tenants", e))
            })
            .collect()
    }

    async fn peek(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT seq, tenant_id, event, enqueued_at
            FROM catalog_outbox
            WHERE tenant_id = $1
            ORDER BY seq ASC
            LIMIT $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox.peek", e))?;

        rows.iter()
            .map(|row| {
                let seq: i64 = row.try_get("seq").map_err(|e| map_sqlx_error("outbox.peek", e))?;
                let tenant: Uuid = row.try_get("tenant_id").map_err(|e| map_sqlx_error("outbox.peek", e))?;
                let event: serde_json::Value = row.try_get("event").map_err(|e| map_sqlx_error("outbox.peek", e))?;
                let enqueued_at: DateTime<Utc> = row
                    .try_get("enqueued_at")
                    .map_err(|e| map_sqlx_error("outbox.peek", e))?;
                let event: DomainEvent = serde_json::from_value(event)
                    .map_err(|e| OutboxError::Backend(format!("corrupt outbox entry {seq}: {e}")))?;
                Ok(OutboxEntry {
                    seq: seq as u64,
                    tenant_id: TenantId::from_uuid(tenant),
                    event,
                    enqueued_at,
                })
            })
            .collect()
    }

    async fn ack(&self, tenant_id: TenantId, seq: u64) -> Result<(), OutboxError> {
        sqlx::query("DELETE FROM catalog_outbox WHERE tenant_id = $1 AND seq = $2")
            .bind(tenant_id.as_uuid())
            .bind(seq as i64)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox.ack", e))?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM catalog_outbox")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("outbox.pending_count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("outbox.pending_count", e))?;
        Ok(total as usize)
    }
}

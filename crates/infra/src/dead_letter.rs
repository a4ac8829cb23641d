//! Records of post-commit side effects that exhausted their retries.
//!
//! A dead letter carries the full committed change, so replaying it needs
//! nothing but the record itself.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use marketplace_core::{EntityId, TenantId};

use crate::capability::CommittedChange;
use crate::store::StoreError;

/// Which side effect failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffect {
    DetailInvalidation,
    CollectionBump,
    SearchSync,
    Publish,
}

impl SideEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffect::DetailInvalidation => "detail_invalidation",
            SideEffect::CollectionBump => "collection_bump",
            SideEffect::SearchSync => "search_sync",
            SideEffect::Publish => "publish",
        }
    }
}

impl FromStr for SideEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detail_invalidation" => Ok(SideEffect::DetailInvalidation),
            "collection_bump" => Ok(SideEffect::CollectionBump),
            "search_sync" => Ok(SideEffect::SearchSync),
            "publish" => Ok(SideEffect::Publish),
            other => Err(format!("unknown side effect `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub side_effect: SideEffect,
    pub attempts: u32,
    pub last_error: String,
    pub change: CommittedChange,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(side_effect: SideEffect, attempts: u32, last_error: String, change: CommittedChange) -> Self {
        Self {
            id: Uuid::now_v7(),
            side_effect,
            attempts,
            last_error,
            change,
            failed_at: Utc::now(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.change.entity.tenant_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.change.entity.id
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError>;

    /// Oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;

    async fn remove(&self, id: Uuid) -> Result<(), StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
impl<D> DeadLetterStore for Arc<D>
where
    D: DeadLetterStore + ?Sized,
{
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        (**self).record(letter).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        (**self).list(limit).await
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        (**self).remove(id).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        (**self).count().await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetters {
    // UUIDv7 keys sort by creation time.
    letters: Mutex<BTreeMap<Uuid, DeadLetter>>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetters {
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let mut letters = self.letters.lock().map_err(|_| Self::poisoned())?;
        letters.insert(letter.id, letter);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let letters = self.letters.lock().map_err(|_| Self::poisoned())?;
        Ok(letters.values().take(limit).cloned().collect())
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let mut letters = self.letters.lock().map_err(|_| Self::poisoned())?;
        letters.remove(&id);
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.letters.lock().map_err(|_| Self::poisoned())?.len())
    }
}

#[derive(Debug, Clone)]
pub struct PostgresDeadLetters {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetters {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn decode_letter(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, StoreError> {
    let read_err = |e: sqlx::Error| StoreError::Backend(format!("dead letter row: {e}"));
    let side_effect: String = row.try_get("side_effect").map_err(read_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(read_err)?;
    let change: serde_json::Value = row.try_get("change").map_err(read_err)?;

    Ok(DeadLetter {
        id: row.try_get("id").map_err(read_err)?,
        side_effect: side_effect.parse().map_err(StoreError::Backend)?,
        attempts: attempts as u32,
        last_error: row.try_get("last_error").map_err(read_err)?,
        change: serde_json::from_value(change)
            .map_err(|e| StoreError::Backend(format!("corrupt dead letter: {e}")))?,
        failed_at: row.try_get("failed_at").map_err(read_err)?,
    })
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetters {
    #[instrument(skip(self, letter), fields(tenant_id = %letter.tenant_id(), side_effect = letter.side_effect.as_str()), err)]
    async fn record(&self, letter: DeadLetter) -> Result<(), StoreError> {
        let change = serde_json::to_value(&letter.change)
            .map_err(|e| StoreError::Backend(format!("change not serializable: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO catalog_dead_letters
                (id, tenant_id, entity_id, version, side_effect, attempts, last_error, change, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(letter.id)
        .bind(letter.tenant_id().as_uuid())
        .bind(letter.entity_id().as_uuid())
        .bind(letter.change.entity.version as i64)
        .bind(letter.side_effect.as_str())
        .bind(letter.attempts as i32)
        .bind(&letter.last_error)
        .bind(&change)
        .bind(letter.failed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("dead letter insert: {e}")))?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, side_effect, attempts, last_error, change, failed_at
            FROM catalog_dead_letters
            ORDER BY failed_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("dead letter list: {e}")))?;

        rows.iter().map(decode_letter).collect()
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM catalog_dead_letters WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("dead letter delete: {e}")))?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM catalog_dead_letters")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("dead letter count: {e}")))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| StoreError::Backend(format!("dead letter count: {e}")))?;
        Ok(total as usize)
    }
}

//! Postgres-backed primary store.
//!
//! ## Optimistic Concurrency
//!
//! Updates and deletes are a single conditional statement:
//!
//! ```sql
//! UPDATE catalog_entities SET version = version + 1, ...
//! WHERE tenant_id = $1 AND entity_type = $2 AND id = $3
//!   AND version = $expected AND deleted = FALSE
//! RETURNING ...
//! ```
//!
//! Zero affected rows means the CAS lost; a follow-up read tells `NotFound`
//! apart from `Conflict`.
//!
//! ## Transactional Outbox
//!
//! Each mutation appends its domain event to `catalog_outbox` in the same
//! transaction as the row change. An event exists exactly when its commit
//! does; the publisher's own enqueue of the same event id is a no-op.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Backend` (duplicate id) |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Io / other | N/A | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use marketplace_catalog::{CatalogEntity, ListFilter, NewEntity};
use marketplace_core::{EntityId, EntityType, ExpectedVersion, TenantId, UserId};
use marketplace_events::Operation;

use super::{CatalogStore, StoreError};
use crate::publishing::outbox::insert_outbox_row;

const ENTITY_COLUMNS: &str =
    "id, tenant_id, entity_type, version, payload, deleted, created_at, updated_at, created_by, updated_by";

/// Postgres-backed primary store.
///
/// ## Tenant Isolation
///
/// Every statement filters on `tenant_id`, which is also the leading column of
/// the primary key.
#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: Arc<PgPool>,
}

impl PostgresCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn current_version(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<(u64, bool)>, StoreError> {
        let row = sqlx::query(
            "SELECT version, deleted FROM catalog_entities WHERE tenant_id = $1 AND entity_type = $2 AND id = $3",
        )
        .bind(tenant_id.as_uuid())
        .bind(entity_type.as_str())
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_version", e))?;

        match row {
            Some(row) => {
                let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("current_version", e))?;
                let deleted: bool = row.try_get("deleted").map_err(|e| map_sqlx_error("current_version", e))?;
                Ok(Some((version as u64, deleted)))
            }
            None => Ok(None),
        }
    }

    /// Classify a CAS that touched no row.
    async fn cas_failure(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
    ) -> StoreError {
        match self.current_version(tenant_id, entity_type, id).await {
            Ok(Some((actual, false))) => StoreError::Conflict {
                expected: expected.value(),
                actual,
            },
            Ok(_) => StoreError::NotFound,
            Err(e) => e,
        }
    }

    fn decode_all(rows: Vec<sqlx::postgres::PgRow>, operation: &str) -> Result<Vec<CatalogEntity>, StoreError> {
        rows.iter()
            .map(|row| decode_entity(row).map_err(|e| map_sqlx_error(operation, e)))
            .collect()
    }
}

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    #[instrument(
        skip(self, entity),
        fields(tenant_id = %entity.tenant_id, entity_id = %entity.id),
        err
    )]
    async fn insert(&self, entity: NewEntity) -> Result<CatalogEntity, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO catalog_entities
                (id, tenant_id, entity_type, version, payload, deleted, created_at, updated_at, created_by, updated_by)
            VALUES ($1, $2, $3, 1, $4, FALSE, NOW(), NOW(), $5, $5)
            RETURNING {ENTITY_COLUMNS}
            "#
        );
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("insert", e))?;
        let row = sqlx::query(&sql)
            .bind(entity.id.as_uuid())
            .bind(entity.tenant_id.as_uuid())
            .bind(entity.entity_type.as_str())
            .bind(&entity.payload)
            .bind(entity.created_by.map(Uuid::from))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        let committed = decode_entity(&row).map_err(|e| map_sqlx_error("insert", e))?;
        commit_with_event(tx, &committed, Operation::Create, "insert").await?;
        Ok(committed)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn get(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM catalog_entities WHERE tenant_id = $1 AND entity_type = $2 AND id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entity_type.as_str())
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_entity(&r))
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }

    #[instrument(skip(self, payload), fields(tenant_id = %tenant_id, expected = expected.value()), err)]
    async fn update_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        payload: JsonValue,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError> {
        let sql = format!(
            r#"
            UPDATE catalog_entities
            SET payload = $5, version = version + 1, updated_at = NOW(), updated_by = $6
            WHERE tenant_id = $1 AND entity_type = $2 AND id = $3
                AND version = $4 AND deleted = FALSE
            RETURNING {ENTITY_COLUMNS}
            "#
        );
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("update_cas", e))?;
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entity_type.as_str())
            .bind(id.as_uuid())
            .bind(expected.value() as i64)
            .bind(&payload)
            .bind(actor.map(Uuid::from))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_cas", e))?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.cas_failure(tenant_id, entity_type, id, expected).await);
        };
        let committed = decode_entity(&row).map_err(|e| map_sqlx_error("update_cas", e))?;
        commit_with_event(tx, &committed, Operation::Update, "update_cas").await?;
        Ok(committed)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, expected = expected.value()), err)]
    async fn soft_delete_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError> {
        let sql = format!(
            r#"
            UPDATE catalog_entities
            SET deleted = TRUE, version = version + 1, updated_at = NOW(), updated_by = $5
            WHERE tenant_id = $1 AND entity_type = $2 AND id = $3
                AND version = $4 AND deleted = FALSE
            RETURNING {ENTITY_COLUMNS}
            "#
        );
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("soft_delete_cas", e))?;
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entity_type.as_str())
            .bind(id.as_uuid())
            .bind(expected.value() as i64)
            .bind(actor.map(Uuid::from))
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("soft_delete_cas", e))?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.cas_failure(tenant_id, entity_type, id, expected).await);
        };
        let committed = decode_entity(&row).map_err(|e| map_sqlx_error("soft_delete_cas", e))?;
        commit_with_event(tx, &committed, Operation::Delete, "soft_delete_cas").await?;
        Ok(committed)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn list(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
    ) -> Result<Vec<CatalogEntity>, StoreError> {
        let rows = match entity_type {
            EntityType::Product => {
                let sql = format!(
                    r#"
                    SELECT {ENTITY_COLUMNS} FROM catalog_entities
                    WHERE tenant_id = $1 AND entity_type = 'product' AND deleted = FALSE
                        AND ($2::text IS NULL OR payload->>'category_id' = $2)
                        AND ($3::text IS NULL OR payload->>'vendor_id' = $3)
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4 OFFSET $5
                    "#
                );
                sqlx::query(&sql)
                    .bind(tenant_id.as_uuid())
                    .bind(filter.category_id.map(|id| id.to_string()))
                    .bind(filter.vendor_id.map(|id| id.to_string()))
                    .bind(filter.limit() as i64)
                    .bind(filter.offset() as i64)
                    .fetch_all(&*self.pool)
                    .await
            }
            EntityType::Category => {
                let sql = format!(
                    r#"
                    SELECT {ENTITY_COLUMNS} FROM catalog_entities
                    WHERE tenant_id = $1 AND entity_type = 'category' AND deleted = FALSE
                        AND payload->>'parent_id' IS NOT DISTINCT FROM $2::text
                    ORDER BY COALESCE((payload->>'order_index')::int, 0), payload->>'name', id
                    LIMIT $3 OFFSET $4
                    "#
                );
                sqlx::query(&sql)
                    .bind(tenant_id.as_uuid())
                    .bind(filter.parent_id.map(|id| id.to_string()))
                    .bind(filter.limit() as i64)
                    .bind(filter.offset() as i64)
                    .fetch_all(&*self.pool)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("list", e))?;

        Self::decode_all(rows, "list")
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_all(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
    ) -> Result<Vec<CatalogEntity>, StoreError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM catalog_entities WHERE tenant_id = $1 AND entity_type = $2 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(entity_type.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_all", e))?;

        Self::decode_all(rows, "list_all")
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT tenant_id FROM catalog_entities ORDER BY tenant_id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tenants", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("tenant_id")
                    .map(TenantId::from_uuid)
                    .map_err(|e| map_sqlx_error("list_tenants", e))
            })
            .collect()
    }
}

/// Stage the change's event in the outbox, then commit both.
async fn commit_with_event(
    mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
    committed: &CatalogEntity,
    operation: Operation,
    context: &str,
) -> Result<(), StoreError> {
    insert_outbox_row(&mut *tx, &committed.to_event(operation))
        .await
        .map_err(|e| map_sqlx_error(context, e))?;
    tx.commit().await.map_err(|e| map_sqlx_error(context, e))
}

fn decode_entity(row: &sqlx::postgres::PgRow) -> Result<CatalogEntity, sqlx::Error> {
    let entity_type: String = row.try_get("entity_type")?;
    let entity_type = entity_type
        .parse::<EntityType>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let version: i64 = row.try_get("version")?;
    let created_by: Option<Uuid> = row.try_get("created_by")?;
    let updated_by: Option<Uuid> = row.try_get("updated_by")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(CatalogEntity {
        id: EntityId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        entity_type,
        version: version as u64,
        payload: row.try_get("payload")?,
        deleted: row.try_get("deleted")?,
        created_at,
        updated_at,
        created_by: created_by.map(UserId::from_uuid),
        updated_by: updated_by.map(UserId::from_uuid),
    })
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Backend(format!(
                "database error in {operation} (code {code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Backend(format!("connection pool closed during {operation}")),
        other => StoreError::Backend(format!("{operation}: {other}")),
    }
}

//! Primary store: the relational source of truth for catalog entities.
//!
//! Versions are assigned here and nowhere else. Updates and deletes are
//! row-level compare-and-swap operations on `version`; there is no
//! distributed lock.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use marketplace_catalog::{CatalogEntity, ListFilter, NewEntity};
use marketplace_core::{EntityId, EntityType, ExpectedVersion, TenantId, UserId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCatalogStore;
pub use postgres::PostgresCatalogStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No live row for `(tenant, type, id)`.
    #[error("entity not found")]
    NotFound,

    /// The compare-and-swap lost: the row moved on since it was read.
    #[error("version conflict (expected {expected}, actual {actual})")]
    Conflict { expected: u64, actual: u64 },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Tenant-scoped persistence for catalog entities.
///
/// Every method takes the tenant id and filters on it; rows of another tenant
/// behave exactly like missing rows.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Persist a new entity at version 1.
    async fn insert(&self, entity: NewEntity) -> Result<CatalogEntity, StoreError>;

    /// Fetch a row, including soft-deleted ones.
    async fn get(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<CatalogEntity>, StoreError>;

    /// Replace the payload if the stored version equals `expected`.
    async fn update_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        payload: JsonValue,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError>;

    /// Mark deleted if the stored version equals `expected`.
    async fn soft_delete_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError>;

    /// Live entities matching `filter`, ordered and paginated.
    async fn list(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
    ) -> Result<Vec<CatalogEntity>, StoreError>;

    /// Every row of a type for a tenant, deleted ones included (reconciliation).
    async fn list_all(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
    ) -> Result<Vec<CatalogEntity>, StoreError>;

    /// Tenants that own at least one row.
    async fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError>;
}

#[async_trait]
impl<S> CatalogStore for Arc<S>
where
    S: CatalogStore + ?Sized,
{
    async fn insert(&self, entity: NewEntity) -> Result<CatalogEntity, StoreError> {
        (**self).insert(entity).await
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        (**self).get(tenant_id, entity_type, id).await
    }

    async fn update_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        payload: JsonValue,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError> {
        (**self)
            .update_cas(tenant_id, entity_type, id, payload, expected, actor)
            .await
    }

    async fn soft_delete_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError> {
        (**self)
            .soft_delete_cas(tenant_id, entity_type, id, expected, actor)
            .await
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
    ) -> Result<Vec<CatalogEntity>, StoreError> {
        (**self).list(tenant_id, entity_type, filter).await
    }

    async fn list_all(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
    ) -> Result<Vec<CatalogEntity>, StoreError> {
        (**self).list_all(tenant_id, entity_type).await
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        (**self).list_tenants().await
    }
}

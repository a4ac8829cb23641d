//! Capabilities the write coordinator dispatches committed changes to.
//!
//! The coordinator only knows these seams; cache, search and event backends
//! plug in behind them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use marketplace_catalog::CatalogEntity;
use marketplace_core::{EntityId, EntityType, TenantId};
use marketplace_events::{DomainEvent, Operation};

use crate::error::SyncError;

/// A committed mutation, as handed to side effects and persisted in dead
/// letters. Everything downstream can be rebuilt from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedChange {
    pub entity: CatalogEntity,
    pub operation: Operation,
}

impl CommittedChange {
    pub fn new(entity: CatalogEntity, operation: Operation) -> Self {
        Self { entity, operation }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.entity.tenant_id
    }

    pub fn event(&self) -> DomainEvent {
        self.entity.to_event(self.operation)
    }
}

#[async_trait]
pub trait Invalidatable: Send + Sync {
    /// Delete the entity-detail key.
    async fn invalidate_detail(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<(), SyncError>;

    /// Move the `(tenant, type)` collection keys to a new version.
    async fn bump_collections(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<(), SyncError>;
}

#[async_trait]
pub trait Upsertable: Send + Sync {
    /// Index a live entity or drop the document of a deleted one.
    async fn sync_entity(&self, entity: &CatalogEntity) -> Result<(), SyncError>;
}

/// Where an event ended up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Still in the outbox; the relay delivers it later, in order.
    Outboxed,
}

#[async_trait]
pub trait Publishable: Send + Sync {
    /// Durably record `event` for delivery. Idempotent on the event id.
    async fn stage(&self, event: &DomainEvent) -> Result<(), SyncError>;

    /// Send the tenant's staged events in order, stopping at the first
    /// transport failure.
    async fn deliver(&self, tenant_id: TenantId) -> Result<PublishOutcome, SyncError>;

    /// Stage then deliver.
    async fn publish(&self, event: &DomainEvent) -> Result<PublishOutcome, SyncError> {
        self.stage(event).await?;
        self.deliver(event.tenant_id).await
    }
}

#[async_trait]
impl<T> Invalidatable for Arc<T>
where
    T: Invalidatable + ?Sized,
{
    async fn invalidate_detail(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<(), SyncError> {
        (**self).invalidate_detail(tenant_id, entity_type, id).await
    }

    async fn bump_collections(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<(), SyncError> {
        (**self).bump_collections(tenant_id, entity_type).await
    }
}

#[async_trait]
impl<T> Upsertable for Arc<T>
where
    T: Upsertable + ?Sized,
{
    async fn sync_entity(&self, entity: &CatalogEntity) -> Result<(), SyncError> {
        (**self).sync_entity(entity).await
    }
}

#[async_trait]
impl<T> Publishable for Arc<T>
where
    T: Publishable + ?Sized,
{
    async fn stage(&self, event: &DomainEvent) -> Result<(), SyncError> {
        (**self).stage(event).await
    }

    async fn deliver(&self, tenant_id: TenantId) -> Result<PublishOutcome, SyncError> {
        (**self).deliver(tenant_id).await
    }

    async fn publish(&self, event: &DomainEvent) -> Result<PublishOutcome, SyncError> {
        (**self).publish(event).await
    }
}

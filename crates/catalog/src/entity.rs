//! Catalog entity lifecycle.
//!
//! ```text
//! (new) --create--> Active(1) --update--> Active(v+1) --delete--> Deleted(v+1)
//! ```
//!
//! `Active -> Active` and `Active -> Deleted` are guarded by a compare-and-swap
//! on the version. `Deleted` is terminal: no further updates, no resurrection.
//! Versions are assigned by the primary store; the planning functions here only
//! decide whether a transition is allowed and what the next payload is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketplace_core::{
    DomainError, DomainResult, EntityId, EntityType, ExpectedVersion, TenantId, UserId, Versioned,
};
use marketplace_events::{DomainEvent, Operation, TenantScoped};

use crate::payload;

/// Canonical copy of a product or category, owned by the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub version: u64,
    pub payload: JsonValue,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<UserId>,
    pub updated_by: Option<UserId>,
}

/// Lifecycle state, as a value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntityState {
    Active(u64),
    Deleted(u64),
}

/// A validated entity ready to be inserted. The store assigns version 1 and
/// the timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub id: EntityId,
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub payload: JsonValue,
    pub created_by: Option<UserId>,
}

impl NewEntity {
    /// Validate `payload` and allocate a fresh id.
    pub fn prepare(
        tenant_id: TenantId,
        entity_type: EntityType,
        payload: JsonValue,
        created_by: Option<UserId>,
    ) -> DomainResult<Self> {
        if tenant_id.is_nil() {
            return Err(DomainError::validation("missing tenant context"));
        }
        let payload = payload::normalize(entity_type, payload)?;
        Ok(Self {
            id: EntityId::new(),
            tenant_id,
            entity_type,
            payload,
            created_by,
        })
    }

    /// Materialize the committed row (version 1).
    pub fn into_entity(self, committed_at: DateTime<Utc>) -> CatalogEntity {
        CatalogEntity {
            id: self.id,
            tenant_id: self.tenant_id,
            entity_type: self.entity_type,
            version: 1,
            payload: self.payload,
            deleted: false,
            created_at: committed_at,
            updated_at: committed_at,
            created_by: self.created_by,
            updated_by: self.created_by,
        }
    }
}

impl CatalogEntity {
    pub fn state(&self) -> EntityState {
        if self.deleted {
            EntityState::Deleted(self.version)
        } else {
            EntityState::Active(self.version)
        }
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Decide the payload an update would commit.
    ///
    /// Cross-tenant access and deleted entities both surface as `NotFound` so
    /// that callers cannot discover another tenant's data.
    pub fn plan_update(
        &self,
        tenant_id: TenantId,
        patch: &JsonValue,
        expected: ExpectedVersion,
    ) -> DomainResult<JsonValue> {
        self.ensure_visible_to(tenant_id)?;
        expected.check(self.version)?;
        let next = payload::apply_patch(self.entity_type, &self.payload, patch)?;

        if self.entity_type == EntityType::Category
            && next.get("parent_id").and_then(JsonValue::as_str)
                == Some(self.id.to_string().as_str())
        {
            return Err(DomainError::validation("a category cannot be its own parent"));
        }
        Ok(next)
    }

    /// Decide whether a soft delete is allowed.
    pub fn plan_delete(&self, tenant_id: TenantId, expected: ExpectedVersion) -> DomainResult<()> {
        self.ensure_visible_to(tenant_id)?;
        expected.check(self.version)
    }

    /// Apply a committed update (used by stores after a successful CAS).
    pub fn committed_update(
        &self,
        payload: JsonValue,
        actor: Option<UserId>,
        committed_at: DateTime<Utc>,
    ) -> CatalogEntity {
        CatalogEntity {
            version: self.version + 1,
            payload,
            updated_at: committed_at,
            updated_by: actor,
            ..self.clone()
        }
    }

    /// Apply a committed soft delete.
    pub fn committed_delete(&self, actor: Option<UserId>, committed_at: DateTime<Utc>) -> CatalogEntity {
        CatalogEntity {
            version: self.version + 1,
            deleted: true,
            updated_at: committed_at,
            updated_by: actor,
            ..self.clone()
        }
    }

    /// The domain event describing the mutation that produced this version.
    ///
    /// `emitted_at` is the commit timestamp, so rebuilding the event for a
    /// retry or a dead-letter replay yields an identical event.
    pub fn to_event(&self, operation: Operation) -> DomainEvent {
        DomainEvent::new(
            self.tenant_id,
            self.entity_type,
            self.id,
            operation,
            self.version,
            self.payload.clone(),
            self.updated_at,
        )
    }

    fn ensure_visible_to(&self, tenant_id: TenantId) -> DomainResult<()> {
        if self.tenant_id != tenant_id || self.deleted {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }
}

impl Versioned for CatalogEntity {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl TenantScoped for CatalogEntity {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use marketplace_core::{EntityId, EntityType, TenantId};

/// Versioned name of the catalog event stream (wire contract).
pub const EVENT_STREAM: &str = "catalog.events.v1";

/// Schema version of [`DomainEvent`]. Bump together with [`EVENT_STREAM`].
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Namespace for deterministic event ids (UUIDv5).
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x3c1e_9f0a_58b4_4d7e_a2f1_6d0c_91b7_e845);

/// Kind of committed mutation an event describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Past-tense verb used in event type names.
    pub fn past_tense(&self) -> &'static str {
        match self {
            Operation::Create => "created",
            Operation::Update => "updated",
            Operation::Delete => "deleted",
        }
    }
}

/// A committed catalog mutation, as seen by downstream services.
///
/// Serialized as `{id, tenantId, entityType, entityId, operation, version,
/// payload, emittedAt}`. Other services depend on this shape; changing it
/// requires a new [`EVENT_STREAM`] version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation: Operation,
    pub version: u64,
    pub payload: JsonValue,
    pub emitted_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Deterministic event id: the same `(entity_id, version)` always yields
    /// the same id, so redeliveries can be deduplicated by consumers.
    pub fn event_id(entity_id: EntityId, version: u64) -> Uuid {
        let name = format!("{}:{}", entity_id.as_uuid(), version);
        Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
    }

    pub fn new(
        tenant_id: TenantId,
        entity_type: EntityType,
        entity_id: EntityId,
        operation: Operation,
        version: u64,
        payload: JsonValue,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Self::event_id(entity_id, version),
            tenant_id,
            entity_type,
            entity_id,
            operation,
            version,
            payload,
            emitted_at,
        }
    }

    /// Stable event type name (e.g. "catalog.product.created").
    pub fn event_type(&self) -> String {
        format!(
            "catalog.{}.{}",
            self.entity_type.as_str(),
            self.operation.past_tense()
        )
    }

    /// Partition/ordering key: all events of one tenant share a partition.
    pub fn partition_key(&self) -> String {
        self.tenant_id.to_string()
    }
}

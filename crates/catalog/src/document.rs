//! Search projection of catalog entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketplace_core::{EntityId, EntityType, TenantId, Versioned};
use marketplace_events::TenantScoped;

use crate::entity::CatalogEntity;

/// What the full-text index stores for one entity.
///
/// `tenant_id` is a mandatory filter field: every query is scoped by it before
/// any caller-supplied clause is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub version: u64,
    pub title: String,
    pub body: Option<String>,
    pub sku: Option<String>,
    pub tags: Vec<String>,
    pub category_id: Option<EntityId>,
    pub parent_id: Option<EntityId>,
    pub price: Option<f64>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl SearchDocument {
    /// Project a live entity. Deleted entities have no document.
    pub fn project(entity: &CatalogEntity) -> Option<Self> {
        if entity.deleted {
            return None;
        }
        let p = &entity.payload;
        let text = |field: &str| p.get(field).and_then(JsonValue::as_str).map(str::to_string);
        let id = |field: &str| {
            p.get(field)
                .and_then(JsonValue::as_str)
                .and_then(|s| s.parse::<EntityId>().ok())
        };

        Some(Self {
            tenant_id: entity.tenant_id,
            entity_type: entity.entity_type,
            entity_id: entity.id,
            version: entity.version,
            title: text("name").unwrap_or_default(),
            body: text("description"),
            sku: text("sku"),
            tags: p
                .get("tags")
                .and_then(JsonValue::as_array)
                .map(|tags| tags.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            category_id: id("category_id"),
            parent_id: id("parent_id"),
            price: p.get("price").and_then(JsonValue::as_f64),
            is_active: p.get("is_active").and_then(JsonValue::as_bool).unwrap_or(true),
            updated_at: entity.updated_at,
        })
    }

    /// Lowercased word tokens of every full-text field.
    pub fn tokens(&self) -> Vec<String> {
        let mut out = tokenize(&self.title);
        if let Some(body) = &self.body {
            out.extend(tokenize(body));
        }
        if let Some(sku) = &self.sku {
            out.extend(tokenize(sku));
        }
        for tag in &self.tags {
            out.extend(tokenize(tag));
        }
        out
    }
}

/// Split on anything that is not alphanumeric and lowercase.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl Versioned for SearchDocument {
    fn entity_id(&self) -> EntityId {
        self.entity_id
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

impl TenantScoped for SearchDocument {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

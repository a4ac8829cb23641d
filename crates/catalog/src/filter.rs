//! Collection (list) filters.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use marketplace_core::{EntityId, EntityType, UserId};

use crate::digest::short_digest;
use crate::entity::CatalogEntity;

pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_LIMIT: u32 = 100;

/// Filters accepted by list endpoints.
///
/// Products filter on `category_id`/`vendor_id` and are listed newest first.
/// Categories filter on `parent_id` (absent means root categories) and are
/// listed by `order_index`, then `name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default)]
    pub vendor_id: Option<UserId>,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// The normalized subset of a filter that actually affects a result set.
#[derive(Serialize)]
struct FilterKey<'a> {
    entity_type: &'a str,
    category_id: Option<EntityId>,
    vendor_id: Option<UserId>,
    parent_id: Option<EntityId>,
    limit: u32,
    offset: u32,
}

impl ListFilter {
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// Stable digest of the filter, embedded in collection cache keys.
    ///
    /// Filters that yield the same result set for `entity_type` hash equally.
    pub fn filter_hash(&self, entity_type: EntityType) -> String {
        let key = match entity_type {
            EntityType::Product => FilterKey {
                entity_type: entity_type.as_str(),
                category_id: self.category_id,
                vendor_id: self.vendor_id,
                parent_id: None,
                limit: self.limit(),
                offset: self.offset(),
            },
            EntityType::Category => FilterKey {
                entity_type: entity_type.as_str(),
                category_id: None,
                vendor_id: None,
                parent_id: self.parent_id,
                limit: self.limit(),
                offset: self.offset(),
            },
        };
        short_digest(&key)
    }

    /// Whether a live entity belongs to this filter's result set.
    pub fn matches(&self, entity: &CatalogEntity) -> bool {
        if entity.deleted {
            return false;
        }
        match entity.entity_type {
            EntityType::Product => {
                id_field_matches(&entity.payload, "category_id", self.category_id.map(|i| i.to_string()))
                    && id_field_matches(&entity.payload, "vendor_id", self.vendor_id.map(|i| i.to_string()))
            }
            EntityType::Category => {
                let parent = entity.payload.get("parent_id").and_then(JsonValue::as_str);
                match self.parent_id {
                    Some(p) => parent == Some(p.to_string().as_str()),
                    None => parent.is_none(),
                }
            }
        }
    }

    /// Filter, order and paginate a tenant's entities of one type.
    pub fn apply(
        &self,
        entity_type: EntityType,
        entities: impl IntoIterator<Item = CatalogEntity>,
    ) -> Vec<CatalogEntity> {
        let mut selected: Vec<CatalogEntity> = entities
            .into_iter()
            .filter(|e| e.entity_type == entity_type && self.matches(e))
            .collect();
        selected.sort_by(|a, b| compare_for_listing(entity_type, a, b));
        selected
            .into_iter()
            .skip(self.offset() as usize)
            .take(self.limit() as usize)
            .collect()
    }
}

fn id_field_matches(payload: &JsonValue, field: &str, wanted: Option<String>) -> bool {
    match wanted {
        Some(w) => payload.get(field).and_then(JsonValue::as_str) == Some(w.as_str()),
        None => true,
    }
}

fn compare_for_listing(entity_type: EntityType, a: &CatalogEntity, b: &CatalogEntity) -> Ordering {
    match entity_type {
        EntityType::Product => b
            .created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id)),
        EntityType::Category => {
            let order = |e: &CatalogEntity| e.payload.get("order_index").and_then(JsonValue::as_i64).unwrap_or(0);
            let name = |e: &CatalogEntity| {
                e.payload
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            order(a)
                .cmp(&order(b))
                .then_with(|| name(a).cmp(&name(b)))
                .then_with(|| a.id.cmp(&b.id))
        }
    }
}

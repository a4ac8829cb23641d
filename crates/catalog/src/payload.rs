//! Product and category payload rules.
//!
//! Payloads travel as JSON (the primary store keeps them as `jsonb`), but every
//! write goes through the typed structs here so that only well-formed,
//! normalized payloads are ever committed.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use marketplace_core::{DomainError, DomainResult, EntityId, EntityType, UserId};

/// Fields a product patch may touch. `vendor_id` is fixed at creation.
const PRODUCT_UPDATABLE: &[&str] = &[
    "category_id",
    "name",
    "description",
    "sku",
    "price",
    "compare_at_price",
    "cost_per_item",
    "stock",
    "images",
    "variants",
    "tags",
    "metadata",
    "is_active",
];

const CATEGORY_UPDATABLE: &[&str] = &[
    "parent_id",
    "name",
    "description",
    "slug",
    "icon_url",
    "order_index",
    "is_active",
];

fn default_true() -> bool {
    true
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Map::new())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductPayload {
    pub name: String,
    pub sku: String,
    pub price: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category_id: Option<EntityId>,
    #[serde(default)]
    pub vendor_id: Option<UserId>,
    #[serde(default)]
    pub compare_at_price: Option<f64>,
    #[serde(default)]
    pub cost_per_item: Option<f64>,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub images: Vec<JsonValue>,
    #[serde(default)]
    pub variants: Vec<JsonValue>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub metadata: JsonValue,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl ProductPayload {
    fn validate(&mut self) -> DomainResult<()> {
        self.name = self.name.trim().to_string();
        self.sku = self.sku.trim().to_string();

        if self.name.is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        if self.sku.is_empty() {
            return Err(DomainError::validation("product sku cannot be empty"));
        }
        ensure_amount("price", Some(self.price))?;
        ensure_amount("compare_at_price", self.compare_at_price)?;
        ensure_amount("cost_per_item", self.cost_per_item)?;
        if self.stock < 0 {
            return Err(DomainError::validation("stock cannot be negative"));
        }
        if !self.metadata.is_object() {
            return Err(DomainError::validation("metadata must be an object"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryPayload {
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub order_index: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl CategoryPayload {
    fn validate(&mut self) -> DomainResult<()> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(DomainError::validation("category name cannot be empty"));
        }
        if self.slug.trim().is_empty() {
            self.slug = slugify(&self.name);
        }
        Ok(())
    }
}

/// Lowercase the name and collapse whitespace runs into `-`.
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

fn ensure_amount(field: &str, value: Option<f64>) -> DomainResult<()> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(DomainError::validation(format!(
            "{field} must be a non-negative number"
        ))),
        _ => Ok(()),
    }
}

fn parse<T: DeserializeOwned>(entity_type: EntityType, payload: JsonValue) -> DomainResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| DomainError::validation(format!("invalid {entity_type} payload: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> DomainResult<JsonValue> {
    serde_json::to_value(value).map_err(|e| DomainError::invariant(e.to_string()))
}

/// Validate a full payload and return its normalized JSON form.
pub fn normalize(entity_type: EntityType, payload: JsonValue) -> DomainResult<JsonValue> {
    if !payload.is_object() {
        return Err(DomainError::validation("payload must be a JSON object"));
    }
    match entity_type {
        EntityType::Product => {
            let mut p: ProductPayload = parse(entity_type, payload)?;
            p.validate()?;
            to_json(&p)
        }
        EntityType::Category => {
            let mut c: CategoryPayload = parse(entity_type, payload)?;
            c.validate()?;
            to_json(&c)
        }
    }
}

/// Merge a partial update into `current` and re-validate the result.
///
/// The patch must be a non-empty object whose keys are all updatable fields
/// for the entity type. An explicit `null` clears an optional field.
pub fn apply_patch(
    entity_type: EntityType,
    current: &JsonValue,
    patch: &JsonValue,
) -> DomainResult<JsonValue> {
    let patch = patch
        .as_object()
        .ok_or_else(|| DomainError::validation("patch must be a JSON object"))?;
    if patch.is_empty() {
        return Err(DomainError::validation("no fields to update"));
    }

    let allowed = match entity_type {
        EntityType::Product => PRODUCT_UPDATABLE,
        EntityType::Category => CATEGORY_UPDATABLE,
    };
    if let Some(field) = patch.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(DomainError::validation(format!(
            "field `{field}` cannot be updated"
        )));
    }

    let mut merged = current.as_object().cloned().unwrap_or_default();
    for (k, v) in patch {
        merged.insert(k.clone(), v.clone());
    }
    normalize(entity_type, JsonValue::Object(merged))
}

//! Cache key layout.

use std::fmt;

use marketplace_catalog::{ListFilter, SearchQuery};
use marketplace_core::{EntityId, EntityType, TenantId};

/// A fully-qualified cache key. Every variant embeds the tenant id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `{type}:{tenant}:{id}`
    pub fn detail(tenant_id: TenantId, entity_type: EntityType, id: EntityId) -> Self {
        Self(format!("{}:{}:{}", entity_type.as_str(), tenant_id, id))
    }

    /// `{plural}:{tenant}:{filterHash}:v{counter}`
    pub fn collection(
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
        counter: u64,
    ) -> Self {
        Self(format!(
            "{}:{}:{}:v{}",
            plural(entity_type),
            tenant_id,
            filter.filter_hash(entity_type),
            counter
        ))
    }

    /// `search:{tenant}:{queryHash}:v{productCounter}.{categoryCounter}`
    ///
    /// A search can return either entity type, so its key moves with both
    /// counters.
    pub fn search(tenant_id: TenantId, query: &SearchQuery, counters: (u64, u64)) -> Self {
        Self(format!(
            "search:{}:{}:v{}.{}",
            tenant_id,
            query.query_hash(),
            counters.0,
            counters.1
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key belongs to `tenant_id`.
    pub fn is_scoped_to(&self, tenant_id: TenantId) -> bool {
        self.0.split(':').nth(1) == Some(tenant_id.to_string().as_str())
    }
}

fn plural(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Product => "products",
        EntityType::Category => "categories",
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Cache-aside reads: detail, collection and search.

use std::sync::Arc;

use tracing::{instrument, warn};

use marketplace_catalog::{CatalogEntity, ListFilter, SearchQuery};
use marketplace_core::{EntityId, EntityType, TenantId};
use marketplace_events::TenantScoped;

use crate::cache::{CacheKey, VersionedCacheManager};
use crate::config::SyncConfig;
use crate::error::CatalogError;
use crate::search::{SearchHit, SearchIndexSynchronizer};
use crate::store::CatalogStore;

pub struct ReadPath {
    store: Arc<dyn CatalogStore>,
    cache: Arc<VersionedCacheManager>,
    search: Arc<SearchIndexSynchronizer>,
    config: SyncConfig,
}

fn require_tenant(tenant_id: TenantId) -> Result<(), CatalogError> {
    if tenant_id.is_nil() {
        return Err(CatalogError::validation("a tenant context is required"));
    }
    Ok(())
}

impl ReadPath {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        cache: Arc<VersionedCacheManager>,
        search: Arc<SearchIndexSynchronizer>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            cache,
            search,
            config,
        }
    }

    /// A live entity of `tenant_id`. Deleted, missing and foreign rows are all
    /// `NotFound`, whether they come from the cache or the store.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, entity_id = %id), err)]
    pub async fn get_by_id(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<CatalogEntity, CatalogError> {
        require_tenant(tenant_id)?;

        let key = CacheKey::detail(tenant_id, entity_type, id);
        let store = self.store.clone();
        let loaded = self
            .cache
            .get_or_load(&key, self.config.detail_ttl(), move || async move {
                let row = store.get(tenant_id, entity_type, id).await?;
                Ok::<_, CatalogError>(row.filter(CatalogEntity::is_active))
            })
            .await?;

        match loaded {
            Some(entity) if entity.belongs_to(tenant_id) && entity.entity_type == entity_type => {
                if entity.deleted {
                    return Err(CatalogError::NotFound);
                }
                Ok(entity)
            }
            Some(entity) => {
                warn!(
                    key = %key,
                    cached_tenant = %entity.tenant_id,
                    "cached entity does not match its key, ignoring"
                );
                Err(CatalogError::NotFound)
            }
            None => Err(CatalogError::NotFound),
        }
    }

    /// Live entities of one type, filtered and paginated.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id, entity_type = %entity_type), err)]
    pub async fn list(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
    ) -> Result<Vec<CatalogEntity>, CatalogError> {
        require_tenant(tenant_id)?;

        let Some(key) = self.cache.collection_key(tenant_id, entity_type, filter).await else {
            return Ok(self.store.list(tenant_id, entity_type, filter).await?);
        };

        let store = self.store.clone();
        let owned = filter.clone();
        let rows = self
            .cache
            .get_or_load(&key, self.config.collection_ttl(), move || async move {
                let rows = store.list(tenant_id, entity_type, &owned).await?;
                Ok::<_, CatalogError>(Some(rows))
            })
            .await?
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .filter(|e: &CatalogEntity| e.belongs_to(tenant_id) && e.is_active())
            .collect())
    }

    /// Ranked full-text search within `tenant_id`.
    #[instrument(skip(self, query), fields(tenant_id = %tenant_id), err)]
    pub async fn search(&self, tenant_id: TenantId, query: &SearchQuery) -> Result<Vec<SearchHit>, CatalogError> {
        require_tenant(tenant_id)?;
        query.validate()?;

        let Some(key) = self.cache.search_key(tenant_id, query).await else {
            return self.search.search(tenant_id, query).await;
        };

        let search = self.search.clone();
        let owned = query.clone();
        let hits = self
            .cache
            .get_or_load(&key, self.config.search_ttl(), move || async move {
                let hits = search.search(tenant_id, &owned).await?;
                Ok::<_, CatalogError>(Some(hits))
            })
            .await?
            .unwrap_or_default();

        Ok(hits
            .into_iter()
            .filter(|h: &SearchHit| h.document.belongs_to(tenant_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    use marketplace_catalog::NewEntity;
    use marketplace_observability::SyncMetrics;

    use crate::cache::{CacheBackend, InMemoryCache, InMemoryVersionCounters, VersionCounterStore};
    use crate::search::InMemorySearchIndex;
    use crate::store::InMemoryCatalogStore;

    struct Fixture {
        store: Arc<InMemoryCatalogStore>,
        backend: Arc<InMemoryCache>,
        counters: Arc<InMemoryVersionCounters>,
        metrics: Arc<SyncMetrics>,
        reads: ReadPath,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(SyncMetrics::new());
        let store = Arc::new(InMemoryCatalogStore::new());
        let backend = Arc::new(InMemoryCache::new());
        let counters = Arc::new(InMemoryVersionCounters::new());
        let cache = Arc::new(VersionedCacheManager::new(
            backend.clone(),
            counters.clone(),
            Duration::from_millis(100),
            metrics.clone(),
        ));
        let search = Arc::new(SearchIndexSynchronizer::new(
            Arc::new(InMemorySearchIndex::new()),
            store.clone(),
        ));
        let reads = ReadPath::new(store.clone(), cache, search, SyncConfig::default());
        Fixture {
            store,
            backend,
            counters,
            metrics,
            reads,
        }
    }

    async fn seed(store: &InMemoryCatalogStore, tenant: TenantId, name: &str) -> CatalogEntity {
        let new = NewEntity::prepare(
            tenant,
            EntityType::Product,
            json!({"name": name, "sku": name, "price": 5}),
            None,
        )
        .unwrap();
        store.insert(new).await.unwrap()
    }

    #[tokio::test]
    async fn second_detail_read_is_a_cache_hit() {
        let f = fixture();
        let tenant = TenantId::new();
        let entity = seed(&f.store, tenant, "Widget").await;

        f.reads.get_by_id(tenant, EntityType::Product, entity.id).await.unwrap();
        f.reads.get_by_id(tenant, EntityType::Product, entity.id).await.unwrap();

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.cache_misses, 1);
    }

    #[tokio::test]
    async fn foreign_tenant_sees_not_found() {
        let f = fixture();
        let owner = TenantId::new();
        let entity = seed(&f.store, owner, "Widget").await;

        let err = f
            .reads
            .get_by_id(TenantId::new(), EntityType::Product, entity.id)
            .await
            .unwrap_err();
        assert_eq!(err, CatalogError::NotFound);
    }

    #[tokio::test]
    async fn poisoned_cache_entry_for_other_tenant_is_not_served() {
        let f = fixture();
        let tenant = TenantId::new();
        let foreign = seed(&f.store, TenantId::new(), "Foreign").await;

        let key = CacheKey::detail(tenant, EntityType::Product, foreign.id);
        f.backend
            .set(key.as_str(), serde_json::to_string(&foreign).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();

        let err = f
            .reads
            .get_by_id(tenant, EntityType::Product, foreign.id)
            .await
            .unwrap_err();
        assert_eq!(err, CatalogError::NotFound);
    }

    #[tokio::test]
    async fn deleted_entity_is_not_found() {
        let f = fixture();
        let tenant = TenantId::new();
        let entity = seed(&f.store, tenant, "Widget").await;
        f.store.put_raw(entity.committed_delete(None, Utc::now()));

        let err = f
            .reads
            .get_by_id(tenant, EntityType::Product, entity.id)
            .await
            .unwrap_err();
        assert_eq!(err, CatalogError::NotFound);
    }

    #[tokio::test]
    async fn list_reflects_bumped_counter() {
        let f = fixture();
        let tenant = TenantId::new();
        seed(&f.store, tenant, "A").await;

        let filter = ListFilter::default();
        assert_eq!(f.reads.list(tenant, EntityType::Product, &filter).await.unwrap().len(), 1);

        seed(&f.store, tenant, "B").await;
        // Still served from the cached page until the counter moves.
        assert_eq!(f.reads.list(tenant, EntityType::Product, &filter).await.unwrap().len(), 1);

        f.counters.bump(tenant, EntityType::Product).await.unwrap();
        assert_eq!(f.reads.list(tenant, EntityType::Product, &filter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cache_outage_falls_through_to_store() {
        let f = fixture();
        let tenant = TenantId::new();
        let entity = seed(&f.store, tenant, "Widget").await;
        f.backend.set_unavailable(true);
        f.counters.set_unavailable(true);

        let got = f.reads.get_by_id(tenant, EntityType::Product, entity.id).await.unwrap();
        assert_eq!(got.id, entity.id);
        assert_eq!(f.reads.list(tenant, EntityType::Product, &ListFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_without_tenant_is_rejected() {
        let f = fixture();
        let err = f
            .reads
            .search(TenantId::from_uuid(uuid::Uuid::nil()), &SearchQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
    }
}

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use marketplace_catalog::{SearchDocument, SearchQuery};
use marketplace_core::{EntityId, TenantId};

use super::{SearchError, SearchHit, SearchIndex, rank};

#[derive(Debug, Clone)]
enum Slot {
    Live(SearchDocument),
    Removed { at: Instant },
}

/// In-memory index, one partition per tenant.
///
/// Intended for tests/dev. Matching and scoring are those of
/// [`SearchQuery::score`].
#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    partitions: RwLock<HashMap<TenantId, HashMap<EntityId, Slot>>>,
    unavailable: AtomicBool,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The live document for an entity, if any.
    pub fn document(&self, tenant_id: TenantId, entity_id: EntityId) -> Option<SearchDocument> {
        let partitions = self.partitions.read().ok()?;
        match partitions.get(&tenant_id)?.get(&entity_id)? {
            Slot::Live(doc) => Some(doc.clone()),
            Slot::Removed { .. } => None,
        }
    }

    /// Live documents across all tenants.
    pub fn live_count(&self) -> usize {
        self.partitions
            .read()
            .map(|p| {
                p.values()
                    .flat_map(HashMap::values)
                    .filter(|slot| matches!(slot, Slot::Live(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Tombstones across all tenants.
    pub fn tombstone_count(&self) -> usize {
        self.partitions
            .read()
            .map(|p| {
                p.values()
                    .flat_map(HashMap::values)
                    .filter(|slot| matches!(slot, Slot::Removed { .. }))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Insert a document unconditionally (drift simulation in tests).
    pub fn force_put(&self, document: SearchDocument) {
        if let Ok(mut partitions) = self.partitions.write() {
            partitions
                .entry(document.tenant_id)
                .or_default()
                .insert(document.entity_id, Slot::Live(document));
        }
    }

    fn check_available(&self) -> Result<(), SearchError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SearchError::Unavailable("search index unavailable".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> SearchError {
        SearchError::Backend("lock poisoned".to_string())
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, document: SearchDocument) -> Result<(), SearchError> {
        self.check_available()?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        let partition = partitions.entry(document.tenant_id).or_default();

        let stale = match partition.get(&document.entity_id) {
            Some(Slot::Live(existing)) => existing.version >= document.version,
            Some(Slot::Removed { .. }) => true,
            None => false,
        };
        if !stale {
            partition.insert(document.entity_id, Slot::Live(document));
        }
        Ok(())
    }

    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<(), SearchError> {
        self.check_available()?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        partitions
            .entry(tenant_id)
            .or_default()
            .insert(entity_id, Slot::Removed { at: Instant::now() });
        Ok(())
    }

    async fn search(&self, tenant_id: TenantId, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        self.check_available()?;
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        let Some(partition) = partitions.get(&tenant_id) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = partition
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(doc) => query.score(doc).map(|score| SearchHit {
                    document: doc.clone(),
                    score,
                }),
                Slot::Removed { .. } => None,
            })
            .collect();
        rank(&mut hits);

        Ok(hits
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect())
    }

    async fn indexed_versions(&self, tenant_id: TenantId) -> Result<HashMap<EntityId, u64>, SearchError> {
        self.check_available()?;
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        Ok(partitions
            .get(&tenant_id)
            .map(|p| {
                p.iter()
                    .filter_map(|(id, slot)| match slot {
                        Slot::Live(doc) => Some((*id, doc.version)),
                        Slot::Removed { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), SearchError> {
        self.check_available()?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        partitions.remove(&tenant_id);
        Ok(())
    }

    async fn purge_tombstones(&self, tenant_id: TenantId, older_than: Duration) -> Result<usize, SearchError> {
        self.check_available()?;
        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        let Some(partition) = partitions.get_mut(&tenant_id) else {
            return Ok(0);
        };
        let now = Instant::now();
        let before = partition.len();
        partition.retain(|_, slot| match slot {
            Slot::Removed { at } => now.duration_since(*at) < older_than,
            Slot::Live(_) => true,
        });
        let purged = before - partition.len();
        if partition.is_empty() {
            partitions.remove(&tenant_id);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marketplace_catalog::NewEntity;
    use marketplace_core::EntityType;
    use serde_json::json;

    fn doc(tenant_id: TenantId, name: &str) -> SearchDocument {
        let entity = NewEntity::prepare(
            tenant_id,
            EntityType::Product,
            json!({"name": name, "sku": name, "price": 1}),
            None,
        )
        .unwrap()
        .into_entity(Utc::now());
        SearchDocument::project(&entity).unwrap()
    }

    #[tokio::test]
    async fn wildcard_search_stays_inside_the_tenant() {
        let index = InMemorySearchIndex::new();
        let a = TenantId::new();
        let b = TenantId::new();
        index.upsert(doc(a, "Widget")).await.unwrap();
        index.upsert(doc(b, "Widget")).await.unwrap();

        let hits = index.search(a, &SearchQuery::text("*")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits.iter().all(|h| h.document.tenant_id == a));
    }

    #[tokio::test]
    async fn older_versions_and_removed_entities_are_not_reindexed() {
        let index = InMemorySearchIndex::new();
        let tenant = TenantId::new();
        let v1 = doc(tenant, "Widget");
        let mut v2 = v1.clone();
        v2.version = 2;
        v2.title = "Gizmo".into();

        index.upsert(v2.clone()).await.unwrap();
        index.upsert(v1.clone()).await.unwrap();
        assert_eq!(index.document(tenant, v1.entity_id).unwrap().title, "Gizmo");

        index.remove(tenant, v1.entity_id).await.unwrap();
        let mut v3 = v2.clone();
        v3.version = 3;
        index.upsert(v3).await.unwrap();
        assert!(index.document(tenant, v1.entity_id).is_none());
        assert!(index.indexed_versions(tenant).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn only_tombstones_past_the_grace_period_are_purged() {
        let index = InMemorySearchIndex::new();
        let tenant = TenantId::new();
        let live = doc(tenant, "Live");
        let old = doc(tenant, "Old");
        let recent = doc(tenant, "Recent");
        index.upsert(live.clone()).await.unwrap();

        index.remove(tenant, old.entity_id).await.unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        index.remove(tenant, recent.entity_id).await.unwrap();

        let purged = index.purge_tombstones(tenant, Duration::from_secs(300)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(index.tombstone_count(), 1);
        assert!(index.document(tenant, live.entity_id).is_some());

        // The surviving tombstone still blocks a late upsert.
        index.upsert(recent).await.unwrap();
        assert_eq!(index.live_count(), 1);
    }
}

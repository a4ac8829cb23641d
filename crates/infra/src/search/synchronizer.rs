//! Keeps the search index in step with the primary store.
//!
//! Upserts are best effort: a failure leaves the previous document (or none)
//! in place, and the entity stays readable by id from the store. Drift is
//! repaired by [`SearchIndexSynchronizer::reconcile`] or a full reindex.
//! Reconciliation also drops tombstones older than the configured grace.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use marketplace_catalog::{CatalogEntity, SearchDocument, SearchQuery};
use marketplace_core::{EntityId, EntityType, TenantId};
use marketplace_events::TenantScoped;

use super::{SearchError, SearchHit, SearchIndex};
use crate::capability::Upsertable;
use crate::error::{CatalogError, SyncError};
use crate::store::CatalogStore;

/// Outcome of a reconciliation pass for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub reindexed: usize,
    pub removed: usize,
    /// Tombstones dropped after outliving the grace period.
    pub purged: usize,
}

const DEFAULT_TOMBSTONE_GRACE: Duration = Duration::from_secs(3_600);

pub struct SearchIndexSynchronizer {
    index: Arc<dyn SearchIndex>,
    store: Arc<dyn CatalogStore>,
    tombstone_grace: Duration,
}

fn index_failure(err: SearchError) -> CatalogError {
    match err {
        SearchError::Rejected(msg) => CatalogError::Validation(msg),
        other => CatalogError::Storage(other.to_string()),
    }
}

impl SearchIndexSynchronizer {
    pub fn new(index: Arc<dyn SearchIndex>, store: Arc<dyn CatalogStore>) -> Self {
        Self {
            index,
            store,
            tombstone_grace: DEFAULT_TOMBSTONE_GRACE,
        }
    }

    /// Keep tombstones at least this long; they must outlive every retry and
    /// dead-letter replay of an older upsert.
    pub fn with_tombstone_grace(mut self, grace: Duration) -> Self {
        self.tombstone_grace = grace;
        self
    }

    /// Index a live entity; a deleted one is removed instead.
    pub async fn upsert(&self, entity: &CatalogEntity) -> Result<(), SearchError> {
        match SearchDocument::project(entity) {
            Some(document) => self.index.upsert(document).await,
            None => self.index.remove(entity.tenant_id, entity.id).await,
        }
    }

    pub async fn remove(
        &self,
        tenant_id: TenantId,
        _entity_type: EntityType,
        id: EntityId,
    ) -> Result<(), SearchError> {
        self.index.remove(tenant_id, id).await
    }

    /// Search within `tenant_id`. A nil tenant id means no tenant context and
    /// is rejected before the index is touched.
    #[instrument(skip(self, query), fields(tenant_id = %tenant_id), err)]
    pub async fn search(&self, tenant_id: TenantId, query: &SearchQuery) -> Result<Vec<SearchHit>, CatalogError> {
        if tenant_id.is_nil() {
            return Err(CatalogError::validation("search requires a tenant context"));
        }
        query.validate()?;

        let hits = self.index.search(tenant_id, query).await.map_err(index_failure)?;
        // A backend must never hand back another tenant's documents.
        Ok(hits
            .into_iter()
            .filter(|h| h.document.belongs_to(tenant_id))
            .collect())
    }

    /// Rebuild the tenant's partition from the primary store.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn reindex_all(&self, tenant_id: TenantId) -> Result<usize, CatalogError> {
        let mut live = Vec::new();
        for entity_type in EntityType::ALL {
            let rows = self.store.list_all(tenant_id, entity_type).await?;
            live.extend(rows.iter().filter_map(SearchDocument::project));
        }

        self.index.clear_tenant(tenant_id).await.map_err(index_failure)?;
        let count = live.len();
        for document in live {
            self.index.upsert(document).await.map_err(index_failure)?;
        }
        info!(tenant_id = %tenant_id, documents = count, "tenant reindexed");
        Ok(count)
    }

    /// Compare indexed versions against the store and repair differences.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn reconcile(&self, tenant_id: TenantId) -> Result<ReconcileReport, CatalogError> {
        let indexed = self.index.indexed_versions(tenant_id).await.map_err(index_failure)?;
        let mut report = ReconcileReport::default();
        let mut known = HashSet::new();

        for entity_type in EntityType::ALL {
            for entity in self.store.list_all(tenant_id, entity_type).await? {
                report.checked += 1;
                known.insert(entity.id);
                let indexed_version = indexed.get(&entity.id).copied();

                if entity.deleted {
                    if indexed_version.is_some() {
                        self.index.remove(tenant_id, entity.id).await.map_err(index_failure)?;
                        report.removed += 1;
                    }
                } else if indexed_version != Some(entity.version) {
                    if let Some(document) = SearchDocument::project(&entity) {
                        self.index.upsert(document).await.map_err(index_failure)?;
                        report.reindexed += 1;
                    }
                }
            }
        }

        for orphan in indexed.keys().filter(|id| !known.contains(*id)) {
            self.index.remove(tenant_id, *orphan).await.map_err(index_failure)?;
            report.removed += 1;
        }

        match self.index.purge_tombstones(tenant_id, self.tombstone_grace).await {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!(tenant_id = %tenant_id, error = %e, "tombstone purge failed"),
        }

        if report.reindexed > 0 || report.removed > 0 {
            info!(
                tenant_id = %tenant_id,
                reindexed = report.reindexed,
                removed = report.removed,
                "search index drift repaired"
            );
        }
        if report.purged > 0 {
            info!(tenant_id = %tenant_id, purged = report.purged, "search tombstones purged");
        }
        Ok(report)
    }
}

#[async_trait]
impl Upsertable for SearchIndexSynchronizer {
    async fn sync_entity(&self, entity: &CatalogEntity) -> Result<(), SyncError> {
        self.upsert(entity).await.map_err(SyncError::from)
    }
}

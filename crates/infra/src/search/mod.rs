//! Full-text search index and its synchronizer.
//!
//! Documents are partitioned by tenant. The tenant filter is applied by the
//! index itself, before any caller-supplied clause, and cannot be expressed
//! in a [`SearchQuery`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use marketplace_catalog::{SearchDocument, SearchQuery};
use marketplace_core::{EntityId, TenantId};

pub mod in_memory;
pub mod postgres;
pub mod synchronizer;

pub use in_memory::InMemorySearchIndex;
pub use postgres::PostgresSearchIndex;
pub use synchronizer::{ReconcileReport, SearchIndexSynchronizer};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("search index unavailable: {0}")]
    Unavailable(String),

    #[error("search request rejected: {0}")]
    Rejected(String),

    #[error("search backend error: {0}")]
    Backend(String),
}

/// A scored match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document: SearchDocument,
    pub score: f64,
}

/// Tenant-partitioned document index.
///
/// Versions never regress: an upsert older than (or equal to) what is indexed
/// is ignored, and a removed entity stays removed.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: SearchDocument) -> Result<(), SearchError>;

    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<(), SearchError>;

    /// Matching documents of `tenant_id` only, best first.
    async fn search(&self, tenant_id: TenantId, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError>;

    /// `entity_id -> version` of every live document of the tenant.
    async fn indexed_versions(&self, tenant_id: TenantId) -> Result<HashMap<EntityId, u64>, SearchError>;

    /// Drop every document and tombstone of the tenant.
    async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), SearchError>;

    /// Drop the tenant's tombstones older than `older_than`. Returns how many.
    async fn purge_tombstones(&self, tenant_id: TenantId, older_than: Duration) -> Result<usize, SearchError>;
}

#[async_trait]
impl<I> SearchIndex for Arc<I>
where
    I: SearchIndex + ?Sized,
{
    async fn upsert(&self, document: SearchDocument) -> Result<(), SearchError> {
        (**self).upsert(document).await
    }

    async fn remove(&self, tenant_id: TenantId, entity_id: EntityId) -> Result<(), SearchError> {
        (**self).remove(tenant_id, entity_id).await
    }

    async fn search(&self, tenant_id: TenantId, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchError> {
        (**self).search(tenant_id, query).await
    }

    async fn indexed_versions(&self, tenant_id: TenantId) -> Result<HashMap<EntityId, u64>, SearchError> {
        (**self).indexed_versions(tenant_id).await
    }

    async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), SearchError> {
        (**self).clear_tenant(tenant_id).await
    }

    async fn purge_tombstones(&self, tenant_id: TenantId, older_than: Duration) -> Result<usize, SearchError> {
        (**self).purge_tombstones(tenant_id, older_than).await
    }
}

/// Best first: score, then most recently updated, then id.
pub(crate) fn rank(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.document.updated_at.cmp(&a.document.updated_at))
            .then_with(|| a.document.entity_id.cmp(&b.document.entity_id))
    });
}

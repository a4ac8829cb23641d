//! Wiring: backends in, coordinator and read path out.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, instrument, warn};

use marketplace_events::{EventTransport, InMemoryEventBus};
use marketplace_observability::SyncMetrics;

use crate::cache::{
    CacheBackend, InMemoryCache, InMemoryVersionCounters, PostgresVersionCounters,
    VersionCounterStore, VersionedCacheManager,
};
use crate::config::SyncConfig;
use crate::coordinator::{ReplayReport, WriteCoordinator};
use crate::dead_letter::{DeadLetterStore, InMemoryDeadLetters, PostgresDeadLetters};
use crate::error::CatalogError;
use crate::publishing::{EventPublisher, InMemoryOutbox, OutboxError, OutboxStore, PostgresOutbox, RelayReport};
use crate::read_path::ReadPath;
use crate::search::{
    InMemorySearchIndex, PostgresSearchIndex, ReconcileReport, SearchIndex, SearchIndexSynchronizer,
};
use crate::store::{CatalogStore, InMemoryCatalogStore, PostgresCatalogStore};

/// Every external dependency of the engine.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn CatalogStore>,
    pub cache: Arc<dyn CacheBackend>,
    pub counters: Arc<dyn VersionCounterStore>,
    pub index: Arc<dyn SearchIndex>,
    pub transport: Arc<dyn EventTransport>,
    pub outbox: Arc<dyn OutboxStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
}

impl Backends {
    /// Postgres for everything durable. The cache stays process-local unless
    /// the caller swaps in a shared one (see `RedisCache`).
    pub fn postgres(pool: PgPool, transport: Arc<dyn EventTransport>) -> Self {
        Self {
            store: Arc::new(PostgresCatalogStore::new(pool.clone())),
            cache: Arc::new(InMemoryCache::new()),
            counters: Arc::new(PostgresVersionCounters::new(pool.clone())),
            index: Arc::new(PostgresSearchIndex::new(pool.clone())),
            transport,
            outbox: Arc::new(PostgresOutbox::new(pool.clone())),
            dead_letters: Arc::new(PostgresDeadLetters::new(pool)),
        }
    }
}

/// In-memory backends with their concrete handles kept for fault injection.
#[derive(Clone, Default)]
pub struct InMemoryBackends {
    pub store: Arc<InMemoryCatalogStore>,
    pub cache: Arc<InMemoryCache>,
    pub counters: Arc<InMemoryVersionCounters>,
    pub index: Arc<InMemorySearchIndex>,
    pub bus: Arc<InMemoryEventBus>,
    pub outbox: Arc<InMemoryOutbox>,
    pub dead_letters: Arc<InMemoryDeadLetters>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backends(&self) -> Backends {
        Backends {
            store: self.store.clone(),
            cache: self.cache.clone(),
            counters: self.counters.clone(),
            index: self.index.clone(),
            transport: self.bus.clone(),
            outbox: self.outbox.clone(),
            dead_letters: self.dead_letters.clone(),
        }
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    metrics: Arc<SyncMetrics>,
    store: Arc<dyn CatalogStore>,
    cache: Arc<VersionedCacheManager>,
    search: Arc<SearchIndexSynchronizer>,
    publisher: Arc<EventPublisher>,
    coordinator: WriteCoordinator,
    reads: ReadPath,
}

impl SyncEngine {
    pub fn assemble(config: SyncConfig, backends: Backends) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let cache = Arc::new(VersionedCacheManager::new(
            backends.cache,
            backends.counters,
            config.cache_timeout(),
            metrics.clone(),
        ));
        let search = Arc::new(
            SearchIndexSynchronizer::new(backends.index, backends.store.clone())
                .with_tombstone_grace(config.tombstone_grace()),
        );
        let publisher = Arc::new(EventPublisher::new(
            backends.transport,
            backends.outbox,
            config.side_effect_timeout(),
            metrics.clone(),
        ));
        let coordinator = WriteCoordinator::new(
            backends.store.clone(),
            cache.clone(),
            search.clone(),
            publisher.clone(),
            backends.dead_letters,
            &config,
            metrics.clone(),
        );
        let reads = ReadPath::new(
            backends.store.clone(),
            cache.clone(),
            search.clone(),
            config.clone(),
        );

        Self {
            config,
            metrics,
            store: backends.store,
            cache,
            search,
            publisher,
            coordinator,
            reads,
        }
    }

    pub fn in_memory(config: SyncConfig) -> (Self, InMemoryBackends) {
        let handles = InMemoryBackends::new();
        (Self::assemble(config, handles.backends()), handles)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn coordinator(&self) -> &WriteCoordinator {
        &self.coordinator
    }

    pub fn reads(&self) -> &ReadPath {
        &self.reads
    }

    pub fn search(&self) -> &SearchIndexSynchronizer {
        &self.search
    }

    pub fn cache(&self) -> &VersionedCacheManager {
        &self.cache
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    /// Deliver parked events, oldest first per tenant.
    pub async fn relay_outbox(&self) -> Result<RelayReport, OutboxError> {
        self.publisher.replay_outbox(self.config.relay_batch).await
    }

    /// Repair search drift for every tenant. A failing tenant is logged and
    /// skipped so that it cannot starve the others.
    #[instrument(skip(self), err)]
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, CatalogError> {
        let mut total = ReconcileReport::default();
        for tenant_id in self.store.list_tenants().await? {
            match self.search.reconcile(tenant_id).await {
                Ok(report) => {
                    total.checked += report.checked;
                    total.reindexed += report.reindexed;
                    total.removed += report.removed;
                    total.purged += report.purged;
                }
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "reconciliation failed for tenant"),
            }
        }
        info!(
            checked = total.checked,
            reindexed = total.reindexed,
            removed = total.removed,
            purged = total.purged,
            "reconciliation pass complete"
        );
        Ok(total)
    }

    pub async fn replay_dead_letters(&self) -> Result<ReplayReport, CatalogError> {
        self.coordinator.replay_dead_letters(self.config.relay_batch).await
    }

    /// Wait for in-flight side effects, then flush the outbox once.
    pub async fn shutdown(&self) {
        self.coordinator.drain().await;
        if let Err(e) = self.relay_outbox().await {
            warn!(error = %e, "final outbox relay failed");
        }
    }
}

//! Write coordinator: commit to the primary store, then fan out.
//!
//! ```text
//! create/update/delete
//!   └─ primary store commit (CAS on version)          ── failure: error to caller
//!        ├─ stage event in the outbox (in request, bounded)
//!        ├─ delete detail key (in request, bounded)    ── read-your-write
//!        └─ background, each effect retried + timed out, dead-lettered on exhaustion
//!             ├─ bump collection counter
//!             ├─ upsert / remove search document
//!             ├─ delete detail key again (closes the load-before-commit race)
//!             └─ deliver staged events (tenant FIFO lane); full publish if staging failed
//! ```
//!
//! Nothing after the commit can fail or roll back the write.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use marketplace_catalog::{CatalogEntity, NewEntity};
use marketplace_core::{EntityId, EntityType, ExpectedVersion, TenantId, UserId};
use marketplace_events::Operation;
use marketplace_observability::SyncMetrics;

use crate::capability::{CommittedChange, Invalidatable, PublishOutcome, Publishable, Upsertable};
use crate::config::{DispatchMode, SyncConfig};
use crate::dead_letter::{DeadLetter, DeadLetterStore, SideEffect};
use crate::error::{CatalogError, SyncError};
use crate::lanes::{InFlight, TenantLanes};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CatalogStore, StoreError};

/// Who is writing, as resolved by the (trusted) upstream layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub tenant_id: TenantId,
    pub actor: Option<UserId>,
}

impl WriteContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }
}

/// Result of a dead-letter replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
}

/// The downstream half, shared with background tasks.
struct SideEffects {
    store: Arc<dyn CatalogStore>,
    cache: Arc<dyn Invalidatable>,
    search: Arc<dyn Upsertable>,
    events: Arc<dyn Publishable>,
    dead_letters: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
    timeout: Duration,
    metrics: Arc<SyncMetrics>,
}

impl SideEffects {
    async fn attempt(&self, effect: SideEffect, change: &CommittedChange) -> Result<(), SyncError> {
        let entity = &change.entity;
        match effect {
            SideEffect::DetailInvalidation => {
                self.cache
                    .invalidate_detail(entity.tenant_id, entity.entity_type, entity.id)
                    .await
            }
            SideEffect::CollectionBump => {
                self.cache
                    .bump_collections(entity.tenant_id, entity.entity_type)
                    .await
            }
            SideEffect::SearchSync => self.search.sync_entity(entity).await,
            SideEffect::Publish => self.events.publish(&change.event()).await.map(|_| ()),
        }
    }

    /// Run one effect under the retry policy. Returns whether it succeeded;
    /// an exhausted effect is dead-lettered.
    async fn run(&self, effect: SideEffect, change: &CommittedChange) -> bool {
        let outcome = retry_with_backoff(&self.retry, self.timeout, effect.as_str(), &self.metrics, || {
            self.attempt(effect, change)
        })
        .await;

        match outcome {
            Ok(()) => {
                self.metrics.side_effect_succeeded(effect.as_str());
                true
            }
            Err(exhausted) => {
                self.metrics.dead_lettered(effect.as_str());
                error!(
                    tenant_id = %change.tenant_id(),
                    entity_id = %change.entity.id,
                    version = change.entity.version,
                    side_effect = effect.as_str(),
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "side effect exhausted retries, dead-lettering"
                );
                let letter = DeadLetter::new(
                    effect,
                    exhausted.attempts,
                    exhausted.last_error.to_string(),
                    change.clone(),
                );
                if let Err(e) = self.dead_letters.record(letter).await {
                    error!(error = %e, "failed to record dead letter");
                }
                false
            }
        }
    }

    /// Send the tenant's staged events. Whatever does not go out stays in
    /// the outbox for the relay.
    async fn deliver(&self, tenant_id: TenantId) {
        let effect = SideEffect::Publish.as_str();
        match tokio::time::timeout(self.timeout, self.events.deliver(tenant_id)).await {
            Ok(Ok(PublishOutcome::Sent)) => self.metrics.side_effect_succeeded(effect),
            Ok(Ok(PublishOutcome::Outboxed)) => {
                debug!(tenant_id = %tenant_id, "delivery deferred to the outbox relay")
            }
            Ok(Err(e)) => warn!(tenant_id = %tenant_id, error = %e, "delivery failed, events stay staged"),
            Err(_) => warn!(tenant_id = %tenant_id, "delivery timed out, events stay staged"),
        }
    }

    /// Everything except publishing, concurrently.
    async fn run_unordered(&self, change: &CommittedChange) {
        futures::join!(
            self.run(SideEffect::CollectionBump, change),
            self.run(SideEffect::SearchSync, change),
            self.run(SideEffect::DetailInvalidation, change),
        );
    }

    /// Re-run a dead-lettered effect once, against fresh state where it matters.
    async fn replay(&self, letter: &DeadLetter) -> Result<(), SyncError> {
        let change = match letter.side_effect {
            // Index whatever the store holds now; older versions are ignored by the index.
            SideEffect::SearchSync => {
                let entity = &letter.change.entity;
                match self.store.get(entity.tenant_id, entity.entity_type, entity.id).await {
                    Ok(Some(current)) => CommittedChange::new(current, letter.change.operation),
                    Ok(None) => letter.change.clone(),
                    Err(e) => {
                        warn!(error = %e, "store read failed during replay, using recorded change");
                        letter.change.clone()
                    }
                }
            }
            _ => letter.change.clone(),
        };

        match tokio::time::timeout(self.timeout, self.attempt(letter.side_effect, &change)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.timeout)),
        }
    }
}

pub struct WriteCoordinator {
    store: Arc<dyn CatalogStore>,
    effects: Arc<SideEffects>,
    dispatch: DispatchMode,
    lanes: Arc<TenantLanes>,
    in_flight: Arc<InFlight>,
}

impl WriteCoordinator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        cache: Arc<dyn Invalidatable>,
        search: Arc<dyn Upsertable>,
        events: Arc<dyn Publishable>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: &SyncConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            store: store.clone(),
            effects: Arc::new(SideEffects {
                store,
                cache,
                search,
                events,
                dead_letters,
                retry: config.retry.clone(),
                timeout: config.side_effect_timeout(),
                metrics,
            }),
            dispatch: config.dispatch,
            lanes: Arc::new(TenantLanes::new()),
            in_flight: Arc::new(InFlight::new()),
        }
    }

    #[instrument(skip(self, payload), fields(tenant_id = %ctx.tenant_id, entity_type = %entity_type), err)]
    pub async fn create(
        &self,
        ctx: WriteContext,
        entity_type: EntityType,
        payload: JsonValue,
    ) -> Result<CatalogEntity, CatalogError> {
        let new = NewEntity::prepare(ctx.tenant_id, entity_type, payload, ctx.actor)?;
        let committed = self.store.insert(new).await?;
        info!(entity_id = %committed.id, version = committed.version, "entity created");

        self.after_commit(CommittedChange::new(committed.clone(), Operation::Create))
            .await;
        Ok(committed)
    }

    #[instrument(
        skip(self, patch),
        fields(tenant_id = %ctx.tenant_id, entity_id = %id, expected = expected.value()),
        err
    )]
    pub async fn update(
        &self,
        ctx: WriteContext,
        entity_type: EntityType,
        id: EntityId,
        patch: JsonValue,
        expected: ExpectedVersion,
    ) -> Result<CatalogEntity, CatalogError> {
        let current = self.load_live(ctx.tenant_id, entity_type, id).await?;
        let next = current
            .plan_update(ctx.tenant_id, &patch, expected)
            .map_err(|e| self.note_conflict(e.into()))?;

        let committed = self
            .store
            .update_cas(ctx.tenant_id, entity_type, id, next, expected, ctx.actor)
            .await
            .map_err(|e| self.note_conflict(e.into()))?;
        info!(version = committed.version, "entity updated");

        self.after_commit(CommittedChange::new(committed.clone(), Operation::Update))
            .await;
        Ok(committed)
    }

    /// Soft delete. Returns the final (deleted) row.
    #[instrument(
        skip(self),
        fields(tenant_id = %ctx.tenant_id, entity_id = %id, expected = expected.value()),
        err
    )]
    pub async fn delete(
        &self,
        ctx: WriteContext,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
    ) -> Result<CatalogEntity, CatalogError> {
        let current = self.load_live(ctx.tenant_id, entity_type, id).await?;
        current
            .plan_delete(ctx.tenant_id, expected)
            .map_err(|e| self.note_conflict(e.into()))?;

        let committed = self
            .store
            .soft_delete_cas(ctx.tenant_id, entity_type, id, expected, ctx.actor)
            .await
            .map_err(|e| self.note_conflict(e.into()))?;
        info!(version = committed.version, "entity deleted");

        self.after_commit(CommittedChange::new(committed.clone(), Operation::Delete))
            .await;
        Ok(committed)
    }

    /// Wait until every background side effect started so far has finished.
    pub async fn drain(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Re-run up to `limit` dead-lettered side effects; successful ones are
    /// removed, failed ones stay for the next pass.
    #[instrument(skip(self), err)]
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<ReplayReport, CatalogError> {
        let mut report = ReplayReport::default();
        for letter in self.effects.dead_letters.list(limit).await? {
            match self.effects.replay(&letter).await {
                Ok(()) => {
                    self.effects.dead_letters.remove(letter.id).await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    warn!(
                        dead_letter = %letter.id,
                        side_effect = letter.side_effect.as_str(),
                        error = %e,
                        "dead letter replay failed"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn load_live(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<CatalogEntity, CatalogError> {
        match self.store.get(tenant_id, entity_type, id).await? {
            Some(entity) if !entity.deleted => Ok(entity),
            _ => Err(StoreError::NotFound.into()),
        }
    }

    fn note_conflict(&self, err: CatalogError) -> CatalogError {
        if err.is_conflict() {
            self.effects.metrics.write_conflict();
        }
        err
    }

    async fn after_commit(&self, change: CommittedChange) {
        let entity = &change.entity;

        // The event is durable before the caller sees success.
        let staged = match tokio::time::timeout(self.effects.timeout, self.effects.events.stage(&change.event())).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "event staging failed, publishing in background");
                false
            }
            Err(_) => {
                warn!("event staging timed out, publishing in background");
                false
            }
        };

        // Read-your-write: the detail key goes before the caller sees success.
        match tokio::time::timeout(
            self.effects.timeout,
            self.effects
                .cache
                .invalidate_detail(entity.tenant_id, entity.entity_type, entity.id),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "in-request detail invalidation failed, retrying in background"),
            Err(_) => warn!("in-request detail invalidation timed out, retrying in background"),
        }

        let change = Arc::new(change);

        let unordered = {
            let effects = self.effects.clone();
            let change = change.clone();
            let guard = self.in_flight.enter();
            tokio::spawn(async move {
                effects.run_unordered(&change).await;
                drop(guard);
            })
        };

        let (published_tx, published_rx) = oneshot::channel();
        {
            let effects = self.effects.clone();
            let change = change.clone();
            let guard = self.in_flight.enter();
            self.lanes.submit(
                change.tenant_id(),
                async move {
                    if staged {
                        effects.deliver(change.tenant_id()).await;
                    } else {
                        effects.run(SideEffect::Publish, &change).await;
                    }
                    let _ = published_tx.send(());
                    drop(guard);
                }
                .boxed(),
            );
        }

        if self.dispatch == DispatchMode::Inline {
            let all = async {
                let _ = unordered.await;
                let _ = published_rx.await;
            };
            if tokio::time::timeout(self.effects.timeout, all).await.is_err() {
                warn!(
                    entity_id = %change.entity.id,
                    "side effects still running at deadline, continuing in background"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::cache::{InMemoryCache, InMemoryVersionCounters, VersionedCacheManager};
    use crate::dead_letter::InMemoryDeadLetters;
    use crate::publishing::{EventPublisher, InMemoryOutbox, OutboxStore};
    use crate::search::{InMemorySearchIndex, SearchIndexSynchronizer};
    use crate::store::InMemoryCatalogStore;
    use marketplace_events::InMemoryEventBus;

    struct Fixture {
        store: Arc<InMemoryCatalogStore>,
        index: Arc<InMemorySearchIndex>,
        bus: Arc<InMemoryEventBus>,
        outbox: Arc<InMemoryOutbox>,
        dead_letters: Arc<InMemoryDeadLetters>,
        coordinator: WriteCoordinator,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let metrics = Arc::new(SyncMetrics::new());
        let store = Arc::new(InMemoryCatalogStore::new());
        let index = Arc::new(InMemorySearchIndex::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let dead_letters = Arc::new(InMemoryDeadLetters::new());
        let cache = Arc::new(VersionedCacheManager::new(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryVersionCounters::new()),
            config.cache_timeout(),
            metrics.clone(),
        ));
        let search = Arc::new(SearchIndexSynchronizer::new(index.clone(), store.clone()));
        let publisher = Arc::new(EventPublisher::new(
            bus.clone(),
            outbox.clone(),
            config.side_effect_timeout(),
            metrics.clone(),
        ));
        let coordinator = WriteCoordinator::new(
            store.clone(),
            cache,
            search,
            publisher,
            dead_letters.clone(),
            &config,
            metrics,
        );
        Fixture {
            store,
            index,
            bus,
            outbox,
            dead_letters,
            coordinator,
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            side_effect_timeout_ms: 500,
            ..SyncConfig::default()
        }
    }

    fn widget() -> JsonValue {
        json!({"name": "Widget", "sku": "W-1", "price": 10})
    }

    #[tokio::test]
    async fn create_commits_version_one_and_fans_out() {
        let f = fixture(fast_config());
        let tenant = TenantId::new();
        let created = f
            .coordinator
            .create(WriteContext::new(tenant), EntityType::Product, widget())
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        f.coordinator.drain().await;
        assert_eq!(f.index.document(tenant, created.id).unwrap().version, 1);
        let events = f.bus.partition(&tenant.to_string());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "catalog.product.created");
    }

    #[tokio::test]
    async fn invalid_payload_writes_nothing() {
        let f = fixture(fast_config());
        let tenant = TenantId::new();
        let err = f
            .coordinator
            .create(WriteContext::new(tenant), EntityType::Product, json!({"name": "No sku"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
        assert!(f.store.list_tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_surfaces_and_commits_nothing() {
        let f = fixture(fast_config());
        f.store.set_unavailable(true);
        let err = f
            .coordinator
            .create(WriteContext::new(TenantId::new()), EntityType::Product, widget())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
        f.coordinator.drain().await;
        assert_eq!(f.bus.total_sent(), 0);
    }

    #[tokio::test]
    async fn search_outage_is_dead_lettered_and_write_still_succeeds() {
        let f = fixture(fast_config());
        f.index.set_unavailable(true);
        let tenant = TenantId::new();

        let created = f
            .coordinator
            .create(WriteContext::new(tenant), EntityType::Product, widget())
            .await
            .unwrap();
        f.coordinator.drain().await;

        let letters = f.dead_letters.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].side_effect, SideEffect::SearchSync);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].change.entity.id, created.id);

        f.index.set_unavailable(false);
        let report = f.coordinator.replay_dead_letters(10).await.unwrap();
        assert_eq!(report, ReplayReport { replayed: 1, failed: 0 });
        assert!(f.index.document(tenant, created.id).is_some());
        assert_eq!(f.dead_letters.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_is_staged_before_the_write_returns() {
        let f = fixture(fast_config());
        f.bus.set_available(false);
        let tenant = TenantId::new();

        let created = f
            .coordinator
            .create(WriteContext::new(tenant), EntityType::Product, widget())
            .await
            .unwrap();
        let staged = f.outbox.peek(tenant, 10).await.unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].event.entity_id, created.id);

        f.coordinator.drain().await;
        assert_eq!(f.outbox.pending_count().await.unwrap(), 1);
        assert!(f.dead_letters.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbox_outage_falls_back_to_retried_publish() {
        let f = fixture(fast_config());
        f.outbox.set_unavailable(true);
        let tenant = TenantId::new();

        f.coordinator
            .create(WriteContext::new(tenant), EntityType::Product, widget())
            .await
            .unwrap();
        f.coordinator.drain().await;

        let letters = f.dead_letters.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].side_effect, SideEffect::Publish);
        assert!(f.bus.partition(&tenant.to_string()).is_empty());

        f.outbox.set_unavailable(false);
        let report = f.coordinator.replay_dead_letters(10).await.unwrap();
        assert_eq!(report, ReplayReport { replayed: 1, failed: 0 });
        assert_eq!(f.bus.partition(&tenant.to_string()).len(), 1);
    }

    #[tokio::test]
    async fn inline_dispatch_returns_after_side_effects() {
        let f = fixture(SyncConfig {
            dispatch: DispatchMode::Inline,
            ..fast_config()
        });
        let tenant = TenantId::new();
        let created = f
            .coordinator
            .create(WriteContext::new(tenant), EntityType::Category, json!({"name": "Tools"}))
            .await
            .unwrap();

        assert!(f.index.document(tenant, created.id).is_some());
        assert_eq!(f.bus.partition(&tenant.to_string()).len(), 1);
    }

    #[tokio::test]
    async fn actor_is_recorded() {
        let f = fixture(fast_config());
        let actor = UserId::new();
        let created = f
            .coordinator
            .create(
                WriteContext::new(TenantId::new()).with_actor(actor),
                EntityType::Product,
                widget(),
            )
            .await
            .unwrap();
        assert_eq!(created.created_by, Some(actor));
    }
}

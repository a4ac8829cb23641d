//! End-to-end tests of the synchronization pipeline on in-memory backends.
//!
//! Tests: write → store → cache / search / events → reads
//!
//! Verifies:
//! - Optimistic concurrency on every mutation
//! - Read-your-write on detail reads, freshness of collections and search
//! - Tenant isolation across every read surface
//! - Per-tenant event order across a transport outage
//! - Dead letters and their replay

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};
    use tokio::sync::Barrier;

    use marketplace_catalog::{CatalogEntity, ListFilter, NewEntity, SearchQuery};
    use marketplace_core::{EntityId, EntityType, ExpectedVersion, TenantId, UserId};
    use marketplace_events::{Delivery, DomainEvent, EventHandler, IdempotentConsumer, Operation};

    use crate::config::SyncConfig;
    use crate::coordinator::WriteContext;
    use crate::dead_letter::{DeadLetterStore, SideEffect};
    use crate::engine::{Backends, InMemoryBackends, SyncEngine};
    use crate::error::CatalogError;
    use crate::publishing::OutboxStore;
    use crate::retry::RetryPolicy;
    use crate::store::{CatalogStore, InMemoryCatalogStore, StoreError};

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    /// What the next `get` does after reading its row.
    #[derive(Clone)]
    enum Gate {
        Open,
        /// Wait until every party of the barrier has read.
        Barrier(Arc<Barrier>),
        /// Sleep once, holding the snapshot, then reopen.
        SlowOnce(Duration),
    }

    /// In-memory store whose reads can be held back to line up races.
    struct GatedStore {
        inner: Arc<InMemoryCatalogStore>,
        gate: Mutex<Gate>,
    }

    impl GatedStore {
        fn new(inner: Arc<InMemoryCatalogStore>) -> Self {
            Self {
                inner,
                gate: Mutex::new(Gate::Open),
            }
        }

        fn set_gate(&self, gate: Gate) {
            *self.gate.lock().unwrap() = gate;
        }

        fn is_open(&self) -> bool {
            matches!(*self.gate.lock().unwrap(), Gate::Open)
        }
    }

    #[async_trait]
    impl CatalogStore for GatedStore {
        async fn insert(&self, entity: NewEntity) -> Result<CatalogEntity, StoreError> {
            self.inner.insert(entity).await
        }

        async fn get(
            &self,
            tenant_id: TenantId,
            entity_type: EntityType,
            id: EntityId,
        ) -> Result<Option<CatalogEntity>, StoreError> {
            let row = self.inner.get(tenant_id, entity_type, id).await?;
            let gate = {
                let mut gate = self.gate.lock().unwrap();
                let current = gate.clone();
                if matches!(current, Gate::SlowOnce(_)) {
                    *gate = Gate::Open;
                }
                current
            };
            match gate {
                Gate::Open => {}
                Gate::Barrier(barrier) => {
                    barrier.wait().await;
                }
                Gate::SlowOnce(delay) => tokio::time::sleep(delay).await,
            }
            Ok(row)
        }

        async fn update_cas(
            &self,
            tenant_id: TenantId,
            entity_type: EntityType,
            id: EntityId,
            payload: JsonValue,
            expected: ExpectedVersion,
            actor: Option<UserId>,
        ) -> Result<CatalogEntity, StoreError> {
            self.inner
                .update_cas(tenant_id, entity_type, id, payload, expected, actor)
                .await
        }

        async fn soft_delete_cas(
            &self,
            tenant_id: TenantId,
            entity_type: EntityType,
            id: EntityId,
            expected: ExpectedVersion,
            actor: Option<UserId>,
        ) -> Result<CatalogEntity, StoreError> {
            self.inner
                .soft_delete_cas(tenant_id, entity_type, id, expected, actor)
                .await
        }

        async fn list(
            &self,
            tenant_id: TenantId,
            entity_type: EntityType,
            filter: &ListFilter,
        ) -> Result<Vec<CatalogEntity>, StoreError> {
            self.inner.list(tenant_id, entity_type, filter).await
        }

        async fn list_all(
            &self,
            tenant_id: TenantId,
            entity_type: EntityType,
        ) -> Result<Vec<CatalogEntity>, StoreError> {
            self.inner.list_all(tenant_id, entity_type).await
        }

        async fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
            self.inner.list_tenants().await
        }
    }

    fn gated_setup() -> (Arc<SyncEngine>, InMemoryBackends, Arc<GatedStore>) {
        let handles = InMemoryBackends::new();
        let gated = Arc::new(GatedStore::new(handles.store.clone()));
        let engine = SyncEngine::assemble(
            SyncConfig {
                retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
                side_effect_timeout_ms: 500,
                ..SyncConfig::default()
            },
            Backends {
                store: gated.clone(),
                ..handles.backends()
            },
        );
        (Arc::new(engine), handles, gated)
    }

    fn setup() -> (SyncEngine, InMemoryBackends) {
        SyncEngine::in_memory(SyncConfig {
            retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            side_effect_timeout_ms: 500,
            ..SyncConfig::default()
        })
    }

    fn widget() -> JsonValue {
        json!({"name": "Widget", "sku": "W-1", "price": 10, "tags": ["tools"]})
    }

    async fn create_widget(engine: &SyncEngine, tenant: TenantId) -> CatalogEntity {
        engine
            .coordinator()
            .create(WriteContext::new(tenant), EntityType::Product, widget())
            .await
            .unwrap()
    }

    async fn search_ids(engine: &SyncEngine, tenant: TenantId, text: &str) -> Vec<String> {
        engine
            .reads()
            .search(tenant, &SearchQuery::text(text))
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.document.entity_id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn product_lifecycle_with_versions_and_events() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();
        let writes = engine.coordinator();

        let created = create_widget(&engine, tenant).await;
        assert_eq!(created.version, 1);

        let updated = writes
            .update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"price": 12}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.payload["price"].as_f64(), Some(12.0));

        let stale = writes
            .update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"price": 99}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap_err();
        assert!(stale.is_conflict());

        let deleted = writes
            .delete(WriteContext::new(tenant), EntityType::Product, created.id, ExpectedVersion::exact(2))
            .await
            .unwrap();
        assert_eq!(deleted.version, 3);
        assert!(deleted.deleted);

        let err = engine
            .reads()
            .get_by_id(tenant, EntityType::Product, created.id)
            .await
            .unwrap_err();
        assert_eq!(err, CatalogError::NotFound);

        writes.drain().await;
        assert!(search_ids(&engine, tenant, "widget").await.is_empty());

        let events = backends.bus.partition(&tenant.to_string());
        let shape: Vec<(String, u64)> = events.iter().map(|e| (e.event_type(), e.version)).collect();
        assert_eq!(
            shape,
            vec![
                ("catalog.product.created".to_string(), 1),
                ("catalog.product.updated".to_string(), 2),
                ("catalog.product.deleted".to_string(), 3),
            ]
        );
        assert_eq!(engine.metrics().snapshot().write_conflicts, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_at_same_version_have_one_winner() {
        let (engine, _backends, gated) = gated_setup();
        let tenant = test_tenant_id();
        let writes = engine.coordinator();
        let created = create_widget(&engine, tenant).await;

        for v in 1..5 {
            writes
                .update(
                    WriteContext::new(tenant),
                    EntityType::Product,
                    created.id,
                    json!({"stock": v}),
                    ExpectedVersion::exact(v),
                )
                .await
                .unwrap();
        }

        // Both writers read version 5 before either reaches the CAS.
        gated.set_gate(Gate::Barrier(Arc::new(Barrier::new(2))));
        let (a, b) = tokio::join!(
            writes.update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"name": "A"}),
                ExpectedVersion::exact(5),
            ),
            writes.update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"name": "B"}),
                ExpectedVersion::exact(5),
            ),
        );
        gated.set_gate(Gate::Open);

        let outcomes = [a, b];
        let winners: Vec<&CatalogEntity> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].version, 6);

        // The loser was rejected by the store's compare-and-swap, not by the pre-check.
        let losers: Vec<&CatalogError> = outcomes.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(
            losers,
            vec![&CatalogError::Conflict("expected version 5, found 6".into())]
        );
        assert_eq!(engine.metrics().snapshot().write_conflicts, 1);
    }

    #[tokio::test]
    async fn read_racing_an_update_does_not_pin_the_old_version() {
        let (engine, _backends, gated) = gated_setup();
        let tenant = test_tenant_id();
        let created = create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;

        // A cold read takes its v1 snapshot, then stalls before filling the cache.
        gated.set_gate(Gate::SlowOnce(Duration::from_millis(200)));
        let slow_read = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .reads()
                    .get_by_id(tenant, EntityType::Product, created.id)
                    .await
            })
        };
        while !gated.is_open() {
            tokio::task::yield_now().await;
        }

        engine
            .coordinator()
            .update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"name": "Widget Pro"}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap();

        let after_write = engine
            .reads()
            .get_by_id(tenant, EntityType::Product, created.id)
            .await
            .unwrap();
        assert_eq!(after_write.version, 2);

        assert_eq!(slow_read.await.unwrap().unwrap().version, 1);
        engine.coordinator().drain().await;

        let later = engine
            .reads()
            .get_by_id(tenant, EntityType::Product, created.id)
            .await
            .unwrap();
        assert_eq!(later.version, 2);
        assert_eq!(later.payload["name"], json!("Widget Pro"));
    }

    #[tokio::test]
    async fn detail_read_sees_own_write_without_waiting() {
        let (engine, _backends) = setup();
        let tenant = test_tenant_id();
        let created = create_widget(&engine, tenant).await;

        // Warm the detail key with version 1.
        let first = engine
            .reads()
            .get_by_id(tenant, EntityType::Product, created.id)
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        engine
            .coordinator()
            .update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"name": "Widget Pro"}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap();

        let second = engine
            .reads()
            .get_by_id(tenant, EntityType::Product, created.id)
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.payload["name"], json!("Widget Pro"));
    }

    #[tokio::test]
    async fn collections_and_search_follow_mutations() {
        let (engine, _backends) = setup();
        let tenant = test_tenant_id();
        let filter = ListFilter::default();

        create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;
        assert_eq!(engine.reads().list(tenant, EntityType::Product, &filter).await.unwrap().len(), 1);
        assert_eq!(search_ids(&engine, tenant, "widget").await.len(), 1);

        create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;
        assert_eq!(engine.reads().list(tenant, EntityType::Product, &filter).await.unwrap().len(), 2);
        assert_eq!(search_ids(&engine, tenant, "widget").await.len(), 2);
    }

    #[tokio::test]
    async fn tenants_never_see_each_other() {
        let (engine, _backends) = setup();
        let owner = test_tenant_id();
        let other = test_tenant_id();
        let created = create_widget(&engine, owner).await;
        engine.coordinator().drain().await;

        let reads = engine.reads();
        assert_eq!(
            reads.get_by_id(other, EntityType::Product, created.id).await.unwrap_err(),
            CatalogError::NotFound
        );
        assert!(reads.list(other, EntityType::Product, &ListFilter::default()).await.unwrap().is_empty());
        assert!(search_ids(&engine, other, "widget").await.is_empty());
        assert!(search_ids(&engine, other, "*").await.is_empty());

        let err = engine
            .coordinator()
            .update(
                WriteContext::new(other),
                EntityType::Product,
                created.id,
                json!({"price": 1}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CatalogError::NotFound);
    }

    #[tokio::test]
    async fn events_keep_commit_order_across_transport_outage() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();
        let writes = engine.coordinator();

        let before = create_widget(&engine, tenant).await;
        writes.drain().await;

        backends.bus.set_available(false);
        let during = create_widget(&engine, tenant).await;
        writes
            .update(
                WriteContext::new(tenant),
                EntityType::Product,
                during.id,
                json!({"price": 11}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap();
        writes.drain().await;
        assert_eq!(engine.relay_outbox().await.unwrap().relayed, 0);
        backends.bus.set_available(true);

        // The next delivery for the tenant flushes the parked events first.
        let after = create_widget(&engine, tenant).await;
        writes.drain().await;
        assert_eq!(engine.relay_outbox().await.unwrap().relayed, 0);

        let order: Vec<(String, u64)> = backends
            .bus
            .partition(&tenant.to_string())
            .iter()
            .map(|e| (e.entity_id.to_string(), e.version))
            .collect();
        assert_eq!(
            order,
            vec![
                (before.id.to_string(), 1),
                (during.id.to_string(), 1),
                (during.id.to_string(), 2),
                (after.id.to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn relay_delivers_events_parked_during_an_outage() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();

        backends.bus.set_available(false);
        let created = create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;
        assert_eq!(backends.outbox.pending_count().await.unwrap(), 1);

        backends.bus.set_available(true);
        assert_eq!(engine.relay_outbox().await.unwrap().relayed, 1);
        let events = backends.bus.partition(&tenant.to_string());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id, created.id);
        assert_eq!(engine.metrics().snapshot().outbox_relayed, 1);
    }

    #[tokio::test]
    async fn search_outage_is_dead_lettered_then_replayed() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();

        backends.index.set_unavailable(true);
        let created = create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;

        let letters = backends.dead_letters.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].side_effect, SideEffect::SearchSync);
        assert_eq!(letters[0].entity_id(), created.id);

        backends.index.set_unavailable(false);
        let report = engine.replay_dead_letters().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(backends.dead_letters.count().await.unwrap(), 0);
        assert_eq!(search_ids(&engine, tenant, "widget").await, vec![created.id.to_string()]);
    }

    #[tokio::test]
    async fn reconciliation_repairs_missed_index_updates() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();
        let created = create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;

        // An update whose search sync was lost without a dead letter.
        let stale = backends.index.document(tenant, created.id).unwrap();
        engine
            .coordinator()
            .update(
                WriteContext::new(tenant),
                EntityType::Product,
                created.id,
                json!({"name": "Gadget"}),
                ExpectedVersion::exact(1),
            )
            .await
            .unwrap();
        engine.coordinator().drain().await;
        backends.index.force_put(stale);

        let report = engine.reconcile_all().await.unwrap();
        assert_eq!(report.reindexed, 1);
        assert_eq!(backends.index.document(tenant, created.id).unwrap().version, 2);
    }

    #[tokio::test]
    async fn late_sync_of_old_version_does_not_resurrect_deleted_entity() {
        let (engine, _backends) = setup();
        let tenant = test_tenant_id();
        let created = create_widget(&engine, tenant).await;
        engine
            .coordinator()
            .delete(WriteContext::new(tenant), EntityType::Product, created.id, ExpectedVersion::exact(1))
            .await
            .unwrap();
        engine.coordinator().drain().await;

        engine.search().upsert(&created).await.unwrap();
        assert!(search_ids(&engine, tenant, "widget").await.is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_the_write_and_emits_nothing() {
        let (engine, backends) = setup();
        backends.store.set_unavailable(true);

        let err = engine
            .coordinator()
            .create(WriteContext::new(test_tenant_id()), EntityType::Product, widget())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));

        engine.coordinator().drain().await;
        assert_eq!(backends.bus.total_sent(), 0);
        assert_eq!(backends.index.live_count(), 0);
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_store_reads() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();
        backends.cache.set_unavailable(true);
        backends.counters.set_unavailable(true);

        let created = create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;

        let got = engine
            .reads()
            .get_by_id(tenant, EntityType::Product, created.id)
            .await
            .unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(
            engine.reads().list(tenant, EntityType::Product, &ListFilter::default()).await.unwrap().len(),
            1
        );
        assert_eq!(search_ids(&engine, tenant, "widget").await.len(), 1);
    }

    #[derive(Default)]
    struct Counter(usize);

    impl EventHandler for Counter {
        fn apply(&mut self, _event: &DomainEvent) {
            self.0 += 1;
        }
    }

    #[tokio::test]
    async fn redelivered_events_are_applied_once() {
        let (engine, backends) = setup();
        let tenant = test_tenant_id();
        let created = create_widget(&engine, tenant).await;
        engine.coordinator().drain().await;

        let mut consumer = IdempotentConsumer::new(Counter::default());
        let events = backends.bus.partition(&tenant.to_string());
        assert_eq!(consumer.process(&events[0]), Delivery::Applied);

        // A redelivery rebuilds the identical event from the committed row.
        let replayed = created.to_event(Operation::Create);
        assert_eq!(replayed.id, events[0].id);
        assert_eq!(consumer.process(&replayed), Delivery::Duplicate);
        assert_eq!(consumer.handler().0, 1);
    }
}

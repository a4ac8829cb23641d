use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use marketplace_catalog::{CatalogEntity, ListFilter, NewEntity};
use marketplace_core::{EntityId, EntityType, ExpectedVersion, TenantId, UserId};

use super::{CatalogStore, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    tenant_id: TenantId,
    id: EntityId,
}

/// In-memory primary store.
///
/// Intended for tests/dev. The write lock makes each CAS atomic, which is the
/// same guarantee the Postgres row update gives.
#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    rows: RwLock<HashMap<RowKey, CatalogEntity>>,
    unavailable: AtomicBool,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreError::Backend`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite a row as-is (fixtures, drift simulation).
    pub fn put_raw(&self, entity: CatalogEntity) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert(
                RowKey {
                    tenant_id: entity.tenant_id,
                    id: entity.id,
                },
                entity,
            );
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("primary store unavailable".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }

    /// Shared CAS path for update and delete.
    fn compare_and_swap(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
        commit: impl FnOnce(&CatalogEntity) -> CatalogEntity,
    ) -> Result<CatalogEntity, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;

        let row = rows
            .get_mut(&RowKey { tenant_id, id })
            .filter(|r| r.entity_type == entity_type && !r.deleted)
            .ok_or(StoreError::NotFound)?;

        if !expected.matches(row.version) {
            return Err(StoreError::Conflict {
                expected: expected.value(),
                actual: row.version,
            });
        }

        let next = commit(row);
        *row = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn insert(&self, entity: NewEntity) -> Result<CatalogEntity, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.write().map_err(|_| Self::poisoned())?;

        let key = RowKey {
            tenant_id: entity.tenant_id,
            id: entity.id,
        };
        if rows.contains_key(&key) {
            return Err(StoreError::Backend(format!("duplicate entity id {}", entity.id)));
        }

        let committed = entity.into_entity(Utc::now());
        rows.insert(key, committed.clone());
        Ok(committed)
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows
            .get(&RowKey { tenant_id, id })
            .filter(|r| r.entity_type == entity_type)
            .cloned())
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
        self.compare_and_swap(tenant_id, entity_type, id, expected, |row| {
            row.committed_update(payload, actor, Utc::now())
        })
    }

    async fn soft_delete_cas(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
        expected: ExpectedVersion,
        actor: Option<UserId>,
    ) -> Result<CatalogEntity, StoreError> {
        self.compare_and_swap(tenant_id, entity_type, id, expected, |row| {
            row.committed_delete(actor, Utc::now())
        })
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
    ) -> Result<Vec<CatalogEntity>, StoreError> {
        let all = self.list_all(tenant_id, entity_type).await?;
        Ok(filter.apply(entity_type, all))
    }

    async fn list_all(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
    ) -> Result<Vec<CatalogEntity>, StoreError> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        Ok(rows
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        self.check_available()?;
        let rows = self.rows.read().map_err(|_| Self::poisoned())?;
        let tenants: BTreeSet<TenantId> = rows.keys().map(|k| k.tenant_id).collect();
        Ok(tenants.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn widget(tenant_id: TenantId) -> NewEntity {
        NewEntity::prepare(
            tenant_id,
            EntityType::Product,
            json!({"name": "Widget", "sku": "W-1", "price": 10}),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn cas_update_bumps_version_and_rejects_stale() {
        let store = InMemoryCatalogStore::new();
        let tenant = test_tenant_id();
        let created = store.insert(widget(tenant)).await.unwrap();

        let updated = store
            .update_cas(tenant, EntityType::Product, created.id, json!({"name": "W2", "sku": "W-1", "price": 1}), ExpectedVersion::exact(1), None)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = store
            .update_cas(tenant, EntityType::Product, created.id, json!({}), ExpectedVersion::exact(1), None)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Conflict { expected: 1, actual: 2 });

        let stored = store.get(tenant, EntityType::Product, created.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn other_tenants_rows_are_invisible() {
        let store = InMemoryCatalogStore::new();
        let owner = test_tenant_id();
        let created = store.insert(widget(owner)).await.unwrap();
        let other = test_tenant_id();

        assert_eq!(store.get(other, EntityType::Product, created.id).await.unwrap(), None);
        assert_eq!(
            store
                .soft_delete_cas(other, EntityType::Product, created.id, ExpectedVersion::exact(1), None)
                .await,
            Err(StoreError::NotFound)
        );
        assert!(store.list_all(other, EntityType::Product).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_rows_stay_deleted() {
        let store = InMemoryCatalogStore::new();
        let tenant = test_tenant_id();
        let created = store.insert(widget(tenant)).await.unwrap();
        let deleted = store
            .soft_delete_cas(tenant, EntityType::Product, created.id, ExpectedVersion::exact(1), None)
            .await
            .unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.version, 2);

        assert_eq!(
            store
                .soft_delete_cas(tenant, EntityType::Product, created.id, ExpectedVersion::exact(2), None)
                .await,
            Err(StoreError::NotFound)
        );
        assert!(store.list(tenant, EntityType::Product, &ListFilter::default()).await.unwrap().is_empty());
        assert_eq!(store.list_all(tenant, EntityType::Product).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = InMemoryCatalogStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.insert(widget(test_tenant_id())).await,
            Err(StoreError::Backend(_))
        ));
    }
}

//! Cache-aside access with versioned collection keys and single-flight loads.
//!
//! ## Design
//!
//! - Every backend round trip is bounded by the configured cache timeout. A
//!   failed or timed-out read is a miss; a failed write is logged and dropped.
//!   The cache can slow a request down by at most one timeout per call, and
//!   never fails it.
//! - Concurrent misses on one key inside this process share a single load
//!   (`futures::future::Shared`). The flight removes itself from the table
//!   when it completes, whichever caller drives it to completion.
//! - Invalidating a key detaches its flight, so later readers start a fresh
//!   load, and advances the key's generation stripe. A flight only fills the
//!   cache if no invalidation landed in its stripe while it ran, and deletes
//!   its own write again if one landed during the write.
//! - Collection keys embed the `(tenant, type)` counter. When the counter
//!   cannot be read there is no safe key, so the caller bypasses the cache.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use marketplace_catalog::{ListFilter, SearchQuery};
use marketplace_core::{EntityId, EntityType, TenantId};
use marketplace_observability::SyncMetrics;

use super::{CacheBackend, CacheError, CacheKey, VersionCounterStore};
use crate::capability::Invalidatable;
use crate::error::{CatalogError, SyncError};

type Flight = Shared<BoxFuture<'static, Result<Option<String>, CatalogError>>>;

const GENERATION_STRIPES: usize = 64;

/// Invalidation counters, striped by key hash so memory stays bounded.
struct Generations {
    stripes: Vec<AtomicU64>,
}

impl Generations {
    fn new() -> Self {
        Self {
            stripes: (0..GENERATION_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn current(&self, key: &str) -> u64 {
        self.stripe(key).load(Ordering::SeqCst)
    }

    fn advance(&self, key: &str) {
        self.stripe(key).fetch_add(1, Ordering::SeqCst);
    }
}

pub struct VersionedCacheManager {
    backend: Arc<dyn CacheBackend>,
    counters: Arc<dyn VersionCounterStore>,
    timeout: Duration,
    metrics: Arc<SyncMetrics>,
    inflight: Arc<Mutex<HashMap<String, (u64, Flight)>>>,
    generations: Arc<Generations>,
    next_flight: AtomicU64,
}

impl VersionedCacheManager {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        counters: Arc<dyn VersionCounterStore>,
        timeout: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            backend,
            counters,
            timeout,
            metrics,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(Generations::new()),
            next_flight: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Read and decode `key`. Any failure is a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match tokio::time::timeout(self.timeout, self.backend.get(key.as_str())).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "cache read failed, treating as miss");
                None
            }
            Err(_) => {
                self.metrics.cache_timeout();
                warn!(key = %key, timeout_ms = self.timeout.as_millis() as u64, "cache read timed out");
                None
            }
        };

        let decoded = raw.and_then(|s| match serde_json::from_str(&s) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable cache entry, treating as miss");
                None
            }
        });

        if decoded.is_some() {
            self.metrics.cache_hit();
        } else {
            self.metrics.cache_miss();
        }
        decoded
    }

    /// Encode and store `value`. Failures are logged only.
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => store_raw(&*self.backend, self.timeout, key.as_str(), raw, ttl).await,
            Err(e) => warn!(key = %key, error = %e, "cache value not serializable"),
        }
    }

    /// Delete `key`, bounded by the cache timeout.
    ///
    /// Any load already in flight for `key` is detached first: callers that
    /// joined it still get its result, but it will not fill the cache and new
    /// readers start their own load.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.generations.advance(key.as_str());
        if let Ok(mut inflight) = self.inflight.lock() {
            if inflight.remove(key.as_str()).is_some() {
                debug!(key = %key, "detached in-flight load");
            }
        }
        match tokio::time::timeout(self.timeout, self.backend.delete(key.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Unavailable(format!(
                "delete of {key} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Increment the `(tenant, type)` counter, orphaning every collection key
    /// built from the previous value.
    pub async fn bump(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<u64, CacheError> {
        match tokio::time::timeout(self.timeout, self.counters.bump(tenant_id, entity_type)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Unavailable("counter bump timed out".to_string())),
        }
    }

    async fn counter(&self, tenant_id: TenantId, entity_type: EntityType) -> Option<u64> {
        match tokio::time::timeout(self.timeout, self.counters.current(tenant_id, entity_type)).await {
            Ok(Ok(counter)) => Some(counter),
            Ok(Err(e)) => {
                warn!(tenant_id = %tenant_id, error = %e, "counter read failed, bypassing cache");
                None
            }
            Err(_) => {
                self.metrics.cache_timeout();
                warn!(tenant_id = %tenant_id, "counter read timed out, bypassing cache");
                None
            }
        }
    }

    /// Current collection key for a list request, if the counter is readable.
    pub async fn collection_key(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        filter: &ListFilter,
    ) -> Option<CacheKey> {
        let counter = self.counter(tenant_id, entity_type).await?;
        Some(CacheKey::collection(tenant_id, entity_type, filter, counter))
    }

    /// Current key for a search request, if both counters are readable.
    pub async fn search_key(&self, tenant_id: TenantId, query: &SearchQuery) -> Option<CacheKey> {
        let products = self.counter(tenant_id, EntityType::Product).await?;
        let categories = self.counter(tenant_id, EntityType::Category).await?;
        Some(CacheKey::search(tenant_id, query, (products, categories)))
    }

    /// Cache-aside read with per-process single-flight.
    ///
    /// A `None` from the loader is returned as-is and not cached.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        loader: F,
    ) -> Result<Option<T>, CatalogError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CatalogError>> + Send + 'static,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(Some(hit));
        }

        let flight = self.join_or_start(key, ttl, loader)?;
        match flight.await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| CatalogError::Storage(format!("cached value decode failed: {e}"))),
            None => Ok(None),
        }
    }

    fn join_or_start<T, F, Fut>(&self, key: &CacheKey, ttl: Duration, loader: F) -> Result<Flight, CatalogError>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CatalogError>> + Send + 'static,
    {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| CatalogError::Storage("single-flight table poisoned".to_string()))?;

        if let Some((_, flight)) = inflight.get(key.as_str()) {
            debug!(key = %key, "joining in-flight load");
            return Ok(flight.clone());
        }

        let load = loader();
        let backend = self.backend.clone();
        let table = self.inflight.clone();
        let generations = self.generations.clone();
        let started_at = generations.current(key.as_str());
        let flight_id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let timeout = self.timeout;
        let owned_key = key.as_str().to_string();

        let flight: Flight = async move {
            let outcome = match load.await {
                Ok(Some(value)) => serde_json::to_string(&value)
                    .map(Some)
                    .map_err(|e| CatalogError::Storage(format!("value not serializable: {e}"))),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            if let Ok(Some(raw)) = &outcome {
                if generations.current(&owned_key) == started_at {
                    store_raw(&*backend, timeout, &owned_key, raw.clone(), ttl).await;
                    if generations.current(&owned_key) != started_at {
                        discard_raw(&*backend, timeout, &owned_key).await;
                    }
                } else {
                    debug!(key = %owned_key, "key invalidated during load, not caching");
                }
            }
            if let Ok(mut table) = table.lock() {
                if matches!(table.get(&owned_key), Some((id, _)) if *id == flight_id) {
                    table.remove(&owned_key);
                }
            }
            outcome
        }
        .boxed()
        .shared();

        inflight.insert(key.as_str().to_string(), (flight_id, flight.clone()));
        Ok(flight)
    }
}

async fn store_raw(backend: &dyn CacheBackend, timeout: Duration, key: &str, raw: String, ttl: Duration) {
    match tokio::time::timeout(timeout, backend.set(key, raw, ttl)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(key = key, error = %e, "cache write failed"),
        Err(_) => warn!(key = key, "cache write timed out"),
    }
}

async fn discard_raw(backend: &dyn CacheBackend, timeout: Duration, key: &str) {
    match tokio::time::timeout(timeout, backend.delete(key)).await {
        Ok(Ok(())) => debug!(key = key, "dropped value written across an invalidation"),
        Ok(Err(e)) => warn!(key = key, error = %e, "cache delete failed"),
        Err(_) => warn!(key = key, "cache delete timed out"),
    }
}

#[async_trait]
impl Invalidatable for VersionedCacheManager {
    async fn invalidate_detail(
        &self,
        tenant_id: TenantId,
        entity_type: EntityType,
        id: EntityId,
    ) -> Result<(), SyncError> {
        self.invalidate(&CacheKey::detail(tenant_id, entity_type, id))
            .await
            .map_err(SyncError::from)
    }

    async fn bump_collections(&self, tenant_id: TenantId, entity_type: EntityType) -> Result<(), SyncError> {
        let counter = self.bump(tenant_id, entity_type).await?;
        debug!(tenant_id = %tenant_id, entity_type = %entity_type, counter, "collection keys rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cache::{InMemoryCache, InMemoryVersionCounters};

    fn manager(cache: Arc<InMemoryCache>, counters: Arc<InMemoryVersionCounters>) -> VersionedCacheManager {
        VersionedCacheManager::new(cache, counters, Duration::from_millis(50), Arc::new(SyncMetrics::new()))
    }

    fn key() -> CacheKey {
        CacheKey::detail(TenantId::new(), EntityType::Product, EntityId::new())
    }

    #[tokio::test]
    async fn get_or_load_caches_the_loaded_value() {
        let cache = Arc::new(InMemoryCache::new());
        let m = manager(cache.clone(), Arc::new(InMemoryVersionCounters::new()));
        let key = key();

        let v: Option<String> = m
            .get_or_load(&key, Duration::from_secs(60), || async { Ok(Some("loaded".to_string())) })
            .await
            .unwrap();
        assert_eq!(v.as_deref(), Some("loaded"));
        assert!(cache.contains(key.as_str()));

        let again: Option<String> = m
            .get_or_load(&key, Duration::from_secs(60), || async {
                Err(CatalogError::Storage("must be served from cache".into()))
            })
            .await
            .unwrap();
        assert_eq!(again.as_deref(), Some("loaded"));
        assert_eq!(m.metrics().snapshot().cache_hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_load() {
        let m = Arc::new(manager(
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryVersionCounters::new()),
        ));
        let loads = Arc::new(AtomicUsize::new(0));
        let key = key();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let m = m.clone();
            let loads = loads.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                m.get_or_load(&key, Duration::from_secs(60), move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Some(42u32))
                })
                .await
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap().unwrap(), Some(42));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidation_detaches_a_slow_load() {
        let cache = Arc::new(InMemoryCache::new());
        let m = Arc::new(manager(cache.clone(), Arc::new(InMemoryVersionCounters::new())));
        let key = key();
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let stale = {
            let m = m.clone();
            let key = key.clone();
            tokio::spawn(async move {
                m.get_or_load(&key, Duration::from_secs(60), || async move {
                    let _ = gate.await;
                    Ok(Some("v1".to_string()))
                })
                .await
            })
        };
        while !m.inflight.lock().unwrap().contains_key(key.as_str()) {
            tokio::task::yield_now().await;
        }

        m.invalidate(&key).await.unwrap();

        let fresh: Option<String> = m
            .get_or_load(&key, Duration::from_secs(60), || async { Ok(Some("v2".to_string())) })
            .await
            .unwrap();
        assert_eq!(fresh.as_deref(), Some("v2"));

        release.send(()).unwrap();
        assert_eq!(stale.await.unwrap().unwrap().as_deref(), Some("v1"));

        let cached: Option<String> = m.get(&key).await;
        assert_eq!(cached.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn not_found_is_not_cached() {
        let cache = Arc::new(InMemoryCache::new());
        let m = manager(cache.clone(), Arc::new(InMemoryVersionCounters::new()));
        let key = key();
        let v: Option<String> = m
            .get_or_load(&key, Duration::from_secs(60), || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(v, None);
        assert!(!cache.contains(key.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cache_degrades_to_direct_load() {
        let cache = Arc::new(InMemoryCache::new());
        cache.set_latency(Duration::from_secs(5));
        let m = manager(cache, Arc::new(InMemoryVersionCounters::new()));

        let v: Option<u32> = m
            .get_or_load(&key(), Duration::from_secs(60), || async { Ok(Some(7)) })
            .await
            .unwrap();
        assert_eq!(v, Some(7));
        assert!(m.metrics().snapshot().cache_timeouts >= 1);
    }

    #[tokio::test]
    async fn bump_rotates_collection_key() {
        let m = manager(Arc::new(InMemoryCache::new()), Arc::new(InMemoryVersionCounters::new()));
        let tenant = TenantId::new();
        let filter = ListFilter::default();

        let before = m.collection_key(tenant, EntityType::Product, &filter).await.unwrap();
        m.bump_collections(tenant, EntityType::Product).await.unwrap();
        let after = m.collection_key(tenant, EntityType::Product, &filter).await.unwrap();
        assert_ne!(before, after);

        let other_type = m.collection_key(tenant, EntityType::Category, &filter).await.unwrap();
        assert!(other_type.as_str().ends_with(":v0"));
    }

    #[tokio::test]
    async fn unreadable_counter_bypasses_cache() {
        let counters = Arc::new(InMemoryVersionCounters::new());
        counters.set_unavailable(true);
        let m = manager(Arc::new(InMemoryCache::new()), counters);
        assert!(m
            .collection_key(TenantId::new(), EntityType::Product, &ListFilter::default())
            .await
            .is_none());
    }
}

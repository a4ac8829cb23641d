use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CacheBackend, CacheError};

/// Minimum spacing between full expiry sweeps triggered by writes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    next_sweep: Option<Instant>,
}

impl Entries {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, e| e.expires_at > now);
        self.next_sweep = Some(now + SWEEP_INTERVAL);
        before - self.map.len()
    }
}

/// In-process TTL cache.
///
/// Intended for tests/dev. Expiry follows the tokio clock, so paused-time tests
/// can advance past a TTL. Outages and slow round trips can be simulated.
///
/// Keys nobody reads again (orphaned collection versions) are reclaimed by a
/// sweep that writes trigger at most once per second.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<Entries>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Whether a live (unexpired) entry exists.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|m| m.map.get(key).is_some_and(|e| e.expires_at > now))
            .unwrap_or(false)
    }

    /// Drop every expired entry. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        self.entries
            .lock()
            .map(|mut m| m.purge_expired(Instant::now()))
            .unwrap_or(0)
    }

    /// Number of live entries. Expired ones are purged first.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|mut m| {
                m.purge_expired(Instant::now());
                m.map.len()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn round_trip(&self) -> Result<(), CacheError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("cache unavailable".to_string()));
        }
        Ok(())
    }

    fn poisoned() -> CacheError {
        CacheError::Command("lock poisoned".to_string())
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.round_trip().await?;
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        let found = entries
            .map
            .get(key)
            .map(|e| (e.expires_at > now).then(|| e.value.clone()));
        match found {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.round_trip().await?;
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        entries.map.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        if entries.next_sweep.is_none_or(|at| now >= at) {
            entries.purge_expired(now);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.round_trip().await?;
        let mut entries = self.entries.lock().map_err(|_| Self::poisoned())?;
        entries.map.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(300)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn orphaned_keys_are_reclaimed_by_later_writes() {
        let cache = InMemoryCache::new();
        // A collection key per counter value, none of them read again.
        for counter in 0..1_000 {
            let key = format!("catalog:t:product:list:f:v{counter}");
            cache.set(&key, "[]".into(), Duration::from_secs(300)).await.unwrap();
        }
        assert_eq!(cache.entries.lock().unwrap().map.len(), 1_000);

        tokio::time::advance(Duration::from_secs(3_600)).await;
        cache
            .set("catalog:t:product:list:f:v1000", "[]".into(), Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(cache.entries.lock().unwrap().map.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn len_counts_only_live_entries() {
        let cache = InMemoryCache::new();
        cache.set("short", "v".into(), Duration::from_secs(10)).await.unwrap();
        cache.set("long", "v".into(), Duration::from_secs(600)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.contains("long"));
    }

    #[tokio::test]
    async fn outage_is_reported() {
        let cache = InMemoryCache::new();
        cache.set_unavailable(true);
        assert!(matches!(cache.get("k").await, Err(CacheError::Unavailable(_))));
    }
}

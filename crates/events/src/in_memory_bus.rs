//! In-memory event transport for tests/dev.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, mpsc};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::{EventTransport, Subscription, TransportError};
use crate::DomainEvent;

/// In-memory partitioned transport.
///
/// - Keeps an ordered log per partition key
/// - Best-effort fan-out to subscribers
/// - Can be switched "down" to simulate a broker outage
#[derive(Debug)]
pub struct InMemoryEventBus {
    partitions: Mutex<HashMap<String, Vec<DomainEvent>>>,
    subscribers: Mutex<Vec<mpsc::Sender<DomainEvent>>>,
    available: AtomicBool,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker going down (`false`) or recovering (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Events accepted on one partition, in send order.
    pub fn partition(&self, partition_key: &str) -> Vec<DomainEvent> {
        self.partitions
            .lock()
            .map(|p| p.get(partition_key).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Total number of accepted sends (duplicates included).
    pub fn total_sent(&self) -> usize {
        self.partitions
            .lock()
            .map(|p| p.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<DomainEvent> {
        let (tx, rx) = mpsc::channel();

        // If the lock is poisoned, we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl EventTransport for InMemoryEventBus {
    async fn send(&self, partition_key: &str, event: &DomainEvent) -> Result<(), TransportError> {
        if !self.is_available() {
            debug!(partition_key, event_id = %event.id, "bus down, send rejected");
            return Err(TransportError::Unavailable("in-memory bus is down".to_string()));
        }

        {
            let mut partitions = self
                .partitions
                .lock()
                .map_err(|_| TransportError::Unavailable("lock poisoned".to_string()))?;
            partitions
                .entry(partition_key.to_string())
                .or_default()
                .push(event.clone());
        }

        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| TransportError::Unavailable("lock poisoned".to_string()))?;

        // Drop any dead subscribers while publishing.
        let before = subs.len();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
        if subs.len() < before {
            warn!(dropped = before - subs.len(), "removed disconnected subscribers");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;
    use chrono::Utc;
    use marketplace_core::{EntityId, EntityType, TenantId};

    fn event(tenant_id: TenantId, version: u64) -> DomainEvent {
        DomainEvent::new(
            tenant_id,
            EntityType::Category,
            EntityId::new(),
            Operation::Create,
            version,
            serde_json::json!({}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn keeps_send_order_per_partition() {
        let bus = InMemoryEventBus::new();
        let tenant = TenantId::new();
        let key = tenant.to_string();
        for v in 1..=3 {
            bus.send(&key, &event(tenant, v)).await.unwrap();
        }
        let versions: Vec<u64> = bus.partition(&key).iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn rejects_sends_while_down() {
        let bus = InMemoryEventBus::new();
        let tenant = TenantId::new();
        bus.set_available(false);
        let err = bus.send(&tenant.to_string(), &event(tenant, 1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert_eq!(bus.total_sent(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_copies() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe();
        let tenant = TenantId::new();
        bus.send(&tenant.to_string(), &event(tenant, 1)).await.unwrap();
        assert_eq!(sub.drain().len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned_on_send() {
        let bus = InMemoryEventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        let tenant = TenantId::new();
        bus.send(&tenant.to_string(), &event(tenant, 1)).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain().len(), 1);
    }
}

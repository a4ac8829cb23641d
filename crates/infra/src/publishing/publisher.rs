//! At-least-once event publisher over a durable outbox.
//!
//! ## Ordering
//!
//! The partition key is the tenant id, so the transport keeps a tenant's
//! events in send order. The publisher keeps them in *commit* order across
//! outages:
//!
//! - every event is staged in the outbox before anything is sent;
//! - delivery drains a tenant strictly in enqueue order, acks each entry
//!   after the transport accepts it and stops that tenant at its first
//!   failure;
//! - deliveries of one tenant never interleave (per-tenant lock, dropped
//!   again once no caller holds it).
//!
//! The publisher does not deduplicate. Consumers dedupe on the event id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use marketplace_core::TenantId;
use marketplace_events::{DomainEvent, EventTransport, TransportError};
use marketplace_observability::SyncMetrics;

use super::outbox::{OutboxError, OutboxStore};
use crate::capability::{PublishOutcome, Publishable};
use crate::error::SyncError;

/// Entries fetched per outbox round trip during delivery.
const DELIVERY_BATCH: usize = 32;

/// Result of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub relayed: usize,
    /// Tenants whose head entry still could not be delivered.
    pub blocked_tenants: usize,
}

/// Outcome of draining one tenant.
struct Drained {
    sent: usize,
    blocked: bool,
}

type TenantLock = Arc<tokio::sync::Mutex<()>>;

/// A tenant's lock handle. Dropping it removes the table entry when no one
/// else holds the lock, also when a delivery is cancelled mid-way.
struct TenantSlot<'a> {
    table: &'a Mutex<HashMap<TenantId, TenantLock>>,
    tenant_id: TenantId,
    lock: TenantLock,
}

impl Drop for TenantSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.table.lock() {
            if Arc::strong_count(&self.lock) == 2 {
                locks.remove(&self.tenant_id);
            }
        }
    }
}

pub struct EventPublisher {
    transport: Arc<dyn EventTransport>,
    outbox: Arc<dyn OutboxStore>,
    send_timeout: Duration,
    metrics: Arc<SyncMetrics>,
    tenant_locks: Mutex<HashMap<TenantId, TenantLock>>,
}

impl EventPublisher {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        outbox: Arc<dyn OutboxStore>,
        send_timeout: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            transport,
            outbox,
            send_timeout,
            metrics,
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.outbox
    }

    /// Tenants with a lock entry right now.
    pub fn tracked_tenants(&self) -> usize {
        self.tenant_locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn tenant_slot(&self, tenant_id: TenantId) -> Result<TenantSlot<'_>, OutboxError> {
        let mut locks = self
            .tenant_locks
            .lock()
            .map_err(|_| OutboxError::Backend("tenant lock table poisoned".to_string()))?;
        Ok(TenantSlot {
            table: &self.tenant_locks,
            tenant_id,
            lock: locks.entry(tenant_id).or_default().clone(),
        })
    }

    async fn send(&self, event: &DomainEvent) -> Result<(), TransportError> {
        let key = event.partition_key();
        match tokio::time::timeout(self.send_timeout, self.transport.send(&key, event)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Unavailable(format!(
                "send timed out after {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Record `event` in the outbox. Nothing is sent yet.
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, event_id = %event.id), err)]
    pub async fn stage(&self, event: &DomainEvent) -> Result<(), OutboxError> {
        self.outbox.enqueue(event).await?;
        self.metrics.outbox_enqueued();
        Ok(())
    }

    /// Send up to `limit` of the tenant's pending entries, oldest first.
    async fn drain_tenant(&self, tenant_id: TenantId, limit: usize) -> Result<Drained, OutboxError> {
        let slot = self.tenant_slot(tenant_id)?;
        let drained = {
            let _guard = slot.lock.lock().await;
            self.drain_locked(tenant_id, limit).await
        };
        drop(slot);

        let drained = drained?;
        if drained.sent > 0 {
            self.metrics.outbox_relayed(drained.sent as u64);
        }
        Ok(drained)
    }

    async fn drain_locked(&self, tenant_id: TenantId, limit: usize) -> Result<Drained, OutboxError> {
        let mut drained = Drained {
            sent: 0,
            blocked: false,
        };
        while drained.sent < limit {
            let entries = self
                .outbox
                .peek(tenant_id, DELIVERY_BATCH.min(limit - drained.sent))
                .await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                if let Err(e) = self.send(&entry.event).await {
                    warn!(
                        tenant_id = %tenant_id,
                        event_id = %entry.event.id,
                        error = %e,
                        "delivery blocked, entry stays in outbox"
                    );
                    drained.blocked = true;
                    return Ok(drained);
                }
                self.outbox.ack(tenant_id, entry.seq).await?;
                drained.sent += 1;
            }
        }
        Ok(drained)
    }

    /// Deliver everything the tenant has staged.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn deliver(&self, tenant_id: TenantId) -> Result<PublishOutcome, OutboxError> {
        let drained = self.drain_tenant(tenant_id, usize::MAX).await?;
        if drained.blocked {
            debug!(sent = drained.sent, "left pending entries for the relay");
            Ok(PublishOutcome::Outboxed)
        } else {
            Ok(PublishOutcome::Sent)
        }
    }

    /// Stage one event and deliver the tenant's queue.
    #[instrument(
        skip(self, event),
        fields(tenant_id = %event.tenant_id, event_id = %event.id, version = event.version),
        err
    )]
    pub async fn publish(&self, event: &DomainEvent) -> Result<PublishOutcome, OutboxError> {
        self.stage(event).await?;
        self.deliver(event.tenant_id).await
    }

    /// Relay up to `batch` pending entries per tenant, in order.
    #[instrument(skip(self), err)]
    pub async fn replay_outbox(&self, batch: usize) -> Result<RelayReport, OutboxError> {
        let mut report = RelayReport::default();

        for tenant_id in self.outbox.pending_tenants().await? {
            let drained = self.drain_tenant(tenant_id, batch).await?;
            report.relayed += drained.sent;
            if drained.blocked {
                report.blocked_tenants += 1;
            }
        }

        if report.relayed > 0 {
            info!(relayed = report.relayed, blocked = report.blocked_tenants, "outbox relayed");
        }
        Ok(report)
    }
}

#[async_trait]
impl Publishable for EventPublisher {
    async fn stage(&self, event: &DomainEvent) -> Result<(), SyncError> {
        EventPublisher::stage(self, event).await.map_err(SyncError::from)
    }

    async fn deliver(&self, tenant_id: TenantId) -> Result<PublishOutcome, SyncError> {
        EventPublisher::deliver(self, tenant_id).await.map_err(SyncError::from)
    }

    async fn publish(&self, event: &DomainEvent) -> Result<PublishOutcome, SyncError> {
        EventPublisher::publish(self, event).await.map_err(SyncError::from)
    }
}

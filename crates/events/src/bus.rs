//! Event transport abstraction (mechanics only).
//!
//! The transport is the last hop of the publishing pipeline:
//!
//! ```text
//! Primary commit → EventPublisher → EventTransport (partitioned by tenant) → Consumers
//!                        └─ outbox (transport unavailable)
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: the publisher retries and replays its outbox, so a
//!   consumer may see the same event more than once. Events carry a stable id
//!   for deduplication (see [`crate::IdempotentConsumer`]).
//! - **Per-tenant ordering**: events are sent with the tenant id as partition
//!   key. A transport must preserve send order within a partition. Nothing is
//!   promised across partitions.
//! - **No persistence assumption**: the primary store is the source of truth,
//!   the transport is for distribution.

use std::sync::mpsc::Receiver;
use std::time::Duration;
use std::sync::Arc;

use async_trait::async_trait;

use crate::DomainEvent;

/// A subscription to a transport's event stream.
///
/// Each subscription gets a copy of every event sent (broadcast semantics).
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(m) = self.receiver.try_recv() {
            out.push(m);
        }
        out
    }
}

/// Transport-level failure. All variants are retryable from the publisher's
/// point of view; the event is parked in the outbox when retries run out.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport rejected event: {0}")]
    Rejected(String),
}

/// Partitioned, ordered event transport (Kafka-like, Redis Streams, in-memory).
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; the publisher shares one transport
/// across all tenant lanes.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Send one event on the partition identified by `partition_key`.
    ///
    /// Must not return before the transport has accepted the event.
    async fn send(&self, partition_key: &str, event: &DomainEvent) -> Result<(), TransportError>;
}

#[async_trait]
impl<T> EventTransport for Arc<T>
where
    T: EventTransport + ?Sized,
{
    async fn send(&self, partition_key: &str, event: &DomainEvent) -> Result<(), TransportError> {
        (**self).send(partition_key, event).await
    }
}

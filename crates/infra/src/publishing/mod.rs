//! Event publishing: durable outbox, in-order delivery, relay.
//!
//! ```text
//! stage(event) ───► outbox (transactional with the commit on Postgres)
//! deliver(tenant) ─ send oldest first, ack each ─┬─ drained ───► Sent
//!                                                └─ failure ───► Outboxed
//! replay_outbox(batch) ── deliver every pending tenant, at most `batch` each
//! ```

pub mod outbox;
pub mod publisher;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use outbox::{InMemoryOutbox, OutboxEntry, OutboxError, OutboxStore, PostgresOutbox};
pub use publisher::{EventPublisher, RelayReport};

//! Catalog domain events and the transport seam.
//!
//! Events are emitted after a successful primary-store commit and delivered
//! at-least-once. Consumers deduplicate on [`DomainEvent::id`], which is
//! reproducible from `(entity_id, version)`.

pub mod bus;
pub mod consumer;
pub mod event;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventTransport, Subscription, TransportError};
pub use consumer::{Delivery, EventHandler, IdempotentConsumer};
pub use event::{DomainEvent, Operation, EVENT_SCHEMA_VERSION, EVENT_STREAM};
pub use in_memory_bus::InMemoryEventBus;
pub use tenant::TenantScoped;

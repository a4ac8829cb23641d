//! Consumer-side deduplication for at-least-once delivery.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use marketplace_core::EntityId;

use crate::DomainEvent;

/// Downstream handler of catalog events (projection, notifier, ...).
pub trait EventHandler {
    fn apply(&mut self, event: &DomainEvent);
}

/// What happened to a delivered event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// First delivery; the handler ran.
    Applied,
    /// Same event id seen before; skipped.
    Duplicate,
    /// An equal or newer version of the entity was already applied; skipped.
    Stale,
}

/// Wraps an [`EventHandler`] so replays and redeliveries are no-ops.
///
/// Events are deduplicated on their deterministic id, and per-entity versions
/// are tracked so a late redelivery of an old version cannot overwrite newer
/// state.
#[derive(Debug)]
pub struct IdempotentConsumer<H> {
    handler: H,
    seen: HashSet<Uuid>,
    versions: HashMap<EntityId, u64>,
}

impl<H: EventHandler> IdempotentConsumer<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            seen: HashSet::new(),
            versions: HashMap::new(),
        }
    }

    pub fn process(&mut self, event: &DomainEvent) -> Delivery {
        if !self.seen.insert(event.id) {
            debug!(event_id = %event.id, "duplicate delivery skipped");
            return Delivery::Duplicate;
        }

        let last = self.versions.get(&event.entity_id).copied().unwrap_or(0);
        if event.version <= last {
            debug!(
                event_id = %event.id,
                entity_id = %event.entity_id,
                version = event.version,
                applied = last,
                "stale delivery skipped"
            );
            return Delivery::Stale;
        }

        self.handler.apply(event);
        self.versions.insert(event.entity_id, event.version);
        Delivery::Applied
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;
    use chrono::Utc;
    use marketplace_core::{EntityType, TenantId};
    use serde_json::{Value as JsonValue, json};

    #[derive(Debug, Default, PartialEq)]
    struct Mirror {
        rows: HashMap<EntityId, (u64, JsonValue, bool)>,
        applied: usize,
    }

    impl EventHandler for Mirror {
        fn apply(&mut self, event: &DomainEvent) {
            self.applied += 1;
            self.rows.insert(
                event.entity_id,
                (
                    event.version,
                    event.payload.clone(),
                    event.operation == Operation::Delete,
                ),
            );
        }
    }

    fn event(entity_id: EntityId, op: Operation, version: u64, price: u64) -> DomainEvent {
        DomainEvent::new(
            TenantId::new(),
            EntityType::Product,
            entity_id,
            op,
            version,
            json!({"price": price}),
            Utc::now(),
        )
    }

    #[test]
    fn replaying_an_event_twice_equals_processing_once() {
        let id = EntityId::new();
        let events = vec![
            event(id, Operation::Create, 1, 10),
            event(id, Operation::Update, 2, 15),
        ];

        let mut once = IdempotentConsumer::new(Mirror::default());
        for e in &events {
            once.process(e);
        }

        let mut twice = IdempotentConsumer::new(Mirror::default());
        for e in &events {
            assert_eq!(twice.process(e), Delivery::Applied);
            assert_eq!(twice.process(e), Delivery::Duplicate);
        }

        assert_eq!(once.handler(), twice.handler());
    }

    #[test]
    fn late_redelivery_of_older_version_is_stale() {
        let id = EntityId::new();
        let mut consumer = IdempotentConsumer::new(Mirror::default());
        consumer.process(&event(id, Operation::Create, 1, 10));
        consumer.process(&event(id, Operation::Update, 3, 20));

        assert_eq!(
            consumer.process(&event(id, Operation::Update, 2, 15)),
            Delivery::Stale
        );
        assert_eq!(consumer.handler().rows[&id].0, 3);
    }
}

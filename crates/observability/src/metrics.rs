//! Prometheus counters for cache, side-effect and outbox activity.
//!
//! Post-commit failures are never surfaced to the writer, so these counters
//! are the only place a degraded downstream shows up besides the logs.
//!
//! Each [`SyncMetrics`] owns its own [`Registry`]; [`SyncMetrics::render`]
//! produces the text exposition format for a `/metrics` endpoint.

use std::fmt;

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Metric name prefix.
const PREFIX: &str = "catalog_sync";

pub struct SyncMetrics {
    registry: Registry,
    /// `outcome`: hit, miss, timeout
    cache_requests: IntCounterVec,
    /// `effect`: side effect name; `outcome`: succeeded, retried, dead_lettered
    side_effects: IntCounterVec,
    /// `stage`: enqueued, relayed
    outbox_events: IntCounterVec,
    write_conflicts: IntCounter,
}

/// Point-in-time totals of [`SyncMetrics`], summed over effect labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_timeouts: u64,
    pub side_effects_succeeded: u64,
    pub side_effect_retries: u64,
    pub dead_letters: u64,
    pub outbox_enqueued: u64,
    pub outbox_relayed: u64,
    pub write_conflicts: u64,
}

impl SyncMetrics {
    /// Build and register every counter.
    ///
    /// # Panics
    ///
    /// Only if the static metric definitions below are invalid.
    pub fn new() -> Self {
        Self::try_new().expect("static metric definitions are valid")
    }

    pub fn try_new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let cache_requests = IntCounterVec::new(
            Opts::new(format!("{PREFIX}_cache_requests_total"), "Cache lookups by outcome"),
            &["outcome"],
        )?;
        let side_effects = IntCounterVec::new(
            Opts::new(
                format!("{PREFIX}_side_effects_total"),
                "Post-commit side effect attempts by effect and outcome",
            ),
            &["effect", "outcome"],
        )?;
        let outbox_events = IntCounterVec::new(
            Opts::new(format!("{PREFIX}_outbox_events_total"), "Events entering and leaving the outbox"),
            &["stage"],
        )?;
        let write_conflicts = IntCounter::with_opts(Opts::new(
            format!("{PREFIX}_write_conflicts_total"),
            "Writes rejected on a version mismatch",
        ))?;

        registry.register(Box::new(cache_requests.clone()))?;
        registry.register(Box::new(side_effects.clone()))?;
        registry.register(Box::new(outbox_events.clone()))?;
        registry.register(Box::new(write_conflicts.clone()))?;

        Ok(Self {
            registry,
            cache_requests,
            side_effects,
            outbox_events,
            write_conflicts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache_hit(&self) {
        self.cache_requests.with_label_values(&["hit"]).inc();
    }

    pub fn cache_miss(&self) {
        self.cache_requests.with_label_values(&["miss"]).inc();
    }

    pub fn cache_timeout(&self) {
        self.cache_requests.with_label_values(&["timeout"]).inc();
    }

    pub fn side_effect_succeeded(&self, effect: &str) {
        self.side_effects.with_label_values(&[effect, "succeeded"]).inc();
    }

    pub fn side_effect_retried(&self, effect: &str) {
        self.side_effects.with_label_values(&[effect, "retried"]).inc();
    }

    pub fn dead_lettered(&self, effect: &str) {
        self.side_effects.with_label_values(&[effect, "dead_lettered"]).inc();
    }

    pub fn outbox_enqueued(&self) {
        self.outbox_events.with_label_values(&["enqueued"]).inc();
    }

    pub fn outbox_relayed(&self, n: u64) {
        self.outbox_events.with_label_values(&["relayed"]).inc_by(n);
    }

    pub fn write_conflict(&self) {
        self.write_conflicts.inc();
    }

    /// Count for one `(effect, outcome)` pair.
    pub fn side_effects(&self, effect: &str, outcome: &str) -> u64 {
        self.side_effects.with_label_values(&[effect, outcome]).get()
    }

    fn side_effect_total(&self, outcome: &str) -> u64 {
        let name = format!("{PREFIX}_side_effects_total");
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "outcome" && label.get_value() == outcome)
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_requests.with_label_values(&["hit"]).get(),
            cache_misses: self.cache_requests.with_label_values(&["miss"]).get(),
            cache_timeouts: self.cache_requests.with_label_values(&["timeout"]).get(),
            side_effects_succeeded: self.side_effect_total("succeeded"),
            side_effect_retries: self.side_effect_total("retried"),
            dead_letters: self.side_effect_total("dead_lettered"),
            outbox_enqueued: self.outbox_events.with_label_values(&["enqueued"]).get(),
            outbox_relayed: self.outbox_events.with_label_values(&["relayed"]).get(),
            write_conflicts: self.write_conflicts.get(),
        }
    }

    /// Prometheus text exposition of every counter.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(format!("exposition is not utf-8: {e}")))
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncMetrics").field("totals", &self.snapshot()).finish()
    }
}

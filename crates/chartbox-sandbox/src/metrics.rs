//! Prometheus metrics for the chartbox sandbox.
//!
//! This module is only compiled when the `metrics` feature is enabled.
//! Gauges are bridged from the pool's atomic [`PoolMetrics`] counters by
//! [`SandboxMetrics::observe`].
//!
//! [`PoolMetrics`]: crate::pool::PoolMetrics

use std::sync::atomic::{AtomicI64, Ordering};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::pool::ContextPool;

/// Label set for lifecycle events.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    /// One of "created", "released", "reaped", "rejected",
    /// "compile_failure", "invocation", "invocation_failure", "stale".
    pub event: String,
}

/// Prometheus view of a [`ContextPool`].
pub struct SandboxMetrics {
    /// Live contexts.
    pub contexts_live: Gauge<i64, AtomicI64>,
    /// Cumulative lifecycle events by kind.
    pub events_total: Family<EventLabels, Gauge<i64, AtomicI64>>,
}

impl SandboxMetrics {
    /// Create a new `SandboxMetrics` and register it with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let contexts_live = Gauge::default();
        registry.register(
            "chartbox_contexts_live",
            "Live sandbox contexts",
            contexts_live.clone(),
        );

        let events_total = Family::default();
        registry.register(
            "chartbox_context_events",
            "Cumulative context lifecycle events by kind",
            events_total.clone(),
        );

        Self {
            contexts_live,
            events_total,
        }
    }

    /// Copy the pool's current counters into the gauges.
    pub async fn observe(&self, pool: &ContextPool) {
        self.contexts_live.set(pool.len().await as i64);

        let m = pool.metrics();
        for (event, counter) in [
            ("created", &m.created),
            ("released", &m.released),
            ("reaped", &m.reaped),
            ("rejected", &m.rejected),
            ("compile_failure", &m.compile_failures),
            ("invocation", &m.invocations),
            ("invocation_failure", &m.invocation_failures),
            ("stale", &m.stale_invocations),
        ] {
            self.set_event(event, counter.load(Ordering::Relaxed) as i64);
        }
    }

    fn set_event(&self, event: &str, value: i64) {
        let labels = EventLabels {
            event: event.to_string(),
        };
        self.events_total.get_or_create(&labels).set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn registers_and_encodes() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        metrics.contexts_live.set(3);
        metrics.set_event("created", 7);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("chartbox_contexts_live 3"), "{buf}");
        assert!(buf.contains("chartbox_context_events"), "{buf}");
        assert!(buf.contains("event=\"created\""), "{buf}");
    }

    #[tokio::test]
    async fn observe_bridges_pool_counters() {
        let mut registry = Registry::default();
        let metrics = SandboxMetrics::new(&mut registry);
        let pool = ContextPool::new(crate::SandboxConfig::default()).unwrap();
        pool.create_context().await.unwrap();

        metrics.observe(&pool).await;
        assert_eq!(metrics.contexts_live.get(), 1);
        let created = EventLabels {
            event: "created".into(),
        };
        assert_eq!(metrics.events_total.get_or_create(&created).get(), 1);
        pool.dispose_all().await;
    }
}

use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HeartbeatLabels {
    pub result: HeartbeatResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HeartbeatResult {
    Ok,
    Failed,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- connections --
    pub connections_total: Counter,
    pub handshake_failures_total: Counter,
    pub active_connections: Gauge,

    // -- forwards --
    pub forwards_opened_total: Counter,
    pub forward_rejections_total: Counter,

    // -- heartbeats --
    pub heartbeats_total: Family<HeartbeatLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let connections_total = Counter::default();
        registry.register(
            "tollgate_connections_total",
            "Total accepted SSH connections",
            connections_total.clone(),
        );

        let handshake_failures_total = Counter::default();
        registry.register(
            "tollgate_handshake_failures_total",
            "SSH handshakes that failed authentication or the protocol",
            handshake_failures_total.clone(),
        );

        let active_connections: Gauge = Gauge::default();
        registry.register(
            "tollgate_active_connections",
            "Currently open SSH connections",
            active_connections.clone(),
        );

        let forwards_opened_total = Counter::default();
        registry.register(
            "tollgate_forwards_opened_total",
            "Reverse-tunnel listeners opened on behalf of workers",
            forwards_opened_total.clone(),
        );

        let forward_rejections_total = Counter::default();
        registry.register(
            "tollgate_forward_rejections_total",
            "tcpip-forward requests rejected over the per-connection cap",
            forward_rejections_total.clone(),
        );

        let heartbeats_total = Family::<HeartbeatLabels, Counter>::default();
        registry.register(
            "tollgate_heartbeats_total",
            "Worker registration attempts by result",
            heartbeats_total.clone(),
        );

        Self {
            connections_total,
            handshake_failures_total,
            active_connections,
            forwards_opened_total,
            forward_rejections_total,
            heartbeats_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::Gateway`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

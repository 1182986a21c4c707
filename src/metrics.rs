use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub rule: String,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Proceed,
    Redirect,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub outcome: RefreshOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshOutcome {
    Ok,
    Error,
    Timeout,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendCallLabels {
    pub call: BackendCall,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BackendCall {
    Auth,
    Settings,
    Role,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub target: UpstreamTarget,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UpstreamTarget {
    App,
    Backend,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gate.
pub struct Metrics {
    // -- gate --
    pub decisions_total: Family<DecisionLabels, Counter>,
    pub decision_duration_seconds: Histogram,

    // -- settings cache --
    pub settings_refresh_total: Family<RefreshLabels, Counter>,
    pub settings_cache_hits: Counter,

    // -- backend --
    pub backend_failures_total: Family<BackendCallLabels, Counter>,

    // -- proxying --
    pub upstream_requests_total: Family<UpstreamLabels, Counter>,
    pub gate_pass_issued_total: Counter,
    pub gate_pass_rejected_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let decisions_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "sitegate_decisions",
            "Gate decisions by deciding rule and outcome",
            decisions_total.clone(),
        );

        let decision_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "sitegate_decision_duration_seconds",
            "Time spent deciding a request, including backend calls",
            decision_duration_seconds.clone(),
        );

        let settings_refresh_total = Family::<RefreshLabels, Counter>::default();
        registry.register(
            "sitegate_settings_refresh",
            "Settings cache refreshes by outcome",
            settings_refresh_total.clone(),
        );

        let settings_cache_hits = Counter::default();
        registry.register(
            "sitegate_settings_cache_hits",
            "Requests served from a fresh settings snapshot",
            settings_cache_hits.clone(),
        );

        let backend_failures_total = Family::<BackendCallLabels, Counter>::default();
        registry.register(
            "sitegate_backend_failures",
            "Failed or timed-out backend calls by call type",
            backend_failures_total.clone(),
        );

        let upstream_requests_total = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "sitegate_upstream_requests",
            "Requests forwarded upstream by target",
            upstream_requests_total.clone(),
        );

        let gate_pass_issued_total = Counter::default();
        registry.register(
            "sitegate_gate_pass_issued",
            "Gate passes issued",
            gate_pass_issued_total.clone(),
        );

        let gate_pass_rejected_total = Counter::default();
        registry.register(
            "sitegate_gate_pass_rejected",
            "Gate pass requests refused for a wrong access code",
            gate_pass_rejected_total.clone(),
        );

        Self {
            decisions_total,
            decision_duration_seconds,
            settings_refresh_total,
            settings_cache_hits,
            backend_failures_total,
            upstream_requests_total,
            gate_pass_issued_total,
            gate_pass_rejected_total,
        }
    }

    pub fn backend_failure(&self, call: BackendCall) {
        self.backend_failures_total
            .get_or_create(&BackendCallLabels { call })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gate metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Prometheus metrics for the environment controller

use crds::{EnvironmentState, ErrorClass};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Reconcile outcome label values
pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";

/// Controller metrics, registered on a private registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    transitions: IntCounterVec,
    by_state: IntGaugeVec,
    reconcile_errors: IntCounterVec,
    reconciles: IntCounterVec,
    age: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let transitions = IntCounterVec::new(
            Opts::new(
                "dev_environment_transitions_total",
                "Lifecycle transitions (created, deleted, errored, degraded)",
            ),
            &["transition"],
        )?;
        let by_state = IntGaugeVec::new(
            Opts::new("dev_environments_by_state", "Environments per lifecycle state"),
            &["state"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("dev_environment_reconcile_errors_total", "Failed reconcile attempts by error class"),
            &["class"],
        )?;
        let reconciles = IntCounterVec::new(
            Opts::new("dev_environment_reconciles_total", "Reconcile attempts by result"),
            &["result"],
        )?;
        // 1h .. 2w, the TTL range plus idle environments
        let age = HistogramVec::new(
            HistogramOpts::new(
                "dev_environment_age_seconds",
                "Environment age at teardown",
            )
            .buckets(vec![3_600.0, 4.0 * 3_600.0, 12.0 * 3_600.0, 86_400.0, 3.0 * 86_400.0, 7.0 * 86_400.0, 14.0 * 86_400.0]),
            &["team"],
        )?;

        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(by_state.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(age.clone()))?;

        for state in EnvironmentState::ALL {
            by_state.with_label_values(&[state.as_str()]).set(0);
        }

        Ok(Self {
            registry,
            transitions,
            by_state,
            reconcile_errors,
            reconciles,
            age,
        })
    }

    pub fn record_transition(&self, transition: &str) {
        self.transitions.with_label_values(&[transition]).inc();
    }

    pub fn record_error(&self, class: ErrorClass) {
        self.reconcile_errors.with_label_values(&[class.as_str()]).inc();
    }

    pub fn record_reconcile(&self, result: &str) {
        self.reconciles.with_label_values(&[result]).inc();
    }

    pub fn observe_age(&self, team: &str, seconds: f64) {
        self.age.with_label_values(&[team]).observe(seconds.max(0.0));
    }

    /// Move one environment from `from` to `to` in the per-state gauge
    pub fn move_state(&self, from: Option<EnvironmentState>, to: EnvironmentState) {
        if let Some(from) = from {
            let gauge = self.by_state.with_label_values(&[from.as_str()]);
            if gauge.get() > 0 {
                gauge.dec();
            }
        }
        self.by_state.with_label_values(&[to.as_str()]).inc();
    }

    /// Overwrite the per-state gauge from a full listing
    pub fn set_state_counts(&self, counts: &[(EnvironmentState, i64)]) {
        for state in EnvironmentState::ALL {
            let count = counts
                .iter()
                .find(|(s, _)| *s == state)
                .map_or(0, |(_, c)| *c);
            self.by_state.with_label_values(&[state.as_str()]).set(count);
        }
    }

    pub fn transitions_total(&self, transition: &str) -> u64 {
        self.transitions.with_label_values(&[transition]).get()
    }

    pub fn state_count(&self, state: EnvironmentState) -> i64 {
        self.by_state.with_label_values(&[state.as_str()]).get()
    }

    pub fn errors_total(&self, class: ErrorClass) -> u64 {
        self.reconcile_errors.with_label_values(&[class.as_str()]).get()
    }

    /// Text exposition format for `/metrics`
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

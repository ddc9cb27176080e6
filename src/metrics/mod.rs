// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Covers:
// - Lifecycle commands (outcome, latency)
// - Fan-out publishing per sink
// - Retry attempts and exhaustion
// - Dues reconciliation drift
// - Assignment lock contention
// - Viewer resyncs and sink circuit state
//
// All metrics are registered with one Registry and scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Command Metrics
    pub commands_total: IntCounterVec,
    pub command_duration: HistogramVec,

    // Fan-out Metrics
    pub events_published_total: IntCounterVec,
    pub publish_failures_total: IntCounterVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_exhausted_total: IntCounterVec,

    // Ledger Metrics
    pub dues_mismatches_total: IntCounter,
    pub dues_repairs_total: IntCounter,
    pub assignment_lock_timeouts_total: IntCounter,

    // Viewer / Sink Metrics
    pub view_resyncs_total: IntCounterVec,
    pub circuit_breaker_state: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let commands_total = IntCounterVec::new(
            Opts::new("ledger_commands_total", "Lifecycle commands by operation and outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let command_duration = HistogramVec::new(
            HistogramOpts::new("ledger_command_duration_seconds", "Lifecycle command latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let events_published_total = IntCounterVec::new(
            Opts::new("fanout_events_published_total", "Lifecycle events delivered to a sink"),
            &["sink", "event_type"],
        )?;
        registry.register(Box::new(events_published_total.clone()))?;

        let publish_failures_total = IntCounterVec::new(
            Opts::new("fanout_publish_failures_total", "Lifecycle events a sink failed to take"),
            &["sink"],
        )?;
        registry.register(Box::new(publish_failures_total.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total attempts made under a retry policy"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_exhausted_total = IntCounterVec::new(
            Opts::new("retry_exhausted_total", "Operations that failed after all attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_exhausted_total.clone()))?;

        let dues_mismatches_total = IntCounter::new(
            "dues_mismatches_total",
            "Customers whose cached dues differed from the recomputed balance",
        )?;
        registry.register(Box::new(dues_mismatches_total.clone()))?;

        let dues_repairs_total = IntCounter::new(
            "dues_repairs_total",
            "Cached dues balances overwritten by a repair",
        )?;
        registry.register(Box::new(dues_repairs_total.clone()))?;

        let assignment_lock_timeouts_total = IntCounter::new(
            "assignment_lock_timeouts_total",
            "Assign commands rejected because the order lock was held too long",
        )?;
        registry.register(Box::new(assignment_lock_timeouts_total.clone()))?;

        let view_resyncs_total = IntCounterVec::new(
            Opts::new("view_resyncs_total", "Viewer snapshot reloads by trigger"),
            &["trigger"],
        )?;
        registry.register(Box::new(view_resyncs_total.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Sink circuit state (0=Closed, 1=Open, 2=HalfOpen)",
            ),
            &["circuit"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            commands_total,
            command_duration,
            events_published_total,
            publish_failures_total,
            retry_attempts_total,
            retry_exhausted_total,
            dues_mismatches_total,
            dues_repairs_total,
            assignment_lock_timeouts_total,
            view_resyncs_total,
            circuit_breaker_state,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_command(&self, operation: &str, outcome: &str, duration_secs: f64) {
        self.commands_total.with_label_values(&[operation, outcome]).inc();
        self.command_duration
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn record_publish(&self, sink: &str, event_type: &str, success: bool) {
        if success {
            self.events_published_total
                .with_label_values(&[sink, event_type])
                .inc();
        } else {
            self.publish_failures_total.with_label_values(&[sink]).inc();
        }
    }

    pub fn set_circuit_state(&self, circuit: &str, gauge: i64) {
        self.circuit_breaker_state.with_label_values(&[circuit]).set(gauge);
    }
}

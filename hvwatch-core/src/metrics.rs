//! Prometheus metrics for HVWatch

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

use crate::migration::TrackerState;

/// Number of nodes classified down in the last cycle
static NODES_DOWN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("hvwatch_nodes_down", "Compute nodes reported down"))
        .expect("Failed to create nodes_down metric")
});

/// Nodes skipped before evacuation, by reason
static NODES_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hvwatch_nodes_skipped_total", "Down nodes skipped before evacuation"),
        &["reason"]
    )
    .expect("Failed to create nodes_skipped metric")
});

/// Evacuate calls, by result
static EVACUATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hvwatch_evacuations_total", "Evacuate requests issued"),
        &["result"]
    )
    .expect("Failed to create evacuations metric")
});

/// Restart calls, by result
static RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hvwatch_restarts_total", "Server restarts after migration"),
        &["result"]
    )
    .expect("Failed to create restarts metric")
});

/// Tracking runs, by terminal state
static TRACKING_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("hvwatch_tracking_outcomes_total", "Migration tracking runs by outcome"),
        &["outcome"]
    )
    .expect("Failed to create tracking_outcomes metric")
});

/// Servers left pending after tracking
static STUCK_SERVERS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hvwatch_stuck_servers_total",
        "Servers whose migration was never confirmed"
    ))
    .expect("Failed to create stuck_servers metric")
});

/// Cycles skipped because no session could be established
static SESSION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "hvwatch_session_failures_total",
        "Reconciliation cycles skipped for lack of a session"
    ))
    .expect("Failed to create session_failures metric")
});

/// Reconciliation cycle duration
static CYCLE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "hvwatch_cycle_duration_seconds",
        "Duration of reconciliation cycles",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .expect("Failed to create cycle_duration metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*NODES_DOWN;
        let _ = &*NODES_SKIPPED;
        let _ = &*EVACUATIONS;
        let _ = &*RESTARTS;
        let _ = &*TRACKING_OUTCOMES;
        let _ = &*STUCK_SERVERS;
        let _ = &*SESSION_FAILURES;
        let _ = &*CYCLE_DURATION;
        Self
    }

    pub fn set_nodes_down(&self, count: i64) {
        NODES_DOWN.set(count);
    }

    pub fn inc_node_skipped(&self, reason: &str) {
        NODES_SKIPPED.with_label_values(&[reason]).inc();
    }

    /// Count one evacuate call
    pub fn inc_evacuation(&self, success: bool) {
        EVACUATIONS.with_label_values(&[result_label(success)]).inc();
    }

    /// Count one restart call
    pub fn inc_restart(&self, success: bool) {
        RESTARTS.with_label_values(&[result_label(success)]).inc();
    }

    pub fn inc_tracking_outcome(&self, outcome: TrackerState) {
        let label = outcome.to_string().to_lowercase();
        TRACKING_OUTCOMES.with_label_values(&[label.as_str()]).inc();
    }

    pub fn inc_stuck_servers(&self, count: u64) {
        STUCK_SERVERS.inc_by(count);
    }

    pub fn inc_session_failure(&self) {
        SESSION_FAILURES.inc();
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        CYCLE_DURATION.observe(duration_secs);
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn result_label(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

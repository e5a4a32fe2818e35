//! Metrics registry for Machina observability
//!
//! OpenTelemetry instruments for:
//! - Managed node count (gauge, refreshed from the cache)
//! - Sync errors (counter)
//! - Cumulative sync time by phase (counter)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

use crate::NodePhase;

/// Global meter for Machina metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("machina"));

/// Gauge tracking the number of nodes owned by this controller
pub static NODES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("machina_nodes")
        .with_description("Number of nodes managed by the controller")
        .with_unit("{nodes}")
        .build()
});

/// Counter of node sync errors
pub static SYNC_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("machina_controller_sync_errors_total")
        .with_description("Total number of node sync errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of cumulative sync time, labeled by phase
///
/// Labels:
/// - `phase`: pending, provisioning, launching, deleting
pub static SYNC_SECONDS: Lazy<Counter<f64>> = Lazy::new(|| {
    METER
        .f64_counter("machina_controller_sync_seconds_total")
        .with_description("Cumulative time spent syncing nodes, by phase")
        .with_unit("s")
        .build()
});

/// Update the managed node count gauge
pub fn set_node_count(count: i64) {
    NODES.record(count, &[]);
}

/// Record a sync error
pub fn record_sync_error() {
    SYNC_ERRORS.add(1, &[]);
}

/// Times a single phase-handler dispatch
///
/// Steady-state passes over running nodes are cheap and frequent; recording
/// them would drown the provisioning signal, so they are skipped.
pub struct SyncTimer {
    phase: NodePhase,
    start: std::time::Instant,
}

impl SyncTimer {
    /// Start timing a sync in the given phase
    pub fn start(phase: NodePhase) -> Self {
        Self {
            phase,
            start: std::time::Instant::now(),
        }
    }

    /// Record the elapsed time against the phase label
    pub fn observe(self) {
        if self.phase == NodePhase::Running {
            return;
        }
        SYNC_SECONDS.add(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("phase", self.phase.as_str())],
        );
    }
}

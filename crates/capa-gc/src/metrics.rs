//! Metrics for external-resource garbage collection
//!
//! Provides OpenTelemetry metrics for:
//! - GC runs (duration, terminal state)
//! - Deletions (resources removed, failed steps)
//! - Discovery (duration per kind and strategy, polling fallbacks)
//! - Event inventory (size, applied and rejected events)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::tasks::GcTaskKind;

/// Global meter for GC metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("capa-gc"));

// ============================================================================
// Run Metrics
// ============================================================================

/// Counter of finished GC runs
///
/// Labels:
/// - `state`: completed, requeue, blocked
pub static GC_RUNS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capa_gc_runs_total")
        .with_description("Total number of garbage collection runs by terminal state")
        .with_unit("{runs}")
        .build()
});

/// Histogram of GC run duration
///
/// Labels:
/// - `state`: completed, requeue, blocked
pub static GC_RUN_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("capa_gc_run_duration_seconds")
        .with_description("Duration of garbage collection runs in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Deletion Metrics
// ============================================================================

/// Counter of resources deleted
///
/// Labels:
/// - `kind`: load-balancer, target-group, security-group
pub static RESOURCES_DELETED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capa_gc_resources_deleted_total")
        .with_description("Total number of external resources deleted")
        .with_unit("{resources}")
        .build()
});

/// Counter of steps that ended in failure
///
/// Labels:
/// - `kind`: load-balancer, target-group, security-group
/// - `error`: throttling, transient-consistency, permission-denied, ...
pub static DELETE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capa_gc_delete_errors_total")
        .with_description("Total number of failed detach or delete steps")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Discovery Metrics
// ============================================================================

/// Histogram of discovery duration
///
/// Labels:
/// - `kind`: load-balancer, target-group, security-group
/// - `strategy`: polling, event-driven
pub static DISCOVERY_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("capa_gc_discovery_duration_seconds")
        .with_description("Duration of resource discovery in seconds")
        .with_unit("s")
        .build()
});

/// Counter of event-driven discoveries answered by a polling fallback
pub static DISCOVERY_FALLBACKS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capa_gc_discovery_fallbacks_total")
        .with_description("Total number of stale-inventory fallbacks to polling")
        .with_unit("{fallbacks}")
        .build()
});

// ============================================================================
// Event Inventory Metrics
// ============================================================================

/// Gauge of resources held in the event inventory
pub static INVENTORY_SIZE: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("capa_gc_inventory_resources")
        .with_description("Number of live resources in the event inventory")
        .with_unit("{resources}")
        .build()
});

/// Counter of lifecycle events processed
///
/// Labels:
/// - `result`: applied, superseded, invalid
pub static INVENTORY_EVENTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capa_gc_inventory_events_total")
        .with_description("Total number of lifecycle events processed by the inventory")
        .with_unit("{events}")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

/// Record a successful deletion
pub fn record_deleted(kind: GcTaskKind) {
    RESOURCES_DELETED.add(1, &[KeyValue::new("kind", kind.as_str())]);
}

/// Record a failed step
pub fn record_delete_error(kind: GcTaskKind, error: &str) {
    DELETE_ERRORS.add(
        1,
        &[
            KeyValue::new("kind", kind.as_str()),
            KeyValue::new("error", error.to_string()),
        ],
    );
}

/// Record a processed lifecycle event
pub fn record_event(result: &'static str) {
    INVENTORY_EVENTS.add(1, &[KeyValue::new("result", result)]);
}

/// Times one GC run
pub struct RunTimer {
    start: std::time::Instant,
}

impl RunTimer {
    /// Start timing a run
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Complete the timer with the run's terminal state
    pub fn complete(self, state: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = [KeyValue::new("state", state)];
        GC_RUN_DURATION.record(duration, &labels);
        GC_RUNS.add(1, &labels);
    }
}

/// Times discovery of one kind
pub struct DiscoveryTimer {
    kind: GcTaskKind,
    strategy: &'static str,
    start: std::time::Instant,
}

impl DiscoveryTimer {
    /// Start timing discovery of a kind
    pub fn start(kind: GcTaskKind, strategy: &'static str) -> Self {
        Self {
            kind,
            strategy,
            start: std::time::Instant::now(),
        }
    }

    /// Complete the timer and record duration
    pub fn complete(self) {
        DISCOVERY_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("kind", self.kind.as_str()),
                KeyValue::new("strategy", self.strategy),
            ],
        );
    }
}

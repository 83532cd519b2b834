//! Metrics for operator observability.
//!
//! Recording only; exposition is left to the embedding process. Instruments
//! cover reconciliation outcomes and the placement mutations the operator
//! issues.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("m3db-operator"));

/// Histogram of reconciliation pass duration
///
/// Labels:
/// - `cluster`: cluster name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("m3db_operator_reconcile_duration_seconds")
        .with_description("Duration of cluster reconciliation passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `cluster`: cluster name
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("m3db_operator_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of placement mutations issued against the admin API
///
/// Labels:
/// - `cluster`: cluster name
/// - `op`: init, add, remove, weight, delete
pub static PLACEMENT_MUTATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("m3db_operator_placement_mutations_total")
        .with_description("Total number of placement mutations issued")
        .with_unit("{mutations}")
        .build()
});

/// Record one placement mutation
pub fn record_placement_mutation(cluster: &str, op: &'static str) {
    PLACEMENT_MUTATIONS.add(
        1,
        &[
            opentelemetry::KeyValue::new("cluster", cluster.to_string()),
            opentelemetry::KeyValue::new("op", op),
        ],
    );
}

/// Times one reconciliation pass and records its outcome
pub struct ReconcileTimer {
    cluster: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                opentelemetry::KeyValue::new("cluster", self.cluster),
                opentelemetry::KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                opentelemetry::KeyValue::new("cluster", self.cluster.clone()),
                opentelemetry::KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                opentelemetry::KeyValue::new("cluster", self.cluster),
                opentelemetry::KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_without_panicking() {
        // No exporter is installed; recording must still be safe.
        ReconcileTimer::start("test-cluster").success();
        ReconcileTimer::start("test-cluster").error("transient");
        record_placement_mutation("test-cluster", "init");
    }
}

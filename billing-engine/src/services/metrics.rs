//! Prometheus metrics for the billing engine.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "billing_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Payment counter by payment method.
pub static PAYMENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_payments_total",
        "Total number of recorded payments by payment method",
        &["payment_method"]
    )
    .expect("Failed to register payments_total")
});

/// Invoice counter by status reached.
pub static INVOICES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_invoices_total",
        "Total number of invoice transitions by resulting status",
        &["status"] // draft, pending, partial_paid, paid, cancelled, on_hold
    )
    .expect("Failed to register invoices_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_errors_total",
        "Total number of errors by stable error code",
        &["code"]
    )
    .expect("Failed to register errors_total")
});

/// Saga rollback counter. `outcome` is "clean" or "incomplete"; incomplete
/// rollbacks page an operator.
pub static SAGA_ROLLBACKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_saga_rollbacks_total",
        "Total number of saga rollbacks by workflow and outcome",
        &["workflow", "outcome"]
    )
    .expect("Failed to register saga_rollbacks_total")
});

/// Visit repairs performed by the self-healing read path.
pub static VISIT_REPAIRS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "billing_visit_repairs_total",
        "Visits driven to completed outside the normal completion path",
        &["trigger"] // read, idempotent_reentry, payment
    )
    .expect("Failed to register visit_repairs_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&INVOICES_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&SAGA_ROLLBACKS_TOTAL);
    Lazy::force(&VISIT_REPAIRS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

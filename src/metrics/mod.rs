//! Prometheus counters for the settlement pipeline, served at `/metrics`.

use axum::{http::header, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SETTLEMENTS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "settlements_created_total",
            "Pending orders and enrollments created, by kind",
        ),
        &["kind"],
    ))
});

pub static RECONCILIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "settlement_reconciliations_total",
            "Payment reconciliation attempts, by outcome",
        ),
        &["outcome"],
    ))
});

pub static COUPON_EVALUATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new(
            "coupon_evaluations_total",
            "Coupon eligibility checks, by result",
        ),
        &["result"],
    ))
});

pub static SIGNATURE_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register(IntCounter::new(
        "payment_signature_rejections_total",
        "Callbacks and webhooks rejected for a bad signature",
    ))
});

fn register<C>(metric: prometheus::Result<C>) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    let metric = metric.expect("metric can be created");
    REGISTRY
        .register(Box::new(metric.clone()))
        .expect("metric can be registered");
    metric
}

pub fn record_settlement(kind: &str) {
    SETTLEMENTS_CREATED.with_label_values(&[kind]).inc();
}

pub fn record_reconciliation(outcome: &str) {
    RECONCILIATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_coupon_evaluation(result: &str) {
    COUPON_EVALUATIONS.with_label_values(&[result]).inc();
}

pub fn record_signature_rejection() {
    SIGNATURE_REJECTIONS.inc();
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather() -> String {
    // Touch the lazies so the families appear even before first use.
    Lazy::force(&SETTLEMENTS_CREATED);
    Lazy::force(&RECONCILIATIONS);
    Lazy::force(&COUPON_EVALUATIONS);
    Lazy::force(&SIGNATURE_REJECTIONS);

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather(),
    )
}

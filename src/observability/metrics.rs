//! # Metrics
//!
//! Prometheus metrics for monitoring controllers.
//!
//! ## Metrics Exposed
//!
//! - `controller_runtime_reconciles_total` - Reconcile calls by controller and outcome
//! - `controller_runtime_reconcile_duration_seconds` - Duration of reconcile calls
//! - `controller_runtime_requeues_total` - Requeues by controller and reason
//! - `controller_runtime_reconcile_panics_total` - Panics recovered from reconcilers and mappers
//! - `controller_runtime_pipeline_starts_total` - Pipeline (re)starts
//! - `controller_runtime_pipeline_failures_total` - Pipeline runs ending in error
//! - `controller_runtime_controllers_running` - 1 while a controller's pipeline runs
//! - `controller_runtime_mapped_requests_dropped_total` - Mapped requests dropped for the wrong type

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "controller_runtime_reconciles_total",
            "Total number of reconcile calls",
        ),
        &["controller", "outcome"],
    )
    .expect("Failed to create RECONCILES_TOTAL metric - this should never happen")
});

static RECONCILE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "controller_runtime_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILE_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "controller_runtime_requeues_total",
            "Total number of requeues",
        ),
        &["controller", "reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static RECONCILE_PANICS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "controller_runtime_reconcile_panics_total",
            "Total number of panics recovered from reconcilers and dependency mappers",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILE_PANICS_TOTAL metric - this should never happen")
});

static PIPELINE_STARTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "controller_runtime_pipeline_starts_total",
            "Total number of controller pipeline starts",
        ),
        &["controller"],
    )
    .expect("Failed to create PIPELINE_STARTS_TOTAL metric - this should never happen")
});

static PIPELINE_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "controller_runtime_pipeline_failures_total",
            "Total number of controller pipeline runs that ended in error",
        ),
        &["controller"],
    )
    .expect("Failed to create PIPELINE_FAILURES_TOTAL metric - this should never happen")
});

static CONTROLLERS_RUNNING: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "controller_runtime_controllers_running",
            "Whether a controller pipeline is currently running",
        ),
        &["controller"],
    )
    .expect("Failed to create CONTROLLERS_RUNNING metric - this should never happen")
});

static MAPPED_REQUESTS_DROPPED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "controller_runtime_mapped_requests_dropped_total",
            "Total number of mapped requests dropped because they target the wrong type",
        ),
        &["controller"],
    )
    .expect("Failed to create MAPPED_REQUESTS_DROPPED_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILE_PANICS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PIPELINE_STARTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PIPELINE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONTROLLERS_RUNNING.clone()))?;
    REGISTRY.register(Box::new(MAPPED_REQUESTS_DROPPED_TOTAL.clone()))?;

    Ok(())
}

pub fn record_reconcile(controller: &str, outcome: &str, duration: f64) {
    RECONCILES_TOTAL
        .with_label_values(&[controller, outcome])
        .inc();
    RECONCILE_DURATION
        .with_label_values(&[controller])
        .observe(duration);
}

pub fn increment_requeues(controller: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[controller, reason]).inc();
}

pub fn increment_reconcile_panics(controller: &str) {
    RECONCILE_PANICS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_pipeline_starts(controller: &str) {
    PIPELINE_STARTS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_pipeline_failures(controller: &str) {
    PIPELINE_FAILURES_TOTAL.with_label_values(&[controller]).inc();
}

pub fn set_controller_running(controller: &str, running: bool) {
    CONTROLLERS_RUNNING
        .with_label_values(&[controller])
        .set(i64::from(running));
}

pub fn increment_mapped_requests_dropped(controller: &str) {
    MAPPED_REQUESTS_DROPPED_TOTAL
        .with_label_values(&[controller])
        .inc();
}

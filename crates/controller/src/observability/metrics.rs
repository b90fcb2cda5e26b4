//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `pki_reconciliations_total` - Reconciles run, labelled by trigger source
//! - `pki_reconciliation_errors_total` - Failed reconciles, labelled by error kind
//! - `pki_reconciliation_duration_seconds` - Duration of reconcile and cleanup runs
//! - `pki_certificates_issued_total` - First certificates issued for an identity
//! - `pki_certificates_renewed_total` - Renewals, labelled by reason
//! - `pki_certificates_managed` - Certificates currently tracked
//! - `pki_revocations_total` - Successful revocations
//! - `pki_revocation_errors_total` - Failed best-effort revocations
//! - `pki_authority_operation_duration_seconds` - Authority calls, labelled by operation
//! - `pki_authority_operation_errors_total` - Failed authority calls, labelled by operation
//! - `pki_destination_writes_total` - Successful destination writes
//! - `pki_requeues_total` - Scheduled follow-up reconciles, labelled by trigger source

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pki_reconciliations_total",
            "Total number of reconciliations by trigger source",
        ),
        &["trigger"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pki_reconciliation_errors_total",
            "Total number of reconciliation errors by error kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "pki_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static CERTIFICATES_ISSUED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pki_certificates_issued_total",
        "Total number of first certificates issued for a resource",
    )
    .expect("Failed to create CERTIFICATES_ISSUED_TOTAL metric - this should never happen")
});

static CERTIFICATES_RENEWED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pki_certificates_renewed_total",
            "Total number of certificate renewals by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create CERTIFICATES_RENEWED_TOTAL metric - this should never happen")
});

static CERTIFICATES_MANAGED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pki_certificates_managed",
        "Current number of certificates being managed",
    )
    .expect("Failed to create CERTIFICATES_MANAGED metric - this should never happen")
});

static REVOCATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pki_revocations_total",
        "Total number of certificates revoked",
    )
    .expect("Failed to create REVOCATIONS_TOTAL metric - this should never happen")
});

static REVOCATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pki_revocation_errors_total",
        "Total number of failed best-effort revocations",
    )
    .expect("Failed to create REVOCATION_ERRORS_TOTAL metric - this should never happen")
});

static AUTHORITY_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "pki_authority_operation_duration_seconds",
            "Duration of credential authority operations in seconds by operation",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["operation"],
    )
    .expect("Failed to create AUTHORITY_OPERATION_DURATION metric - this should never happen")
});

static AUTHORITY_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pki_authority_operation_errors_total",
            "Total number of credential authority operation errors by operation",
        ),
        &["operation"],
    )
    .expect("Failed to create AUTHORITY_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

static DESTINATION_WRITES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pki_destination_writes_total",
        "Total number of certificate writes into destinations",
    )
    .expect("Failed to create DESTINATION_WRITES_TOTAL metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "pki_requeues_total",
            "Total number of scheduled follow-up reconciliations by trigger source",
        ),
        &["trigger"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

/// Register every metric with [`REGISTRY`].
///
/// Fails when called twice, since prometheus rejects duplicate collectors.
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(CERTIFICATES_ISSUED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CERTIFICATES_RENEWED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CERTIFICATES_MANAGED.clone()))?;
    REGISTRY.register(Box::new(REVOCATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REVOCATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUTHORITY_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(AUTHORITY_OPERATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DESTINATION_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(trigger: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[trigger]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_certificates_issued() {
    CERTIFICATES_ISSUED_TOTAL.inc();
}

pub fn increment_certificates_renewed(reason: &str) {
    CERTIFICATES_RENEWED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_certificates_managed(count: usize) {
    CERTIFICATES_MANAGED.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn increment_revocations() {
    REVOCATIONS_TOTAL.inc();
}

pub fn increment_revocation_errors() {
    REVOCATION_ERRORS_TOTAL.inc();
}

/// Record the duration of one authority call
pub fn observe_authority_operation(operation: &str, duration: f64) {
    AUTHORITY_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_authority_operation_errors(operation: &str) {
    AUTHORITY_OPERATION_ERRORS_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn increment_destination_writes() {
    DESTINATION_WRITES_TOTAL.inc();
}

pub fn increment_requeues_total(trigger: &str) {
    REQUEUES_TOTAL.with_label_values(&[trigger]).inc();
}

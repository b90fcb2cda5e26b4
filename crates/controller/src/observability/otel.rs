//! # OpenTelemetry Support
//!
//! Datadog trace export via `datadog-opentelemetry`, enabled when `DD_API_KEY`
//! is present in the environment. Without it the controller only logs.
//!
//! Recognised variables: `DD_API_KEY`, `DD_SERVICE`, `DD_VERSION`, `DD_ENV`,
//! `DD_SITE`, `DD_TRACE_AGENT_URL`.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_SERVICE_NAME: &str = "pki-secret-controller";
const DEFAULT_SITE: &str = "datadoghq.com";
const DEFAULT_AGENT_URL: &str = "http://localhost:8126";

/// Tracer provider handle for graceful shutdown
#[derive(Debug)]
pub enum TracerProviderHandle {
    Datadog(opentelemetry_sdk::trace::SdkTracerProvider),
}

/// Initialize OpenTelemetry tracing from the environment.
///
/// Returns `Ok(None)` when `DD_API_KEY` is not set.
///
/// # Errors
///
/// Reserved for exporter setup failures; the Datadog exporter itself does not fail at init.
pub fn init_otel() -> Result<Option<TracerProviderHandle>> {
    if std::env::var("DD_API_KEY").is_err() {
        if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
            warn!("OTEL_EXPORTER_OTLP_ENDPOINT is set but only Datadog export is supported");
        }
        return Ok(None);
    }

    if std::env::var("DD_SERVICE").is_err() {
        std::env::set_var("DD_SERVICE", DEFAULT_SERVICE_NAME);
    }
    if std::env::var("DD_VERSION").is_err() {
        let build_version = format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("BUILD_GIT_HASH"));
        std::env::set_var("DD_VERSION", build_version);
    }
    if std::env::var("DD_SITE").is_err() {
        std::env::set_var("DD_SITE", DEFAULT_SITE);
    }
    if std::env::var("DD_TRACE_AGENT_URL").is_err() {
        std::env::set_var("DD_TRACE_AGENT_URL", DEFAULT_AGENT_URL);
    }

    info!(
        service = %std::env::var("DD_SERVICE").unwrap_or_default(),
        version = %std::env::var("DD_VERSION").unwrap_or_default(),
        env = ?std::env::var("DD_ENV").ok(),
        "Initializing Datadog OpenTelemetry tracing"
    );

    let tracer_provider = datadog_opentelemetry::tracing().init();

    info!(
        agent_url = %std::env::var("DD_TRACE_AGENT_URL").unwrap_or_default(),
        "Datadog OpenTelemetry tracing initialized"
    );

    Ok(Some(TracerProviderHandle::Datadog(tracer_provider)))
}

/// Flush pending spans and shut the tracer provider down
pub fn shutdown_otel(tracer_provider: Option<TracerProviderHandle>) {
    match tracer_provider {
        Some(TracerProviderHandle::Datadog(provider)) => {
            info!("Shutting down Datadog tracer provider...");
            if let Err(e) = provider.shutdown_with_timeout(Duration::from_secs(5)) {
                warn!("Error shutting down Datadog tracer provider: {}", e);
            } else {
                info!("Datadog tracer provider shut down");
            }
        }
        None => {}
    }
}

//! # Observability
//!
//! - `metrics`: Prometheus metrics collection
//! - `otel`: OpenTelemetry tracing integration

pub mod metrics;
pub mod otel;

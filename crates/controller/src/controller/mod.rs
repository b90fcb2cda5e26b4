//! # Controller
//!
//! Core controller modules for the PKI Secret Controller.
//!
//! - `backoff`: Fibonacci backoff mechanism for retries
//! - `dispatcher`: Per-identity scheduling, coalescing and the worker pool
//! - `reconciler`: Core reconciliation logic
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod dispatcher;
pub mod reconciler;
pub mod server;

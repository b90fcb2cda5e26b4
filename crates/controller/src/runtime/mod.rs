//! # Runtime
//!
//! Process wiring around the dispatcher.
//!
//! - `initialization`: logging, metrics, HTTP server and component setup
//! - `watch_loop`: `PkiSecret` watch feeding the dispatcher
//! - `error_policy`: watch stream error classification
//! - `finalizer`: finalizer add/remove patches
//! - `status`: writes dispatcher completions into resource status

pub mod error_policy;
pub mod finalizer;
pub mod initialization;
pub mod status;
pub mod watch_loop;

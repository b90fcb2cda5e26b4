//! # Validation
//!
//! Validates `PkiSecret` specs and duration strings.

mod duration;
mod spec;

pub use duration::parse_duration;
pub use spec::{validate_kubernetes_name, validate_spec};

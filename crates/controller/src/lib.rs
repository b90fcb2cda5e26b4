//! PKI Secret Controller Library
//!
//! Issues, rotates and revokes certificates from a Vault PKI mount and mirrors
//! them into Kubernetes Secrets. Tests are included in the module files and in
//! the crate's `tests/` directory.
//!
//! ## Quick Start
//!
//! ```rust
//! use controller::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod auth;
pub mod authority;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod destination;
pub mod lifecycle;
pub mod observability;
pub mod prelude;
pub mod runtime;

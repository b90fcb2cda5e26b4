//! # Configuration
//!
//! Controller and HTTP server settings loaded from environment variables.
//!
//! Configuration is read once at startup and passed explicitly into the
//! components that need it. Nothing reads the environment after initialization.

mod controller;
mod server;

pub use controller::ControllerConfig;
pub use server::ServerConfig;

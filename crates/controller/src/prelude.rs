//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use controller::prelude::*;
//! ```
//!
//! This brings into scope:
//! - All CRD types (`PkiSecret`, `DesiredCertificate`, etc.)
//! - The collaborator traits (`CertificateAuthority`, `DestinationStore`, `AuthResolver`, `Clock`)
//! - Reconciler and dispatcher types
//! - Config types (`ControllerConfig`, `ServerConfig`)

// CRD types - most commonly used
pub use crate::crd::*;

// Collaborator traits - needed for alternative backends and fakes
pub use crate::auth::{AccessToken, AuthError, AuthResolver};
pub use crate::authority::{AuthorityError, CertificateAuthority, IssuedCertificate};
pub use crate::destination::{DestinationError, DestinationRecord, DestinationStore};
pub use crate::lifecycle::{Clock, LifecycleTracker, SystemClock};

// Reconciler and dispatcher - core controller functionality
pub use crate::controller::dispatcher::{
    DesiredEvent, Dispatcher, DispatcherOptions, ReconcileCompleted, ReconcileResult,
};
pub use crate::controller::reconciler::{
    ErrorKind, ReconcileOutcome, Reconciler, ReconcilerError, ReconcilerSettings, TriggerSource,
};

// Config types - for configuration management
pub use crate::config::{ControllerConfig, ServerConfig};

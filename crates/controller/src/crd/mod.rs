//! # Custom Resource Definitions
//!
//! CRD types for the PKI Secret Controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - `PkiSecret` specification and destination settings
//! - `status.rs` - Status types for tracking issuance and reconciliation state
//! - `key.rs` - `namespace/name` identity used to partition work
//! - `desired.rs` - Engine-facing snapshot of a resource's desired state

mod desired;
mod key;
mod spec;
mod status;

pub use desired::{DesiredCertificate, ObservedCertificate};
pub use key::ResourceKey;
pub use spec::{CertificateFormat, DestinationRef, PkiSecret, PkiSecretSpec};
pub use status::{Condition, ErrorKindStatus, PkiSecretStatus, PHASE_ACTIVE, PHASE_FAILED};

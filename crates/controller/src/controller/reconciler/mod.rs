//! # Reconciler
//!
//! Per-identity reconcile logic: issue, renew, write, revoke, clean up.
//!
//! - `types`: errors, outcomes, trigger sources and the [`Reconciler`] context
//! - `validation`: spec and duration validation
//! - `reconcile`: the issue/renew path
//! - `cleanup`: the deletion path
//! - `revocation`: background revocation of superseded serials

mod cleanup;
mod reconcile;
mod revocation;
mod types;
pub mod validation;

pub use reconcile::renewal_reason;
pub use types::{
    CleanupOutcome, ErrorKind, ReconcileAction, ReconcileOutcome, Reconciler, ReconcilerError,
    ReconcilerSettings, RenewalReason, TriggerSource,
};

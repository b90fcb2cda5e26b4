//! # Types
//!
//! Core types for the reconciler.

use super::revocation::RevocationTasks;
use crate::auth::{AuthError, AuthResolver};
use crate::authority::{AuthorityError, CertificateAuthority};
use crate::config::ControllerConfig;
use crate::constants::{DEFAULT_AUTHORITY_TIMEOUT_SECS, DEFAULT_DESTINATION_TIMEOUT_SECS};
use crate::crd::{ErrorKindStatus, ResourceKey};
use crate::destination::{ClearOutcome, DestinationError, DestinationStore};
use crate::lifecycle::{Clock, LifecycleTracker};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How a failed reconcile is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with Fibonacci backoff
    Transient,
    /// Left alone until the desired state changes
    Configuration,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl From<ErrorKind> for ErrorKindStatus {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Transient => ErrorKindStatus::Transient,
            ErrorKind::Configuration => ErrorKindStatus::Configuration,
        }
    }
}

/// A failed reconcile or cleanup, tagged with the resource and the step that failed
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("{operation} failed for {key}: {message}")]
    Configuration {
        key: ResourceKey,
        operation: &'static str,
        message: String,
    },
    #[error("{operation} failed for {key}: {source}")]
    Authority {
        key: ResourceKey,
        operation: &'static str,
        #[source]
        source: AuthorityError,
    },
    #[error("{operation} failed for {key}: {source}")]
    Destination {
        key: ResourceKey,
        operation: &'static str,
        #[source]
        source: DestinationError,
    },
    #[error("{operation} failed for {key}: {source}")]
    Auth {
        key: ResourceKey,
        operation: &'static str,
        #[source]
        source: AuthError,
    },
    #[error("{operation} for {key} timed out after {timeout:?}")]
    Timeout {
        key: ResourceKey,
        operation: &'static str,
        timeout: Duration,
    },
}

impl ReconcilerError {
    pub(crate) fn configuration(
        key: &ResourceKey,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        ReconcilerError::Configuration {
            key: key.clone(),
            operation,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        let transient = match self {
            ReconcilerError::Configuration { .. } => false,
            ReconcilerError::Authority { source, .. } => source.is_transient(),
            ReconcilerError::Destination { source, .. } => source.is_transient(),
            ReconcilerError::Auth { source, .. } => source.is_transient(),
            ReconcilerError::Timeout { .. } => true,
        };
        if transient {
            ErrorKind::Transient
        } else {
            ErrorKind::Configuration
        }
    }

    pub fn key(&self) -> &ResourceKey {
        match self {
            ReconcilerError::Configuration { key, .. }
            | ReconcilerError::Authority { key, .. }
            | ReconcilerError::Destination { key, .. }
            | ReconcilerError::Auth { key, .. }
            | ReconcilerError::Timeout { key, .. } => key,
        }
    }

    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            ReconcilerError::Configuration { operation, .. }
            | ReconcilerError::Authority { operation, .. }
            | ReconcilerError::Destination { operation, .. }
            | ReconcilerError::Auth { operation, .. }
            | ReconcilerError::Timeout { operation, .. } => operation,
        }
    }
}

/// Why a reconcile was started
/// Tracked for logging, metrics and status so every run can be attributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    /// First desired state seen for an identity
    Created,
    /// Desired state changed
    Updated,
    /// The renewal deadline timer fired
    RenewalDeadline,
    /// Retry after a transient failure
    ErrorBackoff,
    /// Desired state removed
    Deleted,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Created => "created",
            TriggerSource::Updated => "updated",
            TriggerSource::RenewalDeadline => "renewal-deadline",
            TriggerSource::ErrorBackoff => "error-backoff",
            TriggerSource::Deleted => "deleted",
        }
    }
}

/// Why a new certificate had to be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    /// Nothing tracked yet for this identity
    Absent,
    /// Issuance parameters differ from the tracked certificate
    SpecChanged,
    /// The renewal deadline has passed
    DeadlineReached,
    /// The destination no longer holds the tracked certificate
    DestinationDrift,
}

impl RenewalReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalReason::Absent => "absent",
            RenewalReason::SpecChanged => "spec-changed",
            RenewalReason::DeadlineReached => "deadline-reached",
            RenewalReason::DestinationDrift => "destination-drift",
        }
    }
}

/// What a successful reconcile did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// First certificate for this identity
    Issued,
    /// A new certificate replaced the tracked one
    Renewed(RenewalReason),
    /// Certificate from the resource status picked up without issuing
    Adopted,
    /// Nothing to do before the renewal deadline
    Unchanged,
}

impl ReconcileAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Issued => "issued",
            ReconcileAction::Renewed(_) => "renewed",
            ReconcileAction::Adopted => "adopted",
            ReconcileAction::Unchanged => "unchanged",
        }
    }

    pub fn issued_new_certificate(&self) -> bool {
        matches!(self, ReconcileAction::Issued | ReconcileAction::Renewed(_))
    }
}

/// Result of a successful reconcile
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub serial_number: String,
    pub action: ReconcileAction,
    pub issued_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub next_renewal: DateTime<Utc>,
    /// Delay until the renewal deadline, measured when the reconcile finished
    pub requeue_after: Duration,
    /// Superseded serials not yet revoked when the reconcile returned; they
    /// are revoked in the background
    pub revocations_pending: usize,
}

/// Result of a successful cleanup
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    /// Serials revoked during this cleanup
    pub revoked: Vec<String>,
    /// What happened to the destination, `None` when `clear` was off or it was already gone
    pub cleared: Option<ClearOutcome>,
}

/// Per-call timeouts and defaults applied by the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Auth binding used when a resource leaves `authRef` empty
    pub default_auth_ref: Option<String>,
    pub authority_timeout: Duration,
    pub destination_timeout: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            default_auth_ref: None,
            authority_timeout: Duration::from_secs(DEFAULT_AUTHORITY_TIMEOUT_SECS),
            destination_timeout: Duration::from_secs(DEFAULT_DESTINATION_TIMEOUT_SECS),
        }
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            default_auth_ref: config.default_auth_ref.clone(),
            authority_timeout: config.authority_timeout(),
            destination_timeout: config.destination_timeout(),
        }
    }
}

/// Reconciler context shared by every worker.
///
/// Collaborators are trait objects so the dispatcher and tests can run the
/// same reconcile logic against in-process fakes.
#[derive(Clone)]
pub struct Reconciler {
    pub(super) authority: Arc<dyn CertificateAuthority>,
    pub(super) destinations: Arc<dyn DestinationStore>,
    pub(super) auth: Arc<dyn AuthResolver>,
    pub(super) tracker: LifecycleTracker,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: ReconcilerSettings,
    pub(super) revocations: RevocationTasks,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("tracked_certificates", &self.tracker.len())
            .field("clock", &self.clock)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        destinations: Arc<dyn DestinationStore>,
        auth: Arc<dyn AuthResolver>,
        clock: Arc<dyn Clock>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            authority,
            destinations,
            auth,
            tracker: LifecycleTracker::new(),
            clock,
            settings,
            revocations: RevocationTasks::default(),
        }
    }

    /// Lifecycle records of every certificate this reconciler manages
    pub fn tracker(&self) -> &LifecycleTracker {
        &self.tracker
    }
}

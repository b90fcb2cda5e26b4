//! # Reconcile
//!
//! One reconcile brings a single identity to its desired state:
//!
//! 1. Validate the spec into issuance parameters
//! 2. Read the destination; a missing destination without `create` fails before anything is issued
//! 3. Decide whether a certificate must be issued ([`renewal_reason`])
//! 4. Issue, compute the renewal deadline, write the destination
//! 5. Record the new lifecycle and hand superseded serials to a background
//!    revocation task
//!
//! Every outbound call is bounded by a timeout. The dispatcher guarantees that
//! at most one reconcile per identity runs at a time.

use super::types::{
    ReconcileAction, ReconcileOutcome, Reconciler, ReconcilerError, RenewalReason,
};
use super::validation::validate_spec;
use crate::auth::AccessToken;
use crate::authority::{AuthorityError, IssueRequest, RevokeRequest};
use crate::crd::{DesiredCertificate, ResourceKey};
use crate::destination::{DestinationError, DestinationRecord};
use crate::lifecycle::{Issuance, IssuanceParameters, LifecycleRecord, PendingRevocation};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use std::future::Future;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Bring one identity to its desired state.
    ///
    /// # Errors
    ///
    /// Returns a [`ReconcilerError`] naming the failed step; its
    /// [`kind`](ReconcilerError::kind) decides whether the dispatcher retries.
    pub async fn reconcile(
        &self,
        desired: &DesiredCertificate,
    ) -> Result<ReconcileOutcome, ReconcilerError> {
        let key = &desired.key;
        let spec = &desired.spec;
        let destination = &spec.destination;

        let params = validate_spec(spec)
            .map_err(|e| ReconcilerError::configuration(key, "validate", format!("{e:#}")))?;

        let existing = self
            .destination_call(
                key,
                "read_destination",
                self.destinations.read(&destination.name, &key.namespace),
            )
            .await?;
        if existing.is_none() && !destination.create {
            return Err(ReconcilerError::Destination {
                key: key.clone(),
                operation: "read_destination",
                source: DestinationError::not_found(&destination.name, &key.namespace),
            });
        }
        // Create mode never takes over a destination someone else produced
        let foreign = destination.create
            && existing
                .as_ref()
                .is_some_and(|current| !current.produced_by(&desired.provenance()));
        if foreign {
            return Err(ReconcilerError::Destination {
                key: key.clone(),
                operation: "read_destination",
                source: DestinationError::exists(&destination.name, &key.namespace),
            });
        }

        let (record, adopted) = match self.tracker.get(key) {
            Some(record) => (Some(record), false),
            None => {
                let adopted = self.adopt(desired, &params, existing.as_ref());
                let was_adopted = adopted.is_some();
                (adopted, was_adopted)
            }
        };

        let now = self.clock.now();
        let reason = match (
            record.as_ref(),
            renewal_reason(record.as_ref(), &params, existing.as_ref(), now),
        ) {
            (Some(current), None) => {
                let revocations_pending = self.retry_pending_revocations(desired, current).await;
                let action = if adopted {
                    ReconcileAction::Adopted
                } else {
                    ReconcileAction::Unchanged
                };
                debug!(
                    resource = %key,
                    serial_number = %current.serial_number,
                    action = action.as_str(),
                    next_renewal = %current.renewal_deadline,
                    "Certificate is current"
                );
                return Ok(self.outcome(current, action, revocations_pending));
            }
            (_, reason) => reason.unwrap_or(RenewalReason::Absent),
        };

        info!(
            resource = %key,
            reason = reason.as_str(),
            "Issuing certificate"
        );
        let token = self.resolve_token(desired).await?;
        let issued = self
            .authority_call(
                key,
                "issue",
                self.authority.issue(&token, &IssueRequest::from(&params)),
            )
            .await?;
        let issued_at = issued.not_before.unwrap_or_else(|| self.clock.now());

        let new_revocation = PendingRevocation {
            serial_number: issued.serial_number.clone(),
            mount: params.mount.clone(),
            namespace: params.namespace.clone(),
        };

        let new_record = match LifecycleRecord::new(Issuance {
            serial_number: issued.serial_number.clone(),
            issued_at,
            expiration: issued.not_after,
            parameters: params.clone(),
        }) {
            Ok(record) => record,
            Err(e) => {
                if spec.revoke {
                    self.revoke_unused(key, &token, &new_revocation).await;
                }
                return Err(ReconcilerError::configuration(
                    key,
                    "compute_deadline",
                    e.to_string(),
                ));
            }
        };

        let destination_record = DestinationRecord::from_issued(&issued, desired.provenance())
            .with_metadata(destination.labels.clone(), destination.annotations.clone());
        drop(issued);

        if let Err(e) = self
            .destination_call(
                key,
                "write_destination",
                self.destinations.write(
                    &destination.name,
                    &key.namespace,
                    &destination_record,
                    destination.create,
                ),
            )
            .await
        {
            if spec.revoke {
                self.revoke_unused(key, &token, &new_revocation).await;
            }
            return Err(e);
        }
        metrics::increment_destination_writes();

        let stored = self.tracker.store(key, new_record);
        if spec.revoke {
            let superseded = match record.as_ref() {
                Some(previous) => Some(previous.revocation()),
                None => status_serial(desired, &params),
            };
            if let Some(previous) =
                superseded.filter(|previous| previous.serial_number != stored.serial_number)
            {
                self.tracker.mark_revocation_pending(key, previous);
            }
        }
        let revocations_pending = self.spawn_revocations(key, token);

        let action = match reason {
            RenewalReason::Absent => {
                metrics::increment_certificates_issued();
                ReconcileAction::Issued
            }
            other => {
                metrics::increment_certificates_renewed(other.as_str());
                ReconcileAction::Renewed(other)
            }
        };
        metrics::set_certificates_managed(self.tracker.len());

        info!(
            resource = %key,
            serial_number = %stored.serial_number,
            expiration = %stored.expiration,
            next_renewal = %stored.renewal_deadline,
            action = action.as_str(),
            "Certificate written to destination"
        );

        Ok(self.outcome(&stored, action, revocations_pending))
    }

    /// Rebuild a lifecycle record from the resource status after a restart.
    ///
    /// Only adopted when the destination still holds the reported serial and
    /// the status was written for the current generation.
    fn adopt(
        &self,
        desired: &DesiredCertificate,
        params: &IssuanceParameters,
        existing: Option<&DestinationRecord>,
    ) -> Option<LifecycleRecord> {
        let observed = desired.observed.as_ref()?;
        let existing = existing?;
        if existing.serial_number != observed.serial_number
            || observed.generation != desired.generation
        {
            return None;
        }

        let record = LifecycleRecord::new(Issuance {
            serial_number: observed.serial_number.clone(),
            issued_at: observed.issued_at,
            expiration: observed.expiration,
            parameters: params.clone(),
        })
        .ok()?;

        info!(
            resource = %desired.key,
            serial_number = %record.serial_number,
            "Adopted certificate reported in status"
        );
        let stored = self.tracker.store(&desired.key, record);
        metrics::set_certificates_managed(self.tracker.len());
        Some(stored)
    }

    fn outcome(
        &self,
        record: &LifecycleRecord,
        action: ReconcileAction,
        revocations_pending: usize,
    ) -> ReconcileOutcome {
        ReconcileOutcome {
            serial_number: record.serial_number.clone(),
            action,
            issued_at: record.issued_at,
            expiration: record.expiration,
            next_renewal: record.renewal_deadline,
            requeue_after: record.time_until_renewal(self.clock.now()),
            revocations_pending,
        }
    }

    pub(super) async fn resolve_token(
        &self,
        desired: &DesiredCertificate,
    ) -> Result<AccessToken, ReconcilerError> {
        let auth_ref = desired
            .spec
            .auth_ref
            .as_deref()
            .filter(|auth_ref| !auth_ref.trim().is_empty())
            .or(self.settings.default_auth_ref.as_deref());

        match tokio::time::timeout(
            self.settings.destination_timeout,
            self.auth.resolve(auth_ref, &desired.key.namespace),
        )
        .await
        {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(source)) => Err(ReconcilerError::Auth {
                key: desired.key.clone(),
                operation: "resolve_auth",
                source,
            }),
            Err(_) => Err(ReconcilerError::Timeout {
                key: desired.key.clone(),
                operation: "resolve_auth",
                timeout: self.settings.destination_timeout,
            }),
        }
    }

    /// Attempt every pending revocation for `key`; returns how many remain
    pub(super) async fn revoke_pending(&self, key: &ResourceKey, token: &AccessToken) -> usize {
        let Some(record) = self.tracker.get(key) else {
            return 0;
        };
        for pending in &record.pending_revocations {
            if self.revoke_best_effort(key, token, pending).await {
                self.tracker.resolve_revocation(key, &pending.serial_number);
            }
        }
        self.tracker
            .get(key)
            .map_or(0, |record| record.pending_revocations.len())
    }

    async fn retry_pending_revocations(
        &self,
        desired: &DesiredCertificate,
        record: &LifecycleRecord,
    ) -> usize {
        if !record.revocation_pending() {
            return 0;
        }
        match self.resolve_token(desired).await {
            Ok(token) => self.spawn_revocations(&desired.key, token),
            Err(e) => {
                warn!(resource = %desired.key, error = %e, "Cannot retry pending revocations");
                record.pending_revocations.len()
            }
        }
    }

    /// Revoke a serial that never reached a destination
    async fn revoke_unused(
        &self,
        key: &ResourceKey,
        token: &AccessToken,
        revocation: &PendingRevocation,
    ) {
        if !self.revoke_best_effort(key, token, revocation).await {
            warn!(
                resource = %key,
                serial_number = %revocation.serial_number,
                "Unused certificate could not be revoked and will expire on its own"
            );
        }
    }

    /// Revoke one serial. `true` when it is revoked or the authority no longer knows it.
    pub(super) async fn revoke_best_effort(
        &self,
        key: &ResourceKey,
        token: &AccessToken,
        revocation: &PendingRevocation,
    ) -> bool {
        let request = RevokeRequest::from(revocation);
        match self
            .authority_call(key, "revoke", self.authority.revoke(token, &request))
            .await
        {
            Ok(()) => {
                metrics::increment_revocations();
                info!(
                    resource = %key,
                    serial_number = %revocation.serial_number,
                    "Revoked certificate"
                );
                true
            }
            Err(ReconcilerError::Authority {
                source: AuthorityError::NotFound(_),
                ..
            }) => {
                debug!(
                    resource = %key,
                    serial_number = %revocation.serial_number,
                    "Certificate unknown to the authority, nothing to revoke"
                );
                true
            }
            Err(e) => {
                metrics::increment_revocation_errors();
                warn!(
                    resource = %key,
                    serial_number = %revocation.serial_number,
                    error = %e,
                    "Revocation failed, will retry on a later reconcile"
                );
                false
            }
        }
    }

    pub(super) async fn authority_call<T>(
        &self,
        key: &ResourceKey,
        operation: &'static str,
        call: impl Future<Output = Result<T, AuthorityError>>,
    ) -> Result<T, ReconcilerError> {
        match tokio::time::timeout(self.settings.authority_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ReconcilerError::Authority {
                key: key.clone(),
                operation,
                source,
            }),
            Err(_) => Err(ReconcilerError::Timeout {
                key: key.clone(),
                operation,
                timeout: self.settings.authority_timeout,
            }),
        }
    }

    pub(super) async fn destination_call<T>(
        &self,
        key: &ResourceKey,
        operation: &'static str,
        call: impl Future<Output = Result<T, DestinationError>>,
    ) -> Result<T, ReconcilerError> {
        match tokio::time::timeout(self.settings.destination_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ReconcilerError::Destination {
                key: key.clone(),
                operation,
                source,
            }),
            Err(_) => Err(ReconcilerError::Timeout {
                key: key.clone(),
                operation,
                timeout: self.settings.destination_timeout,
            }),
        }
    }
}

/// Serial reported in status that could not be adopted; it is replaced like a superseded one
fn status_serial(
    desired: &DesiredCertificate,
    params: &IssuanceParameters,
) -> Option<PendingRevocation> {
    desired
        .observed
        .as_ref()
        .filter(|observed| !observed.serial_number.is_empty())
        .map(|observed| PendingRevocation {
            serial_number: observed.serial_number.clone(),
            mount: params.mount.clone(),
            namespace: params.namespace.clone(),
        })
}

/// Decide whether a new certificate is needed; `None` keeps the tracked one
pub fn renewal_reason(
    record: Option<&LifecycleRecord>,
    params: &IssuanceParameters,
    destination: Option<&DestinationRecord>,
    now: DateTime<Utc>,
) -> Option<RenewalReason> {
    let Some(record) = record else {
        return Some(RenewalReason::Absent);
    };
    if &record.parameters != params {
        return Some(RenewalReason::SpecChanged);
    }
    if !destination.is_some_and(|d| d.serial_number == record.serial_number) {
        return Some(RenewalReason::DestinationDrift);
    }
    if record.renewal_due(now) {
        return Some(RenewalReason::DeadlineReached);
    }
    None
}

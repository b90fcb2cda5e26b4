//! # Cleanup
//!
//! Runs once the desired state for an identity is removed. A background
//! revocation still running for the identity is awaited first. Revocation is
//! best-effort; clearing the destination must succeed (or find it already
//! gone) before the identity is forgotten.

use super::types::{CleanupOutcome, Reconciler, ReconcilerError};
use crate::crd::DesiredCertificate;
use crate::destination::DestinationError;
use crate::lifecycle::PendingRevocation;
use crate::observability::metrics;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Honor the `revoke` and `clear` flags of a removed desired state and drop its lifecycle record.
    ///
    /// A destination that was not created for this resource is blanked, never removed.
    ///
    /// # Errors
    ///
    /// Returns a [`ReconcilerError`] when the destination cannot be cleared;
    /// the lifecycle record is kept so a retry revokes and clears again.
    pub async fn cleanup(
        &self,
        desired: &DesiredCertificate,
    ) -> Result<CleanupOutcome, ReconcilerError> {
        let key = &desired.key;
        let spec = &desired.spec;
        let mut outcome = CleanupOutcome::default();

        if spec.revoke {
            self.settle_revocations(key).await;
            let targets = self.revocation_targets(desired);
            if !targets.is_empty() {
                match self.resolve_token(desired).await {
                    Ok(token) => {
                        for target in &targets {
                            if self.revoke_best_effort(key, &token, target).await {
                                self.tracker.resolve_revocation(key, &target.serial_number);
                                outcome.revoked.push(target.serial_number.clone());
                            }
                        }
                    }
                    Err(e) => {
                        metrics::increment_revocation_errors();
                        warn!(
                            resource = %key,
                            error = %e,
                            serials = targets.len(),
                            "Cannot revoke certificates of deleted resource"
                        );
                    }
                }
            }
        }

        if spec.clear {
            let destination = &spec.destination;
            let owner = destination.create.then(|| desired.provenance());
            match self
                .destination_call(
                    key,
                    "clear_destination",
                    self.destinations
                        .clear(&destination.name, &key.namespace, owner.as_ref()),
                )
                .await
            {
                Ok(cleared) => {
                    info!(
                        resource = %key,
                        destination = %destination.name,
                        outcome = ?cleared,
                        "Cleared destination"
                    );
                    outcome.cleared = Some(cleared);
                }
                Err(ReconcilerError::Destination {
                    source: DestinationError::NotFound { .. },
                    ..
                }) => {
                    debug!(resource = %key, "Destination already gone");
                }
                Err(e) => return Err(e),
            }
        }

        self.tracker.clear(key);
        metrics::set_certificates_managed(self.tracker.len());
        info!(
            resource = %key,
            revoked = outcome.revoked.len(),
            "Cleaned up deleted resource"
        );
        Ok(outcome)
    }

    /// Current serial plus every still-pending superseded serial
    fn revocation_targets(&self, desired: &DesiredCertificate) -> Vec<PendingRevocation> {
        if let Some(record) = self.tracker.get(&desired.key) {
            let mut targets = vec![record.revocation()];
            targets.extend(record.pending_revocations);
            return targets;
        }

        // Not tracked (e.g. deleted while the controller was down); fall back to the status
        desired
            .observed
            .as_ref()
            .map(|observed| PendingRevocation {
                serial_number: observed.serial_number.clone(),
                mount: desired.spec.mount.trim().trim_matches('/').to_string(),
                namespace: desired
                    .spec
                    .namespace
                    .clone()
                    .filter(|ns| !ns.trim().is_empty()),
            })
            .into_iter()
            .collect()
    }
}

//! # Background Revocation
//!
//! Superseded serials are revoked off the reconcile path: a reconcile that
//! rotates a certificate returns as soon as the destination is written and the
//! lifecycle is stored. At most one revocation task runs per identity; serials
//! it cannot revoke stay pending in the lifecycle record and the next
//! reconcile starts a new task for them.

use super::types::Reconciler;
use crate::auth::AccessToken;
use crate::crd::ResourceKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

/// Running revocation task per identity
#[derive(Debug, Clone, Default)]
pub(super) struct RevocationTasks {
    tasks: Arc<Mutex<HashMap<ResourceKey, JoinHandle<()>>>>,
}

impl RevocationTasks {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Reconciler {
    /// Start revoking the pending serials of `key` in the background.
    ///
    /// Returns how many serials are pending when the task starts.
    pub(super) fn spawn_revocations(&self, key: &ResourceKey, token: AccessToken) -> usize {
        let pending = self
            .tracker
            .get(key)
            .map_or(0, |record| record.pending_revocations.len());
        if pending == 0 {
            return 0;
        }

        let mut tasks = self.revocations.lock();
        if tasks.get(key).is_some_and(|task| !task.is_finished()) {
            debug!(resource = %key, pending, "Revocation already running");
            return pending;
        }

        let span = info_span!(
            "pki.revoke_superseded",
            resource.namespace = %key.namespace,
            resource.name = %key.name,
            pending,
        );
        let reconciler = self.clone();
        let task_key = key.clone();
        let task = tokio::spawn(
            async move {
                let remaining = reconciler.revoke_pending(&task_key, &token).await;
                if remaining > 0 {
                    debug!(remaining, "Revocations left pending for the next reconcile");
                }
            }
            .instrument(span),
        );
        tasks.insert(key.clone(), task);
        pending
    }

    /// Wait for the background revocation of `key`, if one is running
    pub async fn settle_revocations(&self, key: &ResourceKey) {
        let task = self.revocations.lock().remove(key);
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(resource = %key, error = %e, "Revocation task did not finish");
            }
        }
    }
}

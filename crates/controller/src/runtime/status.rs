//! # Status Writer
//!
//! Mirrors dispatcher completions into `PkiSecret` status and releases the
//! finalizer once cleanup has finished.
//!
//! Status patches never change `metadata.generation`, so the watch events they
//! cause are dropped by the dispatcher without another reconcile.

use crate::constants::FIELD_MANAGER;
use crate::controller::dispatcher::{ReconcileCompleted, ReconcileResult};
use crate::controller::reconciler::{ErrorKind, ReconcileAction, ReconcileOutcome};
use crate::crd::{Condition, ErrorKindStatus, PkiSecret, PHASE_ACTIVE, PHASE_FAILED};
use crate::runtime::finalizer::remove_finalizer;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const READY_CONDITION: &str = "Ready";

/// Consume completions until the dispatcher shuts down
pub async fn run_status_writer(client: Client, mut completions: broadcast::Receiver<ReconcileCompleted>) {
    loop {
        match completions.recv().await {
            Ok(completed) => apply_completion(&client, &completed).await,
            Err(RecvError::Lagged(skipped)) => {
                // The next completion for each resource carries its full state again
                warn!(skipped, "Status writer fell behind, skipped completions");
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("Status writer stopped");
}

async fn apply_completion(client: &Client, completed: &ReconcileCompleted) {
    let key = &completed.key;
    let api: Api<PkiSecret> = Api::namespaced(client.clone(), &key.namespace);
    let now = Utc::now();

    let status = match &completed.result {
        ReconcileResult::Synced(outcome) => synced_status_patch(outcome, completed.generation, now),
        ReconcileResult::Failed { kind, message, .. } => failed_status_patch(*kind, message, now),
        ReconcileResult::Deleted(_) => {
            match remove_finalizer(&api, &key.name, completed.uid.as_deref()).await {
                Ok(true) => info!(resource = %key, "Cleanup finished, released resource"),
                Ok(false) => debug!(resource = %key, "No finalizer to release"),
                Err(e) => warn!(resource = %key, error = %e, "Failed to remove finalizer"),
            }
            return;
        }
    };

    let patch = json!({ "status": status });
    match api
        .patch_status(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => debug!(resource = %key, phase = %status["phase"], "Updated status"),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            debug!(resource = %key, "Resource deleted before status update, skipping");
        }
        Err(e) => warn!(resource = %key, error = %e, "Failed to update status"),
    }
}

/// Status patch for a resource whose destination holds the current certificate.
///
/// `lastError` and `errorKind` are sent as null so the merge patch removes them.
pub fn synced_status_patch(
    outcome: &ReconcileOutcome,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Value {
    let mut status = json!({
        "phase": PHASE_ACTIVE,
        "description": format!(
            "Certificate {} valid until {}",
            outcome.serial_number,
            outcome.expiration.to_rfc3339()
        ),
        "serialNumber": outcome.serial_number,
        "issuedAt": outcome.issued_at.to_rfc3339(),
        "expiration": outcome.expiration.to_rfc3339(),
        "nextRenewalTime": outcome.next_renewal.to_rfc3339(),
        "observedGeneration": generation,
        "lastError": null,
        "errorKind": null,
        "conditions": [ready_condition(true, outcome.action.as_str(), None, now)],
    });
    if matches!(outcome.action, ReconcileAction::Renewed(_)) {
        status["lastRotationTime"] = json!(outcome.issued_at.to_rfc3339());
    }
    status
}

/// Status patch for a failed reconcile.
///
/// Certificate fields and `observedGeneration` are left untouched so the last
/// good certificate stays recorded and restart adoption only matches the
/// generation it was actually issued for.
pub fn failed_status_patch(kind: ErrorKind, message: &str, now: DateTime<Utc>) -> Value {
    json!({
        "phase": PHASE_FAILED,
        "description": message,
        "lastError": message,
        "errorKind": ErrorKindStatus::from(kind),
        "conditions": [ready_condition(false, kind.as_str(), Some(message), now)],
    })
}

fn ready_condition(ready: bool, reason: &str, message: Option<&str>, now: DateTime<Utc>) -> Condition {
    Condition {
        r#type: READY_CONDITION.to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        last_transition_time: Some(now.to_rfc3339()),
        reason: Some(reason.to_string()),
        message: message.map(str::to_string),
    }
}

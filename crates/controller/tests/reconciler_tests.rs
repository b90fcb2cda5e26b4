//! Reconciler tests against in-process fakes
//!
//! Covers issuance, the renewal decision (deadline, spec change, destination
//! drift), revocation on rotation, restart adoption and error classification.

mod common;

use common::{desired, serial, spec, updated, Harness, DESTINATION, NAMESPACE};
use controller::authority::AuthorityError;
use controller::controller::reconciler::{
    ErrorKind, ReconcileAction, ReconcilerError, RenewalReason,
};
use controller::crd::ObservedCertificate;
use controller::destination::{DestinationError, DestinationRecord, DestinationStore};
use std::time::Duration;

#[tokio::test]
async fn test_first_reconcile_issues_and_writes_destination() {
    let harness = Harness::new();
    let desired = desired("web", spec("web.example.com"));

    let outcome = harness.reconciler.reconcile(&desired).await.unwrap();

    assert_eq!(outcome.action, ReconcileAction::Issued);
    assert_eq!(outcome.serial_number, serial(1));
    assert_eq!(outcome.requeue_after, Duration::from_secs(10));
    assert_eq!((outcome.expiration - outcome.issued_at).num_seconds(), 15);
    assert_eq!((outcome.next_renewal - outcome.issued_at).num_seconds(), 10);

    let stored = harness.destinations.get(DESTINATION, NAMESPACE).unwrap();
    assert_eq!(stored.serial_number, serial(1));
    assert_eq!(stored.private_key.as_str(), "key-1");
    let provenance = stored.provenance.unwrap();
    assert_eq!(provenance.kind, "PkiSecret");
    assert_eq!(provenance.name, "web");

    let requests = harness.authority.issued();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].common_name, "web.example.com");
    assert_eq!(requests[0].ttl, Some(Duration::from_secs(15)));
    assert_eq!(requests[0].mount, "pki");
    assert_eq!(requests[0].role, "secret");
    assert_eq!(harness.reconciler.tracker().len(), 1);
}

#[tokio::test]
async fn test_reconcile_before_deadline_is_a_no_op() {
    let harness = Harness::new();
    let desired = desired("web", spec("web.example.com"));
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness.clock.advance(Duration::from_secs(4));
    let outcome = harness.reconciler.reconcile(&desired).await.unwrap();

    assert_eq!(outcome.action, ReconcileAction::Unchanged);
    assert_eq!(outcome.serial_number, serial(1));
    assert_eq!(outcome.requeue_after, Duration::from_secs(6));
    assert_eq!(harness.authority.issue_count(), 1);
    assert_eq!(harness.destinations.write_count(), 1);
}

#[tokio::test]
async fn test_renews_at_deadline_and_revokes_previous_serial() {
    let harness = Harness::new();
    let mut with_revoke = spec("web.example.com");
    with_revoke.revoke = true;
    let desired = desired("web", with_revoke);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness.clock.advance(Duration::from_secs(10));
    let outcome = harness.reconciler.reconcile(&desired).await.unwrap();

    assert_eq!(
        outcome.action,
        ReconcileAction::Renewed(RenewalReason::DeadlineReached)
    );
    assert_eq!(outcome.serial_number, serial(2));
    // Handed to the background task, not revoked inline
    assert_eq!(outcome.revocations_pending, 1);

    harness.reconciler.settle_revocations(&desired.key).await;
    assert_eq!(harness.authority.revoked_serials(), vec![serial(1)]);
    assert!(!harness
        .reconciler
        .tracker()
        .get(&desired.key)
        .unwrap()
        .revocation_pending());
    assert_eq!(
        harness
            .destinations
            .get(DESTINATION, NAMESPACE)
            .unwrap()
            .serial_number,
        serial(2)
    );
}

#[tokio::test]
async fn test_rotation_without_revoke_flag_keeps_old_serial_valid() {
    let harness = Harness::new();
    let desired = desired("web", spec("web.example.com"));
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness.clock.advance(Duration::from_secs(11));
    harness.reconciler.reconcile(&desired).await.unwrap();

    assert_eq!(harness.authority.issue_count(), 2);
    assert!(harness.authority.revoked_serials().is_empty());
}

#[tokio::test]
async fn test_spec_change_renews_immediately() {
    let harness = Harness::new();
    let first = desired("web", spec("web.example.com"));
    harness.reconciler.reconcile(&first).await.unwrap();

    let mut changed = spec("web.example.com");
    changed.alt_names = vec!["www.example.com".to_string()];
    let second = updated(&first, changed);
    let outcome = harness.reconciler.reconcile(&second).await.unwrap();

    assert_eq!(
        outcome.action,
        ReconcileAction::Renewed(RenewalReason::SpecChanged)
    );
    assert_eq!(harness.authority.issued()[1].alt_names, vec!["www.example.com"]);
}

#[tokio::test]
async fn test_destination_drift_triggers_reissue() {
    let harness = Harness::new();
    let desired = desired("web", spec("web.example.com"));
    harness.reconciler.reconcile(&desired).await.unwrap();

    // Someone blanked the destination behind the controller's back
    harness
        .destinations
        .clear(DESTINATION, NAMESPACE, None)
        .await
        .unwrap();
    let outcome = harness.reconciler.reconcile(&desired).await.unwrap();

    assert_eq!(
        outcome.action,
        ReconcileAction::Renewed(RenewalReason::DestinationDrift)
    );
    assert_eq!(
        harness
            .destinations
            .get(DESTINATION, NAMESPACE)
            .unwrap()
            .serial_number,
        serial(2)
    );
}

#[tokio::test]
async fn test_missing_destination_without_create_is_configuration_error() {
    let harness = Harness::new();
    let mut no_create = spec("web.example.com");
    no_create.destination.create = false;

    let err = harness
        .reconciler
        .reconcile(&desired("web", no_create))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(matches!(
        err,
        ReconcilerError::Destination {
            source: DestinationError::NotFound { .. },
            ..
        }
    ));
    assert_eq!(harness.authority.issue_count(), 0);
    assert!(!harness.destinations.contains(DESTINATION, NAMESPACE));
}

#[tokio::test]
async fn test_existing_destination_without_create_is_filled() {
    let harness = Harness::new();
    harness.destinations.insert_existing(DESTINATION, NAMESPACE);
    let mut no_create = spec("web.example.com");
    no_create.destination.create = false;

    let outcome = harness
        .reconciler
        .reconcile(&desired("web", no_create))
        .await
        .unwrap();

    assert_eq!(outcome.action, ReconcileAction::Issued);
    assert_eq!(
        harness
            .destinations
            .get(DESTINATION, NAMESPACE)
            .unwrap()
            .serial_number,
        serial(1)
    );
}

#[tokio::test]
async fn test_invalid_spec_fails_before_any_call() {
    let harness = Harness::new();
    let mut invalid = spec("web.example.com");
    invalid.expiry_offset = Some("15s".to_string());

    let err = harness
        .reconciler
        .reconcile(&desired("web", invalid))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.operation(), "validate");
    assert!(err.to_string().contains("expiryOffset"));
    assert_eq!(harness.authority.issue_count(), 0);
}

#[tokio::test]
async fn test_unreachable_authority_is_transient_and_leaves_state_alone() {
    let harness = Harness::new();
    let desired = desired("web", spec("web.example.com"));
    harness
        .authority
        .fail_next_issue(AuthorityError::Unreachable("connection refused".to_string()));

    let err = harness.reconciler.reconcile(&desired).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.operation(), "issue");
    assert!(!harness.destinations.contains(DESTINATION, NAMESPACE));
    assert!(harness.reconciler.tracker().is_empty());

    // The retry asks for a fresh certificate
    let outcome = harness.reconciler.reconcile(&desired).await.unwrap();
    assert_eq!(outcome.action, ReconcileAction::Issued);
}

#[tokio::test]
async fn test_invalid_role_is_configuration_error() {
    let harness = Harness::new();
    harness
        .authority
        .fail_next_issue(AuthorityError::InvalidRole("unknown role secret".to_string()));

    let err = harness
        .reconciler
        .reconcile(&desired("web", spec("web.example.com")))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_create_mode_refuses_foreign_destination_before_issuing() {
    let harness = Harness::new();
    // Present but produced by someone else: create mode refuses to take it over
    harness.destinations.insert_existing(DESTINATION, NAMESPACE);

    let err = harness
        .reconciler
        .reconcile(&desired("web", spec("web.example.com")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReconcilerError::Destination {
            source: DestinationError::Exists { .. },
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(harness.authority.issue_count(), 0);
}

#[tokio::test]
async fn test_failed_write_revokes_unused_certificate() {
    let harness = Harness::new();
    harness
        .destinations
        .fail_next_write(DestinationError::Unavailable("etcd leader lost".to_string()));
    let mut with_revoke = spec("web.example.com");
    with_revoke.revoke = true;

    let err = harness
        .reconciler
        .reconcile(&desired("web", with_revoke))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(err.operation(), "write_destination");
    assert_eq!(harness.authority.revoked_serials(), vec![serial(1)]);
    assert!(harness.reconciler.tracker().is_empty());
}

#[tokio::test]
async fn test_failed_revocation_is_retried_on_next_reconcile() {
    let harness = Harness::new();
    let mut with_revoke = spec("web.example.com");
    with_revoke.revoke = true;
    let desired = desired("web", with_revoke);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness
        .authority
        .fail_next_revoke(AuthorityError::Unreachable("timeout".to_string()));
    harness.clock.advance(Duration::from_secs(10));
    let renewed = harness.reconciler.reconcile(&desired).await.unwrap();

    // The new certificate is in place even though the old one is not revoked yet
    assert_eq!(renewed.serial_number, serial(2));
    harness.reconciler.settle_revocations(&desired.key).await;
    assert!(harness.authority.revoked_serials().is_empty());
    assert!(harness
        .reconciler
        .tracker()
        .get(&desired.key)
        .unwrap()
        .revocation_pending());

    let retried = harness.reconciler.reconcile(&desired).await.unwrap();
    assert_eq!(retried.action, ReconcileAction::Unchanged);
    assert_eq!(retried.revocations_pending, 1);
    harness.reconciler.settle_revocations(&desired.key).await;
    assert_eq!(harness.authority.revoked_serials(), vec![serial(1)]);
    assert!(!harness
        .reconciler
        .tracker()
        .get(&desired.key)
        .unwrap()
        .revocation_pending());
}

#[tokio::test]
async fn test_revocation_of_unknown_serial_counts_as_done() {
    let harness = Harness::new();
    let mut with_revoke = spec("web.example.com");
    with_revoke.revoke = true;
    let desired = desired("web", with_revoke);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness
        .authority
        .fail_next_revoke(AuthorityError::NotFound(serial(1)));
    harness.clock.advance(Duration::from_secs(10));
    harness.reconciler.reconcile(&desired).await.unwrap();
    harness.reconciler.settle_revocations(&desired.key).await;

    assert!(!harness
        .reconciler
        .tracker()
        .get(&desired.key)
        .unwrap()
        .revocation_pending());
    assert!(harness.authority.revoked_serials().is_empty());
}

#[tokio::test]
async fn test_restart_adopts_certificate_reported_in_status() {
    let harness = Harness::new();
    let first = desired("web", spec("web.example.com"));
    let issued = harness.reconciler.reconcile(&first).await.unwrap();

    let observed = ObservedCertificate {
        serial_number: issued.serial_number.clone(),
        issued_at: issued.issued_at,
        expiration: issued.expiration,
        generation: first.generation,
    };
    let after_restart = harness.restarted();
    let outcome = after_restart
        .reconcile(&first.clone().with_observed(observed))
        .await
        .unwrap();

    assert_eq!(outcome.action, ReconcileAction::Adopted);
    assert_eq!(outcome.serial_number, issued.serial_number);
    assert_eq!(outcome.next_renewal, issued.next_renewal);
    assert_eq!(harness.authority.issue_count(), 1);
}

#[tokio::test]
async fn test_restart_with_stale_status_generation_reissues() {
    let harness = Harness::new();
    let first = desired("web", spec("web.example.com"));
    let issued = harness.reconciler.reconcile(&first).await.unwrap();

    // Spec was edited while the controller was down
    let edited = updated(&first, spec("web.example.com")).with_observed(ObservedCertificate {
        serial_number: issued.serial_number,
        issued_at: issued.issued_at,
        expiration: issued.expiration,
        generation: first.generation,
    });
    let outcome = harness.restarted().reconcile(&edited).await.unwrap();

    assert_eq!(outcome.action, ReconcileAction::Issued);
    assert_eq!(harness.authority.issue_count(), 2);
    assert!(harness.authority.revoked_serials().is_empty());
}

#[tokio::test]
async fn test_reissue_after_restart_revokes_serial_from_status() {
    let harness = Harness::new();
    let mut with_revoke = spec("web.example.com");
    with_revoke.revoke = true;
    let first = desired("web", with_revoke.clone());
    let issued = harness.reconciler.reconcile(&first).await.unwrap();

    let edited = updated(&first, with_revoke).with_observed(ObservedCertificate {
        serial_number: issued.serial_number,
        issued_at: issued.issued_at,
        expiration: issued.expiration,
        generation: first.generation,
    });
    let after_restart = harness.restarted();
    let outcome = after_restart.reconcile(&edited).await.unwrap();
    assert_eq!(outcome.serial_number, serial(2));
    assert_eq!(outcome.revocations_pending, 1);

    after_restart.settle_revocations(&edited.key).await;
    assert_eq!(harness.authority.revoked_serials(), vec![serial(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_revocation_does_not_hold_back_renewal() {
    let harness = Harness::new();
    let mut with_revoke = spec("web.example.com");
    with_revoke.revoke = true;
    let desired = desired("web", with_revoke);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness.authority.hang_revokes();
    harness.clock.advance(Duration::from_secs(10));
    let started = tokio::time::Instant::now();
    let renewed = harness.reconciler.reconcile(&desired).await.unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(renewed.serial_number, serial(2));
    assert_eq!(renewed.requeue_after, Duration::from_secs(10));
    assert_eq!(
        harness
            .destinations
            .get(DESTINATION, NAMESPACE)
            .unwrap()
            .serial_number,
        serial(2)
    );

    // The stalled call gives up at the authority timeout and stays pending
    harness.reconciler.settle_revocations(&desired.key).await;
    assert!(harness.authority.revoked_serials().is_empty());
    assert!(harness
        .reconciler
        .tracker()
        .get(&desired.key)
        .unwrap()
        .revocation_pending());
}

#[tokio::test]
async fn test_same_destination_name_in_other_namespace_is_independent() {
    let harness = Harness::new();
    harness
        .reconciler
        .reconcile(&desired("web", spec("web.example.com")))
        .await
        .unwrap();

    let mut other = desired("web", spec("web.example.com"));
    other.key.namespace = "team-b".to_string();
    harness.reconciler.reconcile(&other).await.unwrap();

    assert_eq!(
        harness.destinations.get(DESTINATION, NAMESPACE).unwrap().serial_number,
        serial(1)
    );
    assert_eq!(
        harness.destinations.get(DESTINATION, "team-b").unwrap().serial_number,
        serial(2)
    );
}

#[tokio::test]
async fn test_destination_holds_labels_from_spec() {
    let harness = Harness::new();
    let mut labelled = spec("web.example.com");
    labelled
        .destination
        .labels
        .insert("app".to_string(), "web".to_string());

    harness
        .reconciler
        .reconcile(&desired("web", labelled))
        .await
        .unwrap();

    let stored: DestinationRecord = harness.destinations.get(DESTINATION, NAMESPACE).unwrap();
    assert_eq!(stored.labels.get("app").map(String::as_str), Some("web"));
}

//! Cleanup tests: revoke-on-delete and clear-on-delete semantics

mod common;

use common::{desired, serial, spec, Harness, DESTINATION, NAMESPACE};
use controller::authority::AuthorityError;
use controller::crd::ObservedCertificate;
use controller::destination::ClearOutcome;
use std::time::Duration;

#[tokio::test]
async fn test_delete_revokes_and_removes_created_destination() {
    let harness = Harness::new();
    let mut flags = spec("web.example.com");
    flags.revoke = true;
    flags.clear = true;
    let desired = desired("web", flags);
    harness.reconciler.reconcile(&desired).await.unwrap();

    let outcome = harness.reconciler.cleanup(&desired).await.unwrap();

    assert_eq!(outcome.revoked, vec![serial(1)]);
    assert_eq!(outcome.cleared, Some(ClearOutcome::Removed));
    assert!(!harness.destinations.contains(DESTINATION, NAMESPACE));
    assert!(harness.reconciler.tracker().is_empty());
}

#[tokio::test]
async fn test_delete_blanks_destination_it_did_not_create() {
    let harness = Harness::new();
    harness.destinations.insert_existing(DESTINATION, NAMESPACE);
    let mut flags = spec("web.example.com");
    flags.clear = true;
    flags.destination.create = false;
    let desired = desired("web", flags);
    harness.reconciler.reconcile(&desired).await.unwrap();

    let outcome = harness.reconciler.cleanup(&desired).await.unwrap();

    assert_eq!(outcome.cleared, Some(ClearOutcome::Blanked));
    let remaining = harness.destinations.get(DESTINATION, NAMESPACE).unwrap();
    assert!(remaining.is_empty());
    assert!(remaining.private_key.is_empty());
}

#[tokio::test]
async fn test_delete_without_flags_leaves_everything_in_place() {
    let harness = Harness::new();
    let desired = desired("web", spec("web.example.com"));
    harness.reconciler.reconcile(&desired).await.unwrap();

    let outcome = harness.reconciler.cleanup(&desired).await.unwrap();

    assert!(outcome.revoked.is_empty());
    assert!(outcome.cleared.is_none());
    assert!(harness.authority.revoked_serials().is_empty());
    assert_eq!(
        harness
            .destinations
            .get(DESTINATION, NAMESPACE)
            .unwrap()
            .serial_number,
        serial(1)
    );
    assert!(harness.reconciler.tracker().is_empty());
}

#[tokio::test]
async fn test_delete_revokes_pending_superseded_serials_too() {
    let harness = Harness::new();
    let mut flags = spec("web.example.com");
    flags.revoke = true;
    let desired = desired("web", flags);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness
        .authority
        .fail_next_revoke(AuthorityError::Unreachable("timeout".to_string()));
    harness.clock.advance(Duration::from_secs(10));
    harness.reconciler.reconcile(&desired).await.unwrap();

    let outcome = harness.reconciler.cleanup(&desired).await.unwrap();

    let mut revoked = outcome.revoked;
    revoked.sort();
    assert_eq!(revoked, vec![serial(1), serial(2)]);
}

#[tokio::test]
async fn test_delete_after_restart_revokes_serial_from_status() {
    let harness = Harness::new();
    let mut flags = spec("web.example.com");
    flags.revoke = true;
    let first = desired("web", flags);
    let issued = harness.reconciler.reconcile(&first).await.unwrap();

    let observed = first.clone().with_observed(ObservedCertificate {
        serial_number: issued.serial_number,
        issued_at: issued.issued_at,
        expiration: issued.expiration,
        generation: first.generation,
    });
    let outcome = harness.restarted().cleanup(&observed).await.unwrap();

    assert_eq!(outcome.revoked, vec![serial(1)]);
    assert_eq!(harness.authority.revoked_serials(), vec![serial(1)]);
}

#[tokio::test]
async fn test_delete_of_already_removed_destination_succeeds() {
    let harness = Harness::new();
    let mut flags = spec("web.example.com");
    flags.clear = true;

    let outcome = harness
        .reconciler
        .cleanup(&desired("never-reconciled", flags))
        .await
        .unwrap();

    assert!(outcome.cleared.is_none());
}

#[tokio::test]
async fn test_failed_clear_keeps_lifecycle_for_retry() {
    let harness = Harness::new();
    let mut flags = spec("web.example.com");
    flags.clear = true;
    let desired = desired("web", flags);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness.destinations.set_unavailable(true);
    let err = harness.reconciler.cleanup(&desired).await.unwrap_err();

    assert_eq!(err.operation(), "clear_destination");
    assert_eq!(harness.reconciler.tracker().len(), 1);

    harness.destinations.set_unavailable(false);
    harness.reconciler.cleanup(&desired).await.unwrap();
    assert!(harness.reconciler.tracker().is_empty());
    assert!(!harness.destinations.contains(DESTINATION, NAMESPACE));
}

#[tokio::test]
async fn test_failed_revocation_does_not_block_clear() {
    let harness = Harness::new();
    let mut flags = spec("web.example.com");
    flags.revoke = true;
    flags.clear = true;
    let desired = desired("web", flags);
    harness.reconciler.reconcile(&desired).await.unwrap();

    harness
        .authority
        .fail_next_revoke(AuthorityError::Unreachable("timeout".to_string()));
    let outcome = harness.reconciler.cleanup(&desired).await.unwrap();

    assert!(outcome.revoked.is_empty());
    assert_eq!(outcome.cleared, Some(ClearOutcome::Removed));
    assert!(harness.reconciler.tracker().is_empty());
}

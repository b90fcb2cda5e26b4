//! # Watch Loop
//!
//! Watches `PkiSecret` resources and forwards their desired state to the
//! dispatcher. The watch is restarted after stream errors until a shutdown
//! signal arrives.

use crate::config::ControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::controller::dispatcher::{DesiredEvent, Dispatcher, DispatcherError};
use crate::controller::server::ServerState;
use crate::crd::{DesiredCertificate, PkiSecret, ResourceKey};
use crate::runtime::error_policy::handle_watch_stream_error;
use crate::runtime::finalizer::{ensure_finalizer, has_finalizer};
use futures::StreamExt;
use kube::api::Api;
use kube::{Client, Resource};
use kube_runtime::watcher;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

/// What a single watch event asks of the dispatcher
#[derive(Debug, PartialEq, Eq)]
enum Intent {
    /// Reconcile; `needs_finalizer` when ours is not on the object yet
    Apply { needs_finalizer: bool },
    Cleanup,
    Ignore,
}

/// An applied object is either live or being deleted; only objects holding
/// our finalizer still need cleanup once deletion starts.
fn intent_for_applied(obj: &PkiSecret) -> Intent {
    if obj.meta().deletion_timestamp.is_some() {
        if has_finalizer(obj) {
            Intent::Cleanup
        } else {
            Intent::Ignore
        }
    } else {
        Intent::Apply {
            needs_finalizer: !has_finalizer(obj),
        }
    }
}

/// A delete event for an object that went through finalization was already
/// handed to the dispatcher when its deletion timestamp appeared.
fn intent_for_deleted(obj: &PkiSecret) -> Intent {
    if obj.meta().deletion_timestamp.is_some() && !has_finalizer(obj) {
        Intent::Ignore
    } else {
        Intent::Cleanup
    }
}

/// Run the watch loop until SIGINT/SIGTERM
///
/// Marks the server not ready on shutdown; stopping the dispatcher is left to the caller.
///
/// # Errors
///
/// Returns an error when the dispatcher has stopped accepting events.
pub async fn run_watch_loop(
    client: Client,
    resources: Api<PkiSecret>,
    dispatcher: Dispatcher,
    server_state: Arc<ServerState>,
    config: &ControllerConfig,
) -> Result<(), anyhow::Error> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let shutdown_server_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_server_state.set_ready(false);
        let _ = shutdown_tx.send(true);
    });

    let restart_delay = config.watch_restart_delay_duration();
    let mut throttle_backoff = FibonacciBackoff::new(1, config.watch_restart_delay_secs.max(1) * 6);

    'restart: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop"
        );
        info!(parent: &watch_span, "Starting PkiSecret watch");
        let mut stream = watcher(resources.clone(), watcher::Config::default()).boxed();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'restart,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    throttle_backoff.reset();
                    handle_event(&client, &dispatcher, event)
                        .instrument(watch_span.clone())
                        .await?;
                }
                Some(Err(e)) => {
                    let error_string = format!("{e:?}");
                    if !handle_watch_stream_error(&error_string, &mut throttle_backoff, restart_delay)
                        .instrument(watch_span.clone())
                        .await
                    {
                        continue 'restart;
                    }
                }
                None => {
                    warn!(
                        delay_secs = restart_delay.as_secs(),
                        "Watch stream ended, restarting"
                    );
                    tokio::time::sleep(restart_delay).await;
                    continue 'restart;
                }
            }
        }
    }

    info!("Watch loop stopped");
    Ok(())
}

async fn handle_event(
    client: &Client,
    dispatcher: &Dispatcher,
    event: watcher::Event<PkiSecret>,
) -> Result<(), DispatcherError> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            let key = ResourceKey::from_object(&obj);
            match intent_for_applied(&obj) {
                Intent::Apply { needs_finalizer } => {
                    if needs_finalizer {
                        let api: Api<PkiSecret> = Api::namespaced(client.clone(), &key.namespace);
                        if let Err(e) = ensure_finalizer(&api, &obj).await {
                            // The next event for this object tries again
                            warn!(resource = %key, error = %e, "Failed to add finalizer");
                        }
                    }
                    debug!(resource = %key, generation = ?obj.meta().generation, "watch.event.apply");
                    dispatcher.submit(DesiredEvent::Applied(DesiredCertificate::from_resource(&obj)))
                }
                Intent::Cleanup => {
                    info!(resource = %key, "Resource is being deleted, scheduling cleanup");
                    dispatcher.submit(DesiredEvent::Deleted(DesiredCertificate::from_resource(&obj)))
                }
                Intent::Ignore => Ok(()),
            }
        }
        watcher::Event::Delete(obj) => {
            let key = ResourceKey::from_object(&obj);
            if intent_for_deleted(&obj) == Intent::Cleanup {
                info!(resource = %key, "Resource deleted, scheduling cleanup");
                dispatcher.submit(DesiredEvent::Deleted(DesiredCertificate::from_resource(&obj)))
            } else {
                debug!(resource = %key, "Resource finalized");
                Ok(())
            }
        }
        watcher::Event::Init => {
            debug!("watch.event.init");
            Ok(())
        }
        watcher::Event::InitDone => {
            info!("Initial PkiSecret listing complete");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FINALIZER;
    use crate::crd::{CertificateFormat, DestinationRef, PkiSecretSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn resource(finalizer: bool, deleting: bool) -> PkiSecret {
        let mut obj = PkiSecret::new(
            "web",
            PkiSecretSpec {
                auth_ref: None,
                namespace: None,
                mount: "pki".to_string(),
                role: "secret".to_string(),
                common_name: "web.example.com".to_string(),
                alt_names: Vec::new(),
                ip_sans: Vec::new(),
                uri_sans: Vec::new(),
                exclude_cn_from_sans: false,
                format: CertificateFormat::Pem,
                revoke: true,
                clear: true,
                expiry_offset: None,
                ttl: None,
                destination: DestinationRef {
                    name: "web-tls".to_string(),
                    ..DestinationRef::default()
                },
            },
        );
        obj.metadata.namespace = Some("team-a".to_string());
        if finalizer {
            obj.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        }
        if deleting {
            let deleted_at: Time = serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z"))
                .expect("valid timestamp");
            obj.metadata.deletion_timestamp = Some(deleted_at);
        }
        obj
    }

    #[test]
    fn test_new_resource_needs_finalizer() {
        assert_eq!(
            intent_for_applied(&resource(false, false)),
            Intent::Apply {
                needs_finalizer: true
            }
        );
        assert_eq!(
            intent_for_applied(&resource(true, false)),
            Intent::Apply {
                needs_finalizer: false
            }
        );
    }

    #[test]
    fn test_deleting_resource_is_cleaned_up_once() {
        assert_eq!(intent_for_applied(&resource(true, true)), Intent::Cleanup);
        // Finalizer already released: cleanup ran
        assert_eq!(intent_for_applied(&resource(false, true)), Intent::Ignore);
        assert_eq!(intent_for_deleted(&resource(false, true)), Intent::Ignore);
    }

    #[test]
    fn test_delete_without_finalization_triggers_cleanup() {
        assert_eq!(intent_for_deleted(&resource(false, false)), Intent::Cleanup);
    }
}

//! # PKI Secret Controller
//!
//! A Kubernetes controller that issues certificates from a Vault PKI mount and
//! keeps them in Kubernetes Secrets.
//!
//! ## Overview
//!
//! For every `PkiSecret` resource the controller:
//!
//! 1. **Issues a certificate** - Calls `<mount>/issue/<role>` with the resource's names and TTL
//! 2. **Writes the destination** - Stores certificate, key, chain and serial in a Secret
//! 3. **Renews ahead of expiry** - Re-issues `expiryOffset` before `notAfter`, or right away when the spec changes
//! 4. **Revokes** - Revokes superseded certificates when `revoke` is set
//! 5. **Cleans up** - Revokes and clears the destination when the resource is deleted
//!
//! ## Configuration
//!
//! Read from the environment at startup; see `config::ControllerConfig` and
//! `config::ServerConfig` for the recognised variables and their defaults.

use anyhow::Result;
use controller::observability::otel::shutdown_otel;
use controller::runtime::initialization::initialize;
use controller::runtime::status::run_status_writer;
use controller::runtime::watch_loop::run_watch_loop;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    let status_writer = tokio::spawn(run_status_writer(
        init.client.clone(),
        init.dispatcher.subscribe(),
    ));

    let watch_result = run_watch_loop(
        init.client.clone(),
        init.resources.clone(),
        init.dispatcher.clone(),
        init.server_state.clone(),
        &init.config,
    )
    .await;
    if let Err(e) = &watch_result {
        error!(error = %e, "Watch loop failed");
    }

    info!("Waiting for in-flight reconciliations to complete...");
    init.dispatcher.shutdown().await;
    // The writer exits once every dispatcher handle is gone
    drop(init.dispatcher);
    if let Err(e) = status_writer.await {
        error!(error = %e, "Status writer task failed");
    }

    shutdown_otel(init.otel_tracer_provider);
    info!("Controller stopped gracefully");
    watch_result
}

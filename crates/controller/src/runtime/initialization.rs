//! # Initialization
//!
//! Controller initialization logic including rustls setup, OpenTelemetry,
//! tracing, metrics, server startup, and wiring of the reconcile pipeline.

use crate::auth::{AccessToken, AuthResolver, KubeSecretTokenResolver, StaticTokenResolver};
use crate::authority::VaultPkiClient;
use crate::config::{ControllerConfig, ServerConfig};
use crate::controller::dispatcher::{Dispatcher, DispatcherOptions, ReconcileHandler};
use crate::controller::reconciler::{Reconciler, ReconcilerSettings};
use crate::controller::server::{start_server, ServerState};
use crate::crd::PkiSecret;
use crate::destination::KubeSecretStore;
use crate::lifecycle::SystemClock;
use crate::observability;
use crate::observability::otel::TracerProviderHandle;
use anyhow::{Context, Result};
use kube::api::{Api, ListParams};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// Kubernetes client
    pub client: Client,
    /// API for PkiSecret resources in the watched scope
    pub resources: Api<PkiSecret>,
    /// Running dispatcher fed by the watch loop
    pub dispatcher: Dispatcher,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// OpenTelemetry tracer provider (if initialized)
    pub otel_tracer_provider: Option<TracerProviderHandle>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - OpenTelemetry initialization
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Authority, auth and destination clients
/// - Reconciler and dispatcher startup
///
/// # Errors
///
/// Returns an error if any of the above cannot be set up.
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before anything opens a TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_existing| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = ControllerConfig::from_env();
    let server_config = ServerConfig::from_env();

    let otel_tracer_provider =
        observability::otel::init_otel().context("Failed to initialize OpenTelemetry")?;
    init_tracing(&config, otel_tracer_provider.is_some());

    info!("Starting PKI Secret Controller");
    info!(
        build.timestamp = env!("BUILD_TIMESTAMP"),
        build.datetime = env!("BUILD_DATETIME"),
        build.git_hash = env!("BUILD_GIT_HASH"),
        "Build info"
    );
    info!(config = ?config, "Loaded configuration");

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());

    // Start HTTP server in the background, but wait until it is bound so
    // readiness probes pass before reconciling starts
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!(error = %e, "HTTP server error");
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let resources: Api<PkiSecret> = match &config.watch_namespace {
        Some(namespace) => {
            info!(namespace = %namespace, "Watching PkiSecret resources in a single namespace");
            Api::namespaced(client.clone(), namespace)
        }
        None => Api::all(client.clone()),
    };
    check_crd_queryable(&resources).await;

    let authority = VaultPkiClient::new(config.vault_addr.clone(), config.authority_timeout())
        .context("Failed to create Vault client")?;
    info!(vault.address = %authority.address(), "Vault PKI client ready");

    let auth: Arc<dyn AuthResolver> = match &config.vault_token {
        Some(token) => {
            warn!("VAULT_TOKEN is set; using it for every resource and ignoring authRef");
            Arc::new(StaticTokenResolver::new(AccessToken::new(token.clone())))
        }
        None => Arc::new(KubeSecretTokenResolver::new(client.clone())),
    };

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(authority),
        Arc::new(KubeSecretStore::new(client.clone())),
        auth,
        Arc::new(SystemClock),
        ReconcilerSettings::from_config(&config),
    ));

    let options = DispatcherOptions::from_config(&config);
    info!(
        max_concurrent = options.max_concurrent,
        backoff.min_secs = options.backoff_min_secs,
        backoff.max_secs = options.backoff_max_secs,
        "Starting dispatcher"
    );
    let dispatcher = Dispatcher::spawn(reconciler as Arc<dyn ReconcileHandler>, options);

    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        resources,
        dispatcher,
        server_state,
        otel_tracer_provider,
        config,
    })
}

/// Install the fmt subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
fn init_tracing(config: &ControllerConfig, otel_enabled: bool) {
    let level = config.log_level.to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("controller={level},pki_secret_controller={level}"))
    });

    let result = if config.json_logs() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        if otel_enabled {
            // datadog-opentelemetry may already have installed its own subscriber
            warn!(error = %e, "Tracing subscriber already initialized by Datadog");
        } else {
            warn!(error = %e, "Tracing subscriber already initialized");
        }
    }
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    server_config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = server_config.startup_timeout();
    let poll_interval = server_config.poll_interval();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Log whether the CRD is installed; the watch keeps retrying either way
async fn check_crd_queryable(resources: &Api<PkiSecret>) {
    let span = tracing::span!(
        tracing::Level::INFO,
        "controller.startup.check_crd",
        operation = "check_crd_queryable"
    );

    match resources
        .list(&ListParams::default().limit(1))
        .instrument(span)
        .await
    {
        Ok(_) => info!("PkiSecret CRD is queryable"),
        Err(e) => warn!(
            error = %e,
            "PkiSecret CRD is not queryable yet; install it with `crdgen | kubectl apply -f -`"
        ),
    }
}

//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// API group of the `PkiSecret` custom resource
pub const API_GROUP: &str = "secrets.octopilot.io";

/// API version of the `PkiSecret` custom resource
pub const API_VERSION: &str = "v1beta1";

/// Kind of the `PkiSecret` custom resource
pub const KIND: &str = "PkiSecret";

/// Finalizer that keeps a `PkiSecret` around until revoke/clear has run
pub const FINALIZER: &str = "secrets.octopilot.io/finalizer";

/// Field manager used for server-side patches
pub const FIELD_MANAGER: &str = "pki-secret-controller";

/// Label marking destination Secrets written by the controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "pki-secret-controller";

/// Provenance annotations identifying the producing resource
pub const OWNER_API_VERSION_ANNOTATION: &str = "secrets.octopilot.io/owner-api-version";
pub const OWNER_KIND_ANNOTATION: &str = "secrets.octopilot.io/owner-kind";
pub const OWNER_NAME_ANNOTATION: &str = "secrets.octopilot.io/owner-name";

/// Default Vault address when `VAULT_ADDR` is unset
pub const DEFAULT_VAULT_ADDR: &str = "http://127.0.0.1:8200";

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Default timeout for a single credential authority request (seconds)
pub const DEFAULT_AUTHORITY_TIMEOUT_SECS: u64 = 10;

/// Default timeout for a single destination store request (seconds)
pub const DEFAULT_DESTINATION_TIMEOUT_SECS: u64 = 10;

/// Default Fibonacci backoff bounds for transient reconcile failures (seconds)
pub const DEFAULT_BACKOFF_MIN_SECS: u64 = 1;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;

/// Default number of reconciles that may run at the same time
pub const DEFAULT_MAX_CONCURRENT_RECONCILIATIONS: usize = 10;

/// Default delay before restarting watch stream after unknown errors (seconds)
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Capacity of the reconcile completion broadcast channel
pub const COMPLETION_CHANNEL_CAPACITY: usize = 1024;

/// Lead time applied when a resource sets no expiry offset (seconds).
/// Keeps the renewal deadline strictly before the certificate's `notAfter`.
pub const MIN_RENEWAL_LEAD_SECS: u64 = 1;

/// Smallest delay used when scheduling a follow-up reconcile (milliseconds)
pub const MIN_REQUEUE_MS: u64 = 100;

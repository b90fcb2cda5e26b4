//! # Controller Configuration
//!
//! Controller-level settings loaded from environment variables.

use std::time::Duration;

/// Controller-level configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
/// Environment variables are populated from a ConfigMap using `envFrom` in the deployment.
#[derive(Clone)]
pub struct ControllerConfig {
    /// Vault server address (scheme, host and port)
    pub vault_addr: String,
    /// Static Vault token used instead of per-resource auth bindings (dev mode)
    pub vault_token: Option<String>,
    /// Auth binding used when a resource leaves `authRef` empty
    pub default_auth_ref: Option<String>,
    /// Timeout for a single credential authority request (seconds)
    pub authority_timeout_secs: u64,
    /// Timeout for a single destination store request (seconds)
    pub destination_timeout_secs: u64,
    /// Fibonacci backoff lower bound for transient failures (seconds)
    pub backoff_min_secs: u64,
    /// Fibonacci backoff upper bound for transient failures (seconds)
    pub backoff_max_secs: u64,
    /// Maximum concurrent reconciliations
    /// Limits how many resources can be reconciled simultaneously
    pub max_concurrent_reconciliations: usize,
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// Watch stream restart delay after unknown errors (seconds)
    pub watch_restart_delay_secs: u64,
    /// Global log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
}

impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("vault_addr", &self.vault_addr)
            .field("vault_token", &self.vault_token.as_ref().map(|_| "***"))
            .field("default_auth_ref", &self.default_auth_ref)
            .field("authority_timeout_secs", &self.authority_timeout_secs)
            .field("destination_timeout_secs", &self.destination_timeout_secs)
            .field("backoff_min_secs", &self.backoff_min_secs)
            .field("backoff_max_secs", &self.backoff_max_secs)
            .field(
                "max_concurrent_reconciliations",
                &self.max_concurrent_reconciliations,
            )
            .field("watch_namespace", &self.watch_namespace)
            .field("watch_restart_delay_secs", &self.watch_restart_delay_secs)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            vault_addr: DEFAULT_VAULT_ADDR.to_string(),
            vault_token: None,
            default_auth_ref: None,
            authority_timeout_secs: DEFAULT_AUTHORITY_TIMEOUT_SECS,
            destination_timeout_secs: DEFAULT_DESTINATION_TIMEOUT_SECS,
            backoff_min_secs: DEFAULT_BACKOFF_MIN_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            max_concurrent_reconciliations: DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            watch_namespace: None,
            watch_restart_delay_secs: DEFAULT_WATCH_RESTART_DELAY_SECS,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            vault_addr: env_var_or_default_str("VAULT_ADDR", DEFAULT_VAULT_ADDR),
            vault_token: env_var_non_empty("VAULT_TOKEN"),
            default_auth_ref: env_var_non_empty("DEFAULT_AUTH_REF"),
            authority_timeout_secs: env_var_or_default(
                "AUTHORITY_TIMEOUT_SECS",
                DEFAULT_AUTHORITY_TIMEOUT_SECS,
            ),
            destination_timeout_secs: env_var_or_default(
                "DESTINATION_TIMEOUT_SECS",
                DEFAULT_DESTINATION_TIMEOUT_SECS,
            ),
            backoff_min_secs: env_var_or_default("BACKOFF_MIN_SECS", DEFAULT_BACKOFF_MIN_SECS),
            backoff_max_secs: env_var_or_default("BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX_SECS),
            max_concurrent_reconciliations: env_var_or_default(
                "MAX_CONCURRENT_RECONCILIATIONS",
                DEFAULT_MAX_CONCURRENT_RECONCILIATIONS,
            ),
            watch_namespace: env_var_non_empty("WATCH_NAMESPACE"),
            watch_restart_delay_secs: env_var_or_default(
                "WATCH_RESTART_DELAY_SECS",
                DEFAULT_WATCH_RESTART_DELAY_SECS,
            ),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
        }
    }

    /// Get authority request timeout duration
    pub fn authority_timeout(&self) -> Duration {
        Duration::from_secs(self.authority_timeout_secs)
    }

    /// Get destination request timeout duration
    pub fn destination_timeout(&self) -> Duration {
        Duration::from_secs(self.destination_timeout_secs)
    }

    /// Get watch restart delay duration
    pub fn watch_restart_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_restart_delay_secs)
    }

    /// Whether logs should be emitted as JSON
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read environment variable, treating blank values as unset
fn env_var_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

//! # PkiSecret Status
//!
//! Status types for tracking issuance and reconciliation state.

use serde::{Deserialize, Serialize};

/// Phase reported once the destination holds the current certificate
pub const PHASE_ACTIVE: &str = "Active";

/// Phase reported when the last reconcile failed
pub const PHASE_FAILED: &str = "Failed";

/// Status of the PkiSecret resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PkiSecretStatus {
    /// Current phase of reconciliation
    /// Values: Active, Failed
    #[serde(default)]
    pub phase: Option<String>,
    /// Human-readable description of current state
    #[serde(default)]
    pub description: Option<String>,
    /// Serial number of the certificate currently in the destination
    #[serde(default)]
    pub serial_number: Option<String>,
    /// When the current certificate was issued (RFC3339)
    #[serde(default)]
    pub issued_at: Option<String>,
    /// Certificate `notAfter` (RFC3339)
    #[serde(default)]
    pub expiration: Option<String>,
    /// When the controller will renew the certificate (RFC3339)
    #[serde(default)]
    pub next_renewal_time: Option<String>,
    /// Last time a certificate replaced a previous one (RFC3339)
    #[serde(default)]
    pub last_rotation_time: Option<String>,
    /// Observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Message of the last failed reconcile, cleared on success
    #[serde(default)]
    pub last_error: Option<String>,
    /// Classification of the last failure
    #[serde(default)]
    pub error_kind: Option<ErrorKindStatus>,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Serialized failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub enum ErrorKindStatus {
    /// Retried with backoff
    Transient,
    /// Not retried until the resource changes
    Configuration,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

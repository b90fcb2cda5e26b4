//! # Response Types
//!
//! Vault response envelopes for the PKI secrets engine.

use serde::Deserialize;
use zeroize::Zeroizing;

/// Generic Vault response wrapper; payload lives under `data`
#[derive(Debug, Deserialize)]
pub struct VaultResponse<T> {
    pub data: T,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// `data` of a successful issue call
#[derive(Deserialize)]
pub struct IssueCertificateData {
    pub serial_number: String,
    pub certificate: String,
    pub private_key: Zeroizing<String>,
    #[serde(default)]
    pub private_key_type: Option<String>,
    #[serde(default)]
    pub issuing_ca: String,
    #[serde(default)]
    pub ca_chain: Option<Vec<String>>,
    /// Unix seconds
    pub expiration: i64,
}

impl std::fmt::Debug for IssueCertificateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueCertificateData")
            .field("serial_number", &self.serial_number)
            .field("private_key", &"***")
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Error envelope: `{"errors": ["..."]}`
#[derive(Debug, Default, Deserialize)]
pub struct VaultErrorResponse {
    #[serde(default)]
    pub errors: Vec<String>,
}

//! # PkiSecret Spec
//!
//! Main CRD specification types and default values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PkiSecret Custom Resource Definition
///
/// Declares a certificate to be issued from a Vault PKI mount and kept in sync
/// inside a Kubernetes Secret.
///
/// # Example
///
/// ```yaml
/// apiVersion: secrets.octopilot.io/v1beta1
/// kind: PkiSecret
/// metadata:
///   name: frontend-tls
///   namespace: default
/// spec:
///   authRef: vault-token
///   mount: pki
///   role: frontend
///   commonName: frontend.example.com
///   format: pem
///   revoke: true
///   clear: true
///   ttl: 15s
///   expiryOffset: 5s
///   destination:
///     name: frontend-tls
///     create: true
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "PkiSecret",
    group = "secrets.octopilot.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::PkiSecretStatus",
    shortname = "pkis",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Serial", "type":"string", "jsonPath":".status.serialNumber"}, {"name":"Expiration", "type":"string", "jsonPath":".status.expiration"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PkiSecretSpec {
    /// Name of the auth binding used to obtain a Vault token.
    /// Falls back to the controller's `DEFAULT_AUTH_REF` when empty.
    /// May be `name` (resource namespace) or `namespace/name`.
    #[serde(default)]
    pub auth_ref: Option<String>,
    /// Vault enterprise namespace, sent as `X-Vault-Namespace`
    #[serde(default)]
    pub namespace: Option<String>,
    /// PKI secrets engine mount path (e.g. `pki` or `pki_int`)
    pub mount: String,
    /// PKI role to issue against
    #[serde(alias = "name")]
    pub role: String,
    /// Requested certificate common name
    pub common_name: String,
    /// Additional DNS subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,
    /// IP subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_sans: Vec<String>,
    /// URI subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uri_sans: Vec<String>,
    /// Leave the common name out of the DNS/email SANs
    #[serde(default)]
    pub exclude_cn_from_sans: bool,
    /// Encoding of the returned certificate material
    #[serde(default)]
    pub format: CertificateFormat,
    /// Revoke superseded certificates on rotation and the current one on delete
    #[serde(default)]
    pub revoke: bool,
    /// Clear the destination when this resource is deleted
    #[serde(default)]
    pub clear: bool,
    /// Lead time before expiry at which the certificate is renewed.
    /// Format: duration string (e.g. "5s", "1h30m"). Must be shorter than the TTL.
    #[serde(default)]
    pub expiry_offset: Option<String>,
    /// Requested certificate lifetime. Format: duration string (e.g. "15s", "720h").
    /// When unset the role's default TTL applies.
    #[serde(default)]
    pub ttl: Option<String>,
    /// Where issued material is written
    pub destination: DestinationRef,
}

/// Output encoding requested from the PKI engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CertificateFormat {
    #[default]
    Pem,
    Der,
    PemBundle,
}

impl CertificateFormat {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateFormat::Pem => "pem",
            CertificateFormat::Der => "der",
            CertificateFormat::PemBundle => "pem_bundle",
        }
    }
}

/// Destination Secret settings
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRef {
    /// Secret name in the resource namespace
    pub name: String,
    /// Create (and own) the Secret when it does not exist.
    /// When false the Secret must already exist and is never created.
    #[serde(default)]
    pub create: bool,
    /// Labels merged into the destination Secret
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations merged into the destination Secret
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

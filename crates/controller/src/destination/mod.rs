//! # Destination Store
//!
//! Key/value containers that receive issued certificate material.
//!
//! A destination is either **owned** (created by the controller because the
//! resource set `create: true`) or **existing** (pre-created by someone else,
//! written into but never created or removed by the controller).
//!
//! ## Implementations
//!
//! - [`MemoryDestinationStore`] - in-process store for dry runs and tests
//! - [`KubeSecretStore`] - Kubernetes `Secret` objects

mod memory;
mod secret;

pub use memory::MemoryDestinationStore;
pub use secret::KubeSecretStore;

use crate::authority::IssuedCertificate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::Zeroizing;

/// Data keys written into a destination
pub mod keys {
    pub const CERTIFICATE: &str = "certificate";
    pub const PRIVATE_KEY: &str = "private_key";
    pub const PRIVATE_KEY_TYPE: &str = "private_key_type";
    pub const ISSUING_CA: &str = "issuing_ca";
    pub const CA_CHAIN: &str = "ca_chain";
    pub const SERIAL_NUMBER: &str = "serial_number";
    pub const EXPIRATION: &str = "expiration";
    pub const TLS_CRT: &str = "tls.crt";
    pub const TLS_KEY: &str = "tls.key";

    pub const ALL: [&str; 9] = [
        CERTIFICATE,
        PRIVATE_KEY,
        PRIVATE_KEY_TYPE,
        ISSUING_CA,
        CA_CHAIN,
        SERIAL_NUMBER,
        EXPIRATION,
        TLS_CRT,
        TLS_KEY,
    ];
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination {namespace}/{name} does not exist")]
    NotFound { namespace: String, name: String },
    #[error("destination {namespace}/{name} already exists and is not owned by this resource")]
    Exists { namespace: String, name: String },
    #[error("access to destination {namespace}/{name} denied: {reason}")]
    Denied {
        namespace: String,
        name: String,
        reason: String,
    },
    #[error("destination store unavailable: {0}")]
    Unavailable(String),
}

impl DestinationError {
    pub fn not_found(name: &str, namespace: &str) -> Self {
        DestinationError::NotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn exists(name: &str, namespace: &str) -> Self {
        DestinationError::Exists {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// RBAC may be granted later and the store may come back; missing or
    /// foreign destinations need the resource to change
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DestinationError::Denied { .. } | DestinationError::Unavailable(_)
        )
    }
}

/// Identity of the resource that produced a destination's contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// `group/version` of the producing resource
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Option<String>,
}

impl Provenance {
    /// Same producing resource; UIDs only compared when both sides know them
    pub fn same_producer(&self, other: &Provenance) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && match (&self.uid, &other.uid) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Certificate material plus metadata, as stored in a destination
#[derive(Clone, Default)]
pub struct DestinationRecord {
    pub serial_number: String,
    pub certificate: String,
    pub private_key: Zeroizing<String>,
    pub private_key_type: Option<String>,
    pub issuing_ca: String,
    pub ca_chain: Vec<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub provenance: Option<Provenance>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl std::fmt::Debug for DestinationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRecord")
            .field("serial_number", &self.serial_number)
            .field("private_key", &"***")
            .field("expiration", &self.expiration)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl DestinationRecord {
    /// Copy issued material into a record; the record owns its own copy
    pub fn from_issued(issued: &IssuedCertificate, provenance: Provenance) -> Self {
        Self {
            serial_number: issued.serial_number.clone(),
            certificate: issued.certificate.clone(),
            private_key: issued.private_key.clone(),
            private_key_type: issued.private_key_type.clone(),
            issuing_ca: issued.issuing_ca.clone(),
            ca_chain: issued.ca_chain.clone(),
            expiration: Some(issued.not_after),
            provenance: Some(provenance),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(
        mut self,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> Self {
        self.labels = labels;
        self.annotations = annotations;
        self
    }

    /// Whether the resource named by `provenance` produced this destination
    pub fn produced_by(&self, provenance: &Provenance) -> bool {
        self.provenance
            .as_ref()
            .is_some_and(|existing| existing.same_producer(provenance))
    }

    /// No certificate present (fresh or cleared container)
    pub fn is_empty(&self) -> bool {
        self.serial_number.is_empty()
    }

    /// Flatten into the data keys stored in the destination
    pub fn to_data(&self) -> BTreeMap<String, String> {
        let chain = self.ca_chain.join("\n");
        let tls_crt = if chain.is_empty() || self.certificate.is_empty() {
            self.certificate.clone()
        } else {
            format!("{}\n{}", self.certificate, chain)
        };

        BTreeMap::from([
            (keys::CERTIFICATE.to_string(), self.certificate.clone()),
            (keys::PRIVATE_KEY.to_string(), self.private_key.to_string()),
            (
                keys::PRIVATE_KEY_TYPE.to_string(),
                self.private_key_type.clone().unwrap_or_default(),
            ),
            (keys::ISSUING_CA.to_string(), self.issuing_ca.clone()),
            (keys::CA_CHAIN.to_string(), chain),
            (keys::SERIAL_NUMBER.to_string(), self.serial_number.clone()),
            (
                keys::EXPIRATION.to_string(),
                self.expiration
                    .map(|e| e.timestamp().to_string())
                    .unwrap_or_default(),
            ),
            (keys::TLS_CRT.to_string(), tls_crt),
            (keys::TLS_KEY.to_string(), self.private_key.to_string()),
        ])
    }

    /// Rebuild from stored data keys; unknown keys are ignored
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| data.get(key).cloned().unwrap_or_default();
        Self {
            serial_number: get(keys::SERIAL_NUMBER),
            certificate: get(keys::CERTIFICATE),
            private_key: Zeroizing::new(get(keys::PRIVATE_KEY)),
            private_key_type: data
                .get(keys::PRIVATE_KEY_TYPE)
                .filter(|t| !t.is_empty())
                .cloned(),
            issuing_ca: get(keys::ISSUING_CA),
            ca_chain: split_chain(&get(keys::CA_CHAIN)),
            expiration: data
                .get(keys::EXPIRATION)
                .and_then(|e| e.parse::<i64>().ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            provenance: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Undo the newline join of `ca_chain`.
///
/// PEM entries span several lines, so they are split on their `-----END` line;
/// single-line entries (DER as base64) are split per line.
fn split_chain(joined: &str) -> Vec<String> {
    if !joined.contains("-----BEGIN ") {
        return joined
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
    }

    let mut chain = Vec::new();
    let mut block = String::new();
    for line in joined.lines() {
        if block.is_empty() && line.trim().is_empty() {
            continue;
        }
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(line);
        if line.starts_with("-----END ") {
            chain.push(std::mem::take(&mut block));
        }
    }
    if !block.trim().is_empty() {
        chain.push(block);
    }
    chain
}

/// What `clear` did to a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The container was deleted
    Removed,
    /// The container was kept with empty certificate fields
    Blanked,
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Read a destination; `Ok(None)` when it does not exist
    async fn read(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DestinationRecord>, DestinationError>;

    /// Write `record` into a destination.
    ///
    /// With `create_if_missing = false` an absent destination is a
    /// [`DestinationError::NotFound`] and is never created. With
    /// `create_if_missing = true` an absent destination is created and owned;
    /// a present one produced by someone else is [`DestinationError::Exists`].
    async fn write(
        &self,
        name: &str,
        namespace: &str,
        record: &DestinationRecord,
        create_if_missing: bool,
    ) -> Result<(), DestinationError>;

    /// Remove certificate data from a destination.
    ///
    /// The container is deleted only when `owner` is given and the destination
    /// was created for that owner; otherwise it is kept with empty fields.
    async fn clear(
        &self,
        name: &str,
        namespace: &str,
        owner: Option<&Provenance>,
    ) -> Result<ClearOutcome, DestinationError>;
}

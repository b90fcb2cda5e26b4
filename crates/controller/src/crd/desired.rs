use super::{PkiSecret, PkiSecretSpec, PkiSecretStatus, ResourceKey};
use crate::constants::{API_GROUP, API_VERSION, KIND};
use crate::destination::Provenance;
use chrono::{DateTime, Utc};

/// Desired state handed from the dispatcher to the reconciler.
///
/// A detached snapshot of a `PkiSecret`: the reconciler never sees the live
/// object, so coalesced updates replace the whole value.
#[derive(Debug, Clone)]
pub struct DesiredCertificate {
    pub key: ResourceKey,
    pub uid: Option<String>,
    pub generation: Option<i64>,
    pub spec: PkiSecretSpec,
    /// Certificate last reported in the resource status, used to adopt
    /// existing material after a controller restart
    pub observed: Option<ObservedCertificate>,
}

impl DesiredCertificate {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: PkiSecretSpec) -> Self {
        Self {
            key: ResourceKey::new(namespace, name),
            uid: None,
            generation: None,
            spec,
            observed: None,
        }
    }

    pub fn from_resource(obj: &PkiSecret) -> Self {
        Self {
            key: ResourceKey::from_object(obj),
            uid: obj.metadata.uid.clone(),
            generation: obj.metadata.generation,
            spec: obj.spec.clone(),
            observed: obj.status.as_ref().and_then(ObservedCertificate::from_status),
        }
    }

    #[must_use]
    pub fn with_observed(mut self, observed: ObservedCertificate) -> Self {
        self.observed = Some(observed);
        self
    }

    /// Metadata stamped on the destination so consumers can verify who wrote it
    pub fn provenance(&self) -> Provenance {
        Provenance {
            api_version: format!("{API_GROUP}/{API_VERSION}"),
            kind: KIND.to_string(),
            name: self.key.name.clone(),
            uid: self.uid.clone(),
        }
    }
}

/// Certificate identity persisted in the resource status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedCertificate {
    pub serial_number: String,
    pub issued_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    /// Resource generation the certificate was issued for
    pub generation: Option<i64>,
}

impl ObservedCertificate {
    /// Rebuild from status; `None` unless serial and both timestamps are present and valid
    pub fn from_status(status: &PkiSecretStatus) -> Option<Self> {
        let serial_number = status.serial_number.clone().filter(|s| !s.is_empty())?;
        let issued_at = parse_rfc3339(status.issued_at.as_deref()?)?;
        let expiration = parse_rfc3339(status.expiration.as_deref()?)?;
        Some(Self {
            serial_number,
            issued_at,
            expiration,
            generation: status.observed_generation,
        })
    }
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

//! # Lifecycle Tracking
//!
//! Per-certificate bookkeeping: which serial is current, when it was issued,
//! when it must be renewed, and which superseded serials still await revocation.
//!
//! Everything here is pure computation over timestamps handed in by the caller.
//! Exclusivity per [`ResourceKey`] comes from the dispatcher's single-flight
//! guarantee; the internal mutex only protects the map itself.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::constants::MIN_RENEWAL_LEAD_SECS;
use crate::crd::{CertificateFormat, ResourceKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("expiry offset {offset:?} must be shorter than the certificate TTL {ttl:?}")]
    OffsetExceedsTtl { offset: Duration, ttl: Duration },
    #[error("certificate expiration {expiration} is not after its issue time {issued_at}")]
    InvalidLifetime {
        issued_at: DateTime<Utc>,
        expiration: DateTime<Utc>,
    },
}

/// The parts of a desired state that determine what certificate is issued.
///
/// Two reconciles with equal parameters want the same certificate; any
/// difference forces an immediate renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceParameters {
    pub namespace: Option<String>,
    pub mount: String,
    pub role: String,
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub ip_sans: Vec<String>,
    pub uri_sans: Vec<String>,
    pub exclude_cn_from_sans: bool,
    pub format: CertificateFormat,
    /// Requested TTL; `None` defers to the role default
    pub ttl: Option<Duration>,
    pub expiry_offset: Duration,
}

/// A successful issuance as seen by the tracker
#[derive(Debug, Clone)]
pub struct Issuance {
    pub serial_number: String,
    pub issued_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub parameters: IssuanceParameters,
}

/// A superseded serial whose best-effort revoke has not succeeded yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRevocation {
    pub serial_number: String,
    pub mount: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub serial_number: String,
    pub issued_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    /// Requested TTL capped by what the authority actually granted
    pub ttl: Duration,
    pub expiry_offset: Duration,
    pub renewal_deadline: DateTime<Utc>,
    pub parameters: IssuanceParameters,
    pub pending_revocations: Vec<PendingRevocation>,
}

impl LifecycleRecord {
    /// Build a record, computing `renewal_deadline = issued_at + ttl - expiry_offset`.
    ///
    /// The deadline is always strictly before `expiration`. A zero offset is
    /// treated as a minimal lead so that renewal still happens before expiry.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::OffsetExceedsTtl`] when the offset does not fit inside
    /// the effective TTL, [`LifecycleError::InvalidLifetime`] when the authority
    /// returned an expiration at or before the issue time.
    pub fn new(issuance: Issuance) -> Result<Self, LifecycleError> {
        let (ttl, renewal_deadline) = renewal_deadline(
            issuance.issued_at,
            issuance.expiration,
            issuance.parameters.ttl,
            issuance.parameters.expiry_offset,
        )?;

        Ok(Self {
            serial_number: issuance.serial_number,
            issued_at: issuance.issued_at,
            expiration: issuance.expiration,
            ttl,
            expiry_offset: issuance.parameters.expiry_offset,
            renewal_deadline,
            parameters: issuance.parameters,
            pending_revocations: Vec::new(),
        })
    }

    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.renewal_deadline
    }

    /// Time left until the renewal deadline, zero once it has passed
    pub fn time_until_renewal(&self, now: DateTime<Utc>) -> Duration {
        (self.renewal_deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn revocation_pending(&self) -> bool {
        !self.pending_revocations.is_empty()
    }

    /// Revocation target for this record's own serial
    pub fn revocation(&self) -> PendingRevocation {
        PendingRevocation {
            serial_number: self.serial_number.clone(),
            mount: self.parameters.mount.clone(),
            namespace: self.parameters.namespace.clone(),
        }
    }
}

/// Effective TTL and renewal deadline for a certificate.
///
/// # Errors
///
/// See [`LifecycleRecord::new`].
pub fn renewal_deadline(
    issued_at: DateTime<Utc>,
    expiration: DateTime<Utc>,
    requested_ttl: Option<Duration>,
    expiry_offset: Duration,
) -> Result<(Duration, DateTime<Utc>), LifecycleError> {
    let lifetime = (expiration - issued_at)
        .to_std()
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or(LifecycleError::InvalidLifetime {
            issued_at,
            expiration,
        })?;

    let ttl = requested_ttl.map_or(lifetime, |requested| requested.min(lifetime));
    let lead = expiry_offset.max(Duration::from_secs(MIN_RENEWAL_LEAD_SECS));

    if lead >= ttl {
        return Err(LifecycleError::OffsetExceedsTtl {
            offset: expiry_offset,
            ttl,
        });
    }

    let active_window = chrono::Duration::from_std(ttl - lead).map_err(|_| {
        LifecycleError::InvalidLifetime {
            issued_at,
            expiration,
        }
    })?;

    Ok((ttl, issued_at + active_window))
}

/// Shared map of lifecycle records keyed by resource identity
#[derive(Debug, Clone, Default)]
pub struct LifecycleTracker {
    records: Arc<Mutex<HashMap<ResourceKey, LifecycleRecord>>>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<LifecycleRecord> {
        self.lock().get(key).cloned()
    }

    /// Compute and store a record for a fresh issuance.
    ///
    /// Pending revocations from the previous record carry over.
    ///
    /// # Errors
    ///
    /// See [`LifecycleRecord::new`]; nothing is stored on error.
    pub fn record(
        &self,
        key: &ResourceKey,
        issuance: Issuance,
    ) -> Result<LifecycleRecord, LifecycleError> {
        let record = LifecycleRecord::new(issuance)?;
        Ok(self.store(key, record))
    }

    /// Store a precomputed record, merging in pending revocations of the one it replaces
    pub fn store(&self, key: &ResourceKey, mut record: LifecycleRecord) -> LifecycleRecord {
        let mut records = self.lock();
        if let Some(previous) = records.remove(key) {
            for pending in previous.pending_revocations {
                if pending.serial_number != record.serial_number
                    && !record.pending_revocations.contains(&pending)
                {
                    record.pending_revocations.push(pending);
                }
            }
        }
        records.insert(key.clone(), record.clone());
        record
    }

    pub fn clear(&self, key: &ResourceKey) -> Option<LifecycleRecord> {
        self.lock().remove(key)
    }

    pub fn mark_revocation_pending(&self, key: &ResourceKey, revocation: PendingRevocation) {
        if let Some(record) = self.lock().get_mut(key) {
            if !record.pending_revocations.contains(&revocation) {
                record.pending_revocations.push(revocation);
            }
        }
    }

    pub fn resolve_revocation(&self, key: &ResourceKey, serial_number: &str) {
        if let Some(record) = self.lock().get_mut(key) {
            record
                .pending_revocations
                .retain(|pending| pending.serial_number != serial_number);
        }
    }

    /// Number of certificates currently tracked
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, LifecycleRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! In-process destination store.

use super::{ClearOutcome, DestinationError, DestinationRecord, DestinationStore, Provenance};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone)]
struct Entry {
    record: DestinationRecord,
    /// Set when the store created the destination on behalf of a resource
    created_for: Option<Provenance>,
}

/// Complete [`DestinationStore`] backed by a shared map.
///
/// Clones share state, so a test can keep a handle while the reconciler owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestinationStore {
    entries: Arc<Mutex<HashMap<(String, String), Entry>>>,
    writes: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    write_failure: Arc<Mutex<Option<DestinationError>>>,
}

impl MemoryDestinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an empty destination that belongs to someone else
    pub fn insert_existing(&self, name: &str, namespace: &str) {
        self.lock().insert(
            (namespace.to_string(), name.to_string()),
            Entry {
                record: DestinationRecord::default(),
                created_for: None,
            },
        );
    }

    /// Stored record, reporting the creating resource as provenance even after blanking
    pub fn get(&self, name: &str, namespace: &str) -> Option<DestinationRecord> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|entry| DestinationRecord {
                provenance: entry
                    .created_for
                    .clone()
                    .or_else(|| entry.record.provenance.clone()),
                ..entry.record.clone()
            })
    }

    pub fn contains(&self, name: &str, namespace: &str) -> bool {
        self.lock()
            .contains_key(&(namespace.to_string(), name.to_string()))
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate an outage: every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `write` with `error`; reads are unaffected
    pub fn fail_next_write(&self, error: DestinationError) {
        *self
            .write_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn check_available(&self) -> Result<(), DestinationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DestinationError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DestinationStore for MemoryDestinationStore {
    async fn read(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DestinationRecord>, DestinationError> {
        self.check_available()?;
        Ok(self.get(name, namespace))
    }

    async fn write(
        &self,
        name: &str,
        namespace: &str,
        record: &DestinationRecord,
        create_if_missing: bool,
    ) -> Result<(), DestinationError> {
        self.check_available()?;
        if let Some(error) = self
            .write_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(error);
        }
        let mut entries = self.lock();
        let key = (namespace.to_string(), name.to_string());

        let Some(entry) = entries.get_mut(&key) else {
            if !create_if_missing {
                return Err(DestinationError::not_found(name, namespace));
            }
            entries.insert(
                key,
                Entry {
                    record: record.clone(),
                    created_for: record.provenance.clone(),
                },
            );
            self.writes.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        };

        if create_if_missing && !produced_by(entry, record.provenance.as_ref()) {
            return Err(DestinationError::exists(name, namespace));
        }
        let mut labels = std::mem::take(&mut entry.record.labels);
        let mut annotations = std::mem::take(&mut entry.record.annotations);
        labels.extend(record.labels.clone());
        annotations.extend(record.annotations.clone());
        entry.record = DestinationRecord {
            labels,
            annotations,
            ..record.clone()
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(
        &self,
        name: &str,
        namespace: &str,
        owner: Option<&Provenance>,
    ) -> Result<ClearOutcome, DestinationError> {
        self.check_available()?;
        let mut entries = self.lock();
        let key = (namespace.to_string(), name.to_string());

        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| DestinationError::not_found(name, namespace))?;

        let owned = match (owner, entry.created_for.as_ref()) {
            (Some(owner), Some(created_for)) => owner.same_producer(created_for),
            _ => false,
        };
        if owned {
            entries.remove(&key);
            return Ok(ClearOutcome::Removed);
        }

        entry.record = DestinationRecord {
            labels: std::mem::take(&mut entry.record.labels),
            annotations: std::mem::take(&mut entry.record.annotations),
            ..DestinationRecord::default()
        };
        Ok(ClearOutcome::Blanked)
    }
}

/// A present destination may be overwritten in create mode only by the resource that produced it
fn produced_by(entry: &Entry, provenance: Option<&Provenance>) -> bool {
    let Some(provenance) = provenance else {
        return false;
    };
    entry
        .created_for
        .as_ref()
        .or(entry.record.provenance.as_ref())
        .is_some_and(|existing| existing.same_producer(provenance))
}

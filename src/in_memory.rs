use crate::model::DataRecord;
use crate::persistence::PersistenceStore;
use crate::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

#[cfg(feature = "tracing")]
use tracing::debug;

/// Process-local persistence, for tests and local runs.
///
/// The claim condition is evaluated under the same lock as the write, which
/// gives the atomicity the remote stores get from conditional expressions.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceStore {
    records: Mutex<HashMap<String, DataRecord>>,
}

impl InMemoryPersistenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Current record for a key, without going through the store contract.
    pub fn snapshot(&self, idempotency_key: &str) -> Option<DataRecord> {
        self.lock().get(idempotency_key).cloned()
    }

    /// Insert a record unconditionally.
    pub fn insert(&self, record: DataRecord) {
        self.lock().insert(record.idempotency_key.clone(), record);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DataRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PersistenceStore for InMemoryPersistenceStore {
    async fn put_record(&self, record: &DataRecord, now: SystemTime) -> Result<(), Error> {
        let mut records = self.lock();
        if let Some(existing) = records.get(&record.idempotency_key) {
            if !existing.is_reclaimable(now) {
                debug!(
                    "Failed to put record for already existing idempotency key: {}",
                    record.idempotency_key
                );
                return Err(Error::ItemAlreadyExists(record.idempotency_key.clone()));
            }
        }
        debug!("Putting record for idempotency key: {}", record.idempotency_key);
        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn get_record(&self, idempotency_key: &str) -> Result<DataRecord, Error> {
        self.lock()
            .get(idempotency_key)
            .cloned()
            .ok_or_else(|| Error::ItemNotFound(idempotency_key.to_string()))
    }

    async fn update_record(&self, record: &DataRecord) -> Result<(), Error> {
        debug!("Updating record for idempotency key: {}", record.idempotency_key);
        let mut records = self.lock();
        let entry = records
            .entry(record.idempotency_key.clone())
            .or_insert_with(|| record.clone());
        entry.status = record.status;
        entry.expiry_timestamp = record.expiry_timestamp;
        entry.response_data = record.response_data.clone();
        if record.payload_hash.is_some() {
            entry.payload_hash = record.payload_hash.clone();
        }
        Ok(())
    }

    async fn delete_record(&self, idempotency_key: &str) -> Result<(), Error> {
        debug!("Deleting record for idempotency key: {}", idempotency_key);
        self.lock().remove(idempotency_key);
        Ok(())
    }
}

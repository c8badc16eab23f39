use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::clock::{epoch_millis, epoch_seconds};
use crate::config::IdempotencyConfig;
use crate::key::{hash_value, is_missing_key, HashFunction, KeyExtraction};
use crate::model::DataRecord;
use crate::persistence::PersistenceStore;
use crate::Error;

#[cfg(feature = "tracing")]
use tracing::{debug, warn};

/// Payload-aware view over a [`PersistenceStore`].
///
/// Turns invocation payloads into hashed idempotency keys and validation
/// hashes, and computes expiry timestamps.
#[derive(Clone)]
pub struct RecordStore {
    store: Arc<dyn PersistenceStore>,
    function_name: String,
    event_key: KeyExtraction,
    payload_validation: Option<KeyExtraction>,
    throw_on_no_idempotency_key: bool,
    hash_function: HashFunction,
    expiration: Duration,
}

impl RecordStore {
    pub fn new(store: Arc<dyn PersistenceStore>, config: &IdempotencyConfig) -> Self {
        Self {
            store,
            function_name: config.function_name.clone(),
            event_key: config.event_key.clone(),
            payload_validation: config.payload_validation.clone(),
            throw_on_no_idempotency_key: config.throw_on_no_idempotency_key,
            hash_function: config.hash_function,
            expiration: config.expiration,
        }
    }

    pub fn payload_validation_enabled(&self) -> bool {
        self.payload_validation.is_some()
    }

    /// `{function_name}#{hash}` for the selected part of the payload.
    ///
    /// `None` when the payload carries no key and missing keys are tolerated:
    /// such invocations are not idempotent and nothing is persisted for them.
    pub fn idempotency_key(&self, payload: &Value) -> Result<Option<String>, Error> {
        let selected = self.event_key.extract(payload);
        if is_missing_key(&selected) {
            if self.throw_on_no_idempotency_key {
                return Err(Error::KeyMissing);
            }
            warn!(
                event_key = ?self.event_key,
                "No data found to create a hashed idempotency key"
            );
            return Ok(None);
        }

        let hash = hash_value(self.hash_function, &selected);
        Ok(Some(format!("{}#{}", self.function_name, hash)))
    }

    fn payload_hash(&self, payload: &Value) -> Option<String> {
        self.payload_validation
            .as_ref()
            .map(|validation| hash_value(self.hash_function, &validation.extract(payload)))
    }

    fn expiry_timestamp(&self, now: SystemTime) -> Result<i64, Error> {
        now.checked_add(self.expiration)
            .map(epoch_seconds)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "Expiration {:?} is out of range for the current time",
                    self.expiration
                ))
            })
    }

    pub async fn save_in_progress(
        &self,
        payload: &Value,
        now: SystemTime,
        remaining_time: Option<Duration>,
    ) -> Result<(), Error> {
        let Some(idempotency_key) = self.idempotency_key(payload)? else {
            return Ok(());
        };

        let in_progress_expiry = remaining_time
            .map(|remaining| {
                now.checked_add(remaining).map(epoch_millis).ok_or_else(|| {
                    Error::Configuration(format!(
                        "Remaining time {remaining:?} is out of range for the current time"
                    ))
                })
            })
            .transpose()?;
        let record = DataRecord::in_progress(
            idempotency_key,
            self.expiry_timestamp(now)?,
            in_progress_expiry,
            self.payload_hash(payload),
        );

        debug!(
            "Saving in progress record for idempotency key: {}",
            record.idempotency_key
        );
        self.store.put_record(&record, now).await
    }

    pub async fn save_success(
        &self,
        payload: &Value,
        response_data: String,
        now: SystemTime,
    ) -> Result<(), Error> {
        let Some(idempotency_key) = self.idempotency_key(payload)? else {
            return Ok(());
        };

        let record = DataRecord::completed(
            idempotency_key,
            self.expiry_timestamp(now)?,
            response_data,
            self.payload_hash(payload),
        );

        debug!(
            "Function successfully executed. Saving record to persistence store with idempotency key: {}",
            record.idempotency_key
        );
        self.store.update_record(&record).await
    }

    /// Fetch the record for a payload, checking the validation hash when enabled.
    ///
    /// `Ok(None)` when the payload carries no key.
    pub async fn get_record(&self, payload: &Value) -> Result<Option<DataRecord>, Error> {
        let Some(idempotency_key) = self.idempotency_key(payload)? else {
            return Ok(None);
        };

        let record = self.store.get_record(&idempotency_key).await?;
        self.validate_payload(payload, &record)?;
        Ok(Some(record))
    }

    pub async fn delete_record(&self, payload: &Value) -> Result<(), Error> {
        let Some(idempotency_key) = self.idempotency_key(payload)? else {
            return Ok(());
        };

        debug!(
            "Clearing in progress record in persistence store for idempotency key: {}",
            idempotency_key
        );
        self.store.delete_record(&idempotency_key).await
    }

    fn validate_payload(&self, payload: &Value, record: &DataRecord) -> Result<(), Error> {
        let Some(expected) = self.payload_hash(payload) else {
            return Ok(());
        };
        match record.payload_hash.as_deref() {
            Some(stored) if stored == expected => Ok(()),
            _ => Err(Error::Validation),
        }
    }
}

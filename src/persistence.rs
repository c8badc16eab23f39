use crate::model::DataRecord;
use crate::Error;
use async_trait::async_trait;
use std::time::SystemTime;

/// Key-value ledger of idempotency records with conditional writes.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Atomically create a record, unless a live one already holds its key.
    ///
    /// An existing record is overwritten when its expiry is in the past, or when
    /// it is in progress and its in-progress expiry is in the past. Otherwise
    /// fails with [`Error::ItemAlreadyExists`].
    async fn put_record(&self, record: &DataRecord, now: SystemTime) -> Result<(), Error>;

    /// Fails with [`Error::ItemNotFound`] when no record exists.
    async fn get_record(&self, idempotency_key: &str) -> Result<DataRecord, Error>;

    /// Overwrite status, expiry, response data and validation hash in one write
    async fn update_record(&self, record: &DataRecord) -> Result<(), Error>;

    async fn delete_record(&self, idempotency_key: &str) -> Result<(), Error>;
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::clock::{epoch_millis, epoch_seconds};
use crate::Error;

/// Status written to the persistence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    #[serde(rename = "INPROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "INPROGRESS",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(Error::Decoding(format!(
                "Unknown idempotency record status '{other}'"
            ))),
        }
    }
}

/// Status of a record as observed at a given instant.
///
/// `Expired` is never persisted: it is derived from the expiry timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    InProgress,
    Completed,
    Expired,
}

impl From<RecordStatus> for Status {
    fn from(status: RecordStatus) -> Self {
        match status {
            RecordStatus::InProgress => Status::InProgress,
            RecordStatus::Completed => Status::Completed,
        }
    }
}

/// One entry of the idempotency ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub idempotency_key: String,
    pub status: RecordStatus,
    /// Epoch seconds after which the record may be overwritten. `0` never expires.
    pub expiry_timestamp: i64,
    /// Epoch milliseconds after which an in-progress claim is considered abandoned.
    pub in_progress_expiry_timestamp: Option<i64>,
    pub response_data: Option<String>,
    pub payload_hash: Option<String>,
}

impl DataRecord {
    pub fn in_progress(
        idempotency_key: String,
        expiry_timestamp: i64,
        in_progress_expiry_timestamp: Option<i64>,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key,
            status: RecordStatus::InProgress,
            expiry_timestamp,
            in_progress_expiry_timestamp,
            response_data: None,
            payload_hash,
        }
    }

    pub fn completed(
        idempotency_key: String,
        expiry_timestamp: i64,
        response_data: String,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key,
            status: RecordStatus::Completed,
            expiry_timestamp,
            in_progress_expiry_timestamp: None,
            response_data: Some(response_data),
            payload_hash,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiry_timestamp != 0 && epoch_seconds(now) > self.expiry_timestamp
    }

    pub fn is_in_progress_expired(&self, now: SystemTime) -> bool {
        self.in_progress_expiry_timestamp
            .is_some_and(|expiry| expiry < epoch_millis(now))
    }

    /// Whether a new claim may overwrite this record.
    pub fn is_reclaimable(&self, now: SystemTime) -> bool {
        self.expiry_timestamp < epoch_seconds(now)
            || (self.status == RecordStatus::InProgress && self.is_in_progress_expired(now))
    }

    pub fn status(&self, now: SystemTime) -> Status {
        if self.is_expired(now) {
            Status::Expired
        } else {
            self.status.into()
        }
    }
}

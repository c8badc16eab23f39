use crate::clock::{epoch_millis, epoch_seconds};
use crate::error::Error;
use crate::model::{DataRecord, RecordStatus};
use crate::persistence::PersistenceStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::SystemTime;

#[cfg(feature = "tracing")]
use tracing::debug;

// Claims the key unless a live record holds it. Nil reply on conflict.
const CLAIM_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local now_millis = tonumber(ARGV[2])
local expiry_attr, status_attr, in_progress_expiry_attr = ARGV[3], ARGV[4], ARGV[5]
local expiry_timestamp = tonumber(ARGV[6])

if redis.call('EXISTS', key) == 1 then
  local expiry = tonumber(redis.call('HGET', key, expiry_attr))
  local status = redis.call('HGET', key, status_attr)
  local in_progress_expiry = tonumber(redis.call('HGET', key, in_progress_expiry_attr))
  local expired = expiry ~= nil and expiry < now
  local timed_out = status == 'INPROGRESS' and in_progress_expiry ~= nil and in_progress_expiry < now_millis
  if not expired and not timed_out then
    return false
  end
  redis.call('DEL', key)
end

redis.call('HSET', key, unpack(ARGV, 7))
redis.call('EXPIREAT', key, expiry_timestamp)
return 1
"#;

/// Field names of the hash holding an idempotency record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashLayout {
    pub key_prefix: String,
    pub key_attr: String,
    pub expiry_attr: String,
    pub in_progress_expiry_attr: String,
    pub status_attr: String,
    pub data_attr: String,
    pub validation_attr: String,
}

impl Default for HashLayout {
    fn default() -> Self {
        Self {
            key_prefix: "idempotency".to_string(),
            key_attr: "id".to_string(),
            expiry_attr: "expiration".to_string(),
            in_progress_expiry_attr: "in-progress-expiration".to_string(),
            status_attr: "status".to_string(),
            data_attr: "data".to_string(),
            validation_attr: "validation".to_string(),
        }
    }
}

impl HashLayout {
    /// `{prefix:key_attr:idempotency_key}`. The braces make the whole key a
    /// cluster hash tag.
    pub fn redis_key(&self, idempotency_key: &str) -> String {
        format!(
            "{{{}:{}:{}}}",
            self.key_prefix, self.key_attr, idempotency_key
        )
    }

    /// Hash field names carry the hash key so they land in its slot
    pub fn field(&self, hash_key: &str, attr: &str) -> String {
        format!("{hash_key}:{attr}")
    }

    fn claim_fields(&self, hash_key: &str, record: &DataRecord) -> Vec<(String, String)> {
        let mut fields = vec![
            (hash_key.to_string(), record.idempotency_key.clone()),
            (
                self.field(hash_key, &self.status_attr),
                record.status.as_str().to_string(),
            ),
            (
                self.field(hash_key, &self.expiry_attr),
                record.expiry_timestamp.to_string(),
            ),
        ];
        if let Some(in_progress_expiry) = record.in_progress_expiry_timestamp {
            fields.push((
                self.field(hash_key, &self.in_progress_expiry_attr),
                in_progress_expiry.to_string(),
            ));
        }
        if let Some(payload_hash) = &record.payload_hash {
            fields.push((
                self.field(hash_key, &self.validation_attr),
                payload_hash.clone(),
            ));
        }
        fields
    }

    fn decode(
        &self,
        idempotency_key: &str,
        mut fields: HashMap<String, String>,
    ) -> Result<DataRecord, Error> {
        let hash_key = self.redis_key(idempotency_key);
        let mut take = |attr: &str| fields.remove(&self.field(&hash_key, attr));

        let status = take(&self.status_attr)
            .ok_or_else(|| Error::Decoding(format!("Missing '{}' field", self.status_attr)))?
            .parse::<RecordStatus>()?;
        let expiry_timestamp = take(&self.expiry_attr)
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| {
                Error::Decoding(format!("Missing or invalid '{}' field", self.expiry_attr))
            })?;
        let in_progress_expiry_timestamp =
            take(&self.in_progress_expiry_attr).and_then(|v| v.parse::<i64>().ok());
        let response_data = take(&self.data_attr);
        let payload_hash = take(&self.validation_attr);

        Ok(DataRecord {
            idempotency_key: idempotency_key.to_string(),
            status,
            expiry_timestamp,
            in_progress_expiry_timestamp,
            response_data,
            payload_hash,
        })
    }
}

/// Redis-backed persistence implementation.
///
/// Records are hashes expiring with the record itself. Claims run as a Lua
/// script so the condition check and the write are atomic.
pub struct RedisPersistenceStore {
    connection: MultiplexedConnection,
    layout: HashLayout,
    claim: redis::Script,
}

impl RedisPersistenceStore {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self::with_layout(connection, HashLayout::default())
    }

    pub fn with_layout(connection: MultiplexedConnection, layout: HashLayout) -> Self {
        Self {
            connection,
            layout,
            claim: redis::Script::new(CLAIM_SCRIPT),
        }
    }

    /// Connect to the server at `url`, e.g. `redis://127.0.0.1:6379`
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(connection))
    }

    pub fn layout(&self) -> &HashLayout {
        &self.layout
    }
}

#[async_trait]
impl PersistenceStore for RedisPersistenceStore {
    async fn put_record(&self, record: &DataRecord, now: SystemTime) -> Result<(), Error> {
        let layout = &self.layout;
        let key = layout.redis_key(&record.idempotency_key);
        debug!("Putting record for idempotency key: {}", record.idempotency_key);

        let mut invocation = self.claim.key(&key);
        invocation
            .arg(epoch_seconds(now))
            .arg(epoch_millis(now))
            .arg(layout.field(&key, &layout.expiry_attr))
            .arg(layout.field(&key, &layout.status_attr))
            .arg(layout.field(&key, &layout.in_progress_expiry_attr))
            .arg(record.expiry_timestamp);
        for (field, value) in layout.claim_fields(&key, record) {
            invocation.arg(field).arg(value);
        }

        let mut connection = self.connection.clone();
        let claimed: Option<i64> = invocation.invoke_async(&mut connection).await?;
        match claimed {
            Some(_) => Ok(()),
            None => {
                debug!(
                    "Failed to put record for already existing idempotency key: {}",
                    record.idempotency_key
                );
                Err(Error::ItemAlreadyExists(record.idempotency_key.clone()))
            }
        }
    }

    async fn get_record(&self, idempotency_key: &str) -> Result<DataRecord, Error> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection
            .hgetall(self.layout.redis_key(idempotency_key))
            .await?;

        if fields.is_empty() {
            return Err(Error::ItemNotFound(idempotency_key.to_string()));
        }
        self.layout.decode(idempotency_key, fields)
    }

    async fn update_record(&self, record: &DataRecord) -> Result<(), Error> {
        let layout = &self.layout;
        let key = layout.redis_key(&record.idempotency_key);
        debug!("Updating record for idempotency key: {}", record.idempotency_key);

        let mut fields = vec![
            (
                layout.field(&key, &layout.data_attr),
                record.response_data.clone().unwrap_or_default(),
            ),
            (
                layout.field(&key, &layout.expiry_attr),
                record.expiry_timestamp.to_string(),
            ),
            (
                layout.field(&key, &layout.status_attr),
                record.status.as_str().to_string(),
            ),
        ];
        if let Some(payload_hash) = &record.payload_hash {
            fields.push((
                layout.field(&key, &layout.validation_attr),
                payload_hash.clone(),
            ));
        }

        let mut connection = self.connection.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire_at(&key, record.expiry_timestamp)
            .ignore()
            .query_async(&mut connection)
            .await?;

        Ok(())
    }

    async fn delete_record(&self, idempotency_key: &str) -> Result<(), Error> {
        debug!("Deleting record for idempotency key: {}", idempotency_key);

        let mut connection = self.connection.clone();
        let _: () = connection
            .del(self.layout.redis_key(idempotency_key))
            .await?;
        Ok(())
    }
}

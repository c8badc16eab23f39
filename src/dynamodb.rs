use crate::clock::{epoch_millis, epoch_seconds};
use crate::config::LAMBDA_FUNCTION_NAME_ENV;
use crate::error::Error;
use crate::model::{DataRecord, RecordStatus};
use crate::persistence::PersistenceStore;
use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use std::collections::HashMap;
use std::time::SystemTime;

#[cfg(feature = "tracing")]
use tracing::debug;

const PUT_CONDITION: &str = "attribute_not_exists(#id) OR #expiry < :now OR \
     (#status = :inprogress AND attribute_exists(#in_progress_expiry) AND #in_progress_expiry < :now_in_millis)";

/// Table layout of idempotency records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub key_attr: String,
    /// Partition key value used when records are addressed by sort key
    pub static_pk_value: String,
    pub sort_key_attr: Option<String>,
    pub expiry_attr: String,
    pub in_progress_expiry_attr: String,
    pub status_attr: String,
    pub data_attr: String,
    pub validation_attr: String,
}

impl Default for TableLayout {
    fn default() -> Self {
        let function_name = std::env::var(LAMBDA_FUNCTION_NAME_ENV).unwrap_or_default();
        Self {
            key_attr: "id".to_string(),
            static_pk_value: format!("idempotency#{function_name}"),
            sort_key_attr: None,
            expiry_attr: "expiration".to_string(),
            in_progress_expiry_attr: "in_progress_expiration".to_string(),
            status_attr: "status".to_string(),
            data_attr: "data".to_string(),
            validation_attr: "validation".to_string(),
        }
    }
}

impl TableLayout {
    /// Primary key of the item holding `idempotency_key`
    pub fn key(&self, idempotency_key: &str) -> HashMap<String, AttributeValue> {
        let mut key = HashMap::new();
        match &self.sort_key_attr {
            Some(sort_key_attr) => {
                key.insert(
                    self.key_attr.clone(),
                    AttributeValue::S(self.static_pk_value.clone()),
                );
                key.insert(
                    sort_key_attr.clone(),
                    AttributeValue::S(idempotency_key.to_string()),
                );
            }
            None => {
                key.insert(
                    self.key_attr.clone(),
                    AttributeValue::S(idempotency_key.to_string()),
                );
            }
        }
        key
    }

    /// Item written when claiming a key. Response data is never part of a claim.
    pub fn encode_claim(&self, record: &DataRecord) -> HashMap<String, AttributeValue> {
        let mut item = self.key(&record.idempotency_key);
        item.insert(
            self.expiry_attr.clone(),
            AttributeValue::N(record.expiry_timestamp.to_string()),
        );
        item.insert(
            self.status_attr.clone(),
            AttributeValue::S(record.status.as_str().to_string()),
        );
        if let Some(in_progress_expiry) = record.in_progress_expiry_timestamp {
            item.insert(
                self.in_progress_expiry_attr.clone(),
                AttributeValue::N(in_progress_expiry.to_string()),
            );
        }
        if let Some(payload_hash) = &record.payload_hash {
            item.insert(
                self.validation_attr.clone(),
                AttributeValue::S(payload_hash.clone()),
            );
        }
        item
    }

    /// Decode a DynamoDB item into a DataRecord
    pub fn decode(&self, mut item: HashMap<String, AttributeValue>) -> Result<DataRecord, Error> {
        let key_attr = self.sort_key_attr.as_ref().unwrap_or(&self.key_attr);

        let idempotency_key = item
            .remove(key_attr)
            .and_then(|v| v.as_s().ok().cloned())
            .ok_or_else(|| Error::Decoding(format!("Missing '{key_attr}' field")))?;

        let status = item
            .remove(&self.status_attr)
            .and_then(|v| v.as_s().ok().cloned())
            .ok_or_else(|| Error::Decoding(format!("Missing '{}' field", self.status_attr)))?
            .parse::<RecordStatus>()?;

        let expiry_timestamp = item
            .remove(&self.expiry_attr)
            .and_then(|v| v.as_n().ok().and_then(|s| s.parse::<i64>().ok()))
            .ok_or_else(|| {
                Error::Decoding(format!("Missing or invalid '{}' field", self.expiry_attr))
            })?;

        let in_progress_expiry_timestamp = item
            .remove(&self.in_progress_expiry_attr)
            .and_then(|v| v.as_n().ok().and_then(|s| s.parse::<i64>().ok()));

        let response_data = item
            .remove(&self.data_attr)
            .and_then(|v| v.as_s().ok().cloned());

        let payload_hash = item
            .remove(&self.validation_attr)
            .and_then(|v| v.as_s().ok().cloned());

        Ok(DataRecord {
            idempotency_key,
            status,
            expiry_timestamp,
            in_progress_expiry_timestamp,
            response_data,
            payload_hash,
        })
    }
}

/// DynamoDB-backed persistence implementation
pub struct DynamoDbPersistenceStore {
    client: Client,
    table_name: String,
    layout: TableLayout,
}

impl DynamoDbPersistenceStore {
    pub fn new(client: Client, table_name: String) -> Self {
        Self {
            client,
            table_name,
            layout: TableLayout::default(),
        }
    }

    /// Store using a client configured from the environment
    pub async fn from_env(table_name: String) -> Self {
        let aws_config = aws_config::load_from_env().await;
        Self::new(Client::new(&aws_config), table_name)
    }

    pub fn builder() -> DynamoDbPersistenceStoreBuilder {
        DynamoDbPersistenceStoreBuilder::default()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn layout(&self) -> &TableLayout {
        &self.layout
    }
}

#[async_trait]
impl PersistenceStore for DynamoDbPersistenceStore {
    async fn put_record(&self, record: &DataRecord, now: SystemTime) -> Result<(), Error> {
        let layout = &self.layout;
        debug!("Putting record for idempotency key: {}", record.idempotency_key);

        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(layout.encode_claim(record)))
            .condition_expression(PUT_CONDITION)
            .expression_attribute_names("#id", &layout.key_attr)
            .expression_attribute_names("#expiry", &layout.expiry_attr)
            .expression_attribute_names("#status", &layout.status_attr)
            .expression_attribute_names("#in_progress_expiry", &layout.in_progress_expiry_attr)
            .expression_attribute_values(":now", AttributeValue::N(epoch_seconds(now).to_string()))
            .expression_attribute_values(
                ":now_in_millis",
                AttributeValue::N(epoch_millis(now).to_string()),
            )
            .expression_attribute_values(
                ":inprogress",
                AttributeValue::S(RecordStatus::InProgress.as_str().to_string()),
            )
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                debug!(
                    "Failed to put record for already existing idempotency key: {}",
                    record.idempotency_key
                );
                Err(Error::ItemAlreadyExists(record.idempotency_key.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_record(&self, idempotency_key: &str) -> Result<DataRecord, Error> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .set_key(Some(self.layout.key(idempotency_key)))
            .consistent_read(true)
            .send()
            .await?;

        match output.item {
            Some(item) if !item.is_empty() => self.layout.decode(item),
            _ => Err(Error::ItemNotFound(idempotency_key.to_string())),
        }
    }

    async fn update_record(&self, record: &DataRecord) -> Result<(), Error> {
        let layout = &self.layout;
        debug!("Updating record for idempotency key: {}", record.idempotency_key);

        let mut update = self
            .client
            .update_item()
            .table_name(&self.table_name)
            .set_key(Some(layout.key(&record.idempotency_key)))
            .expression_attribute_names("#response_data", &layout.data_attr)
            .expression_attribute_names("#expiry", &layout.expiry_attr)
            .expression_attribute_names("#status", &layout.status_attr)
            .expression_attribute_values(
                ":response_data",
                AttributeValue::S(record.response_data.clone().unwrap_or_default()),
            )
            .expression_attribute_values(
                ":expiry",
                AttributeValue::N(record.expiry_timestamp.to_string()),
            )
            .expression_attribute_values(
                ":status",
                AttributeValue::S(record.status.as_str().to_string()),
            );

        let update_expression = if let Some(payload_hash) = &record.payload_hash {
            update = update
                .expression_attribute_names("#validation_key", &layout.validation_attr)
                .expression_attribute_values(
                    ":validation_key",
                    AttributeValue::S(payload_hash.clone()),
                );
            "SET #response_data = :response_data, #expiry = :expiry, #status = :status, #validation_key = :validation_key"
        } else {
            "SET #response_data = :response_data, #expiry = :expiry, #status = :status"
        };

        update
            .update_expression(update_expression)
            .send()
            .await?;

        Ok(())
    }

    async fn delete_record(&self, idempotency_key: &str) -> Result<(), Error> {
        debug!("Deleting record for idempotency key: {}", idempotency_key);

        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(self.layout.key(idempotency_key)))
            .send()
            .await?;

        Ok(())
    }
}

/// Builder for a [`DynamoDbPersistenceStore`] with a custom table layout
#[derive(Default)]
pub struct DynamoDbPersistenceStoreBuilder {
    client: Option<Client>,
    table_name: Option<String>,
    layout: TableLayout,
}

impl DynamoDbPersistenceStoreBuilder {
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn key_attr(mut self, key_attr: impl Into<String>) -> Self {
        self.layout.key_attr = key_attr.into();
        self
    }

    pub fn static_pk_value(mut self, static_pk_value: impl Into<String>) -> Self {
        self.layout.static_pk_value = static_pk_value.into();
        self
    }

    pub fn sort_key_attr(mut self, sort_key_attr: impl Into<String>) -> Self {
        self.layout.sort_key_attr = Some(sort_key_attr.into());
        self
    }

    pub fn expiry_attr(mut self, expiry_attr: impl Into<String>) -> Self {
        self.layout.expiry_attr = expiry_attr.into();
        self
    }

    pub fn in_progress_expiry_attr(mut self, in_progress_expiry_attr: impl Into<String>) -> Self {
        self.layout.in_progress_expiry_attr = in_progress_expiry_attr.into();
        self
    }

    pub fn status_attr(mut self, status_attr: impl Into<String>) -> Self {
        self.layout.status_attr = status_attr.into();
        self
    }

    pub fn data_attr(mut self, data_attr: impl Into<String>) -> Self {
        self.layout.data_attr = data_attr.into();
        self
    }

    pub fn validation_attr(mut self, validation_attr: impl Into<String>) -> Self {
        self.layout.validation_attr = validation_attr.into();
        self
    }

    pub fn build(self) -> Result<DynamoDbPersistenceStore, Error> {
        let table_name = self
            .table_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Configuration("Table name is not specified".to_string()))?;
        let client = self
            .client
            .ok_or_else(|| Error::Configuration("DynamoDB client is not specified".to_string()))?;

        Ok(DynamoDbPersistenceStore {
            client,
            table_name,
            layout: self.layout,
        })
    }
}

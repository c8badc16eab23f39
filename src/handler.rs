use crate::config::IdempotencyConfig;
use crate::error::Error;
use crate::model::{DataRecord, Status};
use crate::persistence::PersistenceStore;
use crate::record_store::RecordStore;
use crate::serdes::{decode_response, decode_value, encode_response, ensure_replayable, response_value};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info, instrument, warn};

/// The outcome of trying to claim an idempotency key
pub enum Outcome<T> {
    /// This invocation owns the key - finish it through the claim
    New(Claim),
    /// A previous invocation completed - here is its response
    Duplicate(T),
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New(_) => f.write_str("New(..)"),
            Self::Duplicate(value) => f.debug_tuple("Duplicate").field(value).finish(),
        }
    }
}

/// Exclusive ownership of an in-progress idempotency record.
///
/// Dropping a claim without completing or releasing it leaves the record in
/// progress until its in-progress expiry elapses.
pub struct Claim {
    records: Arc<RecordStore>,
    config: Arc<IdempotencyConfig>,
    payload: Value,
    // false when idempotency is disabled: nothing was claimed, nothing is stored
    persisted: bool,
}

impl Claim {
    /// Store the response and mark the record completed
    pub async fn complete<T>(self, response: &T) -> Result<(), Error>
    where
        T: Serialize + 'static,
    {
        if !self.persisted {
            return Ok(());
        }
        let response_data = encode_response(response)?;
        self.records
            .save_success(&self.payload, response_data, self.config.clock.now())
            .await
    }

    /// Delete the record so that the request can be retried straight away
    pub async fn release(self) -> Result<(), Error> {
        if !self.persisted {
            return Ok(());
        }
        self.records.delete_record(&self.payload).await
    }
}

/// Runs functions at most once per idempotency key.
pub struct IdempotencyHandler {
    records: Arc<RecordStore>,
    config: Arc<IdempotencyConfig>,
}

impl IdempotencyHandler {
    pub fn new(store: Arc<dyn PersistenceStore>, config: IdempotencyConfig) -> Self {
        Self {
            records: Arc::new(RecordStore::new(store, &config)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Run `f` unless a previous invocation with the same payload key already completed.
    ///
    /// Without a remaining-time budget, an in-progress record is only
    /// reclaimable once the whole record expires.
    pub async fn handle<P, F, Fut, T, E>(&self, payload: &P, f: F) -> Result<T, E>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned + 'static,
        E: From<Error>,
    {
        self.run(payload, None, f).await
    }

    /// Like [`handle`](Self::handle), bounding the in-progress claim by the
    /// time left in the invocation.
    pub async fn handle_with_remaining_time<P, F, Fut, T, E>(
        &self,
        payload: &P,
        remaining_time: Duration,
        f: F,
    ) -> Result<T, E>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned + 'static,
        E: From<Error>,
    {
        self.run(payload, Some(remaining_time), f).await
    }

    /// Like [`handle`](Self::handle), taking the remaining time from the Lambda deadline.
    #[cfg(feature = "lambda")]
    pub async fn handle_lambda<P, F, Fut, T, E>(
        &self,
        payload: &P,
        context: &lambda_runtime::Context,
        f: F,
    ) -> Result<T, E>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned + 'static,
        E: From<Error>,
    {
        let deadline = std::time::UNIX_EPOCH + Duration::from_millis(context.deadline);
        let remaining = deadline
            .duration_since(self.config.clock.now())
            .unwrap_or(Duration::ZERO);
        self.run(payload, Some(remaining), f).await
    }

    /// Claim the key for `payload` without running anything.
    ///
    /// Low-level counterpart of [`handle`](Self::handle): the caller completes
    /// or releases the returned [`Claim`]. When idempotency is disabled every
    /// call is [`Outcome::New`] and the claim persists nothing.
    pub async fn try_start<P, T>(
        &self,
        payload: &P,
        remaining_time: Option<Duration>,
    ) -> Result<Outcome<T>, Error>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned + 'static,
    {
        ensure_replayable::<T>()?;
        let payload = to_payload(payload)?;
        if self.config.disabled {
            debug!("Idempotency is disabled - handing out an untracked claim");
            return Ok(Outcome::New(Claim {
                persisted: false,
                ..self.new_claim(&payload)
            }));
        }
        self.start(&payload, remaining_time).await
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(function_name = %self.config.function_name))
    )]
    async fn run<P, F, Fut, T, E>(
        &self,
        payload: &P,
        remaining_time: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        P: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned + 'static,
        E: From<Error>,
    {
        if self.config.disabled {
            debug!("Idempotency is disabled - running the function directly");
            return f().await;
        }

        ensure_replayable::<T>()?;
        let payload = to_payload(payload)?;
        if remaining_time.is_none() {
            warn!("Couldn't determine the remaining time left - in progress records won't time out");
        }

        match self.start(&payload, remaining_time).await? {
            Outcome::Duplicate(response) => Ok(response),
            Outcome::New(claim) => self.execute(claim, f).await,
        }
    }

    /// Claim with bounded retries on inconsistent store reads.
    async fn start<T>(
        &self,
        payload: &Value,
        remaining_time: Option<Duration>,
    ) -> Result<Outcome<T>, Error>
    where
        T: DeserializeOwned + 'static,
    {
        let mut attempt = 0;

        loop {
            match self.claim(payload, remaining_time).await {
                Err(Error::InconsistentState(_reason)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    info!(attempt, "Retrying after inconsistent idempotency state: {}", _reason);
                }
                outcome => return outcome,
            }
        }
    }

    async fn claim<T>(
        &self,
        payload: &Value,
        remaining_time: Option<Duration>,
    ) -> Result<Outcome<T>, Error>
    where
        T: DeserializeOwned + 'static,
    {
        let now = self.config.clock.now();

        // Saving first spares a read in the common case where no record exists yet
        match self.records.save_in_progress(payload, now, remaining_time).await {
            Ok(()) => Ok(Outcome::New(self.new_claim(payload))),
            Err(Error::ItemAlreadyExists(_)) => match self.fetch_record(payload).await? {
                Some(record) => self.handle_for_status(record).map(Outcome::Duplicate),
                None => Ok(Outcome::New(self.new_claim(payload))),
            },
            Err(err @ (Error::KeyMissing | Error::Configuration(_))) => Err(err),
            Err(err) => Err(Error::persistence(
                "Failed to save in progress record to idempotency store",
                err,
            )),
        }
    }

    fn new_claim(&self, payload: &Value) -> Claim {
        Claim {
            records: Arc::clone(&self.records),
            config: Arc::clone(&self.config),
            payload: payload.clone(),
            persisted: true,
        }
    }

    async fn fetch_record(&self, payload: &Value) -> Result<Option<DataRecord>, Error> {
        match self.records.get_record(payload).await {
            Ok(record) => Ok(record),
            Err(Error::ItemNotFound(_)) => {
                // The record was removed between saving and fetching
                debug!("An existing idempotency record was deleted before we could fetch it");
                Err(Error::InconsistentState(
                    "saveInProgress and getRecord return inconsistent results".to_string(),
                ))
            }
            Err(err @ (Error::Validation | Error::KeyMissing)) => Err(err),
            Err(err) => Err(Error::persistence(
                "Failed to get record from idempotency store",
                err,
            )),
        }
    }

    fn handle_for_status<T>(&self, record: DataRecord) -> Result<T, Error>
    where
        T: DeserializeOwned + 'static,
    {
        let now = self.config.clock.now();

        match record.status(now) {
            Status::Expired => Err(Error::InconsistentState(
                "saveInProgress and getRecord return inconsistent results".to_string(),
            )),
            Status::InProgress if record.is_in_progress_expired(now) => {
                Err(Error::InconsistentState(
                    "Item should have been expired in-progress because it already timed out"
                        .to_string(),
                ))
            }
            Status::InProgress => Err(Error::AlreadyInProgress(record.idempotency_key)),
            Status::Completed => {
                debug!(
                    "Response for key '{}' retrieved from idempotency store, skipping the function",
                    record.idempotency_key
                );
                self.replay(&record).map_err(|err| {
                    Error::persistence(
                        format!(
                            "Unable to get function response as {}",
                            std::any::type_name::<T>()
                        ),
                        err,
                    )
                })
            }
        }
    }

    fn replay<T>(&self, record: &DataRecord) -> Result<T, Error>
    where
        T: DeserializeOwned + 'static,
    {
        let raw = record.response_data.as_deref().ok_or_else(|| {
            Error::Decoding("Completed record carries no response data".to_string())
        })?;

        match &self.config.response_hook {
            Some(hook) => {
                debug!("Applying user-defined response hook to idempotency data before returning");
                let value = response_value::<T>(raw)?;
                decode_value(hook(value, record))
            }
            None => decode_response(raw),
        }
    }

    async fn execute<F, Fut, T, E>(&self, claim: Claim, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + 'static,
        E: From<Error>,
    {
        let response = match f().await {
            Ok(response) => response,
            Err(function_error) => {
                // A failed delete is reported in place of the function's error
                if let Err(err) = claim.release().await {
                    let err = match err {
                        Error::KeyMissing => err,
                        other => Error::persistence(
                            "Failed to delete record from idempotency store",
                            other,
                        ),
                    };
                    return Err(err.into());
                }
                return Err(function_error);
            }
        };

        if let Err(err) = claim.complete(&response).await {
            error!(
                error = %err,
                "Function succeeded but its record could not be completed; the response is dropped"
            );
            return Err(Error::persistence(
                "Failed to update record state to success in idempotency store",
                err,
            )
            .into());
        }

        Ok(response)
    }
}

fn to_payload<P: Serialize + ?Sized>(payload: &P) -> Result<Value, Error> {
    serde_json::to_value(payload)
        .map_err(|e| Error::Configuration(format!("Unable to convert payload to JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::in_memory::InMemoryPersistenceStore;
    use crate::key::KeyExtraction;
    use crate::model::RecordStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn setup(config: IdempotencyConfig) -> (Arc<InMemoryPersistenceStore>, Arc<ManualClock>, IdempotencyHandler) {
        let store = Arc::new(InMemoryPersistenceStore::new());
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000)));
        let handler = IdempotencyHandler::new(store.clone(), config.with_clock(clock.clone()));
        (store, clock, handler)
    }

    fn key_of(handler: &IdempotencyHandler, payload: &Value) -> String {
        handler.records.idempotency_key(payload).unwrap().unwrap()
    }

    // Keeps refusing claims while reporting whatever record it holds
    struct StubbornStore(InMemoryPersistenceStore);

    #[async_trait::async_trait]
    impl PersistenceStore for StubbornStore {
        async fn put_record(&self, record: &DataRecord, _now: SystemTime) -> Result<(), Error> {
            Err(Error::ItemAlreadyExists(record.idempotency_key.clone()))
        }
        async fn get_record(&self, key: &str) -> Result<DataRecord, Error> {
            self.0.get_record(key).await
        }
        async fn update_record(&self, record: &DataRecord) -> Result<(), Error> {
            self.0.update_record(record).await
        }
        async fn delete_record(&self, key: &str) -> Result<(), Error> {
            self.0.delete_record(key).await
        }
    }

    // Handler over a stubborn store pre-loaded with `record_for(key)`
    fn stubborn_handler(
        payload: &Value,
        record_for: impl FnOnce(String) -> DataRecord,
    ) -> IdempotencyHandler {
        let inner = InMemoryPersistenceStore::new();
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(2_000)));
        let config = IdempotencyConfig::new().with_clock(clock);
        let records = RecordStore::new(Arc::new(InMemoryPersistenceStore::new()), &config);
        let key = records.idempotency_key(payload).unwrap().unwrap();
        inner.insert(record_for(key));
        IdempotencyHandler::new(Arc::new(StubbornStore(inner)), config)
    }

    #[tokio::test]
    async fn test_try_start_new_then_duplicate() {
        let (_, _, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});

        match handler.try_start::<_, String>(&payload, None).await.unwrap() {
            Outcome::New(claim) => claim.complete(&"done".to_string()).await.unwrap(),
            Outcome::Duplicate(_) => panic!("Expected New on first attempt"),
        }

        match handler.try_start::<_, String>(&payload, None).await.unwrap() {
            Outcome::New(_) => panic!("Expected Duplicate on second attempt"),
            Outcome::Duplicate(value) => assert_eq!(value, "done"),
        }
    }

    #[tokio::test]
    async fn test_in_progress_conflict() {
        let (_, _, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});

        let _claim = handler.try_start::<_, String>(&payload, None).await.unwrap();
        let err = handler
            .try_start::<_, String>(&payload, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyInProgress(_)));
    }

    #[tokio::test]
    async fn test_release_frees_key() {
        let (store, _, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});

        match handler.try_start::<_, String>(&payload, None).await.unwrap() {
            Outcome::New(claim) => claim.release().await.unwrap(),
            Outcome::Duplicate(_) => panic!("Expected New"),
        }
        assert!(store.is_empty());
        assert!(matches!(
            handler.try_start::<_, String>(&payload, None).await.unwrap(),
            Outcome::New(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_completed_record_reexecutes() {
        let (_, clock, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});

        let first: String = handler
            .handle(&payload, || async { Ok::<_, Error>("first".to_string()) })
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3_601));
        let second: String = handler
            .handle(&payload, || async { Ok::<_, Error>("second".to_string()) })
            .await
            .unwrap();

        assert_eq!(first, "first");
        assert_eq!(second, "second");
    }

    #[tokio::test]
    async fn test_in_progress_timeout_reclaims() {
        let (_, clock, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});

        let _abandoned = handler
            .try_start::<_, String>(&payload, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));

        let result: String = handler
            .handle(&payload, || async { Ok::<_, Error>("recovered".to_string()) })
            .await
            .unwrap();
        assert_eq!(result, "recovered");
    }

    #[tokio::test]
    async fn test_in_progress_with_elapsed_expiry_is_inconsistent() {
        let payload = json!({"id": 7});
        let handler = stubborn_handler(&payload, |key| {
            DataRecord::in_progress(key, 9_999, Some(1_000_000), None)
        });

        let err = handler
            .handle(&payload, || async { Ok::<_, Error>("never".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentState(_)));
    }

    #[tokio::test]
    async fn test_expired_completed_record_behind_refused_claim_is_inconsistent() {
        let payload = json!({"id": 8});
        // Completed, but expired at 1_500 while the clock reads 2_000
        let handler = stubborn_handler(&payload, |key| {
            DataRecord::completed(key, 1_500, "\"stale\"".to_string(), None)
        });
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<String, Error> = handler
            .handle(&payload, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_string())
            })
            .await;
        assert!(matches!(result, Err(Error::InconsistentState(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_remaining_time_is_configuration_error() {
        let (store, _, handler) = setup(IdempotencyConfig::new());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<String, Error> = handler
            .handle_with_remaining_time(&json!({"id": 1}), Duration::MAX, || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            })
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failure_deletes_record_and_propagates_error() {
        let (store, _, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});

        let result: Result<String, Error> = handler
            .handle(&payload, || async { Err(Error::Internal("boom".to_string())) })
            .await;
        assert!(matches!(result, Err(Error::Internal(msg)) if msg == "boom"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_response_hook_applied_on_replay_only() {
        let config = IdempotencyConfig::new().with_response_hook(|mut value, record| {
            value["replayed_key"] = json!(record.idempotency_key.clone());
            value
        });
        let (_, _, handler) = setup(config);
        let payload = json!({"id": 1});

        let first: Value = handler
            .handle(&payload, || async { Ok::<_, Error>(json!({"total": 3})) })
            .await
            .unwrap();
        assert_eq!(first, json!({"total": 3}));

        let second: Value = handler
            .handle(&payload, || async { Ok::<_, Error>(json!({"total": 99})) })
            .await
            .unwrap();
        assert_eq!(second["total"], json!(3));
        assert_eq!(second["replayed_key"], json!(key_of(&handler, &payload)));
    }

    #[tokio::test]
    async fn test_unit_return_type_rejected() {
        let (store, _, handler) = setup(IdempotencyConfig::new());
        let result: Result<(), Error> = handler.handle(&json!({"id": 1}), || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_runs_function_every_time() {
        let (store, _, handler) = setup(IdempotencyConfig::new().with_disabled(true));
        let counter = Arc::new(AtomicU32::new(0));
        let payload = json!({"id": 1});

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            let _: u32 = handler
                .handle(&payload, || async move {
                    Ok::<_, Error>(counter.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_try_start_persists_nothing() {
        let (store, _, handler) = setup(IdempotencyConfig::new().with_disabled(true));
        let payload = json!({"id": 1});

        for _ in 0..2 {
            match handler.try_start::<_, String>(&payload, None).await.unwrap() {
                Outcome::New(claim) => claim.complete(&"done".to_string()).await.unwrap(),
                Outcome::Duplicate(_) => panic!("Expected New while disabled"),
            }
            assert!(store.is_empty());
        }

        match handler.try_start::<_, String>(&payload, None).await.unwrap() {
            Outcome::New(claim) => claim.release().await.unwrap(),
            Outcome::Duplicate(_) => panic!("Expected New while disabled"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_no_key_runs_without_persisting() {
        let config = IdempotencyConfig::new().with_event_key(KeyExtraction::path("/id").unwrap());
        let (store, _, handler) = setup(config);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            let _: u32 = handler
                .handle(&json!({"name": "x"}), || async move {
                    Ok::<_, Error>(counter.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remaining_time_sets_in_progress_expiry() {
        let (store, clock, handler) = setup(IdempotencyConfig::new());
        let payload = json!({"id": 1});
        let _claim = handler
            .try_start::<_, String>(&payload, Some(Duration::from_millis(1_500)))
            .await
            .unwrap();

        let record = store.snapshot(&key_of(&handler, &payload)).unwrap();
        let now_millis = clock.now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64;
        assert_eq!(record.status, RecordStatus::InProgress);
        assert_eq!(record.in_progress_expiry_timestamp, Some(now_millis + 1_500));
    }
}

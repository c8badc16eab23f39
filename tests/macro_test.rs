use powertools_idempotency::{
    idempotent, Error, IdempotencyConfig, IdempotencyHandler, InMemoryPersistenceStore,
    KeyExtraction,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// Example struct that uses the macro
struct EmailService {
    idempotency: IdempotencyHandler,
    sent: AtomicU32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Email {
    id: Uuid,
    recipient: String,
    subject: String,
    body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Receipt {
    message: String,
    sequence: u32,
}

impl EmailService {
    fn new(config: IdempotencyConfig) -> Self {
        Self {
            idempotency: IdempotencyHandler::new(Arc::new(InMemoryPersistenceStore::new()), config),
            sent: AtomicU32::new(0),
        }
    }

    /// Send an email at most once per email id
    #[idempotent(handler = self.idempotency, payload = email)]
    async fn send_email(&self, email: Email) -> Result<Receipt, Error> {
        // Simulate sending email
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sequence = self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(Receipt {
            message: format!(
                "Email sent to {} with subject: {}",
                email.recipient, email.subject
            ),
            sequence,
        })
    }

    /// Same, bounding the in-progress record by the time left
    #[idempotent(handler = self.idempotency, payload = email, remaining_time = timeout)]
    async fn send_email_within(&self, email: Email, timeout: Duration) -> Result<String, Error> {
        if email.recipient.is_empty() {
            return Err(Error::Internal("no recipient".to_string()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(format!("Email sent to {} within {:?}", email.recipient, timeout))
    }

    fn sent(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }
}

fn email(recipient: &str, subject: &str) -> Email {
    Email {
        id: Uuid::new_v4(),
        recipient: recipient.to_string(),
        subject: subject.to_string(),
        body: "Test Body".to_string(),
    }
}

fn keyed_by_id() -> IdempotencyConfig {
    IdempotencyConfig::new().with_event_key(KeyExtraction::path("/id").unwrap())
}

#[tokio::test]
async fn test_idempotent_macro_basic() {
    let service = EmailService::new(keyed_by_id());
    let email = email("test@example.com", "Test Subject");

    // First call should execute
    let result1 = service.send_email(email.clone()).await.unwrap();
    assert!(result1.message.contains("Email sent to test@example.com"));

    // Second call with same email.id should return the stored receipt
    let result2 = service.send_email(email.clone()).await.unwrap();
    assert_eq!(result1, result2);
    assert_eq!(service.sent(), 1);
}

#[tokio::test]
async fn test_idempotent_macro_key_on_recipient_and_subject() {
    let config =
        IdempotencyConfig::new().with_event_key(KeyExtraction::paths(["/recipient", "/subject"]).unwrap());
    let service = EmailService::new(config);
    let email1 = email("test@example.com", "Test Subject");

    let result1 = service.send_email(email1.clone()).await.unwrap();

    // Different id, same recipient and subject
    let email2 = Email {
        id: Uuid::new_v4(),
        ..email1
    };
    let result2 = service.send_email(email2).await.unwrap();
    assert_eq!(result1, result2);
    assert_eq!(service.sent(), 1);
}

#[tokio::test]
async fn test_idempotent_macro_different_ids() {
    let service = EmailService::new(keyed_by_id());

    // Both should execute as they have different ids
    let result1 = service.send_email(email("test1@example.com", "S1")).await.unwrap();
    let result2 = service.send_email(email("test2@example.com", "S2")).await.unwrap();

    assert!(result1.message.contains("test1@example.com"));
    assert!(result2.message.contains("test2@example.com"));
    assert_ne!(result1, result2);
    assert_eq!(service.sent(), 2);
}

#[tokio::test]
async fn test_idempotent_macro_with_remaining_time() {
    let service = EmailService::new(keyed_by_id());
    let email = email("test@example.com", "Test Subject");

    let result1 = service
        .send_email_within(email.clone(), Duration::from_secs(30))
        .await
        .unwrap();
    let result2 = service
        .send_email_within(email, Duration::from_secs(5))
        .await
        .unwrap();

    // The second call replays the first response, timeout included
    assert_eq!(result1, result2);
    assert!(result1.ends_with("within 30s"));
    assert_eq!(service.sent(), 1);
}

#[tokio::test]
async fn test_idempotent_macro_failure_allows_retry() {
    let service = EmailService::new(keyed_by_id());
    let mut email = email("", "Test Subject");

    let err = service
        .send_email_within(email.clone(), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));

    // Same key, fixed payload: the failed attempt left nothing behind
    email.recipient = "test@example.com".to_string();
    let result = service
        .send_email_within(email, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(result.contains("test@example.com"));
    assert_eq!(service.sent(), 1);
}

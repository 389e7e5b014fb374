//! Delivery of notifications to chat users.
//!
//! The [`NotificationSink`] is the outbound "post a direct message to a
//! user" capability. [`ChatWebhookSink`] posts JSON to the chat server's
//! incoming endpoint:
//!
//! ```json
//! {"user_id": "...", "message": "...", "props": {"attachments": [ ... ]}}
//! ```
//!
//! [`NotificationDispatcher`] wraps a sink with bounded retries so a
//! transient chat outage does not drop a notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::types::{Attachment, NotificationMessage};

/// Default timeout for chat requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery attempts per notification.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff.
const BASE_BACKOFF_MS: u64 = 200;

/// Maximum delay cap for exponential backoff.
const MAX_BACKOFF_MS: u64 = 5_000;

/// Maximum jitter added to the backoff delay.
const MAX_JITTER_MS: u64 = 100;

/// Errors that can occur while posting to the chat server.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("chat server unavailable: {0}")]
    Unavailable(String),

    #[error("chat server rejected post with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("client configuration error: {0}")]
    Configuration(String),
}

/// Posts a direct message to a single user.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post(&self, message: &NotificationMessage) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct ChatPost<'a> {
    user_id: &'a str,
    message: &'a str,
    props: ChatProps<'a>,
}

#[derive(Serialize)]
struct ChatProps<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<&'a Attachment>,
}

/// [`NotificationSink`] posting to a chat server's incoming webhook.
#[derive(Debug, Clone)]
pub struct ChatWebhookSink {
    http_client: Client,
    url: String,
    token: Option<String>,
}

impl ChatWebhookSink {
    /// Creates a sink for `url`, optionally authenticating with a bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Configuration`] if the HTTP client cannot be created.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Result<Self, SinkError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl NotificationSink for ChatWebhookSink {
    async fn post(&self, message: &NotificationMessage) -> Result<(), SinkError> {
        let body = ChatPost {
            user_id: &message.user_id,
            message: &message.message,
            props: ChatProps {
                attachments: message.attachment.iter().collect(),
            },
        };

        let mut request = self.http_client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SinkError::Timeout(REQUEST_TIMEOUT)
            } else if e.is_connect() {
                SinkError::Unavailable(format!("connection failed: {e}"))
            } else {
                SinkError::Unavailable(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Hands notifications to a sink, retrying failed posts.
#[derive(Clone)]
pub struct NotificationDispatcher {
    sink: Arc<dyn NotificationSink>,
    base_backoff_ms: u64,
}

impl NotificationDispatcher {
    /// Creates a dispatcher with the default backoff.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            base_backoff_ms: BASE_BACKOFF_MS,
        }
    }

    /// Overrides the base backoff delay.
    #[must_use]
    pub fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff_ms = u64::try_from(base.as_millis()).unwrap_or(MAX_BACKOFF_MS);
        self
    }

    /// Delivers `message`, retrying up to three attempts in total.
    ///
    /// Returns `true` once the sink accepted the message. The final failure
    /// is logged, not returned.
    pub async fn dispatch(&self, message: &NotificationMessage) -> bool {
        for attempt in 0..MAX_ATTEMPTS {
            match self.sink.post(message).await {
                Ok(()) => {
                    debug!(user_id = %message.user_id, attempt = attempt + 1, "Notification delivered");
                    return true;
                }
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    let delay = calculate_backoff_delay(self.base_backoff_ms, attempt);
                    warn!(
                        user_id = %message.user_id,
                        attempt = attempt + 1,
                        max_attempts = MAX_ATTEMPTS,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Notification delivery failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        user_id = %message.user_id,
                        attempts = MAX_ATTEMPTS,
                        error = %e,
                        "Notification dropped after all delivery attempts"
                    );
                }
            }
        }

        false
    }
}

/// Exponential backoff with jitter, capped at [`MAX_BACKOFF_MS`].
fn calculate_backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponential_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
    let total_ms = exponential_ms.saturating_add(jitter_ms).min(MAX_BACKOFF_MS);
    Duration::from_millis(total_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Sink failing the first `failures` posts.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn post(&self, _message: &NotificationMessage) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(SinkError::Unavailable("down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher(failures: u32) -> (NotificationDispatcher, Arc<FlakySink>) {
        let sink = Arc::new(FlakySink {
            failures,
            calls: AtomicU32::new(0),
        });
        let dispatcher = NotificationDispatcher::new(sink.clone()).with_base_backoff(Duration::from_millis(1));
        (dispatcher, sink)
    }

    #[tokio::test]
    async fn dispatch_succeeds_first_try() {
        let (dispatcher, sink) = dispatcher(0);
        assert!(dispatcher.dispatch(&NotificationMessage::text("alice", "hi")).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_retries_transient_failures() {
        let (dispatcher, sink) = dispatcher(2);
        assert!(dispatcher.dispatch(&NotificationMessage::text("alice", "hi")).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dispatch_gives_up_after_three_attempts() {
        let (dispatcher, sink) = dispatcher(10);
        assert!(!dispatcher.dispatch(&NotificationMessage::text("alice", "hi")).await);
        assert_eq!(sink.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        for _ in 0..10 {
            let d0 = calculate_backoff_delay(BASE_BACKOFF_MS, 0);
            let d2 = calculate_backoff_delay(BASE_BACKOFF_MS, 2);
            assert!(d0 >= Duration::from_millis(BASE_BACKOFF_MS));
            assert!(d0 <= Duration::from_millis(BASE_BACKOFF_MS + MAX_JITTER_MS));
            assert!(d2 >= Duration::from_millis(BASE_BACKOFF_MS * 4));
        }
        assert_eq!(
            calculate_backoff_delay(BASE_BACKOFF_MS, 30),
            Duration::from_millis(MAX_BACKOFF_MS)
        );
    }

    #[tokio::test]
    async fn webhook_sink_posts_message_with_attachment() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/dm"))
            .and(header("Authorization", "Bearer chat-token"))
            .and(body_json(serde_json::json!({
                "user_id": "alice",
                "message": "",
                "props": {"attachments": [{"title": "Plan", "footer": "Google Drive"}]}
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&mock_server)
            .await;

        let sink = ChatWebhookSink::new(
            format!("{}/hooks/dm", mock_server.uri()),
            Some("chat-token".to_string()),
        )
        .unwrap();
        let message = NotificationMessage::text("alice", "").with_attachment(Attachment {
            title: "Plan".into(),
            footer: "Google Drive".into(),
            ..Attachment::default()
        });

        sink.post(&message).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_sink_omits_empty_attachments() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({
                "user_id": "bob",
                "message": "hello",
                "props": {}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let sink = ChatWebhookSink::new(mock_server.uri(), None).unwrap();
        sink.post(&NotificationMessage::text("bob", "hello")).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_sink_maps_rejection() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&mock_server)
            .await;

        let sink = ChatWebhookSink::new(mock_server.uri(), None).unwrap();
        let result = sink.post(&NotificationMessage::text("bob", "hello")).await;

        assert!(matches!(result, Err(SinkError::Rejected { status: 403, .. })));
    }
}

//! Per-user Google credentials.
//!
//! The watch manager, change processor and renewal workers never see OAuth
//! details: they ask a [`CredentialSource`] for an [`AccessToken`] and hand
//! it to the Drive client. [`StoredTokenSource`] is the production source;
//! it reads tokens written by the connect flow and refreshes them shortly
//! before they expire.
//!
//! Token values are never logged. Both [`AccessToken`] and [`StoredToken`]
//! redact their secrets in `Debug` output.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::oauth::OAuthClient;
use crate::store::{get_json, set_json, KvStore, StoreError, TOKEN_PREFIX};

/// Tokens expiring within this window are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Errors that can occur while obtaining credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No token is stored for the user.
    #[error("user has not connected a Google account")]
    NotConnected,

    /// The stored token expired and could not be refreshed.
    #[error("token refresh failed: {0}")]
    Refresh(String),

    /// Reading or writing the stored token failed.
    #[error("token storage error: {0}")]
    Store(#[from] StoreError),
}

/// A bearer token for Google APIs.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token for an `Authorization` header.
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// An OAuth token pair as persisted under `google_token-<user>`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// Returns true if the token is expired or about to expire at `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .is_some_and(|expiry| expiry - now < Duration::seconds(REFRESH_MARGIN_SECS))
    }
}

impl fmt::Debug for StoredToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredToken")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Supplies an authorized bearer token for a user.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Returns a currently valid access token for `user_id`.
    async fn access_token(&self, user_id: &str) -> Result<AccessToken, CredentialError>;
}

/// Storage key for a user's token.
pub fn token_key(user_id: &str) -> String {
    format!("{TOKEN_PREFIX}{user_id}")
}

/// Returns true if a non-empty token is stored for `user_id`.
pub async fn is_connected(kv: &dyn KvStore, user_id: &str) -> Result<bool, StoreError> {
    let token: Option<StoredToken> = get_json(kv, &token_key(user_id)).await?;
    Ok(token.is_some_and(|t| !t.access_token.is_empty()))
}

/// Persists a token for `user_id`.
pub async fn store_token(
    kv: &dyn KvStore,
    user_id: &str,
    token: &StoredToken,
) -> Result<(), StoreError> {
    set_json(kv, &token_key(user_id), token).await
}

/// [`CredentialSource`] backed by tokens in the key-value store.
pub struct StoredTokenSource {
    kv: Arc<dyn KvStore>,
    oauth: Arc<OAuthClient>,
}

impl StoredTokenSource {
    /// Creates a source reading from `kv` and refreshing through `oauth`.
    pub fn new(kv: Arc<dyn KvStore>, oauth: Arc<OAuthClient>) -> Self {
        Self { kv, oauth }
    }
}

#[async_trait]
impl CredentialSource for StoredTokenSource {
    async fn access_token(&self, user_id: &str) -> Result<AccessToken, CredentialError> {
        let key = token_key(user_id);
        let token: StoredToken = get_json(self.kv.as_ref(), &key)
            .await?
            .filter(|t: &StoredToken| !t.access_token.is_empty())
            .ok_or(CredentialError::NotConnected)?;

        if !token.needs_refresh(Utc::now()) {
            return Ok(AccessToken::new(token.access_token));
        }

        let Some(refresh_token) = token.refresh_token.as_deref() else {
            warn!(user_id = %user_id, "Stored token expired and has no refresh token");
            return Err(CredentialError::Refresh(
                "token expired and no refresh token is available".to_string(),
            ));
        };

        debug!(user_id = %user_id, "Refreshing expiring access token");
        let mut refreshed = self
            .oauth
            .refresh(refresh_token)
            .await
            .map_err(|e| CredentialError::Refresh(e.to_string()))?;

        // Google omits the refresh token on refresh responses.
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = token.refresh_token.clone();
        }

        set_json(self.kv.as_ref(), &key, &refreshed).await?;
        info!(user_id = %user_id, "Access token refreshed");

        Ok(AccessToken::new(refreshed.access_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth_client(server: &MockServer) -> Arc<OAuthClient> {
        Arc::new(
            OAuthClient::new(
                format!("{}/auth", server.uri()),
                format!("{}/token", server.uri()),
                "client-id",
                "client-secret",
                "https://chat.example.com/oauth/complete",
            )
            .expect("should create client"),
        )
    }

    fn token(access: &str, refresh: Option<&str>, expiry: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expiry,
        }
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let t = token("ya29.secret", Some("1//refresh"), None);
        let debug = format!("{t:?} {:?}", AccessToken::new("ya29.secret"));
        assert!(!debug.contains("ya29.secret"));
        assert!(!debug.contains("1//refresh"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn needs_refresh_within_margin() {
        let now = Utc::now();
        assert!(token("a", None, Some(now + Duration::seconds(30))).needs_refresh(now));
        assert!(token("a", None, Some(now - Duration::hours(1))).needs_refresh(now));
        assert!(!token("a", None, Some(now + Duration::hours(1))).needs_refresh(now));
        assert!(!token("a", None, None).needs_refresh(now));
    }

    #[tokio::test]
    async fn missing_token_is_not_connected() {
        let server = MockServer::start().await;
        let source = StoredTokenSource::new(Arc::new(MemoryKvStore::new()), oauth_client(&server));

        let result = source.access_token("alice").await;
        assert!(matches!(result, Err(CredentialError::NotConnected)));
    }

    #[tokio::test]
    async fn is_connected_requires_non_empty_token() {
        let kv = MemoryKvStore::new();
        assert!(!is_connected(&kv, "alice").await.unwrap());

        store_token(&kv, "alice", &token("", None, None)).await.unwrap();
        assert!(!is_connected(&kv, "alice").await.unwrap());

        store_token(&kv, "alice", &token("tok", None, None)).await.unwrap();
        assert!(is_connected(&kv, "alice").await.unwrap());
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let kv = Arc::new(MemoryKvStore::new());
        store_token(
            kv.as_ref(),
            "alice",
            &token("fresh", Some("r"), Some(Utc::now() + Duration::hours(1))),
        )
        .await
        .unwrap();

        let source = StoredTokenSource::new(kv, oauth_client(&server));
        let access = source.access_token("alice").await.unwrap();
        assert_eq!(access.secret(), "fresh");
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let kv = Arc::new(MemoryKvStore::new());
        store_token(
            kv.as_ref(),
            "alice",
            &token("stale", Some("old-refresh"), Some(Utc::now() - Duration::minutes(5))),
        )
        .await
        .unwrap();

        let source = StoredTokenSource::new(kv.clone(), oauth_client(&server));
        let access = source.access_token("alice").await.unwrap();
        assert_eq!(access.secret(), "new-access");

        let stored: StoredToken = get_json(kv.as_ref(), &token_key("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token.as_deref(), Some("old-refresh"));
        assert!(!stored.needs_refresh(Utc::now()));
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_fails() {
        let server = MockServer::start().await;
        let kv = Arc::new(MemoryKvStore::new());
        store_token(
            kv.as_ref(),
            "alice",
            &token("stale", None, Some(Utc::now() - Duration::minutes(5))),
        )
        .await
        .unwrap();

        let source = StoredTokenSource::new(kv, oauth_client(&server));
        let result = source.access_token("alice").await;
        assert!(matches!(result, Err(CredentialError::Refresh(_))));
    }

    #[tokio::test]
    async fn refresh_rejection_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let kv = Arc::new(MemoryKvStore::new());
        store_token(
            kv.as_ref(),
            "alice",
            &token("stale", Some("revoked"), Some(Utc::now())),
        )
        .await
        .unwrap();

        let source = StoredTokenSource::new(kv, oauth_client(&server));
        let result = source.access_token("alice").await;
        assert!(matches!(result, Err(CredentialError::Refresh(_))));
    }
}

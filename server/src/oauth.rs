//! Google OAuth client and the account connect flow.
//!
//! [`OAuthClient`] talks to Google's authorization and token endpoints.
//! [`ConnectFlow`] ties it to the key-value store and the completion broker:
//!
//! 1. `begin(user)` stores a random state and returns the consent URL.
//! 2. Google redirects the browser to `/oauth/complete?code=..&state=..`.
//! 3. `complete(code, state)` checks the state, exchanges the code, stores
//!    the token and wakes any handler waiting on the broker.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::Rng;
use reqwest::{Client, Url};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::{OAuthBroker, OAuthCompletion};
use crate::credentials::{store_token, StoredToken};
use crate::store::{KvStore, StoreError, OAUTH_STATE_PREFIX};

/// Timeout for token endpoint requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Random bytes in a state nonce.
const STATE_NONCE_BYTES: usize = 32;

/// Length of the base64url-encoded nonce (32 bytes, no padding).
const STATE_NONCE_LEN: usize = 43;

/// Read-only access to Drive files and Drive activity.
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/drive.readonly",
    "https://www.googleapis.com/auth/drive.activity.readonly",
];

/// Errors that can occur during the OAuth flow.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// The token request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The token endpoint is unreachable.
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),

    /// Google rejected the request (bad code, revoked refresh token, ...).
    #[error("token request rejected with status {status}: {error}")]
    Rejected { status: u16, error: String },

    /// The token response could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The state parameter is malformed, unknown, or does not match.
    #[error("invalid OAuth state")]
    InvalidState,

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),

    /// Reading or writing the state or token failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for Google's OAuth 2.0 endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http_client: Client,
    auth_url: Url,
    token_url: String,
    client_id: String,
    client_secret: String,
    redirect_url: String,
}

impl OAuthClient {
    /// Creates a new OAuth client.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::Configuration`] if `auth_url` is not a valid URL
    /// or the HTTP client cannot be created.
    pub fn new(
        auth_url: impl AsRef<str>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        let auth_url = Url::parse(auth_url.as_ref())
            .map_err(|e| OAuthError::Configuration(format!("invalid authorization URL: {e}")))?;

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| OAuthError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            auth_url,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: redirect_url.into(),
        })
    }

    /// Builds the consent-screen URL for `state`.
    ///
    /// Requests offline access with a forced consent prompt so Google always
    /// returns a refresh token.
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        url.into()
    }

    /// Exchanges an authorization code for a token.
    pub async fn exchange_code(&self, code: &str) -> Result<StoredToken, OAuthError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.redirect_url),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    /// Obtains a fresh access token using a refresh token.
    ///
    /// The returned token carries a refresh token only if Google rotated it.
    pub async fn refresh(&self, refresh_token: &str) -> Result<StoredToken, OAuthError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<StoredToken, OAuthError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OAuthError::Timeout(REQUEST_TIMEOUT)
                } else if e.is_connect() {
                    OAuthError::Unavailable(format!("connection failed: {e}"))
                } else {
                    OAuthError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            // The body is Google's error JSON; it never echoes the secret.
            let body = response.text().await.unwrap_or_default();
            let error = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                })
                .unwrap_or(body);
            warn!(status = %status, error = %error, "Token endpoint rejected request");
            return Err(OAuthError::Rejected {
                status: status.as_u16(),
                error,
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            OAuthError::InvalidResponse(format!("failed to parse token response: {e}"))
        })?;

        Ok(StoredToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expiry: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }
}

/// Generates a state value `<nonce>_<user_id>`.
fn generate_state(user_id: &str) -> String {
    let mut bytes = [0u8; STATE_NONCE_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{}_{user_id}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Extracts the user id from a state value.
///
/// The nonce alphabet includes `_`, so the split is positional.
fn state_user_id(state: &str) -> Option<&str> {
    let rest = state.get(STATE_NONCE_LEN..)?;
    rest.strip_prefix('_').filter(|user| !user.is_empty())
}

fn state_key(user_id: &str) -> String {
    format!("{OAUTH_STATE_PREFIX}{user_id}")
}

/// Account connect flow.
pub struct ConnectFlow {
    oauth: Arc<OAuthClient>,
    kv: Arc<dyn KvStore>,
    broker: OAuthBroker,
}

impl ConnectFlow {
    /// Creates a flow that stores state and tokens in `kv` and reports
    /// outcomes to `broker`.
    pub fn new(oauth: Arc<OAuthClient>, kv: Arc<dyn KvStore>, broker: OAuthBroker) -> Self {
        Self { oauth, kv, broker }
    }

    /// Starts a flow for `user_id` and returns the consent URL.
    ///
    /// A new flow replaces any pending state for the same user.
    pub async fn begin(&self, user_id: &str) -> Result<String, OAuthError> {
        let state = generate_state(user_id);
        self.kv
            .set(&state_key(user_id), state.clone().into_bytes())
            .await?;

        debug!(user_id = %user_id, "OAuth flow started");
        Ok(self.oauth.authorize_url(&state))
    }

    /// Finishes a flow from the redirect parameters.
    ///
    /// Returns the connected user id. A state that does not match the
    /// pending one is rejected without touching the broker; every outcome
    /// after that is reported to it.
    pub async fn complete(&self, code: &str, state: &str) -> Result<String, OAuthError> {
        let user_id = state_user_id(state).ok_or(OAuthError::InvalidState)?;

        if let Err(err) = self.verify_state(user_id, state).await {
            warn!(user_id = %user_id, error = %err, "Rejected OAuth callback");
            return Err(err);
        }

        let result = self.finish(user_id, code).await;

        let outcome = match &result {
            Ok(()) => {
                info!(user_id = %user_id, "Google account connected");
                OAuthCompletion::Connected
            }
            Err(err) => {
                error!(user_id = %user_id, error = %err, "OAuth flow failed");
                OAuthCompletion::Failed(err.to_string())
            }
        };
        self.broker.complete(user_id, outcome);

        result.map(|()| user_id.to_string())
    }

    /// Checks `state` against the pending one and consumes it.
    async fn verify_state(&self, user_id: &str, state: &str) -> Result<(), OAuthError> {
        let key = state_key(user_id);
        let stored = self.kv.get(&key).await?.ok_or(OAuthError::InvalidState)?;

        if !bool::from(stored.as_slice().ct_eq(state.as_bytes())) {
            return Err(OAuthError::InvalidState);
        }
        self.kv.delete(&key).await?;
        Ok(())
    }

    async fn finish(&self, user_id: &str, code: &str) -> Result<(), OAuthError> {
        let token = self.oauth.exchange_code(code).await?;
        store_token(self.kv.as_ref(), user_id, &token).await?;

        Ok(())
    }
}

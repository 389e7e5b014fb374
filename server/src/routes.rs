//! HTTP route handlers for the Drivewatch server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /health` - Health check endpoint
//! - `POST /api/v1/webhook` - Drive push notifications
//! - `POST /api/v1/command` - Chat commands
//! - `GET /api/v1/oauth/wait` - Blocks until the user's OAuth flow finishes
//! - `GET /oauth/connect` - Redirects to Google's consent screen
//! - `GET /oauth/complete` - OAuth redirect target
//!
//! Requests made on behalf of a chat user identify them with the
//! `X-User-ID` header, set by the chat server's plugin proxy.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use drivewatch_server::config::Config;
//! use drivewatch_server::routes::{create_router, AppState};
//! use drivewatch_server::store::MemoryKvStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::from_config(&config, Arc::new(MemoryKvStore::new()))
//!         .expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, Request, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, error, info, warn, Span};

use crate::activity::ActivityRouter;
use crate::broker::{OAuthBroker, OAuthCompletion, WaitError};
use crate::changes::{ChangeProcessor, PushNotification};
use crate::commands::CommandHandler;
use crate::config::Config;
use crate::credentials::{CredentialSource, StoredTokenSource};
use crate::drive::{DriveApi, GoogleDriveClient};
use crate::error::ServerError;
use crate::notify::{ChatWebhookSink, NotificationDispatcher};
use crate::oauth::{ConnectFlow, OAuthClient};
use crate::store::KvStore;
use crate::watch::WatchManager;

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the chat user on whose behalf a request is made.
const HEADER_USER_ID: &str = "X-User-ID";

const HEADER_CHANNEL_ID: &str = "X-Goog-Channel-ID";
const HEADER_RESOURCE_ID: &str = "X-Goog-Resource-ID";
const HEADER_RESOURCE_STATE: &str = "X-Goog-Resource-State";
const HEADER_MESSAGE_NUMBER: &str = "X-Goog-Message-Number";

/// Maximum body size for command requests (64 KB).
const MAX_BODY_SIZE: usize = 64 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Watch channel lifecycle, shared with the renewal scheduler.
    pub watch: Arc<WatchManager>,

    /// Chat command execution.
    pub commands: Arc<CommandHandler>,

    /// Push notification processing.
    pub changes: Arc<ChangeProcessor>,

    /// Account connect flow.
    pub connect: Arc<ConnectFlow>,

    /// OAuth completion broker.
    pub broker: OAuthBroker,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state from already-built components.
    #[must_use]
    pub fn new(
        watch: Arc<WatchManager>,
        commands: Arc<CommandHandler>,
        changes: Arc<ChangeProcessor>,
        connect: Arc<ConnectFlow>,
        broker: OAuthBroker,
    ) -> Self {
        Self {
            watch,
            commands,
            changes,
            connect,
            broker,
            start_time: Instant::now(),
        }
    }

    /// Wires every component against the Google and chat endpoints named in
    /// `config`, storing state in `kv`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Client`] if an HTTP client cannot be created.
    pub fn from_config(config: &Config, kv: Arc<dyn KvStore>) -> Result<Self, ServerError> {
        let broker = OAuthBroker::new(config.oauth_wait_timeout);

        let oauth = Arc::new(
            OAuthClient::new(
                &config.oauth_auth_url,
                config.oauth_token_url.clone(),
                config.google_client_id.clone(),
                config.google_client_secret.clone(),
                config.oauth_redirect_url(),
            )
            .map_err(|e| ServerError::client(e.to_string()))?,
        );
        let credentials: Arc<dyn CredentialSource> =
            Arc::new(StoredTokenSource::new(kv.clone(), oauth.clone()));
        let drive: Arc<dyn DriveApi> = Arc::new(
            GoogleDriveClient::new(config.drive_api_url.clone(), config.activity_api_url.clone())
                .map_err(|e| ServerError::client(e.to_string()))?,
        );
        let sink = Arc::new(
            ChatWebhookSink::new(config.chat_webhook_url.clone(), config.chat_token.clone())
                .map_err(|e| ServerError::client(e.to_string()))?,
        );

        let watch = Arc::new(WatchManager::new(
            kv.clone(),
            credentials.clone(),
            drive.clone(),
            config.webhook_url(),
        ));
        let router = ActivityRouter::new(
            drive.clone(),
            NotificationDispatcher::new(sink),
            config.public_url.clone(),
        );
        let changes = Arc::new(ChangeProcessor::new(kv.clone(), credentials, drive, router));
        let commands = Arc::new(CommandHandler::new(
            watch.clone(),
            kv.clone(),
            config.public_url.clone(),
        ));
        let connect = Arc::new(ConnectFlow::new(oauth, kv, broker.clone()));

        Ok(Self::new(watch, commands, changes, connect, broker))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("pending_oauth_waits", &self.broker.pending_count())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/command", post(post_command))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/api/v1/webhook", post(post_webhook))
        .route("/api/v1/oauth/wait", get(get_oauth_wait))
        .route("/oauth/connect", get(get_oauth_connect))
        .route("/oauth/complete", get(get_oauth_complete))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span without the query string, which carries OAuth codes and
/// state nonces.
fn request_span(request: &Request<Body>) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Reads `X-User-ID`, or builds the 401 response for its absence.
#[allow(clippy::result_large_err)]
fn require_user(headers: &HeaderMap) -> Result<&str, Response> {
    header(headers, HEADER_USER_ID).ok_or_else(|| {
        debug!("Missing or empty X-User-ID header");
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("missing X-User-ID header").with_code("missing_user")),
        )
            .into_response()
    })
}

// ============================================================================
// POST /api/v1/webhook - Drive push notifications
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// POST /api/v1/webhook - Receive a Drive push notification.
///
/// Drive retries deliveries that are not acknowledged quickly, so the
/// notification is processed in a background task and the request is
/// answered immediately.
///
/// # Responses
///
/// - `200 OK` - Notification accepted
/// - `400 Bad Request` - Missing `userId` or `X-Goog-Channel-ID`
async fn post_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(user_id) = query.user_id.filter(|u| !u.is_empty()) else {
        debug!("Webhook call without userId");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("missing userId parameter").with_code("missing_user")),
        )
            .into_response();
    };

    let Some(channel_id) = header(&headers, HEADER_CHANNEL_ID) else {
        debug!(user_id = %user_id, "Webhook call without channel header");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("missing X-Goog-Channel-ID header").with_code("missing_channel")),
        )
            .into_response();
    };

    let push = PushNotification {
        user_id,
        channel_id: channel_id.to_string(),
        resource_id: header(&headers, HEADER_RESOURCE_ID).map(str::to_string),
        resource_state: header(&headers, HEADER_RESOURCE_STATE)
            .unwrap_or_default()
            .to_string(),
        message_number: header(&headers, HEADER_MESSAGE_NUMBER).and_then(|n| n.parse().ok()),
    };

    debug!(
        user_id = %push.user_id,
        channel_id = %push.channel_id,
        resource_state = %push.resource_state,
        message_number = ?push.message_number,
        "Push notification received"
    );

    let changes = Arc::clone(&state.changes);
    tokio::spawn(async move {
        match changes.process(&push).await {
            Ok(delivered) => {
                debug!(user_id = %push.user_id, delivered, "Push notification processed");
            }
            Err(e) => {
                warn!(user_id = %push.user_id, error = %e, "Failed to process push notification");
            }
        }
    });

    StatusCode::OK.into_response()
}

// ============================================================================
// POST /api/v1/command - Chat commands
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub text: String,
}

/// POST /api/v1/command - Execute a chat command for `X-User-ID`.
///
/// Always answers `200` with the reply text once the user is identified;
/// command failures are reported in the text.
async fn post_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CommandRequest>,
) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    let text = state.commands.execute(user_id, &request.command).await;
    Json(CommandResponse { text }).into_response()
}

// ============================================================================
// GET /oauth/connect, GET /oauth/complete - Account connection
// ============================================================================

/// GET /oauth/connect - Redirect `X-User-ID` to Google's consent screen.
async fn get_oauth_connect(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    match state.connect.begin(user_id).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to start OAuth flow");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("failed to start OAuth flow").with_code("oauth_error")),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

const COMPLETE_SUCCESS_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Google Drive</title></head>\
<body><p>Completed connecting to Google Drive. Please close this window.</p></body></html>";

fn failure_page(reason: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>Google Drive</title></head>\
         <body><p>Failed to connect to Google Drive: {}</p></body></html>",
        escape_html(reason)
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// GET /oauth/complete - OAuth redirect target.
///
/// # Responses
///
/// - `200 OK` - Token stored, success page
/// - `400 Bad Request` - Consent denied, missing parameters or invalid state
/// - `500 Internal Server Error` - Token exchange or storage failed
async fn get_oauth_complete(
    State(state): State<AppState>,
    Query(query): Query<CompleteQuery>,
) -> Response {
    if let Some(reason) = query.error.as_deref() {
        info!(reason = %reason, "OAuth consent was not granted");
        return (StatusCode::BAD_REQUEST, Html(failure_page(reason))).into_response();
    }

    let (Some(code), Some(oauth_state)) = (query.code.as_deref(), query.state.as_deref()) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(failure_page("missing code or state")),
        )
            .into_response();
    };

    match state.connect.complete(code, oauth_state).await {
        Ok(_) => Html(COMPLETE_SUCCESS_PAGE).into_response(),
        Err(crate::oauth::OAuthError::InvalidState) => (
            StatusCode::BAD_REQUEST,
            Html(failure_page("invalid state")),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(failure_page(&e.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// GET /api/v1/oauth/wait - OAuth completion
// ============================================================================

/// Outcome reported by the wait endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitResponse {
    /// `connected`, `failed`, `timeout` or `closed`.
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WaitResponse {
    fn status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            error: None,
        }
    }
}

/// GET /api/v1/oauth/wait - Block until the OAuth flow of `X-User-ID`
/// completes, the broker's timeout elapses, or the server shuts down.
async fn get_oauth_wait(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    let outcome = state.broker.wait_for_completion(user_id).wait().await;
    let body = match outcome {
        Ok(OAuthCompletion::Connected) => WaitResponse::status("connected"),
        Ok(OAuthCompletion::Failed(reason)) => WaitResponse {
            status: "failed".to_string(),
            error: Some(reason),
        },
        Err(WaitError::Timeout(_)) => WaitResponse::status("timeout"),
        Err(WaitError::Closed) => WaitResponse::status("closed"),
    };

    Json(body).into_response()
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Health check response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Requests currently blocked on an OAuth completion.
    pub pending_oauth_waits: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        pending_oauth_waits: state.broker.pending_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

//! Shared helpers for integration tests.
//!
//! Every external endpoint (Drive, Drive Activity, OAuth token, chat) is
//! served by a single `wiremock` server under distinct paths.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use drivewatch_server::config::{Config, RenewalSettings};
use drivewatch_server::credentials::{store_token, StoredToken};
use drivewatch_server::store::KvStore;

pub const PUBLIC_URL: &str = "https://chat.example.com/plugins/drive";
pub const CHAT_PATH: &str = "/hooks/dm";

/// Configuration pointing every external API at `server`.
pub fn test_config(server: &MockServer) -> Config {
    Config {
        port: 0,
        public_url: PUBLIC_URL.to_string(),
        google_client_id: "client-id".to_string(),
        google_client_secret: "client-secret".to_string(),
        chat_webhook_url: format!("{}{CHAT_PATH}", server.uri()),
        chat_token: Some("chat-bot-token".to_string()),
        store_path: None,
        drive_api_url: server.uri(),
        activity_api_url: server.uri(),
        oauth_auth_url: format!("{}/o/oauth2/v2/auth", server.uri()),
        oauth_token_url: format!("{}/token", server.uri()),
        renewal: RenewalSettings {
            interval: Duration::from_secs(3600),
            lookahead: Duration::from_secs(24 * 3600),
            workers: 3,
        },
        oauth_wait_timeout: Duration::from_secs(5),
    }
}

/// Stores a non-expiring access token for `user_id`.
pub async fn connect_user(kv: &dyn KvStore, user_id: &str, access_token: &str) {
    let token = StoredToken {
        access_token: access_token.to_string(),
        refresh_token: Some(format!("refresh-{user_id}")),
        expiry: None,
    };
    store_token(kv, user_id, &token).await.unwrap();
}

/// Mounts `startPageToken`, `changes/watch` and `channels/stop` endpoints.
///
/// The watch endpoint echoes the requested channel id and derives the
/// resource id from it.
pub async fn mount_channel_endpoints(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/drive/v3/changes/startPageToken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "startPageToken": "start-100" })),
        )
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/changes/watch"))
        .respond_with(|request: &Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            let id = body["id"].as_str().unwrap_or_default().to_string();
            let expiration = (Utc::now() + ChronoDuration::days(7)).timestamp_millis();
            ResponseTemplate::new(200).set_body_json(json!({
                "kind": "api#channel",
                "id": id,
                "resourceId": format!("res-{id}"),
                "expiration": expiration.to_string(),
            }))
        })
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/drive/v3/channels/stop"))
        .respond_with(ResponseTemplate::new(204))
        .mount(server)
        .await;
}

/// Mounts an accepting chat endpoint.
pub async fn mount_chat_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

/// Requests received on `request_path`, in arrival order.
pub async fn requests_to(server: &MockServer, request_path: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == request_path)
        .collect()
}

/// JSON bodies received on `request_path`.
pub async fn bodies_to(server: &MockServer, request_path: &str) -> Vec<Value> {
    requests_to(server, request_path)
        .await
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

/// Polls `condition` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

pub fn shared<T: KvStore + 'static>(kv: T) -> Arc<dyn KvStore> {
    Arc::new(kv)
}

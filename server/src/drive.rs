//! Google Drive and Drive Activity REST client.
//!
//! [`DriveApi`] is the typed surface the rest of the server depends on; it
//! covers the change stream (start token, watch, stop, list), file and
//! comment lookups used to compose notifications, and the activity query.
//! [`GoogleDriveClient`] implements it over `reqwest`.
//!
//! All calls take the caller's [`AccessToken`]; the client holds no
//! per-user state and is shared across tasks via `Arc`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::credentials::AccessToken;

/// Default timeout for Google API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// File fields needed to compose notifications and detect shares.
const FILE_FIELDS: &str = "id,name,webViewLink,iconLink,createdTime,permissions,\
    sharingUser,lastModifyingUser,sharedWithMeTime,viewedByMeTime";

/// Page size for activity queries.
const ACTIVITY_PAGE_SIZE: u32 = 100;

/// Errors that can occur when calling Google APIs.
#[derive(Debug, Error)]
pub enum DriveError {
    /// The access token was rejected.
    #[error("unauthorized: access token rejected")]
    Unauthorized,

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Google is unreachable.
    #[error("drive unavailable: {0}")]
    Unavailable(String),

    /// Google answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    #[error("client configuration error: {0}")]
    Configuration(String),
}

impl DriveError {
    /// Returns true for 404 responses.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

// ==================== Change stream ====================

/// A watch channel registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRequest {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: &'static str,

    /// Callback URL Drive posts notifications to.
    pub address: String,

    /// Requested expiry in Unix milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiration: DateTime<Utc>,

    pub payload: bool,

    pub params: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ChannelRequest {
    /// Creates a `web_hook` channel request.
    pub fn web_hook(id: impl Into<String>, address: impl Into<String>, expiration: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind: "web_hook",
            address: address.into(),
            expiration,
            payload: true,
            params: BTreeMap::new(),
            resource_id: None,
        }
    }

    /// Adds a channel parameter echoed back by Drive.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A registered watch channel as returned by Drive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub resource_id: String,

    /// Drive encodes this as a string of Unix milliseconds.
    #[serde(deserialize_with = "deserialize_millis")]
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopChannelRequest<'a> {
    id: &'a str,
    resource_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageTokenResponse {
    start_page_token: String,
}

/// One page of the change stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub changes: Vec<Change>,

    /// Present when more pages follow.
    pub next_page_token: Option<String>,

    /// Present on the last page; the cursor for the next poll.
    pub new_start_page_token: Option<String>,
}

/// A single change in the change stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub file_id: Option<String>,

    #[serde(default)]
    pub removed: bool,

    pub time: Option<DateTime<Utc>>,

    pub file: Option<FileMetadata>,
}

// ==================== Files and comments ====================

/// A Drive user as embedded in files and comments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    #[serde(default)]
    pub display_name: String,

    pub email_address: Option<String>,

    #[serde(default)]
    pub me: bool,
}

/// A permission entry on a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub role: String,

    pub email_address: Option<String>,
}

/// File metadata used to compose notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub web_view_link: String,

    #[serde(default)]
    pub icon_link: String,

    pub created_time: Option<DateTime<Utc>>,

    pub sharing_user: Option<DriveUser>,

    pub last_modifying_user: Option<DriveUser>,

    #[serde(default)]
    pub permissions: Vec<Permission>,

    pub shared_with_me_time: Option<DateTime<Utc>>,

    pub viewed_by_me_time: Option<DateTime<Utc>>,
}

/// Text of the document a comment is anchored to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QuotedFileContent {
    #[serde(default)]
    pub value: String,
}

/// A reply in a comment thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub content: String,

    pub author: Option<DriveUser>,
}

/// A comment thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub content: String,

    pub author: Option<DriveUser>,

    pub quoted_file_content: Option<QuotedFileContent>,

    #[serde(default)]
    pub replies: Vec<Reply>,

    #[serde(default)]
    pub deleted: bool,
}

impl Comment {
    /// Display name of the comment author, empty when unknown.
    pub fn author_name(&self) -> &str {
        self.author
            .as_ref()
            .map(|a| a.display_name.as_str())
            .unwrap_or_default()
    }
}

// ==================== Drive Activity ====================

/// One entry of the Drive Activity API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveActivity {
    #[serde(default)]
    pub primary_action_detail: ActionDetail,

    #[serde(default)]
    pub actors: Vec<Actor>,

    #[serde(default)]
    pub targets: Vec<Target>,

    pub timestamp: Option<DateTime<Utc>>,

    pub time_range: Option<TimeRange>,
}

impl DriveActivity {
    /// When the activity happened: the timestamp, or the end of its range.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .or_else(|| self.time_range.as_ref().and_then(|r| r.end_time))
    }

    /// True when every actor is the user whose token ran the query.
    pub fn by_current_user(&self) -> bool {
        !self.actors.is_empty()
            && self.actors.iter().all(|a| {
                a.user
                    .as_ref()
                    .and_then(|u| u.known_user.as_ref())
                    .is_some_and(|k| k.is_current_user)
            })
    }

    /// The comment target, if the first target is a comment.
    pub fn file_comment(&self) -> Option<&FileComment> {
        self.targets.first().and_then(|t| t.file_comment.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// The primary action. Only comment actions are decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ActionDetail {
    pub comment: Option<CommentAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommentAction {
    pub post: Option<Subtyped>,
    pub suggestion: Option<Subtyped>,
    pub assignment: Option<Subtyped>,
}

/// A comment action detail carrying a subtype string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Subtyped {
    #[serde(default)]
    pub subtype: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Actor {
    pub user: Option<ActorUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorUser {
    pub known_user: Option<KnownUser>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownUser {
    #[serde(default)]
    pub person_name: String,

    #[serde(default)]
    pub is_current_user: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub file_comment: Option<FileComment>,
}

/// A comment target of an activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileComment {
    #[serde(default)]
    pub legacy_comment_id: String,

    #[serde(default)]
    pub legacy_discussion_id: String,

    #[serde(default)]
    pub link_to_discussion: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivityQuery<'a> {
    item_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,

    page_size: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    page_token: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityResponse {
    #[serde(default)]
    activities: Vec<DriveActivity>,
    next_page_token: Option<String>,
}

/// Accepts Unix milliseconds as a JSON string or number.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(i64),
        Text(String),
    }

    let millis = match Millis::deserialize(deserializer)? {
        Millis::Number(n) => n,
        Millis::Text(s) => s.parse().map_err(serde::de::Error::custom)?,
    };

    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {millis}")))
}

/// Operations on a user's Drive used by the watch manager and router.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Returns the cursor for changes made from now on.
    async fn get_start_page_token(&self, token: &AccessToken) -> Result<String, DriveError>;

    /// Registers a watch channel on the change stream starting at `page_token`.
    async fn watch_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
        request: &ChannelRequest,
    ) -> Result<Channel, DriveError>;

    /// Cancels a watch channel.
    async fn stop_channel(
        &self,
        token: &AccessToken,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), DriveError>;

    /// Reads one page of the change stream.
    async fn list_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
    ) -> Result<ChangeList, DriveError>;

    /// Fetches file metadata.
    async fn get_file(&self, token: &AccessToken, file_id: &str)
        -> Result<FileMetadata, DriveError>;

    /// Fetches a comment thread with its replies.
    async fn get_comment(
        &self,
        token: &AccessToken,
        file_id: &str,
        comment_id: &str,
        include_deleted: bool,
    ) -> Result<Comment, DriveError>;

    /// Lists activities on a file, optionally only those after `since`.
    async fn query_activity(
        &self,
        token: &AccessToken,
        file_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DriveActivity>, DriveError>;
}

/// REST implementation of [`DriveApi`].
#[derive(Debug, Clone)]
pub struct GoogleDriveClient {
    http_client: Client,
    drive_url: String,
    activity_url: String,
}

impl GoogleDriveClient {
    /// Creates a client for the given API base URLs.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        drive_url: impl Into<String>,
        activity_url: impl Into<String>,
    ) -> Result<Self, DriveError> {
        let drive_url = drive_url.into().trim_end_matches('/').to_string();
        let activity_url = activity_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DriveError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            drive_url,
            activity_url,
        })
    }

    /// Sends an authorized request and checks the status.
    async fn execute(
        &self,
        request: RequestBuilder,
        token: &AccessToken,
    ) -> Result<Response, DriveError> {
        let response = request
            .bearer_auth(token.secret())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DriveError::Timeout(REQUEST_TIMEOUT)
                } else if e.is_connect() {
                    DriveError::Unavailable(format!("connection failed: {e}"))
                } else {
                    DriveError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            debug!("Google rejected access token");
            return Err(DriveError::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Unexpected response from Google API");
            return Err(DriveError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        token: &AccessToken,
        what: &str,
    ) -> Result<T, DriveError> {
        self.execute(request, token)
            .await?
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(format!("failed to parse {what}: {e}")))
    }
}

#[async_trait]
impl DriveApi for GoogleDriveClient {
    async fn get_start_page_token(&self, token: &AccessToken) -> Result<String, DriveError> {
        let url = format!("{}/drive/v3/changes/startPageToken", self.drive_url);
        let response: StartPageTokenResponse = self
            .fetch_json(self.http_client.get(&url), token, "start page token")
            .await?;
        Ok(response.start_page_token)
    }

    async fn watch_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
        request: &ChannelRequest,
    ) -> Result<Channel, DriveError> {
        let url = format!("{}/drive/v3/changes/watch", self.drive_url);
        debug!(channel_id = %request.id, "Registering Drive watch channel");

        let builder = self
            .http_client
            .post(&url)
            .query(&[("pageToken", page_token)])
            .json(request);
        self.fetch_json(builder, token, "channel").await
    }

    async fn stop_channel(
        &self,
        token: &AccessToken,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), DriveError> {
        let url = format!("{}/drive/v3/channels/stop", self.drive_url);
        debug!(channel_id = %channel_id, "Stopping Drive watch channel");

        let builder = self.http_client.post(&url).json(&StopChannelRequest {
            id: channel_id,
            resource_id,
        });
        self.execute(builder, token).await?;
        Ok(())
    }

    async fn list_changes(
        &self,
        token: &AccessToken,
        page_token: &str,
    ) -> Result<ChangeList, DriveError> {
        let url = format!("{}/drive/v3/changes", self.drive_url);
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,time,file({FILE_FIELDS}))"
        );

        let builder = self
            .http_client
            .get(&url)
            .query(&[("pageToken", page_token), ("fields", fields.as_str())]);
        self.fetch_json(builder, token, "change list").await
    }

    async fn get_file(
        &self,
        token: &AccessToken,
        file_id: &str,
    ) -> Result<FileMetadata, DriveError> {
        let url = format!("{}/drive/v3/files/{file_id}", self.drive_url);
        let builder = self.http_client.get(&url).query(&[("fields", FILE_FIELDS)]);
        self.fetch_json(builder, token, "file metadata").await
    }

    async fn get_comment(
        &self,
        token: &AccessToken,
        file_id: &str,
        comment_id: &str,
        include_deleted: bool,
    ) -> Result<Comment, DriveError> {
        let url = format!(
            "{}/drive/v3/files/{file_id}/comments/{comment_id}",
            self.drive_url
        );
        let builder = self.http_client.get(&url).query(&[
            ("fields", "*"),
            ("includeDeleted", if include_deleted { "true" } else { "false" }),
        ]);
        self.fetch_json(builder, token, "comment").await
    }

    async fn query_activity(
        &self,
        token: &AccessToken,
        file_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DriveActivity>, DriveError> {
        let url = format!("{}/v2/activity:query", self.activity_url);
        let filter = since.map(|t| format!("time > {}", t.timestamp_millis()));

        let mut activities = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let body = ActivityQuery {
                item_name: format!("items/{file_id}"),
                filter: filter.clone(),
                page_size: ACTIVITY_PAGE_SIZE,
                page_token: page_token.as_deref(),
            };
            let response: ActivityResponse = self
                .fetch_json(self.http_client.post(&url).json(&body), token, "activity")
                .await?;

            activities.extend(response.activities);

            match response.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(activities)
    }
}

//! In-process fakes for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::credentials::{AccessToken, CredentialError, CredentialSource};
use crate::drive::{
    Change, ChangeList, Channel, ChannelRequest, Comment, DriveActivity, DriveApi, DriveError,
    FileMetadata,
};
use crate::notify::{NotificationSink, SinkError};
use crate::types::NotificationMessage;

/// A call observed by [`FakeDrive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveCall {
    StartPageToken,
    Watch {
        channel_id: String,
        page_token: String,
        address: String,
    },
    Stop {
        channel_id: String,
        resource_id: String,
    },
    ListChanges(String),
    GetFile(String),
    GetComment {
        file_id: String,
        comment_id: String,
        include_deleted: bool,
    },
    QueryActivity {
        file_id: String,
        since: Option<DateTime<Utc>>,
    },
}

/// Scriptable [`DriveApi`].
#[derive(Default)]
pub struct FakeDrive {
    pub calls: Mutex<Vec<DriveCall>>,
    pub fail_watch: AtomicBool,
    pub fail_stop: AtomicBool,
    pub start_token: Mutex<String>,
    pub change_pages: Mutex<HashMap<String, ChangeList>>,
    pub files: Mutex<HashMap<String, FileMetadata>>,
    pub comments: Mutex<HashMap<String, Comment>>,
    pub activities: Mutex<HashMap<String, Vec<DriveActivity>>>,
}

impl FakeDrive {
    pub fn new() -> Self {
        let drive = Self::default();
        *drive.start_token.lock().unwrap() = "start-1".to_string();
        drive
    }

    pub fn calls(&self) -> Vec<DriveCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stopped_channels(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriveCall::Stop { channel_id, .. } => Some(channel_id),
                _ => None,
            })
            .collect()
    }

    pub fn watched_channels(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriveCall::Watch { channel_id, .. } => Some(channel_id),
                _ => None,
            })
            .collect()
    }

    pub fn add_file(&self, file: FileMetadata) {
        self.files.lock().unwrap().insert(file.id.clone(), file);
    }

    pub fn add_comment(&self, comment_id: &str, comment: Comment) {
        self.comments
            .lock()
            .unwrap()
            .insert(comment_id.to_string(), comment);
    }

    pub fn add_activities(&self, file_id: &str, activities: Vec<DriveActivity>) {
        self.activities
            .lock()
            .unwrap()
            .insert(file_id.to_string(), activities);
    }

    pub fn add_changes(&self, page_token: &str, changes: Vec<Change>, next: Option<&str>, new_start: Option<&str>) {
        self.change_pages.lock().unwrap().insert(
            page_token.to_string(),
            ChangeList {
                changes,
                next_page_token: next.map(str::to_string),
                new_start_page_token: new_start.map(str::to_string),
            },
        );
    }

    fn record(&self, call: DriveCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn not_found() -> DriveError {
    DriveError::Status {
        status: 404,
        body: "not found".to_string(),
    }
}

#[async_trait]
impl DriveApi for FakeDrive {
    async fn get_start_page_token(&self, _token: &AccessToken) -> Result<String, DriveError> {
        self.record(DriveCall::StartPageToken);
        Ok(self.start_token.lock().unwrap().clone())
    }

    async fn watch_changes(
        &self,
        _token: &AccessToken,
        page_token: &str,
        request: &ChannelRequest,
    ) -> Result<Channel, DriveError> {
        self.record(DriveCall::Watch {
            channel_id: request.id.clone(),
            page_token: page_token.to_string(),
            address: request.address.clone(),
        });
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(DriveError::Unavailable("watch failed".into()));
        }
        Ok(Channel {
            id: request.id.clone(),
            resource_id: request
                .resource_id
                .clone()
                .unwrap_or_else(|| format!("res-{}", request.id)),
            expiration: request.expiration,
        })
    }

    async fn stop_channel(
        &self,
        _token: &AccessToken,
        channel_id: &str,
        resource_id: &str,
    ) -> Result<(), DriveError> {
        self.record(DriveCall::Stop {
            channel_id: channel_id.to_string(),
            resource_id: resource_id.to_string(),
        });
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(DriveError::Unavailable("stop failed".into()));
        }
        Ok(())
    }

    async fn list_changes(
        &self,
        _token: &AccessToken,
        page_token: &str,
    ) -> Result<ChangeList, DriveError> {
        self.record(DriveCall::ListChanges(page_token.to_string()));
        self.change_pages
            .lock()
            .unwrap()
            .get(page_token)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_file(
        &self,
        _token: &AccessToken,
        file_id: &str,
    ) -> Result<FileMetadata, DriveError> {
        self.record(DriveCall::GetFile(file_id.to_string()));
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_comment(
        &self,
        _token: &AccessToken,
        file_id: &str,
        comment_id: &str,
        include_deleted: bool,
    ) -> Result<Comment, DriveError> {
        self.record(DriveCall::GetComment {
            file_id: file_id.to_string(),
            comment_id: comment_id.to_string(),
            include_deleted,
        });
        self.comments
            .lock()
            .unwrap()
            .get(comment_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn query_activity(
        &self,
        _token: &AccessToken,
        file_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DriveActivity>, DriveError> {
        self.record(DriveCall::QueryActivity {
            file_id: file_id.to_string(),
            since,
        });
        Ok(self
            .activities
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// [`CredentialSource`] with a fixed set of connected users.
#[derive(Default)]
pub struct FakeCredentials {
    connected: Mutex<HashSet<String>>,
}

impl FakeCredentials {
    pub fn with_users(users: &[&str]) -> Self {
        Self {
            connected: Mutex::new(users.iter().map(|u| u.to_string()).collect()),
        }
    }

    pub fn disconnect(&self, user_id: &str) {
        self.connected.lock().unwrap().remove(user_id);
    }
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn access_token(&self, user_id: &str) -> Result<AccessToken, CredentialError> {
        if self.connected.lock().unwrap().contains(user_id) {
            Ok(AccessToken::new(format!("token-{user_id}")))
        } else {
            Err(CredentialError::NotConnected)
        }
    }
}

/// [`NotificationSink`] that records every message.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<NotificationMessage>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<NotificationMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn post(&self, message: &NotificationMessage) -> Result<(), SinkError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

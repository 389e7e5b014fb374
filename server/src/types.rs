//! Shared data types for the Drivewatch server.
//!
//! This module defines the persisted watch channel record and the
//! notification message model handed to the chat sink. Drive wire types
//! live in [`crate::drive`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One active Drive change subscription, keyed by the owning user.
///
/// Serialized with the field names used by the persisted key layout:
/// `channel_id`, `resource_id`, `mm_user_id` and `expiration` (Unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchChannelRecord {
    /// Channel identifier chosen at registration time.
    pub channel_id: String,

    /// Resource identifier returned by Drive for the subscribed stream.
    pub resource_id: String,

    /// Owning user.
    #[serde(rename = "mm_user_id")]
    pub user_id: String,

    /// Absolute expiry of the subscription.
    #[serde(rename = "expiration", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl WatchChannelRecord {
    /// Creates a record with `expires_at` truncated to whole seconds, the
    /// precision it is persisted with. A record built here compares equal
    /// to itself after a store round-trip.
    pub fn new(
        channel_id: impl Into<String>,
        resource_id: impl Into<String>,
        user_id: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            resource_id: resource_id.into(),
            user_id: user_id.into(),
            expires_at: expires_at.trunc_subsecs(0),
        }
    }

    /// Returns true once the subscription has expired.
    ///
    /// Stale records are kept in the store but treated as absent when
    /// deciding whether to deliver notifications.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns true if the subscription expires within `lookahead` of `now`.
    ///
    /// Already-expired records are always due.
    pub fn is_due_for_renewal(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        self.expires_at - now < lookahead
    }
}

/// A direct message to a single user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Recipient.
    pub user_id: String,

    /// Plain-text body. May be empty when the attachment carries the content.
    pub message: String,

    /// Optional structured attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl NotificationMessage {
    /// Creates a plain-text message.
    pub fn text(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            attachment: None,
        }
    }

    /// Attaches a structured attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Structured message attachment (title, body, links and buttons).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pretext: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title_link: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub footer: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub footer_icon: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<AttachmentAction>,
}

/// An actionable button on an attachment.
///
/// Pressing the button posts `integration.context` to `integration.url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentAction {
    pub name: String,
    pub integration: ActionIntegration,
}

/// Target of an attachment action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionIntegration {
    pub url: String,

    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

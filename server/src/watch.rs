//! Watch channel lifecycle: registration, renewal and cancellation.
//!
//! [`WatchManager`] is the only writer of watch channel records. Renewal is
//! register-then-cancel so a user is never left without an active channel
//! when the new registration fails, and the new record is written with a
//! compare-and-set against the record the renewal started from. A renewal
//! that loses against a concurrent stop or restart cancels the channel it
//! just created instead of resurrecting the subscription.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::{AccessToken, CredentialSource};
use crate::drive::{ChannelRequest, DriveApi, DriveError};
use crate::error::WatchError;
use crate::store::{ChangeCursor, ChannelStore, CursorStore, KvStore};
use crate::types::WatchChannelRecord;

/// Lifetime requested for every channel (7 days).
pub const CHANNEL_VALIDITY_SECS: i64 = 604_800;

fn channel_validity() -> Duration {
    Duration::seconds(CHANNEL_VALIDITY_SECS)
}

/// Registers, renews and cancels per-user watch channels.
pub struct WatchManager {
    channels: ChannelStore,
    cursors: CursorStore,
    credentials: Arc<dyn CredentialSource>,
    drive: Arc<dyn DriveApi>,
    webhook_url: String,
}

impl WatchManager {
    /// Creates a manager delivering notifications to `webhook_url`.
    pub fn new(
        kv: Arc<dyn KvStore>,
        credentials: Arc<dyn CredentialSource>,
        drive: Arc<dyn DriveApi>,
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            channels: ChannelStore::new(kv.clone()),
            cursors: CursorStore::new(kv),
            credentials,
            drive,
            webhook_url: webhook_url.into(),
        }
    }

    /// Returns the channel store the manager writes to.
    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    /// Registers a watch channel for `user_id` and stores it, replacing any
    /// previous record.
    ///
    /// Passing `channel_id` re-registers the same logical channel; otherwise
    /// a fresh id is generated.
    pub async fn start_watch(
        &self,
        user_id: &str,
        channel_id: Option<&str>,
        resource_id: Option<&str>,
    ) -> Result<WatchChannelRecord, WatchError> {
        let token = self.token(user_id).await?;
        let (record, page_token) = self
            .register(&token, user_id, channel_id, resource_id, Utc::now())
            .await?;

        if let Err(e) = self.channels.put(&record).await {
            warn!(
                user_id = %user_id,
                channel_id = %record.channel_id,
                error = %e,
                "Watch channel registered but not persisted; subscription left dangling"
            );
            return Err(WatchError::Persistence(e));
        }

        self.init_cursor(user_id, page_token).await?;

        info!(
            user_id = %user_id,
            channel_id = %record.channel_id,
            expires_at = %record.expires_at,
            "Watch channel started"
        );
        Ok(record)
    }

    /// Cancels the stored channel for `user_id` and forgets it.
    ///
    /// Fails with [`WatchError::NotFound`] without calling Drive when no
    /// record exists.
    pub async fn stop_watch(&self, user_id: &str) -> Result<(), WatchError> {
        let record = self
            .channels
            .get(user_id)
            .await?
            .ok_or_else(|| WatchError::NotFound(user_id.to_string()))?;

        let token = self.token(user_id).await?;
        self.cancel(&token, &record).await?;

        self.channels.delete(user_id).await?;
        self.cursors.delete(user_id).await?;

        info!(user_id = %user_id, channel_id = %record.channel_id, "Watch channel stopped");
        Ok(())
    }

    /// Replaces `current` with a freshly registered channel.
    ///
    /// The old channel is cancelled only after the new record is stored;
    /// failing to cancel it is logged, since it expires on its own.
    pub async fn renew(
        &self,
        current: &WatchChannelRecord,
        now: DateTime<Utc>,
    ) -> Result<WatchChannelRecord, WatchError> {
        let user_id = current.user_id.as_str();
        let token = self.token(user_id).await?;
        let (renewed, page_token) = self.register(&token, user_id, None, None, now).await?;

        match self.channels.replace(current, &renewed).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(user_id = %user_id, "Watch channel changed during renewal, rolling back");
                if let Err(e) = self.cancel(&token, &renewed).await {
                    warn!(
                        user_id = %user_id,
                        channel_id = %renewed.channel_id,
                        error = %e,
                        "Failed to cancel superseded watch channel"
                    );
                }
                return Err(WatchError::Superseded(user_id.to_string()));
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    channel_id = %renewed.channel_id,
                    error = %e,
                    "Renewed watch channel not persisted; subscription left dangling"
                );
                return Err(WatchError::Persistence(e));
            }
        }

        self.init_cursor(user_id, page_token).await?;

        if let Err(e) = self.cancel(&token, current).await {
            warn!(
                user_id = %user_id,
                channel_id = %current.channel_id,
                error = %e,
                "Failed to cancel replaced watch channel"
            );
        }

        info!(
            user_id = %user_id,
            old_channel_id = %current.channel_id,
            channel_id = %renewed.channel_id,
            expires_at = %renewed.expires_at,
            "Watch channel renewed"
        );
        Ok(renewed)
    }

    async fn token(&self, user_id: &str) -> Result<AccessToken, WatchError> {
        self.credentials
            .access_token(user_id)
            .await
            .map_err(|e| WatchError::credential(user_id, e))
    }

    /// Registers a channel with Drive. Returns the record and the page
    /// token the channel starts from.
    async fn register(
        &self,
        token: &AccessToken,
        user_id: &str,
        channel_id: Option<&str>,
        resource_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(WatchChannelRecord, String), WatchError> {
        let page_token = self
            .drive
            .get_start_page_token(token)
            .await
            .map_err(WatchError::Registration)?;

        let address = Url::parse_with_params(&self.webhook_url, &[("userId", user_id)])
            .map_err(|e| {
                WatchError::Registration(DriveError::Configuration(format!(
                    "invalid webhook URL: {e}"
                )))
            })?;

        let id = channel_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let mut request = ChannelRequest::web_hook(id, address, now + channel_validity())
            .param("userId", user_id);
        request.resource_id = resource_id.map(str::to_string);

        let channel = self
            .drive
            .watch_changes(token, &page_token, &request)
            .await
            .map_err(WatchError::Registration)?;

        let record = WatchChannelRecord::new(
            channel.id,
            channel.resource_id,
            user_id,
            channel.expiration,
        );
        Ok((record, page_token))
    }

    async fn cancel(
        &self,
        token: &AccessToken,
        record: &WatchChannelRecord,
    ) -> Result<(), WatchError> {
        match self
            .drive
            .stop_channel(token, &record.channel_id, &record.resource_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(channel_id = %record.channel_id, "Watch channel already gone");
                Ok(())
            }
            Err(e) => Err(WatchError::Cancellation(e)),
        }
    }

    /// Starts the change cursor unless the user already has one, so a
    /// renewal never skips unprocessed changes.
    async fn init_cursor(&self, user_id: &str, page_token: String) -> Result<(), WatchError> {
        let cursor = ChangeCursor {
            page_token,
            last_activity_at: None,
        };
        self.cursors.init(user_id, &cursor).await?;
        Ok(())
    }
}

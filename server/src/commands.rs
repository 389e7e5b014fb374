//! Chat command handling.
//!
//! Every command answers with a short human-readable string; internal
//! errors are logged and replaced by a generic message.

use std::sync::Arc;

use tracing::{error, warn};

use crate::credentials::{is_connected, token_key};
use crate::error::WatchError;
use crate::store::KvStore;
use crate::watch::WatchManager;

pub const NOTIFICATIONS_STARTED: &str = "Successfully enabled drive activity notifications.";

pub const NOTIFICATIONS_START_FAILED: &str = "Something went wrong while starting Drive activity \
     notifications. Please contact your organization admin for support.";

pub const NOTIFICATIONS_STOPPED: &str = "Successfully disabled drive activity notifications.";

pub const NOTIFICATIONS_STOP_FAILED: &str = "Something went wrong while stopping Drive activity \
     notifications. Please contact your organization admin for support.";

pub const ALREADY_CONNECTED: &str = "You have already connected your Google account. If you want \
     to reconnect then disconnect the account first using `/drive disconnect`.";

pub const NOT_CONNECTED: &str = "There is no Google account connected to your account.";

pub const DISCONNECTED: &str = "Your Google account has been disconnected.";

pub const GENERIC_FAILURE: &str = "Something went wrong. Please contact your organization admin for support.";

pub const HELP_TEXT: &str = "Available commands:\n\
     * `/drive connect` - Connect your Google account\n\
     * `/drive disconnect` - Disconnect your Google account\n\
     * `/drive notifications start` - Start Drive activity notifications\n\
     * `/drive notifications stop` - Stop Drive activity notifications\n\
     * `/drive help` - Show this help text";

/// Executes chat commands on behalf of a user.
pub struct CommandHandler {
    watch: Arc<WatchManager>,
    kv: Arc<dyn KvStore>,
    public_url: String,
}

impl CommandHandler {
    /// Creates a handler. `public_url` is used to build the connect link.
    pub fn new(watch: Arc<WatchManager>, kv: Arc<dyn KvStore>, public_url: impl Into<String>) -> Self {
        Self {
            watch,
            kv,
            public_url: public_url.into(),
        }
    }

    /// Runs `command` for `user_id` and returns the reply text.
    ///
    /// A leading trigger word such as `/drive` is ignored.
    pub async fn execute(&self, user_id: &str, command: &str) -> String {
        let mut words = command.split_whitespace().peekable();
        if words.peek().is_some_and(|w| w.starts_with('/')) {
            words.next();
        }

        match (words.next(), words.next()) {
            (Some("connect"), _) => self.connect(user_id).await,
            (Some("disconnect"), _) => self.disconnect(user_id).await,
            (Some("notifications"), Some("start")) => self.start_notifications(user_id).await,
            (Some("notifications"), Some("stop")) => self.stop_notifications(user_id).await,
            (Some("notifications"), Some(other)) => {
                format!("`{other}` is not a valid notifications subcommand")
            }
            _ => HELP_TEXT.to_string(),
        }
    }

    async fn start_notifications(&self, user_id: &str) -> String {
        match self.watch.start_watch(user_id, None, None).await {
            Ok(_) => NOTIFICATIONS_STARTED.to_string(),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to start notifications");
                NOTIFICATIONS_START_FAILED.to_string()
            }
        }
    }

    async fn stop_notifications(&self, user_id: &str) -> String {
        match self.watch.stop_watch(user_id).await {
            Ok(()) => NOTIFICATIONS_STOPPED.to_string(),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to stop notifications");
                NOTIFICATIONS_STOP_FAILED.to_string()
            }
        }
    }

    async fn connect(&self, user_id: &str) -> String {
        match is_connected(self.kv.as_ref(), user_id).await {
            Ok(true) => ALREADY_CONNECTED.to_string(),
            Ok(false) => format!(
                "[Click here to link your Google account.]({}/oauth/connect)",
                self.public_url
            ),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to read connection status");
                GENERIC_FAILURE.to_string()
            }
        }
    }

    /// Stops notifications, if any, then forgets the token.
    async fn disconnect(&self, user_id: &str) -> String {
        match is_connected(self.kv.as_ref(), user_id).await {
            Ok(true) => {}
            Ok(false) => return NOT_CONNECTED.to_string(),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to read connection status");
                return GENERIC_FAILURE.to_string();
            }
        }

        match self.watch.stop_watch(user_id).await {
            Ok(()) | Err(WatchError::NotFound(_)) => {}
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to stop notifications on disconnect");
            }
        }

        match self.kv.delete(&token_key(user_id)).await {
            Ok(()) => DISCONNECTED.to_string(),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to delete token");
                GENERIC_FAILURE.to_string()
            }
        }
    }
}

//! Error types for the Drivewatch server.
//!
//! This module defines the error hierarchy shared across components.
//! Lower-level components own their own error enums ([`StoreError`],
//! [`DriveError`], [`CredentialError`], ...); this module groups them into
//! the watch lifecycle taxonomy and the top-level server error.
//!
//! # Error Types
//!
//! - [`WatchError`] - Failures of watch channel registration, renewal and cancellation
//! - [`ServerError`] - Top-level server errors encompassing startup failure modes
//!
//! [`StoreError`]: crate::store::StoreError
//! [`DriveError`]: crate::drive::DriveError
//! [`CredentialError`]: crate::credentials::CredentialError

use std::error::Error;
use std::fmt;

use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::drive::DriveError;
use crate::store::StoreError;

/// Failures of the watch channel lifecycle.
///
/// | Variant | Retry policy |
/// |---------|--------------|
/// | `Credential` | none until the user reconnects |
/// | `Registration` / `Cancellation` | next scheduled renewal tick |
/// | `Persistence` | none; the external subscription is left dangling |
/// | `NotFound` | none |
/// | `Superseded` | none; a concurrent stop or restart won |
#[derive(ThisError, Debug)]
pub enum WatchError {
    /// No usable token exists for the user.
    #[error("no valid credentials for user {user_id}: {source}")]
    Credential {
        user_id: String,
        #[source]
        source: CredentialError,
    },

    /// Registering the watch channel with Drive failed.
    #[error("failed to register watch channel: {0}")]
    Registration(#[source] DriveError),

    /// Cancelling a watch channel with Drive failed.
    #[error("failed to cancel watch channel: {0}")]
    Cancellation(#[source] DriveError),

    /// Writing the channel record failed after a successful registration.
    #[error("failed to persist watch channel: {0}")]
    Persistence(#[from] StoreError),

    /// Stop requested for a user without a known subscription.
    #[error("no watch channel found for user {0}")]
    NotFound(String),

    /// A renewal lost the race against a concurrent stop or restart.
    #[error("watch channel for user {0} changed during renewal")]
    Superseded(String),
}

impl WatchError {
    /// Creates a credential error for the given user.
    pub fn credential(user_id: impl Into<String>, source: CredentialError) -> Self {
        Self::Credential {
            user_id: user_id.into(),
            source,
        }
    }

    /// Returns `true` if a later renewal tick may succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Registration(_) | Self::Cancellation(_))
    }
}

/// Top-level error type for the Drivewatch server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// The key-value store could not be opened.
    Store(StoreError),

    /// An HTTP client could not be constructed.
    Client(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Client(msg) => write!(f, "client setup error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl ServerError {
    /// Creates a new client setup error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use drivewatch_server::error::ServerError;
    ///
    /// let err = ServerError::client("invalid TLS backend");
    /// assert!(matches!(err, ServerError::Client(_)));
    /// ```
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    /// Creates a new internal error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use drivewatch_server::error::ServerError;
    ///
    /// let err = ServerError::internal("listener closed");
    /// assert!(matches!(err, ServerError::Internal(_)));
    /// ```
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// A specialized Result type for server startup.
pub type Result<T> = std::result::Result<T, ServerError>;

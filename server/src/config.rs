//! Server configuration module.
//!
//! Parses configuration from environment variables for the Drivewatch server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DRIVEWATCH_PUBLIC_URL` | Yes | - | Public site URL of this server |
//! | `DRIVEWATCH_GOOGLE_CLIENT_ID` | Yes | - | Google OAuth client ID |
//! | `DRIVEWATCH_GOOGLE_CLIENT_SECRET` | Yes | - | Google OAuth client secret |
//! | `DRIVEWATCH_CHAT_WEBHOOK_URL` | Yes | - | Endpoint that posts direct messages |
//! | `DRIVEWATCH_CHAT_TOKEN` | No | - | Bearer token for the chat endpoint |
//! | `DRIVEWATCH_STORE_PATH` | No | - | JSON snapshot file for the key-value store |
//! | `DRIVEWATCH_DRIVE_API_URL` | No | `https://www.googleapis.com` | Drive REST API |
//! | `DRIVEWATCH_ACTIVITY_API_URL` | No | `https://driveactivity.googleapis.com` | Drive Activity API |
//! | `DRIVEWATCH_OAUTH_AUTH_URL` | No | Google authorize endpoint | OAuth authorization URL |
//! | `DRIVEWATCH_OAUTH_TOKEN_URL` | No | Google token endpoint | OAuth token URL |
//! | `DRIVEWATCH_RENEWAL_INTERVAL_SECS` | No | 43200 | Renewal tick period |
//! | `DRIVEWATCH_RENEWAL_LOOKAHEAD_SECS` | No | 86400 | Renew channels expiring within this window |
//! | `DRIVEWATCH_RENEWAL_WORKERS` | No | 5 | Concurrent renewal workers |
//! | `DRIVEWATCH_OAUTH_WAIT_TIMEOUT_SECS` | No | 300 | OAuth completion wait timeout |
//! | `PORT` | No | 8080 | HTTP server port |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const DEFAULT_DRIVE_API_URL: &str = "https://www.googleapis.com";
const DEFAULT_ACTIVITY_API_URL: &str = "https://driveactivity.googleapis.com";
const DEFAULT_OAUTH_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Drive does not allow indefinite watch channels, so they are replaced
/// every 12 hours when close to expiry.
const DEFAULT_RENEWAL_INTERVAL_SECS: u64 = 12 * 60 * 60;

const DEFAULT_RENEWAL_LOOKAHEAD_SECS: u64 = 24 * 60 * 60;

const DEFAULT_RENEWAL_WORKERS: usize = 5;

const DEFAULT_OAUTH_WAIT_TIMEOUT_SECS: u64 = 5 * 60;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Renewal scheduler settings.
#[derive(Debug, Clone)]
pub struct RenewalSettings {
    /// Period between renewal ticks.
    pub interval: Duration,

    /// Channels expiring within this window are renewed.
    pub lookahead: Duration,

    /// Number of concurrent renewal workers.
    pub workers: usize,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_RENEWAL_INTERVAL_SECS),
            lookahead: Duration::from_secs(DEFAULT_RENEWAL_LOOKAHEAD_SECS),
            workers: DEFAULT_RENEWAL_WORKERS,
        }
    }
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Public URL this server is reachable at, without trailing slash.
    pub public_url: String,

    /// Google OAuth client ID.
    pub google_client_id: String,

    /// Google OAuth client secret.
    pub google_client_secret: String,

    /// Endpoint that posts a direct message to a user.
    pub chat_webhook_url: String,

    /// Optional bearer token for the chat endpoint.
    pub chat_token: Option<String>,

    /// Snapshot file for the key-value store. In-memory only when unset.
    pub store_path: Option<PathBuf>,

    /// Base URL of the Drive REST API.
    pub drive_api_url: String,

    /// Base URL of the Drive Activity API.
    pub activity_api_url: String,

    /// OAuth authorization endpoint.
    pub oauth_auth_url: String,

    /// OAuth token endpoint.
    pub oauth_token_url: String,

    /// Renewal scheduler settings.
    pub renewal: RenewalSettings,

    /// How long an OAuth completion wait blocks before timing out.
    pub oauth_wait_timeout: Duration,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing
    /// - A URL does not parse as an absolute `http`/`https` URL
    /// - A numeric value does not parse or is zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use drivewatch_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let public_url = parse_url("DRIVEWATCH_PUBLIC_URL", None)?;
        let google_client_id = required("DRIVEWATCH_GOOGLE_CLIENT_ID")?;
        let google_client_secret = required("DRIVEWATCH_GOOGLE_CLIENT_SECRET")?;
        let chat_webhook_url = parse_url("DRIVEWATCH_CHAT_WEBHOOK_URL", None)?;
        let chat_token = optional("DRIVEWATCH_CHAT_TOKEN");
        let store_path = optional("DRIVEWATCH_STORE_PATH").map(PathBuf::from);
        let drive_api_url = parse_url("DRIVEWATCH_DRIVE_API_URL", Some(DEFAULT_DRIVE_API_URL))?;
        let activity_api_url =
            parse_url("DRIVEWATCH_ACTIVITY_API_URL", Some(DEFAULT_ACTIVITY_API_URL))?;
        let oauth_auth_url = parse_url("DRIVEWATCH_OAUTH_AUTH_URL", Some(DEFAULT_OAUTH_AUTH_URL))?;
        let oauth_token_url =
            parse_url("DRIVEWATCH_OAUTH_TOKEN_URL", Some(DEFAULT_OAUTH_TOKEN_URL))?;

        let renewal = RenewalSettings {
            interval: Duration::from_secs(parse_positive(
                "DRIVEWATCH_RENEWAL_INTERVAL_SECS",
                DEFAULT_RENEWAL_INTERVAL_SECS,
            )?),
            lookahead: Duration::from_secs(parse_positive(
                "DRIVEWATCH_RENEWAL_LOOKAHEAD_SECS",
                DEFAULT_RENEWAL_LOOKAHEAD_SECS,
            )?),
            workers: parse_positive("DRIVEWATCH_RENEWAL_WORKERS", DEFAULT_RENEWAL_WORKERS as u64)?
                as usize,
        };
        let oauth_wait_timeout = Duration::from_secs(parse_positive(
            "DRIVEWATCH_OAUTH_WAIT_TIMEOUT_SECS",
            DEFAULT_OAUTH_WAIT_TIMEOUT_SECS,
        )?);

        let config = Self {
            port,
            public_url,
            google_client_id,
            google_client_secret,
            chat_webhook_url,
            chat_token,
            store_path,
            drive_api_url,
            activity_api_url,
            oauth_auth_url,
            oauth_token_url,
            renewal,
            oauth_wait_timeout,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.renewal.lookahead <= self.renewal.interval {
            return Err(ConfigError::ValidationError(format!(
                "renewal lookahead ({}s) must exceed the renewal interval ({}s) \
                 or channels can expire between ticks",
                self.renewal.lookahead.as_secs(),
                self.renewal.interval.as_secs()
            )));
        }

        Ok(())
    }

    /// URL Drive posts change notifications to.
    pub fn webhook_url(&self) -> String {
        format!("{}/api/v1/webhook", self.public_url)
    }

    /// OAuth redirect URL registered with Google.
    pub fn oauth_redirect_url(&self) -> String {
        format!("{}/oauth/complete", self.public_url)
    }
}

/// Read a required, non-empty environment variable.
fn required(name: &str) -> Result<String, ConfigError> {
    optional(name).ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Read an optional environment variable, treating empty values as unset.
fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an absolute http(s) URL and trim trailing slashes.
fn parse_url(name: &str, default: Option<&str>) -> Result<String, ConfigError> {
    let raw = match (optional(name), default) {
        (Some(value), _) => value,
        (None, Some(default)) => default.to_string(),
        (None, None) => return Err(ConfigError::MissingEnvVar(name.to_string())),
    };

    let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidFormat {
        var: name.to_string(),
        message: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(raw.trim_end_matches('/').to_string())
}

/// Parse a positive integer, falling back to `default` when unset.
fn parse_positive(name: &str, default: u64) -> Result<u64, ConfigError> {
    let Some(raw) = optional(name) else {
        return Ok(default);
    };

    let value: u64 = raw.parse().map_err(|_| ConfigError::InvalidFormat {
        var: name.to_string(),
        message: format!("expected a positive integer, got '{raw}'"),
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(value)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

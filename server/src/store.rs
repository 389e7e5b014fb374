//! Key-value persistence for watch channels, change cursors and tokens.
//!
//! The [`KvStore`] trait is the only shared mutable resource in the server.
//! Every operation is atomic on its own; callers that need read-modify-write
//! semantics go through [`KvStore::compare_and_set`] instead of holding
//! in-process state.
//!
//! # Key Layout
//!
//! | Prefix | Value |
//! |--------|-------|
//! | `drive_change_channels-<user>` | [`WatchChannelRecord`] |
//! | `drive_change_cursor-<user>` | [`ChangeCursor`] |
//! | `google_token-<user>` | stored OAuth token |
//! | `oauth_state-<user>` | pending OAuth state |
//!
//! # Persistence
//!
//! [`MemoryKvStore`] keeps everything in a `BTreeMap`. When opened with a
//! path it loads a JSON snapshot at startup and rewrites it after every
//! mutation (written to a temporary file, then renamed into place).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::WatchChannelRecord;

/// Key prefix for watch channel records.
pub const WATCH_CHANNEL_PREFIX: &str = "drive_change_channels-";

/// Key prefix for change cursors.
pub const CHANGE_CURSOR_PREFIX: &str = "drive_change_cursor-";

/// Key prefix for stored OAuth tokens.
pub const TOKEN_PREFIX: &str = "google_token-";

/// Key prefix for pending OAuth states.
pub const OAUTH_STATE_PREFIX: &str = "oauth_state-";

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Reading or writing the snapshot file failed.
    #[error("store I/O error: {0}")]
    Io(String),

    /// A value could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Atomic key-value operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Replaces the value under `key` only if it currently equals `expected`.
    ///
    /// `expected == None` means "key must be absent"; `new == None` deletes
    /// the key. Returns `false` without writing when the current value does
    /// not match.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, StoreError>;

    /// Lists keys starting with `prefix`, in ascending order, one page at a time.
    async fn list_keys(
        &self,
        page: usize,
        per_page: usize,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError>;
}

/// In-memory [`KvStore`] with optional JSON snapshot persistence.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    snapshot_path: Option<PathBuf>,
}

/// On-disk snapshot format: keys to base64-encoded values.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, String>,
}

impl MemoryKvStore {
    /// Creates an empty, purely in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store backed by a snapshot file.
    ///
    /// A missing file starts an empty store; the file is created on the
    /// first mutation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                let mut entries = BTreeMap::new();
                for (key, value) in snapshot.entries {
                    let decoded = STANDARD.decode(value.as_bytes()).map_err(|e| {
                        StoreError::Serialization(format!("invalid value for key '{key}': {e}"))
                    })?;
                    entries.insert(key, decoded);
                }
                entries
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StoreError::Io(err.to_string())),
        };

        debug!(path = %path.display(), entries = entries.len(), "Opened key-value store");

        Ok(Self {
            entries: RwLock::new(entries),
            snapshot_path: Some(path),
        })
    }

    /// Returns the number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Applies `update` to `entries`. With a snapshot file the update is
    /// written to disk first and only becomes visible once that succeeds.
    async fn commit<F>(
        &self,
        entries: &mut BTreeMap<String, Vec<u8>>,
        update: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<String, Vec<u8>>),
    {
        if self.snapshot_path.is_none() {
            update(entries);
            return Ok(());
        }

        let mut next = entries.clone();
        update(&mut next);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    /// Rewrites the snapshot file, if any. Called with the write lock held
    /// so snapshots are never written out of order.
    async fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        self.commit(&mut entries, |map| {
            map.insert(key.to_string(), value);
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            self.commit(&mut entries, |map| {
                map.remove(key);
            })
            .await?;
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;

        if entries.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }

        self.commit(&mut entries, |map| match new {
            Some(value) => {
                map.insert(key.to_string(), value);
            }
            None => {
                map.remove(key);
            }
        })
        .await?;

        Ok(true)
    }

    async fn list_keys(
        &self,
        page: usize,
        per_page: usize,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;

        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .skip(page.saturating_mul(per_page))
            .take(per_page)
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Reads and decodes a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match kv.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON value.
pub async fn set_json<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    kv.set(key, serde_json::to_vec(value)?).await
}

/// Typed view over the watch channel namespace.
///
/// At most one record exists per user: the key is derived from the user ID.
#[derive(Clone)]
pub struct ChannelStore {
    kv: Arc<dyn KvStore>,
}

impl ChannelStore {
    /// Wraps a key-value store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Storage key for a user's channel record.
    pub fn key(user_id: &str) -> String {
        format!("{WATCH_CHANNEL_PREFIX}{user_id}")
    }

    /// Loads the record for `user_id`.
    pub async fn get(&self, user_id: &str) -> Result<Option<WatchChannelRecord>, StoreError> {
        get_json(self.kv.as_ref(), &Self::key(user_id)).await
    }

    /// Stores `record`, overwriting any prior record for the same user.
    pub async fn put(&self, record: &WatchChannelRecord) -> Result<(), StoreError> {
        set_json(self.kv.as_ref(), &Self::key(&record.user_id), record).await
    }

    /// Replaces `current` with `new` only if the store still holds `current`.
    ///
    /// Returns `false` if the record was deleted or replaced in between.
    pub async fn replace(
        &self,
        current: &WatchChannelRecord,
        new: &WatchChannelRecord,
    ) -> Result<bool, StoreError> {
        let expected = serde_json::to_vec(current)?;
        let value = serde_json::to_vec(new)?;
        self.kv
            .compare_and_set(&Self::key(&current.user_id), Some(&expected), Some(value))
            .await
    }

    /// Deletes the record for `user_id`.
    pub async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.delete(&Self::key(user_id)).await
    }

    /// Loads one page of records.
    ///
    /// An empty result means there are no further pages. Entries that fail
    /// to decode are logged and skipped, so a page may hold fewer than
    /// `per_page` records without being the last one.
    pub async fn list_page(
        &self,
        page: usize,
        per_page: usize,
    ) -> Result<ListPage, StoreError> {
        let keys = self.kv.list_keys(page, per_page, WATCH_CHANNEL_PREFIX).await?;
        let key_count = keys.len();
        let mut records = Vec::with_capacity(key_count);

        for key in keys {
            match get_json::<WatchChannelRecord>(self.kv.as_ref(), &key).await {
                Ok(Some(record)) => records.push(record),
                // Deleted between listing and reading.
                Ok(None) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping undecodable watch channel record");
                }
            }
        }

        Ok(ListPage { key_count, records })
    }
}

/// One page of a [`ChannelStore`] listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Number of keys the page covered, including skipped entries.
    pub key_count: usize,

    /// Decoded records.
    pub records: Vec<WatchChannelRecord>,
}

/// Position in a user's Drive change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCursor {
    /// Next changes page token to read from.
    pub page_token: String,

    /// Newest activity already notified about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Typed view over the change cursor namespace.
#[derive(Clone)]
pub struct CursorStore {
    kv: Arc<dyn KvStore>,
}

impl CursorStore {
    /// Wraps a key-value store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(user_id: &str) -> String {
        format!("{CHANGE_CURSOR_PREFIX}{user_id}")
    }

    /// Loads the cursor for `user_id`.
    pub async fn get(&self, user_id: &str) -> Result<Option<ChangeCursor>, StoreError> {
        get_json(self.kv.as_ref(), &Self::key(user_id)).await
    }

    /// Stores the cursor for `user_id`.
    pub async fn put(&self, user_id: &str, cursor: &ChangeCursor) -> Result<(), StoreError> {
        set_json(self.kv.as_ref(), &Self::key(user_id), cursor).await
    }

    /// Forgets the cursor for `user_id`.
    pub async fn delete(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.delete(&Self::key(user_id)).await
    }

    /// Stores `cursor` only if the user has none yet.
    ///
    /// Used at registration so a renewal never skips unprocessed changes.
    pub async fn init(&self, user_id: &str, cursor: &ChangeCursor) -> Result<bool, StoreError> {
        let value = serde_json::to_vec(cursor)?;
        self.kv
            .compare_and_set(&Self::key(user_id), None, Some(value))
            .await
    }
}

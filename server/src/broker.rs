//! OAuth completion broker.
//!
//! Lets a request handler block until the out-of-band OAuth callback for the
//! same user arrives. One slot exists per user; every waiter for that user
//! observes the same single delivery.
//!
//! ```text
//! wait_for_completion(u) ──► slot(u) ◄── complete(u, outcome)
//!          │                    │
//!          └── wait() ◄─────────┘  (or timeout / close)
//! ```
//!
//! Slots are removed when they are fulfilled, when [`OAuthBroker::close`] is
//! called, or when the last waiter for a user gives up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Default time a waiter blocks before giving up.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of an OAuth flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthCompletion {
    /// The user's token was stored.
    Connected,

    /// The flow failed; the message is safe to show to the user.
    Failed(String),
}

/// Reasons a waiter returns without an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for OAuth completion")]
    Timeout(Duration),

    #[error("OAuth broker closed")]
    Closed,
}

type Slot = Option<OAuthCompletion>;

struct Entry {
    id: u64,
    sender: watch::Sender<Slot>,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    timeout: Duration,
}

/// Process-wide registry of pending OAuth completions.
#[derive(Clone)]
pub struct OAuthBroker {
    inner: Arc<Inner>,
}

impl OAuthBroker {
    /// Creates a broker whose waiters give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers interest in the next completion for `user_id`.
    ///
    /// Joins the existing slot if another waiter is already pending. After
    /// [`close`](Self::close) the returned waiter resolves to
    /// [`WaitError::Closed`] immediately.
    pub fn wait_for_completion(&self, user_id: &str) -> OAuthWaiter {
        let mut entries = self.entries();

        if self.inner.closed.load(Ordering::Acquire) {
            // Sender dropped right away: the receiver reports closed.
            let (_, receiver) = watch::channel(None);
            return OAuthWaiter {
                broker: self.clone(),
                user_id: user_id.to_string(),
                slot_id: None,
                receiver,
            };
        }

        let entry = entries.entry(user_id.to_string()).or_insert_with(|| {
            let (sender, _) = watch::channel(None);
            Entry {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                sender,
            }
        });

        debug!(user_id = %user_id, "Waiting for OAuth completion");

        OAuthWaiter {
            broker: self.clone(),
            user_id: user_id.to_string(),
            slot_id: Some(entry.id),
            receiver: entry.sender.subscribe(),
        }
    }

    /// Delivers `outcome` to everyone waiting on `user_id`.
    ///
    /// Returns `false` (and does nothing) when no slot exists, including
    /// when the slot was already fulfilled.
    pub fn complete(&self, user_id: &str, outcome: OAuthCompletion) -> bool {
        let Some(entry) = self.entries().remove(user_id) else {
            debug!(user_id = %user_id, "No pending OAuth waiter");
            return false;
        };

        entry.sender.send(Some(outcome)).is_ok()
    }

    /// Releases every pending waiter with [`WaitError::Closed`].
    ///
    /// Waiters registered after this call are closed immediately.
    pub fn close(&self) {
        let mut entries = self.entries();
        self.inner.closed.store(true, Ordering::Release);
        let released = entries.len();
        entries.clear();
        debug!(released, "OAuth broker closed");
    }

    /// Number of users with a pending slot.
    pub fn pending_count(&self) -> usize {
        self.entries().len()
    }

    /// Returns the configured wait timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Drops the slot if the departing waiter was its last receiver.
    fn release(&self, user_id: &str, slot_id: u64) {
        let mut entries = self.entries();
        let last_waiter = entries
            .get(user_id)
            .is_some_and(|e| e.id == slot_id && e.sender.receiver_count() <= 1);
        if last_waiter {
            entries.remove(user_id);
        }
    }
}

impl Default for OAuthBroker {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

/// Handle returned by [`OAuthBroker::wait_for_completion`].
///
/// Dropping the handle without waiting gives up the slot if it was the
/// only waiter.
pub struct OAuthWaiter {
    broker: OAuthBroker,
    user_id: String,
    slot_id: Option<u64>,
    receiver: watch::Receiver<Slot>,
}

impl OAuthWaiter {
    /// Suspends until the slot is fulfilled, the broker closes, or the
    /// timeout elapses.
    pub async fn wait(mut self) -> Result<OAuthCompletion, WaitError> {
        let timeout = self.broker.inner.timeout;

        match tokio::time::timeout(timeout, self.receiver.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => value.clone().ok_or(WaitError::Closed),
            Ok(Err(_)) => Err(WaitError::Closed),
            Err(_) => {
                debug!(user_id = %self.user_id, "OAuth wait timed out");
                Err(WaitError::Timeout(timeout))
            }
        }
    }
}

impl Drop for OAuthWaiter {
    fn drop(&mut self) {
        if let Some(slot_id) = self.slot_id {
            self.broker.release(&self.user_id, slot_id);
        }
    }
}

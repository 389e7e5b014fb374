//! Periodic renewal of expiring watch channels.
//!
//! Drive does not allow indefinite channels, so every channel is replaced
//! before it expires. Each tick:
//!
//! 1. pages through all stored channel records,
//! 2. selects those expiring within the lookahead window,
//! 3. feeds them through a bounded queue to a fixed pool of workers, each
//!    calling [`WatchManager::renew`],
//! 4. joins the pool before reporting.
//!
//! A failure for one user is logged and never affects other users; the
//! record stays in the store and is picked up again by the next tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RenewalSettings;
use crate::error::WatchError;
use crate::types::WatchChannelRecord;
use crate::watch::WatchManager;

/// Records read from the store per page.
pub const LIST_PAGE_SIZE: usize = 100;

/// Counters for one renewal tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Records read from the store.
    pub scanned: usize,

    /// Records inside the lookahead window, submitted to the pool.
    pub due: usize,

    /// Successful renewals.
    pub renewed: usize,

    /// Failed renewals.
    pub failed: usize,
}

/// Runs renewal ticks.
pub struct Renewer {
    manager: Arc<WatchManager>,
    lookahead: chrono::Duration,
    workers: usize,
}

impl Renewer {
    /// Creates a renewer using the lookahead window and pool size from
    /// `settings`. A pool size of zero is raised to one.
    pub fn new(manager: Arc<WatchManager>, settings: &RenewalSettings) -> Self {
        Self {
            manager,
            lookahead: chrono::Duration::from_std(settings.lookahead)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            workers: settings.workers.max(1),
        }
    }

    /// Runs one tick against the current time.
    pub async fn run_tick(&self) -> TickReport {
        self.run_tick_at(Utc::now()).await
    }

    /// Runs one tick as if the current time were `now`.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let (tx, rx) = mpsc::channel::<WatchChannelRecord>(self.workers);
        let rx = Arc::new(Mutex::new(rx));

        let mut pool = JoinSet::new();
        for worker in 0..self.workers {
            let rx = Arc::clone(&rx);
            let manager = Arc::clone(&self.manager);
            pool.spawn(async move { renewal_worker(worker, rx, manager, now).await });
        }

        let mut report = self.scan(now, &tx).await;
        // Closing the queue lets workers exit once it drains.
        drop(tx);

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((renewed, failed)) => {
                    report.renewed += renewed;
                    report.failed += failed;
                }
                Err(e) => error!(error = %e, "Renewal worker panicked"),
            }
        }

        info!(
            scanned = report.scanned,
            due = report.due,
            renewed = report.renewed,
            failed = report.failed,
            "Renewal tick complete"
        );
        report
    }

    /// Pages through the store and queues every due record once.
    async fn scan(&self, now: DateTime<Utc>, tx: &mpsc::Sender<WatchChannelRecord>) -> TickReport {
        let mut report = TickReport::default();
        let mut queued = HashSet::new();
        let channels = self.manager.channels();

        for page in 0.. {
            let listing = match channels.list_page(page, LIST_PAGE_SIZE).await {
                Ok(listing) => listing,
                Err(e) => {
                    error!(page, error = %e, "Failed to list watch channels, ending scan");
                    break;
                }
            };

            for record in listing.records {
                report.scanned += 1;

                if !record.is_due_for_renewal(now, self.lookahead) {
                    continue;
                }
                if !queued.insert(record.user_id.clone()) {
                    continue;
                }

                report.due += 1;
                if tx.send(record).await.is_err() {
                    error!("All renewal workers exited early");
                    return report;
                }
            }

            if listing.key_count < LIST_PAGE_SIZE {
                break;
            }
        }

        report
    }
}

async fn renewal_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<WatchChannelRecord>>>,
    manager: Arc<WatchManager>,
    now: DateTime<Utc>,
) -> (usize, usize) {
    let mut renewed = 0;
    let mut failed = 0;

    loop {
        let next = rx.lock().await.recv().await;
        let Some(record) = next else {
            break;
        };

        debug!(worker, user_id = %record.user_id, "Renewing watch channel");
        match manager.renew(&record, now).await {
            Ok(_) => renewed += 1,
            Err(WatchError::Superseded(user_id)) => {
                debug!(user_id = %user_id, "Skipped renewal of replaced or stopped channel");
            }
            Err(e) => {
                failed += 1;
                warn!(
                    user_id = %record.user_id,
                    channel_id = %record.channel_id,
                    transient = e.is_transient(),
                    error = %e,
                    "Watch channel renewal failed"
                );
            }
        }
    }

    (renewed, failed)
}

/// Timer-driven renewal service.
///
/// Constructed by [`RenewalScheduler::start`]; [`RenewalScheduler::stop`]
/// prevents further ticks and waits for an in-flight tick to finish.
pub struct RenewalScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RenewalScheduler {
    /// Spawns the renewal loop. The first tick runs immediately, then one
    /// every `interval`.
    pub fn start(renewer: Arc<Renewer>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "Renewal scheduler started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        renewer.run_tick().await;
                    }
                }
            }

            info!("Renewal scheduler stopped");
        });

        Self { shutdown, handle }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Renewal scheduler task failed");
        }
    }
}

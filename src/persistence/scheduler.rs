//! Snapshot Scheduler
//!
//! A single background task owns every save once the server is running:
//! periodic saves on a timer, explicit requests from `SAVE`, and the final
//! save at shutdown. Because one task runs them all, two saves never overlap.
//!
//! Requests that pile up while a save is on disk are answered together by the
//! next save, so a burst of `SAVE` commands costs one write.

use crate::persistence::{Persistence, PersistenceError, SaveReport};
use crate::storage::Store;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

type SaveReply = oneshot::Sender<Result<SaveReport, PersistenceError>>;

/// Configuration for snapshot persistence.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Snapshot file location
    pub path: PathBuf,

    /// Time between periodic saves (`None` disables them)
    pub interval: Option<Duration>,

    /// Whether to write one last snapshot when the scheduler shuts down
    pub save_on_shutdown: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dump.ekv"),
            interval: Some(Duration::from_secs(60)),
            save_on_shutdown: true,
        }
    }
}

/// Cloneable handle for requesting saves from the scheduler.
#[derive(Debug, Clone)]
pub struct SaveTrigger {
    tx: mpsc::Sender<SaveReply>,
    persistence: Arc<Persistence>,
}

impl SaveTrigger {
    /// Requests a save and waits for it to finish.
    pub async fn save(&self) -> Result<SaveReport, PersistenceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| PersistenceError::Stopped)?;
        reply_rx.await.map_err(|_| PersistenceError::Stopped)?
    }

    /// Unix ms of the last successful save, if any.
    pub fn last_save(&self) -> Option<u64> {
        self.persistence.last_save()
    }

    pub fn saves(&self) -> u64 {
        self.persistence.saves()
    }

    pub fn path(&self) -> &Path {
        self.persistence.path()
    }
}

/// A handle to the running snapshot scheduler.
#[derive(Debug)]
pub struct SnapshotScheduler {
    trigger: SaveTrigger,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SnapshotScheduler {
    /// Starts the scheduler as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(store: Arc<Store>, config: PersistenceConfig) -> Self {
        let persistence = Arc::new(Persistence::new(store, config.path.clone()));
        Self::with_persistence(persistence, config)
    }

    /// Starts the scheduler around an existing [`Persistence`], typically the
    /// one that just loaded the snapshot.
    pub fn with_persistence(persistence: Arc<Persistence>, config: PersistenceConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler_loop(
            Arc::clone(&persistence),
            rx,
            config.interval,
            config.save_on_shutdown,
            shutdown_rx,
        ));

        info!(
            path = %persistence.path().display(),
            interval_secs = config.interval.map(|i| i.as_secs()),
            "Snapshot scheduler started"
        );

        Self {
            trigger: SaveTrigger { tx, persistence },
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger(&self) -> SaveTrigger {
        self.trigger.clone()
    }

    /// Stops the scheduler, running the final save if configured, and waits
    /// for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Snapshot scheduler task failed");
        }
    }
}

async fn scheduler_loop(
    persistence: Arc<Persistence>,
    mut rx: mpsc::Receiver<SaveReply>,
    interval: Option<Duration>,
    save_on_shutdown: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval.filter(|p| !p.is_zero()).map(|period| {
        let mut t = tokio::time::interval_at(Instant::now() + period, period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        tokio::select! {
            Some(first) = rx.recv() => {
                let mut waiters = vec![first];
                while let Ok(more) = rx.try_recv() {
                    waiters.push(more);
                }
                debug!(requests = waiters.len(), "Running requested save");

                let result = run_save(&persistence).await;
                if let Err(e) = &result {
                    error!(error = %e, "Requested save failed");
                }
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            _ = next_tick(&mut ticker) => {
                if let Err(e) = run_save(&persistence).await {
                    error!(error = %e, "Periodic save failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    rx.close();
    let mut waiters = Vec::new();
    while let Ok(waiter) = rx.try_recv() {
        waiters.push(waiter);
    }

    if save_on_shutdown {
        let result = run_save(&persistence).await;
        if let Err(e) = &result {
            error!(error = %e, "Final save failed");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    info!("Snapshot scheduler stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_save(persistence: &Arc<Persistence>) -> Result<SaveReport, PersistenceError> {
    let persistence = Arc::clone(persistence);
    match tokio::task::spawn_blocking(move || persistence.save()).await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e).into()),
    }
}

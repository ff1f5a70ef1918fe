//! Background Expiry Sweeper
//!
//! This module implements the background task that removes expired keys
//! without waiting for anyone to read them ("active expiry", as opposed to
//! the "lazy expiry" done on access).
//!
//! ## Why Do We Need This?
//!
//! Lazy expiry is cheap but a key that expires and is never read again would
//! stay in memory forever. The sweeper reclaims those.
//!
//! ## Design
//!
//! The sweeper is event-driven rather than a fixed-interval poll:
//! 1. Drain every due record from the expiry index ([`Store::reap_due`]),
//!    at most `scan_cap` records per shard lock.
//! 2. If a shard hit the cap, yield and go again right away.
//! 3. Otherwise sleep until the earliest known deadline, never longer than
//!    `max_interval`.
//! 4. A `set` with a deadline earlier than the planned wake-up interrupts the
//!    sleep.

use crate::storage::clock::duration_millis;
use crate::storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Longest the sweeper ever sleeps (default: 1s)
    pub max_interval: Duration,

    /// Heap records popped per shard per lock hold (default: 256)
    pub scan_cap: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_secs(1),
            scan_cap: 256,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use emberkv::storage::{ExpiryConfig, ExpirySweeper, Store};
    /// use std::sync::Arc;
    ///
    /// let store = Arc::new(Store::new());
    /// let sweeper = ExpirySweeper::start(store, ExpiryConfig::default());
    ///
    /// // Dropping the sweeper will stop it
    /// drop(sweeper);
    /// ```
    pub fn start(store: Arc<Store>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(store, config, shutdown_rx));

        info!("Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop(
    store: Arc<Store>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let scan_cap = config.scan_cap.max(1);
    let max_wait = duration_millis(config.max_interval).max(1);

    loop {
        if *shutdown_rx.borrow() {
            debug!("Expiry sweeper received shutdown signal");
            return;
        }

        // Publish the worst-case wake-up before looking at the heaps, so a
        // deadline scheduled while we scan still interrupts the sleep below.
        let now = store.now_millis();
        store.plan_wakeup(now.saturating_add(max_wait));

        let report = store.reap_due(scan_cap);

        if report.expired > 0 || report.stale > 0 {
            debug!(
                expired = report.expired,
                stale = report.stale,
                keys_remaining = store.len(),
                "Expired keys cleaned up"
            );
        }

        if report.saturated {
            // More is due; let client tasks at the locks before the next pass
            tokio::task::yield_now().await;
            continue;
        }

        let now = store.now_millis();
        let wait_ms = report
            .next_deadline
            .map_or(max_wait, |deadline| deadline.saturating_sub(now).min(max_wait));
        store.plan_wakeup(now.saturating_add(wait_ms));

        trace!(wait_ms, next_deadline = ?report.next_deadline, "Expiry sweeper sleeping");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            _ = store.earlier_deadline_scheduled() => {
                trace!("Earlier deadline scheduled, waking sweeper");
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(store: Arc<Store>) -> ExpirySweeper {
    ExpirySweeper::start(store, ExpiryConfig::default())
}

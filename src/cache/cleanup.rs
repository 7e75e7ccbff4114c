//! Periodic sweep of expired local-cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::LocalCache;
use crate::telemetry;

/// Handle to a running cleanup task.
///
/// [`shutdown`](Self::shutdown) stops the task and waits for it. Dropping
/// the handle also stops the task at its next wake-up, since the task
/// exits when the shutdown channel closes.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signal the task and wait until it has exited.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "cache cleanup task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the sweep loop on the current tokio runtime.
///
/// The first sweep runs one `period` after spawning.
pub fn spawn_cleanup(cache: Arc<LocalCache>, period: Duration) -> CleanupHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_cleanup(cache, period, shutdown_rx));
    CleanupHandle { shutdown_tx, task }
}

async fn run_cleanup(
    cache: Arc<LocalCache>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_ms = period.as_millis() as u64,
        "cache cleanup task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // Err: every sender is gone, nobody can ask us to stop later.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let evicted = cache.purge_expired();
                if evicted > 0 {
                    metrics::counter!(telemetry::CLEANUP_EVICTED_TOTAL).increment(evicted as u64);
                    debug!(evicted, remaining = cache.len(), "evicted expired local entries");
                }
            }
        }
    }

    info!("cache cleanup task stopped");
}

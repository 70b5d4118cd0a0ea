//! Periodic maintenance loop.
//!
//! Duplicate-detection fingerprints carry a 24-hour TTL; this loop prunes
//! the expired rows on a fixed interval for the lifetime of the store.
//! Deletes run in batches with a short pause in between so a large backlog
//! never holds the write connection for long. Pass errors are logged and
//! the loop continues on the next tick.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{now_millis, Connection, StoreError};

const CLEANUP_BATCH_SIZE: usize = 10_000;
const BATCH_PAUSE: Duration = Duration::from_millis(100);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the running cleanup task: a stop signal plus the join handle
/// the close path waits on.
pub(crate) struct CleanupLoop {
    stop_tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
}

impl CleanupLoop {
    pub(crate) fn spawn(conn: Arc<Connection>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so passes
            // run on the configured period.
            ticker.tick().await;

            loop {
                tokio::select! {
                    msg = stop_rx.recv() => {
                        if msg.is_none() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        run_cleanup_pass(&conn).await;
                    }
                }
            }

            log::info!("cleanup loop stopped");
        });

        log::info!("cleanup loop started (interval: {:?})", interval);

        Self { stop_tx, handle }
    }

    /// Signal the loop to stop and wait for it, bounded by the shutdown
    /// timeout.
    pub(crate) async fn stop(self) {
        drop(self.stop_tx);

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.handle).await.is_err() {
            log::warn!("cleanup loop did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}

/// One cleanup pass: delete expired fingerprints oldest-first in batches
/// until none remain. Errors abort the pass, not the loop.
pub(crate) async fn run_cleanup_pass(conn: &Connection) {
    let started = std::time::Instant::now();
    let mut total_deleted = 0usize;
    let mut batches = 0u32;

    loop {
        let deleted = match delete_expired_batch(conn) {
            Ok(n) => n,
            Err(e) => {
                log::error!(
                    "fingerprint cleanup failed after {total_deleted} rows in {batches} batches: {e}"
                );
                return;
            }
        };

        total_deleted += deleted;
        batches += 1;

        if deleted < CLEANUP_BATCH_SIZE {
            break;
        }

        // Let other writers interleave between batches.
        tokio::time::sleep(BATCH_PAUSE).await;
    }

    if total_deleted == 0 {
        log::debug!("cleanup pass found no expired fingerprints");
    } else {
        log::info!(
            "pruned {} expired fingerprints in {} batches ({:?})",
            total_deleted,
            batches,
            started.elapsed()
        );
    }
}

fn delete_expired_batch(conn: &Connection) -> Result<usize, StoreError> {
    let guard = conn.write()?;

    let deleted = guard.execute(
        "DELETE FROM event_fingerprints
         WHERE fingerprint IN (
             SELECT fingerprint FROM event_fingerprints
             WHERE expires_at < ?1
             ORDER BY expires_at ASC
             LIMIT ?2
         )",
        params![now_millis(), CLEANUP_BATCH_SIZE as i64],
    )?;

    Ok(deleted)
}

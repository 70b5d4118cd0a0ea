//! Debounced correlation view refresh.
//!
//! Rebuilding the correlation snapshot on every write would serialize all
//! writers behind the rebuild cost; never rebuilding would serve stale
//! correlation data. The controller implements trailing-edge debounce: a
//! burst of data-change notifications produces exactly one refresh,
//! executed `refresh_delay` after the last notification in the burst.
//!
//! The controller is an owned worker task fed by an unbounded channel; the
//! worker moves through four states:
//!
//! - idle: no deadline armed, waiting for a notification;
//! - pending: a deadline is armed; every further notification re-arms it;
//! - refreshing: the deadline fired and the refresh action is running to
//!   completion (a new notification meanwhile re-enters pending);
//! - stopped: the channel closed; the worker exits without firing an
//!   armed deadline.
//!
//! `close()` drops the sender and joins the worker, which gives the two
//! shutdown guarantees directly: an unfired timer can never fire after
//! close begins, and a refresh that already started is always drained
//! before `close()` returns.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) struct RefreshController {
    notify_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshController {
    /// Start the controller with the given debounce window and refresh
    /// action. A zero delay disables refreshing entirely: no worker is
    /// spawned and notifications are no-ops.
    pub(crate) fn start<F, Fut>(refresh_delay: Duration, mut refresh: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if refresh_delay.is_zero() {
            log::info!("debounced view refresh disabled (zero refresh delay)");

            return Self {
                notify_tx: Mutex::new(None),
                worker: Mutex::new(None),
            };
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let handle = tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;

            loop {
                // Re-armed every iteration; only polled while a deadline
                // is outstanding.
                let wake = deadline.unwrap_or_else(Instant::now);

                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(()) => {
                            deadline = Some(Instant::now() + refresh_delay);
                        }
                        // Channel closed: stop without firing an armed
                        // deadline.
                        None => break,
                    },
                    _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                        deadline = None;
                        refresh().await;
                    }
                }
            }

            log::info!("refresh controller stopped");
        });

        Self {
            notify_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Record that correlation inputs changed. Never blocks; coalesced by
    /// the worker into at most one pending refresh.
    pub(crate) fn notify_data_changed(&self) {
        let guard = self.notify_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            // Send only fails when the worker is gone, i.e. after close.
            let _ = tx.send(());
        }
    }

    /// Stop the controller. Idempotent; blocks until an in-flight refresh
    /// has completed.
    pub(crate) async fn close(&self) {
        drop(self.notify_tx.lock().unwrap().take());

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                log::warn!("refresh worker terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn counting_controller(delay: Duration) -> (RefreshController, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let controller = RefreshController::start(delay, move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        (controller, count)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_refresh() {
        let (controller, count) = counting_controller(Duration::from_millis(100));

        for _ in 0..50 {
            controller.notify_data_changed();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "refresh must wait out the quiet window");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "a burst produces exactly one refresh");

        // And nothing else fires afterwards.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_disables_refreshing() {
        let (controller, count) = counting_controller(Duration::ZERO);

        for _ in 0..10 {
            controller.notify_data_changed();
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_timer() {
        let (controller, count) = counting_controller(Duration::from_millis(200));

        controller.notify_data_changed();
        controller.close().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "cancelled timer must never fire");
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_inflight_refresh() {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);

        // Refresh takes 200ms; close must observe its effect.
        let controller = RefreshController::start(Duration::from_millis(10), move || {
            let c = Arc::clone(&c);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        controller.notify_data_changed();

        // Let the timer fire so the refresh is executing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "refresh still running");

        controller.close().await;
        assert_eq!(
            count.load(Ordering::SeqCst),
            1,
            "close must block until the in-flight refresh completed"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_notification_resets_the_deadline() {
        let (controller, count) = counting_controller(Duration::from_millis(300));

        controller.notify_data_changed();

        tokio::time::sleep(Duration::from_millis(200)).await;
        controller.notify_data_changed();

        // 350ms after the first call: its original deadline has passed but
        // was reset, and the new one has not fired yet.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0, "reset deadline must not fire early");

        // 300ms after the second call the single refresh runs.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        controller.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_notify_after_close_is_noop() {
        let (controller, count) = counting_controller(Duration::from_millis(10));

        controller.close().await;
        controller.close().await;

        controller.notify_data_changed();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

//! Opt-in periodic cleanup of finished tasks.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tracker::TaskTracker;

impl TaskTracker {
    /// Every `period`, remove terminal tasks older than `max_age`, until
    /// `shutdown` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(
        &self,
        period: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(?period, ?max_age, "task sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = tracker.cleanup(max_age);
                        if removed > 0 {
                            info!(removed, "swept finished tasks");
                        } else {
                            debug!("no finished tasks to sweep");
                        }
                    }
                }
            }
            info!("task sweeper stopped");
        })
    }
}

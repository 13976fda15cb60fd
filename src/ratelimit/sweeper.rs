//! Background eviction of idle buckets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use super::bucket::Bucket;

/// Bucket map shared between admission checks and the sweep task.
pub(crate) type BucketMap = Arc<Mutex<HashMap<String, Bucket>>>;

/// Remove every bucket idle for longer than `idle_timeout`.
///
/// Returns the number of evicted buckets.
pub(crate) fn evict_idle(
    buckets: &mut HashMap<String, Bucket>,
    now: Instant,
    idle_timeout: Duration,
) -> usize {
    let before = buckets.len();
    buckets.retain(|_, bucket| bucket.idle_for(now) <= idle_timeout);
    before - buckets.len()
}

/// Handle to a running sweep task.
pub(crate) struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweep task and wait for it to exit.
    ///
    /// A tick already in progress finishes first.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(true);

        match self.task.await {
            Ok(()) => info!("Eviction sweep stopped"),
            Err(e) if e.is_cancelled() => debug!("Eviction sweep was cancelled"),
            Err(e) => error!(error = %e, "Eviction sweep task failed"),
        }
    }

    /// Stop the sweep task without waiting for it.
    pub(crate) fn abort(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Spawn the periodic eviction sweep on `runtime`.
pub(crate) fn spawn_sweeper(
    runtime: &Handle,
    buckets: BucketMap,
    idle_timeout: Duration,
    period: Duration,
) -> SweeperHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = runtime.spawn(async move {
        // The first tick of `interval_at` lands one period after start
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            idle_timeout_ms = idle_timeout.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "Eviction sweep started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut map = buckets.lock();
                    let evicted = evict_idle(&mut map, Instant::now(), idle_timeout);
                    if evicted > 0 {
                        debug!(evicted = evicted, remaining = map.len(), "Evicted idle buckets");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle { shutdown, task }
}

//! Background reclamation of idle limiter state.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backend::Limiter;

/// Shortest interval between sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a periodic task evicting keys idle longer than the limiter's
/// TTL.
///
/// The task sweeps every `ttl / 2`. It stops when [`Reclaimer::shutdown`]
/// is called or once the limiter it watches has been dropped.
pub struct Reclaimer {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reclaimer {
    /// Spawn a reclaimer for `limiter` on the current tokio runtime.
    pub fn spawn(name: impl Into<String>, limiter: &Arc<dyn Limiter>) -> Self {
        let name = name.into();
        let period = (limiter.idle_ttl() / 2).max(MIN_SWEEP_INTERVAL);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            name.clone(),
            Arc::downgrade(limiter),
            period,
            shutdown_rx,
        ));

        debug!(limiter = %name, period_ms = period.as_millis() as u64, "Reclaimer started");

        Self {
            name,
            shutdown_tx,
            task,
        }
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(limiter = %self.name, error = %e, "Reclaimer task failed");
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run(
    name: String,
    limiter: Weak<dyn Limiter>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(limiter) = limiter.upgrade() else {
                    debug!(limiter = %name, "Limiter dropped, reclaimer exiting");
                    return;
                };

                let evicted = limiter.evict_idle();
                if evicted > 0 {
                    info!(
                        limiter = %name,
                        evicted = evicted,
                        remaining = limiter.tracked_keys(),
                        "Reclaimed idle rate limit state"
                    );
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(limiter = %name, "Reclaimer stopped");
                    return;
                }
            }
        }
    }
}

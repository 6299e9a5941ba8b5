//! Background task that expires idle sessions.

use std::sync::Weak;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::registry::SandboxRegistry;

/// Handle used to stop a running sweeper.
pub struct SweeperHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to exit. A sweep already in
    /// progress is allowed to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }
}

/// Spawn the sweeper. It ticks every `every`, and exits when stopped or
/// when the registry has been dropped.
pub fn spawn(registry: Weak<SandboxRegistry>, every: Duration) -> SweeperHandle {
    let (stop, mut stopped) = oneshot::channel();
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    let evicted = registry.sweep_expired().await;
                    if evicted > 0 {
                        info!(evicted, "expired idle sessions");
                    }
                }
            }
        }
        debug!("sweeper stopped");
    });
    SweeperHandle { stop, task }
}

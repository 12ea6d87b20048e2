//! Periodic drain of the overflow buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::DispatchCoordinator;

/// Handle to a running drain task. Dropping the handle also stops the task.
pub struct DrainTask {
    handle: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl DrainTask {
    /// Stop the task. A cycle already in flight finishes first.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = self.handle.await {
            debug!(error = %e, "Drain task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `coordinator.drain_step()` every `period` until stopped.
pub fn spawn_drain_task(coordinator: Arc<DispatchCoordinator>, period: Duration) -> DrainTask {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    coordinator.drain_step().await;
                }
            }
        }
        info!("Drain task stopped");
    });

    info!(period_ms = period.as_millis() as u64, "Drain task started");
    DrainTask {
        handle,
        shutdown: Some(shutdown_tx),
    }
}

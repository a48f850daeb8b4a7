//! Recurring conform sweeps on a fixed cadence.
//!
//! The scheduler resubmits a connector sweep every interval and leans on
//! reconciliation idempotence for self-healing: a cycle that finds
//! nothing to fix changes nothing, and a cycle that lost its locks to a
//! manual job simply waits for the next tick.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warden_core::ObjectKind;
use warden_engine::EngineError;

use crate::error::ConformError;
use crate::orchestrator::ConformOrchestrator;

/// Handle over the background conform loop.
///
/// Dropping the handle stops the loop at its next suspension point;
/// [`Self::shutdown`] stops it and waits for the exit.
pub struct ConformScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConformScheduler {
    /// Starts the conform loop over the orchestrator's connectors.
    ///
    /// The first sweep runs immediately; later sweeps follow the
    /// configured interval. A disabled configuration exits the loop
    /// before the first sweep.
    #[must_use]
    pub fn start(orchestrator: ConformOrchestrator) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(run_loop(orchestrator, receiver));
        Self { shutdown, handle }
    }

    /// Signals the loop to stop without waiting for it.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        self.request_shutdown();
        drop(self.handle.await);
    }

    /// Whether the loop has exited on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_loop(orchestrator: ConformOrchestrator, mut shutdown: watch::Receiver<bool>) {
    let config = orchestrator.config().conform.clone();
    if !config.enabled {
        info!("conform scheduling disabled");
        return;
    }

    // The first tick completes immediately, so the first sweep runs at
    // startup instead of one interval in.
    let mut ticker = tokio::time::interval(config.interval());
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("conform scheduler stopping");
                    return;
                }
            }
            _ = ticker.tick() => {
                if !run_cycle(&orchestrator).await {
                    return;
                }
            }
        }
    }
}

/// Submits one sweep per connector; false when the engine is gone.
async fn run_cycle(orchestrator: &ConformOrchestrator) -> bool {
    let mut submitted = 0_usize;
    for versioned in orchestrator.store().list(ObjectKind::Connector).await {
        let connector = versioned.entity.id();
        match orchestrator.sweep_connector(connector).await {
            Ok(job) => {
                debug!(%job, %connector, "sweep submitted");
                submitted += 1;
            }
            Err(ConformError::Engine(EngineError::EngineStopped)) => {
                info!("engine stopped, conform scheduler exiting");
                return false;
            }
            Err(error) if error.is_retryable() => {
                debug!(%error, %connector, "sweep contended, deferring to the next cycle");
            }
            Err(error) => {
                warn!(%error, %connector, "sweep submission failed");
            }
        }
    }
    debug!(submitted, "conform cycle complete");
    true
}

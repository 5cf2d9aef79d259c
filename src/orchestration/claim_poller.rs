//! Worker-side polling loop.
//!
//! Claims step runs one at a time and hands them to the worker through a
//! bounded channel, so a worker that is busy stops claiming. Transient store
//! errors are retried with exponential backoff for as long as the poller runs.

use crate::config::BackoffConfig;
use crate::models::{QueueItem, WorkerCapabilities};
use crate::orchestration::step_queue::StepRunClaimer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

pub struct ClaimPoller<C: ?Sized> {
    claimer: Arc<C>,
    capabilities: WorkerCapabilities,
    poll_interval: Duration,
    backoff: BackoffConfig,
}

impl<C> ClaimPoller<C>
where
    C: StepRunClaimer + ?Sized + 'static,
{
    pub fn new(claimer: Arc<C>, capabilities: WorkerCapabilities, poll_interval: Duration) -> Self {
        Self {
            claimer,
            capabilities,
            poll_interval,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Poll until shutdown is signalled, the shutdown sender is dropped, or the
    /// receiving side is dropped
    pub async fn run(self, sender: mpsc::Sender<QueueItem>, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.capabilities.worker_id,
            tenant_id = %self.capabilities.tenant_id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "🚀 Claim poller started"
        );

        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.claimer.claim(&self.capabilities).await {
                Ok(Some(item)) => {
                    failures = 0;
                    if sender.send(item).await.is_err() {
                        warn!(worker_id = %self.capabilities.worker_id, "Claim receiver dropped, stopping poller");
                        break;
                    }
                    continue;
                }
                Ok(None) => {
                    failures = 0;
                    self.poll_interval
                }
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    let delay = self.backoff.delay_for_attempt(failures);
                    warn!(
                        worker_id = %self.capabilities.worker_id,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure while claiming, backing off"
                    );
                    delay
                }
                Err(err) => {
                    error!(worker_id = %self.capabilities.worker_id, error = %err, "Claim failed");
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    // a dropped switch counts as shutdown
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.capabilities.worker_id, "🛑 Claim poller stopped");
    }
}

/// Spawn a poller; returns the claimed-item stream, its task and the shutdown switch
pub fn spawn_claim_poller<C>(
    poller: ClaimPoller<C>,
    buffer: usize,
) -> (
    mpsc::Receiver<QueueItem>,
    tokio::task::JoinHandle<()>,
    watch::Sender<bool>,
)
where
    C: StepRunClaimer + ?Sized + 'static,
{
    let (item_tx, item_rx) = mpsc::channel(buffer.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(poller.run(item_tx, shutdown_rx));
    (item_rx, handle, shutdown_tx)
}

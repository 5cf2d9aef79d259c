//! # Retention Controller
//!
//! Periodically deletes expired queue items for the tenants owned by this
//! controller's partition. One sweep:
//!
//! 1. refreshes the partition heartbeat (a failure is logged, the sweep goes on);
//! 2. lists owned tenants, including unassigned ones;
//! 3. cleans tenants one after another under a single wall-clock budget.
//!
//! When the budget runs out, the remaining tenants are deferred to the next
//! interval and reported in the [`SweepResult`]. A failing tenant is logged and
//! recorded but never stops the sweep. Transient store errors are retried with
//! backoff as long as the budget allows.
//!
//! [`RetentionController::run_once`] holds the whole sweep and takes `now`
//! explicitly; [`spawn_retention_controller`] only adds the timer.

use crate::config::{BackoffConfig, RetentionConfig};
use crate::error::{TaskerError, TaskerResult};
use crate::orchestration::partition_manager::TenantPartitionManager;
use crate::orchestration::step_queue::StepRunQueue;
use crate::resilience::retry_with_backoff;
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A failure recorded during a sweep; `tenant_id` is `None` when the tenant
/// listing itself failed
#[derive(Debug, Clone, PartialEq)]
pub struct SweepError {
    pub tenant_id: Option<Uuid>,
    pub error: TaskerError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub partition_id: String,
    pub cutoff: DateTime<Utc>,
    pub tenants_total: usize,
    pub tenants_processed: usize,
    /// Tenants not cleaned because the budget ran out, in listing order
    pub tenants_deferred: Vec<Uuid>,
    pub deleted_items: u64,
    pub errors: Vec<SweepError>,
    pub budget_exhausted: bool,
    pub elapsed: Duration,
}

impl SweepResult {
    fn new(partition_id: &str, cutoff: DateTime<Utc>) -> Self {
        Self {
            partition_id: partition_id.to_string(),
            cutoff,
            tenants_total: 0,
            tenants_processed: 0,
            tenants_deferred: Vec::new(),
            deleted_items: 0,
            errors: Vec::new(),
            budget_exhausted: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.budget_exhausted
    }
}

#[derive(Debug, Clone)]
pub struct RetentionController {
    partitions: TenantPartitionManager,
    queue: Arc<StepRunQueue>,
    sweep_budget: Duration,
    backoff: BackoffConfig,
}

impl RetentionController {
    pub fn new(partitions: TenantPartitionManager, queue: Arc<StepRunQueue>) -> Self {
        Self {
            partitions,
            queue,
            sweep_budget: RetentionConfig::default().sweep_budget(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_sweep_budget(mut self, sweep_budget: Duration) -> Self {
        self.sweep_budget = sweep_budget;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// One bounded sweep over the partition's tenants. Never fails; problems
    /// are reported in the result.
    #[instrument(skip(self), fields(partition_id = %self.partitions.partition_id()))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepResult {
        let started = Instant::now();
        let deadline = started + self.sweep_budget;
        let cutoff = now - self.queue.retention_period();
        let mut result = SweepResult::new(self.partitions.partition_id(), cutoff);

        match timeout_at(deadline, self.partitions.heartbeat()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "Heartbeat before retention sweep failed"),
            Err(_) => warn!("Heartbeat before retention sweep timed out"),
        }

        let tenants = match self.owned_tenants(deadline).await {
            Ok(tenants) => tenants,
            Err(err) => {
                error!(error = %err, "Could not list tenants for retention sweep");
                result.budget_exhausted = Instant::now() >= deadline;
                result.errors.push(SweepError {
                    tenant_id: None,
                    error: err,
                });
                result.elapsed = started.elapsed();
                return result;
            }
        };
        result.tenants_total = tenants.len();

        for (index, tenant_id) in tenants.iter().copied().enumerate() {
            if Instant::now() >= deadline {
                result.budget_exhausted = true;
                result.tenants_deferred = tenants[index..].to_vec();
                break;
            }

            let cleanup = retry_with_backoff("cleanup_queue_items", &self.backoff, Some(deadline), || {
                self.queue.cleanup_queue_items_before(tenant_id, cutoff)
            });

            match timeout_at(deadline, cleanup).await {
                Ok(Ok(deleted)) => {
                    result.tenants_processed += 1;
                    result.deleted_items += deleted;
                }
                Ok(Err(err)) => {
                    warn!(tenant_id = %tenant_id, error = %err, "Retention cleanup failed for tenant");
                    result.errors.push(SweepError {
                        tenant_id: Some(tenant_id),
                        error: err,
                    });
                }
                Err(_) => {
                    // partial deletes stand; the rest is picked up next sweep
                    result.budget_exhausted = true;
                    result.tenants_deferred = tenants[index..].to_vec();
                    break;
                }
            }
        }

        result.elapsed = started.elapsed();
        if result.budget_exhausted {
            warn!(
                deferred = result.tenants_deferred.len(),
                processed = result.tenants_processed,
                budget_ms = self.sweep_budget.as_millis() as u64,
                "⏱️ Retention sweep budget exhausted, deferring remaining tenants"
            );
        }
        info!(
            tenants = result.tenants_total,
            processed = result.tenants_processed,
            deleted = result.deleted_items,
            errors = result.errors.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "🧹 Retention sweep finished"
        );
        result
    }

    async fn owned_tenants(&self, deadline: Instant) -> TaskerResult<Vec<Uuid>> {
        let listing = retry_with_backoff("list_owned_tenants", &self.backoff, Some(deadline), || {
            self.partitions.list_owned_tenants()
        });
        timeout_at(deadline, listing).await?
    }

    async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            partition_id = %self.partitions.partition_id(),
            interval_ms = interval.as_millis() as u64,
            budget_ms = self.sweep_budget.as_millis() as u64,
            "Retention controller started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Retention controller shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let now = self.queue.clock().now();
                    let result = self.run_once(now).await;
                    debug!(clean = result.is_clean(), "Retention tick complete");
                }
            }
        }
    }
}

/// Run a sweep every `interval` until the returned sender is set to `true` or
/// dropped
pub fn spawn_retention_controller(
    controller: RetentionController,
    interval: Duration,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(controller.run(interval, shutdown_rx));
    (handle, shutdown_tx)
}

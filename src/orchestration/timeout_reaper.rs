//! Periodic sweep failing running step runs whose execution timeout elapsed.
//!
//! Like retention, the sweep visits the tenants owned by this controller's
//! partition and never fails as a whole: tenant errors are logged and counted.

use crate::error::TaskerError;
use crate::orchestration::partition_manager::TenantPartitionManager;
use crate::orchestration::workflow_engine::WorkflowEngine;
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapResult {
    pub tenants_total: usize,
    pub reaped: usize,
    pub errors: Vec<(Uuid, TaskerError)>,
}

#[derive(Debug, Clone)]
pub struct TimeoutReaper {
    partitions: TenantPartitionManager,
    engine: Arc<WorkflowEngine>,
}

impl TimeoutReaper {
    pub fn new(partitions: TenantPartitionManager, engine: Arc<WorkflowEngine>) -> Self {
        Self { partitions, engine }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> ReapResult {
        let mut result = ReapResult::default();
        let tenants = match self.partitions.list_owned_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                warn!(error = %err, "Could not list tenants for timeout sweep");
                return result;
            }
        };
        result.tenants_total = tenants.len();

        for tenant_id in tenants {
            match self.engine.reap_timed_out_steps(tenant_id, now).await {
                Ok(reaped) => result.reaped += reaped,
                Err(err) => {
                    warn!(tenant_id = %tenant_id, error = %err, "Timeout sweep failed for tenant");
                    result.errors.push((tenant_id, err));
                }
            }
        }
        debug!(
            tenants = result.tenants_total,
            reaped = result.reaped,
            errors = result.errors.len(),
            "Timeout sweep finished"
        );
        result
    }

    async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            partition_id = %self.partitions.partition_id(),
            interval_ms = interval.as_millis() as u64,
            "Timeout reaper started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Timeout reaper shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let now = self.engine.queue().clock().now();
                    self.run_once(now).await;
                }
            }
        }
    }
}

/// Sweep every `interval` until the returned sender is set to `true` or dropped
pub fn spawn_timeout_reaper(
    reaper: TimeoutReaper,
    interval: Duration,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(reaper.run(interval, shutdown_rx));
    (handle, shutdown_tx)
}

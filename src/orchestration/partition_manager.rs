//! # Tenant Partition Manager
//!
//! Shards tenants across controller replicas. Each replica owns a partition id
//! and keeps it alive with heartbeats; sweeps only visit the tenants assigned to
//! the replica's partition plus any tenant that has no assignment yet.
//!
//! Ownership is a soft lease. A partition whose heartbeat is older than the
//! stale window is reported by [`TenantPartitionManager::stale_partitions`];
//! moving its tenants elsewhere is up to an external scheduler.

use crate::config::PartitionConfig;
use crate::error::TaskerResult;
use crate::models::ControllerPartition;
use crate::repository::PartitionRepository;
use crate::utils::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct TenantPartitionManager {
    partition_id: String,
    repository: Arc<dyn PartitionRepository>,
    clock: Arc<dyn Clock>,
    stale_after: chrono::Duration,
}

impl std::fmt::Debug for TenantPartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPartitionManager")
            .field("partition_id", &self.partition_id)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl TenantPartitionManager {
    pub fn new(
        partition_id: impl Into<String>,
        repository: Arc<dyn PartitionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            partition_id: partition_id.into(),
            repository,
            clock,
            stale_after: PartitionConfig::default().stale_after(),
        }
    }

    /// Uses the configured partition id, or generates `partition-<uuid>`
    pub fn from_config(
        config: &PartitionConfig,
        repository: Arc<dyn PartitionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let partition_id = config
            .partition_id
            .clone()
            .unwrap_or_else(|| format!("partition-{}", Uuid::new_v4()));
        Self::new(partition_id, repository, clock).with_stale_after(config.stale_after())
    }

    pub fn with_stale_after(mut self, stale_after: chrono::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub async fn heartbeat(&self) -> TaskerResult<ControllerPartition> {
        let partition = self
            .repository
            .upsert_partition_heartbeat(&self.partition_id, self.clock.now())
            .await?;
        debug!(partition_id = %self.partition_id, "💓 Partition heartbeat");
        Ok(partition)
    }

    /// Tenants assigned to this partition and every unassigned tenant
    pub async fn list_owned_tenants(&self) -> TaskerResult<Vec<Uuid>> {
        let tenants = self
            .repository
            .list_tenants_by_partition(&self.partition_id)
            .await?;
        Ok(tenants.into_iter().map(|t| t.tenant_id).collect())
    }

    pub async fn stale_partitions(&self) -> TaskerResult<Vec<ControllerPartition>> {
        let now = self.clock.now();
        let partitions = self.repository.list_partitions().await?;
        Ok(partitions
            .into_iter()
            .filter(|p| p.is_stale(now, self.stale_after))
            .collect())
    }

    pub async fn assign_tenant(&self, tenant_id: Uuid, partition_id: Option<&str>) -> TaskerResult<()> {
        self.repository.assign_tenant(tenant_id, partition_id).await?;
        info!(
            tenant_id = %tenant_id,
            partition_id = partition_id,
            "Tenant partition assignment updated"
        );
        Ok(())
    }

    async fn run_heartbeat_loop(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            partition_id = %self.partition_id,
            interval_ms = interval.as_millis() as u64,
            "Partition heartbeat task started"
        );

        loop {
            if let Err(err) = self.heartbeat().await {
                warn!(partition_id = %self.partition_id, error = %err, "Partition heartbeat failed");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(partition_id = %self.partition_id, "Partition heartbeat task shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Heartbeat immediately, then every `interval` until shutdown or until the
/// returned sender is dropped
pub fn spawn_partition_heartbeat(
    manager: TenantPartitionManager,
    interval: Duration,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(manager.run_heartbeat_loop(interval, shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::utils::ManualClock;
    use chrono::Utc;

    #[tokio::test]
    async fn test_owned_tenants_include_unassigned() {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let p1 = TenantPartitionManager::new("p1", repo.clone(), clock.clone());
        let p2 = TenantPartitionManager::new("p2", repo.clone(), clock);

        let (mine, theirs, shared) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        p1.assign_tenant(mine, Some("p1")).await.unwrap();
        p1.assign_tenant(theirs, Some("p2")).await.unwrap();
        p1.assign_tenant(shared, None).await.unwrap();

        let owned = p1.list_owned_tenants().await.unwrap();
        assert!(owned.contains(&mine) && owned.contains(&shared) && !owned.contains(&theirs));

        let owned = p2.list_owned_tenants().await.unwrap();
        assert!(owned.contains(&theirs) && owned.contains(&shared) && !owned.contains(&mine));
    }

    #[tokio::test]
    async fn test_stale_partitions_follow_heartbeats() {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = ManualClock::new(Utc::now());
        let p1 = TenantPartitionManager::new("p1", repo.clone(), Arc::new(clock.clone()))
            .with_stale_after(chrono::Duration::seconds(60));
        let p2 = TenantPartitionManager::new("p2", repo, Arc::new(clock.clone()))
            .with_stale_after(chrono::Duration::seconds(60));

        p1.heartbeat().await.unwrap();
        p2.heartbeat().await.unwrap();
        clock.advance(chrono::Duration::seconds(90));
        p2.heartbeat().await.unwrap();

        let stale = p2.stale_partitions().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "p1");
    }

    #[test]
    fn test_partition_id_generated_when_unconfigured() {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager =
            TenantPartitionManager::from_config(&PartitionConfig::default(), repo.clone(), clock.clone());
        assert!(manager.partition_id().starts_with("partition-"));

        let config = PartitionConfig {
            partition_id: Some("controller-a".into()),
            ..PartitionConfig::default()
        };
        let manager = TenantPartitionManager::from_config(&config, repo, clock);
        assert_eq!(manager.partition_id(), "controller-a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_runs_until_shutdown() {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = TenantPartitionManager::new("p1", repo.clone(), clock);

        let (handle, shutdown) = spawn_partition_heartbeat(manager, Duration::from_secs(15));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(repo.list_partitions().await.unwrap().len(), 1);

        shutdown.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_stops_when_sender_dropped() {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = TenantPartitionManager::new("p1", repo, clock);

        let (handle, shutdown) = spawn_partition_heartbeat(manager, Duration::from_secs(15));
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("heartbeat task should stop")
            .unwrap();
    }
}

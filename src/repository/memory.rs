//! In-memory repository for tests and single-process deployments.
//!
//! All state sits behind one mutex, which makes every trait method trivially
//! atomic. Fault injection hooks let tests make cleanup slow or failing for a
//! given tenant.

use super::{
    CancelledQueueItem, ConcurrencyRepository, PartitionRepository, QueueRepository,
    WorkflowRunRepository,
};
use crate::error::{TaskerError, TaskerResult};
use crate::models::{
    is_compatible, ClaimOutcome, ControllerPartition, EnqueueOutcome, NewQueueItem, QueueItem,
    TenantPartition, WorkerCapabilities, WorkflowRun, WorkflowRunUpdate,
};
use crate::state_machine::{determine_target_state, QueueItemEvent, QueueItemStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    queue_items: HashMap<Uuid, QueueItem>,
    concurrency_slots: HashMap<(Uuid, String), u32>,
    tenants: HashMap<Uuid, Option<String>>,
    partitions: HashMap<String, DateTime<Utc>>,
    workflow_runs: HashMap<Uuid, WorkflowRun>,
}

#[derive(Debug, Default)]
struct Faults {
    delete_latency: HashMap<Uuid, Duration>,
    delete_failures: HashMap<Uuid, (TaskerError, u32)>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `delete_queue_items` call for the tenant sleeps this long first
    pub fn set_delete_latency(&self, tenant_id: Uuid, latency: Duration) {
        self.faults.lock().delete_latency.insert(tenant_id, latency);
    }

    /// The next `times` deletes for the tenant fail with `error`
    pub fn fail_deletes(&self, tenant_id: Uuid, error: TaskerError, times: u32) {
        self.faults
            .lock()
            .delete_failures
            .insert(tenant_id, (error, times));
    }

    /// Snapshot of every queue item, for assertions
    pub fn queue_items(&self) -> Vec<QueueItem> {
        let mut items: Vec<_> = self.state.lock().queue_items.values().cloned().collect();
        items.sort_by_key(|i| (i.queued_at, i.step_run_uuid));
        items
    }

    /// Overwrite a stored item, e.g. to backdate `finished_at` in tests
    pub fn put_queue_item(&self, item: QueueItem) {
        self.state
            .lock()
            .queue_items
            .insert(item.step_run_uuid, item);
    }
}

impl MemoryState {
    fn reserve_slot(&mut self, tenant_id: Uuid, key: &str, limit: u32) -> bool {
        let in_flight = self
            .concurrency_slots
            .entry((tenant_id, key.to_string()))
            .or_insert(0);
        if *in_flight < limit {
            *in_flight += 1;
            true
        } else {
            false
        }
    }

    fn release_slot(&mut self, tenant_id: Uuid, key: &str) {
        if let Some(in_flight) = self.concurrency_slots.get_mut(&(tenant_id, key.to_string())) {
            *in_flight = in_flight.saturating_sub(1);
        }
    }

    /// Apply `event` to an item, releasing its slot if it leaves `running`
    fn transition(
        &mut self,
        step_run_uuid: Uuid,
        event: QueueItemEvent,
        now: DateTime<Utc>,
    ) -> TaskerResult<(QueueItem, QueueItemStatus)> {
        let item = self
            .queue_items
            .get_mut(&step_run_uuid)
            .ok_or_else(|| TaskerError::NotFound(format!("queue item {step_run_uuid}")))?;

        let previous_status = item.status;
        item.status = determine_target_state(step_run_uuid, item.status, &event)?;
        match event {
            QueueItemEvent::Claim => item.started_at = Some(now),
            QueueItemEvent::Complete(output) => {
                item.output = Some(output);
                item.finished_at = Some(now);
            }
            QueueItemEvent::Fail(error) => {
                item.error = Some(error);
                item.finished_at = Some(now);
            }
            QueueItemEvent::Cancel => item.finished_at = Some(now),
        }
        let item = item.clone();

        if previous_status == QueueItemStatus::Running {
            if let Some((key, _)) = item.concurrency() {
                self.release_slot(item.tenant_id, key);
            }
        }
        Ok((item, previous_status))
    }
}

#[async_trait]
impl QueueRepository for InMemoryRepository {
    async fn enqueue_step_run(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> TaskerResult<EnqueueOutcome> {
        let mut state = self.state.lock();
        state.tenants.entry(item.tenant_id).or_insert(None);
        if state.queue_items.contains_key(&item.step_run_uuid) {
            return Ok(EnqueueOutcome::AlreadyEnqueued);
        }
        state
            .queue_items
            .insert(item.step_run_uuid, item.into_queue_item(now));
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn list_claim_candidates(
        &self,
        capabilities: &WorkerCapabilities,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let state = self.state.lock();
        let mut candidates: Vec<QueueItem> = state
            .queue_items
            .values()
            .filter(|i| {
                i.tenant_id == capabilities.tenant_id
                    && i.status == QueueItemStatus::Queued
                    && is_compatible(&i.compute, capabilities)
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|i| (i.queued_at, i.step_run_uuid));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn claim_step_run(
        &self,
        step_run_uuid: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> TaskerResult<ClaimOutcome> {
        let mut state = self.state.lock();
        let reservation = match state.queue_items.get(&step_run_uuid) {
            Some(item) if item.status == QueueItemStatus::Queued => item
                .concurrency()
                .map(|(key, limit)| (item.tenant_id, key.to_string(), limit)),
            _ => return Ok(ClaimOutcome::Lost),
        };
        if let Some((tenant_id, key, limit)) = reservation {
            if !state.reserve_slot(tenant_id, &key, limit) {
                return Ok(ClaimOutcome::Saturated);
            }
        }

        let Some(item) = state.queue_items.get_mut(&step_run_uuid) else {
            return Ok(ClaimOutcome::Lost);
        };
        item.status = QueueItemStatus::Running;
        item.started_at = Some(now);
        item.claimed_by = Some(worker_id.to_string());
        Ok(ClaimOutcome::Claimed(item.clone()))
    }

    async fn complete_step_run(
        &self,
        step_run_uuid: Uuid,
        output: Value,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem> {
        let (item, _) = self
            .state
            .lock()
            .transition(step_run_uuid, QueueItemEvent::Complete(output), now)?;
        Ok(item)
    }

    async fn fail_step_run(
        &self,
        step_run_uuid: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem> {
        let (item, _) = self
            .state
            .lock()
            .transition(step_run_uuid, QueueItemEvent::Fail(error), now)?;
        Ok(item)
    }

    async fn cancel_step_run(
        &self,
        step_run_uuid: Uuid,
        now: DateTime<Utc>,
    ) -> TaskerResult<Option<CancelledQueueItem>> {
        let mut state = self.state.lock();
        match state.queue_items.get(&step_run_uuid) {
            Some(item) if item.status.is_terminal() => return Ok(None),
            Some(_) => {}
            None => {
                return Err(TaskerError::NotFound(format!(
                    "queue item {step_run_uuid}"
                )))
            }
        }

        let (item, previous_status) =
            state.transition(step_run_uuid, QueueItemEvent::Cancel, now)?;
        Ok(Some(CancelledQueueItem {
            item,
            previous_status,
        }))
    }

    async fn get_queue_item(&self, step_run_uuid: Uuid) -> TaskerResult<Option<QueueItem>> {
        Ok(self.state.lock().queue_items.get(&step_run_uuid).cloned())
    }

    async fn list_expired_queue_items(
        &self,
        tenant_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let state = self.state.lock();
        let mut expired: Vec<QueueItem> = state
            .queue_items
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.is_expired(cutoff))
            .cloned()
            .collect();
        expired.sort_by_key(|i| (i.finished_at, i.step_run_uuid));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn list_timed_out_queue_items(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let state = self.state.lock();
        let mut timed_out: Vec<QueueItem> = state
            .queue_items
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.is_timed_out(now))
            .cloned()
            .collect();
        timed_out.sort_by_key(|i| (i.started_at, i.step_run_uuid));
        timed_out.truncate(limit);
        Ok(timed_out)
    }

    async fn delete_queue_items(&self, tenant_id: Uuid, ids: &[Uuid]) -> TaskerResult<u64> {
        let (latency, failure) = {
            let mut faults = self.faults.lock();
            let latency = faults.delete_latency.get(&tenant_id).copied();
            let failure = match faults.delete_failures.get_mut(&tenant_id) {
                Some((err, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(err.clone())
                }
                _ => None,
            };
            (latency, failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = self.state.lock();
        let mut deleted = 0;
        for id in ids {
            let removable = state
                .queue_items
                .get(id)
                .is_some_and(|i| i.tenant_id == tenant_id && i.status.is_terminal());
            if removable {
                state.queue_items.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl ConcurrencyRepository for InMemoryRepository {
    async fn try_reserve(&self, tenant_id: Uuid, key: &str, limit: u32) -> TaskerResult<bool> {
        Ok(self.state.lock().reserve_slot(tenant_id, key, limit))
    }

    async fn release(&self, tenant_id: Uuid, key: &str) -> TaskerResult<()> {
        self.state.lock().release_slot(tenant_id, key);
        Ok(())
    }

    async fn in_flight(&self, tenant_id: Uuid, key: &str) -> TaskerResult<u32> {
        Ok(self
            .state
            .lock()
            .concurrency_slots
            .get(&(tenant_id, key.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl PartitionRepository for InMemoryRepository {
    async fn list_tenants_by_partition(
        &self,
        partition_id: &str,
    ) -> TaskerResult<Vec<TenantPartition>> {
        let state = self.state.lock();
        let mut tenants: Vec<TenantPartition> = state
            .tenants
            .iter()
            .filter(|(_, assigned)| assigned.as_deref().map_or(true, |p| p == partition_id))
            .map(|(tenant_id, assigned)| TenantPartition {
                tenant_id: *tenant_id,
                partition_id: assigned.clone(),
            })
            .collect();
        tenants.sort_by_key(|t| t.tenant_id);
        Ok(tenants)
    }

    async fn upsert_partition_heartbeat(
        &self,
        partition_id: &str,
        now: DateTime<Utc>,
    ) -> TaskerResult<ControllerPartition> {
        self.state
            .lock()
            .partitions
            .insert(partition_id.to_string(), now);
        Ok(ControllerPartition {
            id: partition_id.to_string(),
            last_heartbeat: now,
        })
    }

    async fn list_partitions(&self) -> TaskerResult<Vec<ControllerPartition>> {
        let state = self.state.lock();
        let mut partitions: Vec<ControllerPartition> = state
            .partitions
            .iter()
            .map(|(id, last_heartbeat)| ControllerPartition {
                id: id.clone(),
                last_heartbeat: *last_heartbeat,
            })
            .collect();
        partitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(partitions)
    }

    async fn assign_tenant(
        &self,
        tenant_id: Uuid,
        partition_id: Option<&str>,
    ) -> TaskerResult<()> {
        self.state
            .lock()
            .tenants
            .insert(tenant_id, partition_id.map(str::to_string));
        Ok(())
    }
}

#[async_trait]
impl WorkflowRunRepository for InMemoryRepository {
    async fn create_workflow_run(&self, run: &WorkflowRun) -> TaskerResult<()> {
        let mut state = self.state.lock();
        state.tenants.entry(run.tenant_id).or_insert(None);
        if state.workflow_runs.contains_key(&run.workflow_run_uuid) {
            return Err(TaskerError::Conflict(format!(
                "workflow run {} already exists",
                run.workflow_run_uuid
            )));
        }
        state
            .workflow_runs
            .insert(run.workflow_run_uuid, run.clone());
        Ok(())
    }

    async fn get_workflow_run(&self, workflow_run_uuid: Uuid) -> TaskerResult<Option<WorkflowRun>> {
        Ok(self
            .state
            .lock()
            .workflow_runs
            .get(&workflow_run_uuid)
            .cloned())
    }

    async fn apply_update(
        &self,
        workflow_run_uuid: Uuid,
        update: WorkflowRunUpdate,
        now: DateTime<Utc>,
    ) -> TaskerResult<WorkflowRun> {
        let mut state = self.state.lock();
        let run = state
            .workflow_runs
            .get_mut(&workflow_run_uuid)
            .ok_or_else(|| TaskerError::NotFound(format!("workflow run {workflow_run_uuid}")))?;
        run.apply(update, now)?;
        Ok(run.clone())
    }
}

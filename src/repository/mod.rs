//! # Repository Interfaces
//!
//! Persistence seams for the queue core. Every method is atomic at the
//! granularity of a single queue item, counter, partition row or workflow run:
//!
//! - [`QueueRepository::claim_step_run`] takes a slot of the item's concurrency
//!   key and flips the item `queued → running` as one unit; of any number of
//!   concurrent callers for one item, at most one gets `Claimed`. Either both
//!   writes land or neither does, so a dropped call or a lost response never
//!   leaves a slot held without a running item.
//! - Leaving `running` (complete, fail, cancel) returns the slot in the same
//!   unit as the status change.
//! - [`ConcurrencyRepository::try_reserve`] increments a counter shared by every
//!   controller only while it is below the limit.
//! - [`WorkflowRunRepository::apply_update`] applies
//!   [`WorkflowRun::apply`](crate::models::WorkflowRun::apply) under an
//!   exclusive lock on the run.
//!
//! Two implementations ship with the crate: [`InMemoryRepository`] for tests
//! and single-process use, and [`PgRepository`] on PostgreSQL.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;

use crate::error::TaskerResult;
use crate::models::{
    ClaimOutcome, ControllerPartition, EnqueueOutcome, NewQueueItem, QueueItem, TenantPartition,
    WorkerCapabilities, WorkflowRun, WorkflowRunUpdate,
};
use crate::state_machine::QueueItemStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// A queue item after a cancel, with the status it held before
#[derive(Debug, Clone, PartialEq)]
pub struct CancelledQueueItem {
    pub item: QueueItem,
    pub previous_status: QueueItemStatus,
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Insert a queued item; an existing item with the same id is left untouched
    async fn enqueue_step_run(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> TaskerResult<EnqueueOutcome>;

    /// Queued items of the worker's tenant whose pool, cpu kind and region fit
    /// the worker, oldest first. Not locked; the claim itself arbitrates.
    async fn list_claim_candidates(
        &self,
        capabilities: &WorkerCapabilities,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>>;

    /// Reserve the item's concurrency slot and move it `queued → running`
    async fn claim_step_run(
        &self,
        step_run_uuid: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> TaskerResult<ClaimOutcome>;

    /// `running → succeeded`, releasing the slot; `InvalidTransition` from any
    /// other status
    async fn complete_step_run(
        &self,
        step_run_uuid: Uuid,
        output: Value,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem>;

    /// `running → failed`, releasing the slot; `InvalidTransition` from any
    /// other status
    async fn fail_step_run(
        &self,
        step_run_uuid: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> TaskerResult<QueueItem>;

    /// `queued | running → cancelled`, releasing the slot of a running item;
    /// `None` when the item is already terminal
    async fn cancel_step_run(
        &self,
        step_run_uuid: Uuid,
        now: DateTime<Utc>,
    ) -> TaskerResult<Option<CancelledQueueItem>>;

    async fn get_queue_item(&self, step_run_uuid: Uuid) -> TaskerResult<Option<QueueItem>>;

    /// Terminal items of the tenant finished before `cutoff`
    async fn list_expired_queue_items(
        &self,
        tenant_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>>;

    /// Running items of the tenant whose execution timeout elapsed before `now`
    async fn list_timed_out_queue_items(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>>;

    /// Delete the given items of the tenant, skipping any that are not terminal.
    /// Returns the number of rows removed.
    async fn delete_queue_items(&self, tenant_id: Uuid, ids: &[Uuid]) -> TaskerResult<u64>;
}

#[async_trait]
pub trait ConcurrencyRepository: Send + Sync {
    /// Increment the in-flight count for `(tenant_id, key)` if it is below
    /// `limit`; returns whether the slot was taken
    async fn try_reserve(&self, tenant_id: Uuid, key: &str, limit: u32) -> TaskerResult<bool>;

    /// Decrement the in-flight count, never below zero
    async fn release(&self, tenant_id: Uuid, key: &str) -> TaskerResult<()>;

    async fn in_flight(&self, tenant_id: Uuid, key: &str) -> TaskerResult<u32>;
}

#[async_trait]
pub trait PartitionRepository: Send + Sync {
    /// Tenants assigned to `partition_id` plus every unassigned tenant
    async fn list_tenants_by_partition(
        &self,
        partition_id: &str,
    ) -> TaskerResult<Vec<TenantPartition>>;

    async fn upsert_partition_heartbeat(
        &self,
        partition_id: &str,
        now: DateTime<Utc>,
    ) -> TaskerResult<ControllerPartition>;

    async fn list_partitions(&self) -> TaskerResult<Vec<ControllerPartition>>;

    /// Create or move a tenant; `None` leaves it unassigned
    async fn assign_tenant(&self, tenant_id: Uuid, partition_id: Option<&str>)
        -> TaskerResult<()>;
}

#[async_trait]
pub trait WorkflowRunRepository: Send + Sync {
    async fn create_workflow_run(&self, run: &WorkflowRun) -> TaskerResult<()>;

    async fn get_workflow_run(&self, workflow_run_uuid: Uuid) -> TaskerResult<Option<WorkflowRun>>;

    /// Apply `update` atomically and return the resulting run
    async fn apply_update(
        &self,
        workflow_run_uuid: Uuid,
        update: WorkflowRunUpdate,
        now: DateTime<Utc>,
    ) -> TaskerResult<WorkflowRun>;
}

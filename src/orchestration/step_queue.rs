//! # Step-Run Queue
//!
//! Lifecycle of queue items from enqueue until retention deletes them.
//!
//! ## Claiming
//!
//! A claim lists compatible queued candidates of the worker's tenant (oldest
//! first, best effort) and asks the repository to reserve the candidate's
//! concurrency key and flip it `queued → running` as one atomic unit.
//! Candidates that were taken by someone else or whose key is saturated are
//! skipped. Completing, failing or cancelling a running item returns its slot
//! in the same unit as the status change, so no interleaving of calls,
//! dropped futures or store errors can leave a slot held by nothing. Together
//! this keeps two guarantees:
//!
//! - an item is claimed by at most one worker;
//! - items running under one key never exceed the key's limit, across every
//!   controller and worker sharing the repository.
//!
//! ## Cleanup
//!
//! [`StepRunQueue::cleanup_queue_items`] deletes terminal items that finished
//! before `now - retention_period`, batch by batch until drained. Queued and
//! running items are never deleted, so cleanup can race with claims and
//! completions and can run concurrently on several partitions.

use crate::config::QueueConfig;
use crate::error::TaskerResult;
use crate::logging::log_queue_operation;
use crate::models::{
    is_compatible, ClaimOutcome, EnqueueOutcome, NewQueueItem, QueueItem, WorkerCapabilities,
};
use crate::orchestration::concurrency::ConcurrencyController;
use crate::repository::QueueRepository;
use crate::state_machine::QueueItemStatus;
use crate::utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Anything a worker-side poller can claim step runs from
#[async_trait]
pub trait StepRunClaimer: Send + Sync {
    async fn claim(&self, capabilities: &WorkerCapabilities) -> TaskerResult<Option<QueueItem>>;
}

pub struct StepRunQueue {
    repository: Arc<dyn QueueRepository>,
    concurrency: ConcurrencyController,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    retention_period: chrono::Duration,
}

impl std::fmt::Debug for StepRunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunQueue")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .field("retention_period", &self.retention_period)
            .finish_non_exhaustive()
    }
}

impl StepRunQueue {
    pub fn new(
        repository: Arc<dyn QueueRepository>,
        concurrency: ConcurrencyController,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            concurrency,
            clock,
            config: QueueConfig::default(),
            retention_period: chrono::Duration::hours(24),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retention_period(mut self, retention_period: chrono::Duration) -> Self {
        self.retention_period = retention_period;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn retention_period(&self) -> chrono::Duration {
        self.retention_period
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run one repository call under the operation timeout
    async fn bounded<T>(&self, fut: impl Future<Output = TaskerResult<T>>) -> TaskerResult<T> {
        timeout(self.config.operation_timeout(), fut).await?
    }

    #[instrument(skip(self, item), fields(step_run_uuid = %item.step_run_uuid, tenant_id = %item.tenant_id))]
    pub async fn enqueue(&self, item: NewQueueItem) -> TaskerResult<EnqueueOutcome> {
        let tenant_id = item.tenant_id;
        let step_run_uuid = item.step_run_uuid;
        let step_id = item.step_id.clone();
        let outcome = self
            .bounded(self.repository.enqueue_step_run(item, self.clock.now()))
            .await?;

        match outcome {
            EnqueueOutcome::Enqueued => log_queue_operation(
                "enqueue",
                tenant_id,
                Some(step_run_uuid),
                Some(&step_id),
                QueueItemStatus::Queued.as_str(),
                None,
            ),
            EnqueueOutcome::AlreadyEnqueued => {
                debug!(step_id = %step_id, "Step run already enqueued, nothing to do")
            }
        }
        Ok(outcome)
    }

    /// Claim one compatible queued item, or `None` when nothing is claimable
    #[instrument(skip(self, capabilities), fields(worker_id = %capabilities.worker_id, tenant_id = %capabilities.tenant_id))]
    pub async fn claim(&self, capabilities: &WorkerCapabilities) -> TaskerResult<Option<QueueItem>> {
        let candidates = self
            .bounded(
                self.repository
                    .list_claim_candidates(capabilities, self.config.claim_candidate_limit),
            )
            .await?;

        for candidate in candidates {
            if !is_compatible(&candidate.compute, capabilities) {
                continue;
            }
            if let Some(item) = self.try_claim(&candidate, capabilities).await? {
                return Ok(Some(item));
            }
        }

        debug!("No claimable step runs");
        Ok(None)
    }

    /// Claim up to `min(max_items, slots)` items
    pub async fn claim_batch(
        &self,
        capabilities: &WorkerCapabilities,
        max_items: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        let wanted = max_items.min(capabilities.slots as usize);
        let mut claimed = Vec::with_capacity(wanted);
        while claimed.len() < wanted {
            match self.claim(capabilities).await? {
                Some(item) => claimed.push(item),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn try_claim(
        &self,
        candidate: &QueueItem,
        capabilities: &WorkerCapabilities,
    ) -> TaskerResult<Option<QueueItem>> {
        let now = self.clock.now();
        let result = self
            .bounded(self.repository.claim_step_run(
                candidate.step_run_uuid,
                &capabilities.worker_id,
                now,
            ))
            .await;

        match result {
            Ok(ClaimOutcome::Claimed(item)) => {
                log_queue_operation(
                    "claim",
                    item.tenant_id,
                    Some(item.step_run_uuid),
                    Some(&item.step_id),
                    item.status.as_str(),
                    Some(&capabilities.worker_id),
                );
                Ok(Some(item))
            }
            Ok(ClaimOutcome::Saturated) => {
                debug!(
                    step_run_uuid = %candidate.step_run_uuid,
                    key = ?candidate.concurrency_key,
                    "Concurrency key saturated, skipping candidate"
                );
                Ok(None)
            }
            Ok(ClaimOutcome::Lost) => {
                debug!(step_run_uuid = %candidate.step_run_uuid, "Claim lost to another worker");
                Ok(None)
            }
            Err(err) => {
                // the claim may have committed before the error surfaced; its
                // slot stays with the item either way
                if let Ok(Some(item)) = self
                    .bounded(self.repository.get_queue_item(candidate.step_run_uuid))
                    .await
                {
                    if item.status == QueueItemStatus::Running
                        && item.claimed_by.as_deref() == Some(capabilities.worker_id.as_str())
                        && item.started_at == Some(now)
                    {
                        return Ok(Some(item));
                    }
                }
                if err.is_conflict() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    #[instrument(skip(self, output))]
    pub async fn complete(&self, step_run_uuid: Uuid, output: Value) -> TaskerResult<QueueItem> {
        let item = self
            .bounded(
                self.repository
                    .complete_step_run(step_run_uuid, output, self.clock.now()),
            )
            .await?;
        log_queue_operation(
            "complete",
            item.tenant_id,
            Some(step_run_uuid),
            Some(&item.step_id),
            item.status.as_str(),
            None,
        );
        Ok(item)
    }

    #[instrument(skip(self, error))]
    pub async fn fail(&self, step_run_uuid: Uuid, error: impl Into<String>) -> TaskerResult<QueueItem> {
        let error = error.into();
        let item = self
            .bounded(
                self.repository
                    .fail_step_run(step_run_uuid, error.clone(), self.clock.now()),
            )
            .await?;
        log_queue_operation(
            "fail",
            item.tenant_id,
            Some(step_run_uuid),
            Some(&item.step_id),
            item.status.as_str(),
            Some(&error),
        );
        Ok(item)
    }

    /// Cancel a queued or running item. `None` when it had already finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, step_run_uuid: Uuid) -> TaskerResult<Option<QueueItem>> {
        let cancelled = self
            .bounded(self.repository.cancel_step_run(step_run_uuid, self.clock.now()))
            .await?;

        let Some(cancelled) = cancelled else {
            return Ok(None);
        };
        log_queue_operation(
            "cancel",
            cancelled.item.tenant_id,
            Some(step_run_uuid),
            Some(&cancelled.item.step_id),
            cancelled.item.status.as_str(),
            Some(cancelled.previous_status.as_str()),
        );
        Ok(Some(cancelled.item))
    }

    /// Running items currently holding a slot of `(tenant_id, key)`
    pub async fn in_flight(&self, tenant_id: Uuid, key: &str) -> TaskerResult<u32> {
        self.bounded(self.concurrency.in_flight(tenant_id, key)).await
    }

    pub async fn get(&self, step_run_uuid: Uuid) -> TaskerResult<Option<QueueItem>> {
        self.bounded(self.repository.get_queue_item(step_run_uuid))
            .await
    }

    pub async fn list_expired(
        &self,
        tenant_id: Uuid,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        self.bounded(
            self.repository
                .list_expired_queue_items(tenant_id, cutoff, limit),
        )
        .await
    }

    pub async fn list_timed_out(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: usize,
    ) -> TaskerResult<Vec<QueueItem>> {
        self.bounded(
            self.repository
                .list_timed_out_queue_items(tenant_id, now, limit),
        )
        .await
    }

    /// Delete the tenant's terminal items older than the retention period
    pub async fn cleanup_queue_items(&self, tenant_id: Uuid) -> TaskerResult<u64> {
        let cutoff = self.clock.now() - self.retention_period;
        self.cleanup_queue_items_before(tenant_id, cutoff).await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn cleanup_queue_items_before(
        &self,
        tenant_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> TaskerResult<u64> {
        let batch_size = self.config.cleanup_batch_size;
        let mut deleted_total = 0u64;

        loop {
            let expired = self.list_expired(tenant_id, cutoff, batch_size).await?;
            if expired.is_empty() {
                break;
            }
            let ids: Vec<Uuid> = expired.iter().map(|i| i.step_run_uuid).collect();
            let deleted = self
                .bounded(self.repository.delete_queue_items(tenant_id, &ids))
                .await?;
            deleted_total += deleted;

            if expired.len() < batch_size || deleted == 0 {
                break;
            }
            debug!(deleted, batch_size, "Cleanup batch filled; continuing");
        }

        if deleted_total > 0 {
            info!(
                tenant_id = %tenant_id,
                deleted = deleted_total,
                cutoff = %cutoff,
                "🧹 Deleted expired queue items"
            );
        }
        Ok(deleted_total)
    }
}

#[async_trait]
impl StepRunClaimer for StepRunQueue {
    async fn claim(&self, capabilities: &WorkerCapabilities) -> TaskerResult<Option<QueueItem>> {
        StepRunQueue::claim(self, capabilities).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskerError;
    use crate::models::{ComputeClass, CpuKind};
    use crate::repository::{CancelledQueueItem, InMemoryRepository};
    use crate::utils::ManualClock;
    use chrono::Duration;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory repository with injectable faults on the claim path
    #[derive(Default)]
    struct FaultyClaims {
        inner: InMemoryRepository,
        /// the claim is applied, then reported as a store error
        lose_claim_response: AtomicBool,
        fail_reads: AtomicBool,
        delay: Mutex<std::time::Duration>,
    }

    impl FaultyClaims {
        fn new(inner: InMemoryRepository) -> Self {
            Self {
                inner,
                ..Self::default()
            }
        }

        async fn pause(&self) {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl QueueRepository for FaultyClaims {
        async fn enqueue_step_run(
            &self,
            item: NewQueueItem,
            now: DateTime<Utc>,
        ) -> TaskerResult<EnqueueOutcome> {
            self.inner.enqueue_step_run(item, now).await
        }

        async fn list_claim_candidates(
            &self,
            capabilities: &WorkerCapabilities,
            limit: usize,
        ) -> TaskerResult<Vec<QueueItem>> {
            self.inner.list_claim_candidates(capabilities, limit).await
        }

        async fn claim_step_run(
            &self,
            step_run_uuid: Uuid,
            worker_id: &str,
            now: DateTime<Utc>,
        ) -> TaskerResult<ClaimOutcome> {
            self.pause().await;
            let outcome = self.inner.claim_step_run(step_run_uuid, worker_id, now).await?;
            if self.lose_claim_response.load(Ordering::SeqCst) {
                return Err(TaskerError::TransientStore("connection reset".into()));
            }
            Ok(outcome)
        }

        async fn complete_step_run(
            &self,
            step_run_uuid: Uuid,
            output: Value,
            now: DateTime<Utc>,
        ) -> TaskerResult<QueueItem> {
            self.pause().await;
            self.inner.complete_step_run(step_run_uuid, output, now).await
        }

        async fn fail_step_run(
            &self,
            step_run_uuid: Uuid,
            error: String,
            now: DateTime<Utc>,
        ) -> TaskerResult<QueueItem> {
            self.inner.fail_step_run(step_run_uuid, error, now).await
        }

        async fn cancel_step_run(
            &self,
            step_run_uuid: Uuid,
            now: DateTime<Utc>,
        ) -> TaskerResult<Option<CancelledQueueItem>> {
            self.inner.cancel_step_run(step_run_uuid, now).await
        }

        async fn get_queue_item(&self, step_run_uuid: Uuid) -> TaskerResult<Option<QueueItem>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(TaskerError::TransientStore("connection reset".into()));
            }
            self.inner.get_queue_item(step_run_uuid).await
        }

        async fn list_expired_queue_items(
            &self,
            tenant_id: Uuid,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> TaskerResult<Vec<QueueItem>> {
            self.inner
                .list_expired_queue_items(tenant_id, cutoff, limit)
                .await
        }

        async fn list_timed_out_queue_items(
            &self,
            tenant_id: Uuid,
            now: DateTime<Utc>,
            limit: usize,
        ) -> TaskerResult<Vec<QueueItem>> {
            self.inner
                .list_timed_out_queue_items(tenant_id, now, limit)
                .await
        }

        async fn delete_queue_items(&self, tenant_id: Uuid, ids: &[Uuid]) -> TaskerResult<u64> {
            self.inner.delete_queue_items(tenant_id, ids).await
        }
    }

    fn faulty_queue(repo: &InMemoryRepository) -> (Arc<FaultyClaims>, StepRunQueue) {
        let faulty = Arc::new(FaultyClaims::new(repo.clone()));
        let queue = StepRunQueue::new(
            faulty.clone(),
            ConcurrencyController::new(Arc::new(repo.clone())),
            Arc::new(ManualClock::new(Utc::now())),
        );
        (faulty, queue)
    }

    struct Harness {
        repo: InMemoryRepository,
        clock: ManualClock,
        queue: StepRunQueue,
        tenant: Uuid,
    }

    fn harness() -> Harness {
        let repo = InMemoryRepository::new();
        let clock = ManualClock::new(Utc::now());
        let queue = StepRunQueue::new(
            Arc::new(repo.clone()),
            ConcurrencyController::new(Arc::new(repo.clone())),
            Arc::new(clock.clone()),
        )
        .with_retention_period(Duration::hours(1));
        Harness {
            repo,
            clock,
            queue,
            tenant: Uuid::new_v4(),
        }
    }

    fn item(tenant: Uuid, key: Option<(&str, u32)>) -> NewQueueItem {
        NewQueueItem {
            step_run_uuid: Uuid::new_v4(),
            workflow_run_uuid: Uuid::new_v4(),
            tenant_id: tenant,
            step_id: "step".into(),
            concurrency_key: key.map(|(k, _)| k.to_string()),
            concurrency_limit: key.map(|(_, l)| l),
            compute: ComputeClass::default(),
            execution_timeout_secs: 60,
        }
    }

    fn worker(h: &Harness, id: &str) -> WorkerCapabilities {
        WorkerCapabilities::new(id, h.tenant).with_slots(4)
    }

    #[tokio::test]
    async fn test_saturated_key_is_skipped_until_released() {
        let h = harness();
        let first = item(h.tenant, Some(("user-1", 1)));
        let second = item(h.tenant, Some(("user-1", 1)));
        let other = item(h.tenant, Some(("user-2", 1)));
        for i in [first.clone(), second.clone(), other.clone()] {
            h.queue.enqueue(i).await.unwrap();
            h.clock.advance(Duration::seconds(1));
        }

        let w = worker(&h, "w1");
        let claimed = h.queue.claim(&w).await.unwrap().unwrap();
        assert_eq!(claimed.step_run_uuid, first.step_run_uuid);

        // user-1 is saturated, so the next claim skips ahead to user-2
        let claimed = h.queue.claim(&w).await.unwrap().unwrap();
        assert_eq!(claimed.step_run_uuid, other.step_run_uuid);
        assert!(h.queue.claim(&w).await.unwrap().is_none());

        h.queue
            .complete(first.step_run_uuid, json!({"ok": true}))
            .await
            .unwrap();
        let claimed = h.queue.claim(&w).await.unwrap().unwrap();
        assert_eq!(claimed.step_run_uuid, second.step_run_uuid);
    }

    #[tokio::test]
    async fn test_incompatible_worker_claims_nothing() {
        let h = harness();
        h.queue.enqueue(item(h.tenant, None)).await.unwrap();

        let perf = worker(&h, "w1").with_cpu_kind(CpuKind::Performance);
        assert!(h.queue.claim(&perf).await.unwrap().is_none());

        let other_tenant = WorkerCapabilities::new("w2", Uuid::new_v4());
        assert!(h.queue.claim(&other_tenant).await.unwrap().is_none());

        assert!(h.queue.claim(&worker(&h, "w3")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_and_fail_require_running() {
        let h = harness();
        let queued = item(h.tenant, None);
        h.queue.enqueue(queued.clone()).await.unwrap();

        let err = h
            .queue
            .complete(queued.step_run_uuid, json!(null))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskerError::InvalidTransition {
                from: QueueItemStatus::Queued,
                ..
            }
        ));

        h.queue.claim(&worker(&h, "w1")).await.unwrap().unwrap();
        let failed = h.queue.fail(queued.step_run_uuid, "boom").await.unwrap();
        assert_eq!(failed.status, QueueItemStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let err = h.queue.fail(queued.step_run_uuid, "again").await.unwrap_err();
        assert!(matches!(err, TaskerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_running_item_releases_its_slot() {
        let h = harness();
        let running = item(h.tenant, Some(("k", 1)));
        let waiting = item(h.tenant, Some(("k", 1)));
        h.queue.enqueue(running.clone()).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        h.queue.enqueue(waiting.clone()).await.unwrap();

        let w = worker(&h, "w1");
        h.queue.claim(&w).await.unwrap().unwrap();
        assert!(h.queue.claim(&w).await.unwrap().is_none());

        let cancelled = h.queue.cancel(running.step_run_uuid).await.unwrap().unwrap();
        assert_eq!(cancelled.status, QueueItemStatus::Cancelled);
        assert!(h.queue.cancel(running.step_run_uuid).await.unwrap().is_none());

        let claimed = h.queue.claim(&w).await.unwrap().unwrap();
        assert_eq!(claimed.step_run_uuid, waiting.step_run_uuid);
    }

    #[tokio::test]
    async fn test_cancel_queued_item_does_not_touch_counter() {
        let h = harness();
        let queued = item(h.tenant, Some(("k", 2)));
        h.queue.enqueue(queued.clone()).await.unwrap();
        h.queue.cancel(queued.step_run_uuid).await.unwrap().unwrap();

        assert_eq!(h.queue.in_flight(h.tenant, "k").await.unwrap(), 0);
        assert!(h.queue.claim(&worker(&h, "w1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_batch_is_bounded_by_slots() {
        let h = harness();
        for _ in 0..6 {
            h.queue.enqueue(item(h.tenant, None)).await.unwrap();
        }
        let w = worker(&h, "w1").with_slots(3);
        assert_eq!(h.queue.claim_batch(&w, 10).await.unwrap().len(), 3);
        assert_eq!(h.queue.claim_batch(&w, 2).await.unwrap().len(), 2);
        assert_eq!(h.queue.claim_batch(&w, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_terminal_items() {
        let mut h = harness();
        h.queue = StepRunQueue::new(
            Arc::new(h.repo.clone()),
            ConcurrencyController::new(Arc::new(h.repo.clone())),
            Arc::new(h.clock.clone()),
        )
        .with_retention_period(Duration::hours(1))
        .with_config(QueueConfig {
            cleanup_batch_size: 2,
            ..QueueConfig::default()
        });

        let w = worker(&h, "w1");
        let mut finished = Vec::new();
        for _ in 0..5 {
            let i = item(h.tenant, None);
            h.queue.enqueue(i.clone()).await.unwrap();
            let claimed = h.queue.claim(&w).await.unwrap().unwrap();
            h.queue.complete(claimed.step_run_uuid, json!(1)).await.unwrap();
            finished.push(i.step_run_uuid);
        }
        let still_queued = item(h.tenant, None);
        h.queue.enqueue(still_queued.clone()).await.unwrap();

        h.clock.advance(Duration::hours(2));
        let recent = item(h.tenant, None);
        h.queue.enqueue(recent.clone()).await.unwrap();
        h.queue.claim(&w).await.unwrap().unwrap();
        h.queue.complete(still_queued.step_run_uuid, json!(2)).await.unwrap();

        assert_eq!(h.queue.cleanup_queue_items(h.tenant).await.unwrap(), 5);
        assert_eq!(h.queue.cleanup_queue_items(h.tenant).await.unwrap(), 0);

        let remaining: Vec<Uuid> = h.repo.queue_items().iter().map(|i| i.step_run_uuid).collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&still_queued.step_run_uuid));
        assert!(remaining.contains(&recent.step_run_uuid));
    }

    #[tokio::test]
    async fn test_claim_with_unknown_outcome_keeps_slot_with_running_item() {
        let repo = InMemoryRepository::new();
        let (faulty, queue) = faulty_queue(&repo);
        let tenant = Uuid::new_v4();
        let first = item(tenant, Some(("k", 1)));
        let second = item(tenant, Some(("k", 1)));
        queue.enqueue(first.clone()).await.unwrap();
        let w = WorkerCapabilities::new("w1", tenant).with_slots(4);

        faulty.lose_claim_response.store(true, Ordering::SeqCst);
        faulty.fail_reads.store(true, Ordering::SeqCst);
        assert!(queue.claim(&w).await.is_err());
        faulty.lose_claim_response.store(false, Ordering::SeqCst);
        faulty.fail_reads.store(false, Ordering::SeqCst);

        // the claim landed, so the slot belongs to the running item
        queue.enqueue(second.clone()).await.unwrap();
        assert!(queue.claim(&w).await.unwrap().is_none());
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 1);
        let running: Vec<QueueItem> = repo
            .queue_items()
            .into_iter()
            .filter(|i| i.status == QueueItemStatus::Running)
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].step_run_uuid, first.step_run_uuid);

        // completing returns the slot exactly once
        queue.complete(first.step_run_uuid, json!(1)).await.unwrap();
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 0);
        let claimed = queue.claim(&w).await.unwrap().unwrap();
        assert_eq!(claimed.step_run_uuid, second.step_run_uuid);
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_with_lost_response_is_recovered_by_reread() {
        let repo = InMemoryRepository::new();
        let (faulty, queue) = faulty_queue(&repo);
        let tenant = Uuid::new_v4();
        let queued = item(tenant, Some(("k", 1)));
        queue.enqueue(queued.clone()).await.unwrap();

        faulty.lose_claim_response.store(true, Ordering::SeqCst);
        let claimed = queue
            .claim(&WorkerCapabilities::new("w1", tenant))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.step_run_uuid, queued.step_run_uuid);
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_calls_leave_counter_consistent() {
        let repo = InMemoryRepository::new();
        let (faulty, queue) = faulty_queue(&repo);
        let tenant = Uuid::new_v4();
        let queued = item(tenant, Some(("k", 1)));
        queue.enqueue(queued.clone()).await.unwrap();
        let w = WorkerCapabilities::new("w1", tenant);

        *faulty.delay.lock() = std::time::Duration::from_millis(200);
        let dropped =
            tokio::time::timeout(std::time::Duration::from_millis(50), queue.claim(&w)).await;
        assert!(dropped.is_err());
        let item_now = queue.get(queued.step_run_uuid).await.unwrap().unwrap();
        assert_eq!(item_now.status, QueueItemStatus::Queued);
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 0);

        *faulty.delay.lock() = std::time::Duration::ZERO;
        queue.claim(&w).await.unwrap().unwrap();

        *faulty.delay.lock() = std::time::Duration::from_millis(200);
        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            queue.complete(queued.step_run_uuid, json!(1)),
        )
        .await;
        assert!(dropped.is_err());
        let item_now = queue.get(queued.step_run_uuid).await.unwrap().unwrap();
        assert_eq!(item_now.status, QueueItemStatus::Running);
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 1);

        *faulty.delay.lock() = std::time::Duration::ZERO;
        queue.complete(queued.step_run_uuid, json!(1)).await.unwrap();
        assert_eq!(queue.in_flight(tenant, "k").await.unwrap(), 0);
    }
}

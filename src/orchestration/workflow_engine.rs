//! # Workflow Engine
//!
//! Drives workflow runs over the step-run queue.
//!
//! ## Flow
//!
//! ```text
//! TriggerEvent -> WorkflowRun (all steps pending)
//!              -> runnable steps -> resolve concurrency key -> bind compute
//!              -> enqueue -> mark queued
//! claim        -> mark running
//! complete     -> mark succeeded -> enqueue newly runnable children
//! fail         -> mark failed, run failed, remaining steps cancelled
//! ```
//!
//! Queue items are written before the run records the step as queued, so a
//! controller that crashes in between replays the enqueue and hits the
//! idempotent path. Run bookkeeping only ever moves forward; see
//! [`WorkflowRun::apply`].

use crate::error::{TaskerError, TaskerResult};
use crate::models::{
    NewQueueItem, QueueItem, StepRun, TriggerEvent, WorkerCapabilities, WorkflowDefinition,
    WorkflowRun, WorkflowRunUpdate,
};
use crate::orchestration::compute_binder::ComputeBinder;
use crate::orchestration::concurrency::ConcurrencyController;
use crate::orchestration::dag;
use crate::orchestration::registry::WorkflowRegistry;
use crate::orchestration::step_queue::{StepRunClaimer, StepRunQueue};
use crate::repository::WorkflowRunRepository;
use crate::state_machine::{QueueItemStatus, StepRunState};
use crate::utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Error recorded on step runs failed by the timeout reaper
pub const TIMED_OUT: &str = "TIMED_OUT";

pub struct WorkflowEngine {
    registry: Arc<WorkflowRegistry>,
    queue: Arc<StepRunQueue>,
    runs: Arc<dyn WorkflowRunRepository>,
    binder: ComputeBinder,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("queue", &self.queue)
            .field("binder", &self.binder)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        queue: Arc<StepRunQueue>,
        runs: Arc<dyn WorkflowRunRepository>,
    ) -> Self {
        Self {
            registry,
            queue,
            runs,
            binder: ComputeBinder::new(),
        }
    }

    pub fn with_binder(mut self, binder: ComputeBinder) -> Self {
        self.binder = binder;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<StepRunQueue> {
        &self.queue
    }

    fn now(&self) -> DateTime<Utc> {
        self.queue.clock().now()
    }

    /// Start one run per active definition of the tenant that listens to the event
    #[instrument(skip(self, event), fields(event_name = %event.event_name, tenant_id = %event.tenant_id))]
    pub async fn handle_event(&self, event: &TriggerEvent) -> TaskerResult<Vec<WorkflowRun>> {
        let definitions = self
            .registry
            .definitions_for_event(event.tenant_id, &event.event_name);
        if definitions.is_empty() {
            debug!("No workflow listens to this event");
            return Ok(Vec::new());
        }

        let mut runs = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let run = self
                .trigger_workflow(
                    &definition,
                    event.payload.clone(),
                    event.additional_metadata.clone(),
                )
                .await?;
            runs.push(run);
        }
        Ok(runs)
    }

    #[instrument(skip(self, definition, input, additional_metadata), fields(workflow = %definition.name, version = %definition.version))]
    pub async fn trigger_workflow(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
        additional_metadata: Option<Value>,
    ) -> TaskerResult<WorkflowRun> {
        let run = WorkflowRun::instantiate(definition, input, additional_metadata, self.now());
        self.runs.create_workflow_run(&run).await?;
        info!(
            workflow_run_uuid = %run.workflow_run_uuid,
            tenant_id = %run.tenant_id,
            steps = run.step_runs.len(),
            "🚀 Workflow run created"
        );
        self.enqueue_ready(definition, run).await
    }

    pub async fn get_workflow_run(&self, workflow_run_uuid: Uuid) -> TaskerResult<Option<WorkflowRun>> {
        self.runs.get_workflow_run(workflow_run_uuid).await
    }

    /// Enqueue every pending step of the run whose parents have all succeeded
    pub async fn enqueue_runnable_steps(&self, workflow_run_uuid: Uuid) -> TaskerResult<WorkflowRun> {
        let run = self.load_run(workflow_run_uuid).await?;
        let definition = self.definition_for(&run)?;
        self.enqueue_ready(&definition, run).await
    }

    async fn enqueue_ready(
        &self,
        definition: &WorkflowDefinition,
        mut run: WorkflowRun,
    ) -> TaskerResult<WorkflowRun> {
        if run.status.is_terminal() {
            return Ok(run);
        }

        let context = run.trigger_context();
        let ready: Vec<StepRun> = dag::runnable_steps(definition, &run)
            .into_iter()
            .cloned()
            .collect();

        for step_run in ready {
            let Some(step) = definition.step(&step_run.step_id) else {
                continue;
            };

            let concurrency = match ConcurrencyController::resolve_spec(step.concurrency.as_ref(), &context) {
                Ok(concurrency) => concurrency,
                Err(err) => {
                    warn!(
                        workflow_run_uuid = %run.workflow_run_uuid,
                        step_id = %step.id,
                        error = %err,
                        "Concurrency key could not be resolved, failing step"
                    );
                    run = self
                        .runs
                        .apply_update(
                            run.workflow_run_uuid,
                            WorkflowRunUpdate::StepFailed {
                                step_id: step.id.clone(),
                                error: err.to_string(),
                            },
                            self.now(),
                        )
                        .await?;
                    self.cancel_queue_items(&run).await?;
                    return Ok(run);
                }
            };

            let compute = self.binder.bind(step);
            let item = NewQueueItem::for_step_run(
                &step_run,
                concurrency.clone(),
                compute.clone(),
                step.execution_timeout_secs,
            );
            self.queue.enqueue(item).await?;

            let (concurrency_key, concurrency_limit) = match concurrency {
                Some((key, limit)) => (Some(key), Some(limit)),
                None => (None, None),
            };
            run = self
                .runs
                .apply_update(
                    run.workflow_run_uuid,
                    WorkflowRunUpdate::StepQueued {
                        step_id: step.id.clone(),
                        concurrency_key,
                        concurrency_limit,
                        compute,
                    },
                    self.now(),
                )
                .await?;

            // the run was cancelled between the enqueue and the bookkeeping
            if run
                .step_run(&step.id)
                .is_some_and(|s| s.status == StepRunState::Cancelled)
            {
                self.cancel_queue_item(step_run.step_run_uuid).await?;
                return Ok(run);
            }
        }

        Ok(run)
    }

    /// Claim a step run and record it as running on its workflow run
    pub async fn claim_step_run(
        &self,
        capabilities: &WorkerCapabilities,
    ) -> TaskerResult<Option<QueueItem>> {
        let Some(item) = self.queue.claim(capabilities).await? else {
            return Ok(None);
        };

        // the claim stands even if the bookkeeping fails; completion advances the step anyway
        if let Err(err) = self
            .runs
            .apply_update(
                item.workflow_run_uuid,
                WorkflowRunUpdate::StepStarted {
                    step_id: item.step_id.clone(),
                },
                self.now(),
            )
            .await
        {
            warn!(
                step_run_uuid = %item.step_run_uuid,
                error = %err,
                "Could not record step start on workflow run"
            );
        }
        Ok(Some(item))
    }

    #[instrument(skip(self, output))]
    pub async fn complete_step_run(&self, step_run_uuid: Uuid, output: Value) -> TaskerResult<WorkflowRun> {
        let completed = self.queue.complete(step_run_uuid, output.clone()).await;
        let item = self.settled_item(step_run_uuid, completed).await?;

        let run = self
            .runs
            .apply_update(
                item.workflow_run_uuid,
                WorkflowRunUpdate::StepSucceeded {
                    step_id: item.step_id.clone(),
                    output,
                },
                self.now(),
            )
            .await?;

        let definition = self.definition_for(&run)?;
        let run = self.enqueue_ready(&definition, run).await?;
        if run.status.is_terminal() {
            info!(
                workflow_run_uuid = %run.workflow_run_uuid,
                status = %run.status,
                "🏁 Workflow run finished"
            );
        }
        Ok(run)
    }

    #[instrument(skip(self, error))]
    pub async fn fail_step_run(
        &self,
        step_run_uuid: Uuid,
        error: impl Into<String>,
    ) -> TaskerResult<WorkflowRun> {
        let error = error.into();
        let failed = self.queue.fail(step_run_uuid, error.clone()).await;
        let item = self.settled_item(step_run_uuid, failed).await?;
        let run = self
            .runs
            .apply_update(
                item.workflow_run_uuid,
                WorkflowRunUpdate::StepFailed {
                    step_id: item.step_id.clone(),
                    error,
                },
                self.now(),
            )
            .await?;
        self.cancel_queue_items(&run).await?;
        info!(
            workflow_run_uuid = %run.workflow_run_uuid,
            step_id = %item.step_id,
            status = %run.status,
            "❌ Step run failed"
        );
        Ok(run)
    }

    /// Cancel the run and every unfinished step, releasing their reservations
    #[instrument(skip(self))]
    pub async fn cancel_workflow_run(&self, workflow_run_uuid: Uuid) -> TaskerResult<WorkflowRun> {
        let run = self
            .runs
            .apply_update(workflow_run_uuid, WorkflowRunUpdate::Cancel, self.now())
            .await?;
        self.cancel_queue_items(&run).await?;
        info!(status = %run.status, "🛑 Workflow run cancelled");
        Ok(run)
    }

    /// Fail running items of the tenant whose execution timeout elapsed.
    /// Returns how many were failed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn reap_timed_out_steps(&self, tenant_id: Uuid, now: DateTime<Utc>) -> TaskerResult<usize> {
        let limit = self.queue.config().claim_candidate_limit;
        let timed_out = self.queue.list_timed_out(tenant_id, now, limit).await?;

        let mut reaped = 0;
        for item in timed_out {
            match self.fail_step_run(item.step_run_uuid, TIMED_OUT).await {
                Ok(run)
                    if run
                        .step_run_by_uuid(item.step_run_uuid)
                        .is_some_and(|step| step.status == StepRunState::Failed) =>
                {
                    reaped += 1
                }
                Ok(_) => {
                    debug!(step_run_uuid = %item.step_run_uuid, "Step run was cancelled before it could be timed out");
                }
                Err(TaskerError::InvalidTransition { .. }) => {
                    debug!(step_run_uuid = %item.step_run_uuid, "Step run finished before it could be timed out");
                }
                Err(err) => return Err(err),
            }
        }

        if reaped > 0 {
            info!(reaped, "⏰ Failed timed-out step runs");
        }
        Ok(reaped)
    }

    /// A result for an item that was cancelled first is still recorded on the
    /// run; the statuses stay cancelled.
    async fn settled_item(
        &self,
        step_run_uuid: Uuid,
        result: TaskerResult<QueueItem>,
    ) -> TaskerResult<QueueItem> {
        match result {
            Ok(item) => Ok(item),
            Err(TaskerError::InvalidTransition {
                from: QueueItemStatus::Cancelled,
                ..
            }) => {
                debug!("Step run finished after cancellation, recording result only");
                self.queue
                    .get(step_run_uuid)
                    .await?
                    .ok_or_else(|| TaskerError::NotFound(format!("queue item {step_run_uuid}")))
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_queue_items(&self, run: &WorkflowRun) -> TaskerResult<()> {
        for step in run.cancelled_enqueued_steps() {
            self.cancel_queue_item(step.step_run_uuid).await?;
        }
        Ok(())
    }

    async fn cancel_queue_item(&self, step_run_uuid: Uuid) -> TaskerResult<()> {
        match self.queue.cancel(step_run_uuid).await {
            Ok(_) | Err(TaskerError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn load_run(&self, workflow_run_uuid: Uuid) -> TaskerResult<WorkflowRun> {
        self.runs
            .get_workflow_run(workflow_run_uuid)
            .await?
            .ok_or_else(|| TaskerError::NotFound(format!("workflow run {workflow_run_uuid}")))
    }

    fn definition_for(&self, run: &WorkflowRun) -> TaskerResult<Arc<WorkflowDefinition>> {
        self.registry
            .get(run.workflow_definition_id)
            .ok_or_else(|| {
                TaskerError::NotFound(format!(
                    "workflow definition {} for run {}",
                    run.workflow_definition_id, run.workflow_run_uuid
                ))
            })
    }
}

#[async_trait]
impl StepRunClaimer for WorkflowEngine {
    async fn claim(&self, capabilities: &WorkerCapabilities) -> TaskerResult<Option<QueueItem>> {
        self.claim_step_run(capabilities).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComputeClass, StepDefinition};
    use crate::repository::{ConcurrencyRepository, InMemoryRepository};
    use crate::state_machine::WorkflowRunStatus;
    use crate::utils::{Clock, ManualClock};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        repo: InMemoryRepository,
        clock: ManualClock,
        engine: WorkflowEngine,
        tenant_id: Uuid,
    }

    impl Harness {
        fn new() -> Self {
            let repo = InMemoryRepository::new();
            let clock = ManualClock::new(Utc::now());
            let queue = Arc::new(StepRunQueue::new(
                Arc::new(repo.clone()),
                ConcurrencyController::new(Arc::new(repo.clone())),
                Arc::new(clock.clone()),
            ));
            let engine = WorkflowEngine::new(
                Arc::new(WorkflowRegistry::new()),
                queue,
                Arc::new(repo.clone()),
            );
            Self {
                repo,
                clock,
                engine,
                tenant_id: Uuid::new_v4(),
            }
        }

        fn register(&self, steps: Vec<StepDefinition>) -> Arc<WorkflowDefinition> {
            let definition = steps.into_iter().fold(
                WorkflowDefinition::new(self.tenant_id, "wf", "v1").on_event("user:create"),
                WorkflowDefinition::with_step,
            );
            self.engine.registry().register(definition).unwrap()
        }

        fn worker(&self) -> WorkerCapabilities {
            WorkerCapabilities::new("w1", self.tenant_id)
        }

        async fn trigger(&self, input: Value) -> WorkflowRun {
            let event = TriggerEvent::new("user:create", self.tenant_id, input);
            let mut runs = self.engine.handle_event(&event).await.unwrap();
            assert_eq!(runs.len(), 1);
            runs.remove(0)
        }
    }

    fn step_status(run: &WorkflowRun, step_id: &str) -> StepRunState {
        run.step_run(step_id).unwrap().status
    }

    #[tokio::test]
    async fn test_children_enqueued_after_parent_succeeds() {
        let h = Harness::new();
        h.register(vec![
            StepDefinition::new("a"),
            StepDefinition::new("b").with_parents(["a"]),
        ]);

        let run = h.trigger(json!({"user_id": "u1"})).await;
        assert_eq!(step_status(&run, "a"), StepRunState::Queued);
        assert_eq!(step_status(&run, "b"), StepRunState::Pending);
        assert_eq!(h.repo.queue_items().len(), 1);

        let a = h.engine.claim_step_run(&h.worker()).await.unwrap().unwrap();
        assert_eq!(a.step_id, "a");
        assert!(h.engine.claim_step_run(&h.worker()).await.unwrap().is_none());

        let run = h.engine.complete_step_run(a.step_run_uuid, json!({"ok": 1})).await.unwrap();
        assert_eq!(step_status(&run, "a"), StepRunState::Succeeded);
        assert_eq!(step_status(&run, "b"), StepRunState::Queued);

        let b = h.engine.claim_step_run(&h.worker()).await.unwrap().unwrap();
        assert_eq!(b.step_id, "b");
        let run = h.engine.complete_step_run(b.step_run_uuid, json!({})).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unresolvable_key_fails_step_and_run() {
        let h = Harness::new();
        h.register(vec![
            StepDefinition::new("a").with_concurrency("input.user_id", 1),
            StepDefinition::new("b"),
        ]);

        let run = h.trigger(json!({"other": "x"})).await;
        assert_eq!(run.status, WorkflowRunStatus::Failed);
        assert_eq!(step_status(&run, "a"), StepRunState::Failed);
        assert!(run.step_run("a").unwrap().error.as_deref().unwrap().contains("input.user_id"));
        assert!(step_status(&run, "b").is_terminal());
        // nothing claimable is left behind
        assert!(h.engine.claim_step_run(&h.worker()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_failure_cancels_siblings_in_queue() {
        let h = Harness::new();
        h.register(vec![StepDefinition::new("a"), StepDefinition::new("b")]);
        h.trigger(json!({})).await;

        let first = h.engine.claim_step_run(&h.worker()).await.unwrap().unwrap();
        let run = h.engine.fail_step_run(first.step_run_uuid, "boom").await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Failed);

        let sibling = if first.step_id == "a" { "b" } else { "a" };
        assert_eq!(step_status(&run, sibling), StepRunState::Cancelled);
        let sibling_uuid = run.step_run(sibling).unwrap().step_run_uuid;
        let item = h.engine.queue().get(sibling_uuid).await.unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_releases_slot_and_late_completion_is_recorded() {
        let h = Harness::new();
        h.register(vec![StepDefinition::new("a").with_concurrency("input.user_id", 1)]);
        let run = h.trigger(json!({"user_id": "u1"})).await;

        let a = h.engine.claim_step_run(&h.worker()).await.unwrap().unwrap();
        assert_eq!(h.repo.in_flight(h.tenant_id, "u1").await.unwrap(), 1);

        let cancelled = h.engine.cancel_workflow_run(run.workflow_run_uuid).await.unwrap();
        assert_eq!(cancelled.status, WorkflowRunStatus::Cancelled);
        assert_eq!(h.repo.in_flight(h.tenant_id, "u1").await.unwrap(), 0);

        let run = h
            .engine
            .complete_step_run(a.step_run_uuid, json!({"late": true}))
            .await
            .unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Cancelled);
        let step = run.step_run("a").unwrap();
        assert_eq!(step.status, StepRunState::Cancelled);
        assert_eq!(step.output, Some(json!({"late": true})));
    }

    #[tokio::test]
    async fn test_late_failure_is_recorded_like_late_completion() {
        let h = Harness::new();
        h.register(vec![StepDefinition::new("a").with_concurrency("input.user_id", 1)]);
        let run = h.trigger(json!({"user_id": "u1"})).await;
        let a = h.engine.claim_step_run(&h.worker()).await.unwrap().unwrap();
        h.engine.cancel_workflow_run(run.workflow_run_uuid).await.unwrap();

        let run = h.engine.fail_step_run(a.step_run_uuid, "boom").await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Cancelled);
        assert!(run.error.is_none());
        let step = run.step_run("a").unwrap();
        assert_eq!(step.status, StepRunState::Cancelled);
        assert_eq!(step.error.as_deref(), Some("boom"));
        assert_eq!(h.repo.in_flight(h.tenant_id, "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_reaches_item_whose_start_was_recorded_before_queued() {
        let h = Harness::new();
        let definition = h.register(vec![StepDefinition::new("a")]);
        let run = WorkflowRun::instantiate(&definition, json!({}), None, h.clock.now());
        h.repo.create_workflow_run(&run).await.unwrap();
        let step = run.step_run("a").unwrap().clone();

        h.engine
            .queue()
            .enqueue(NewQueueItem {
                step_run_uuid: step.step_run_uuid,
                workflow_run_uuid: run.workflow_run_uuid,
                tenant_id: h.tenant_id,
                step_id: "a".into(),
                concurrency_key: Some("u1".into()),
                concurrency_limit: Some(1),
                compute: ComputeClass::default(),
                execution_timeout_secs: 60,
            })
            .await
            .unwrap();
        h.engine.queue().claim(&h.worker()).await.unwrap().unwrap();
        h.repo
            .apply_update(
                run.workflow_run_uuid,
                WorkflowRunUpdate::StepStarted { step_id: "a".into() },
                h.clock.now(),
            )
            .await
            .unwrap();

        h.engine.cancel_workflow_run(run.workflow_run_uuid).await.unwrap();
        let item = h.engine.queue().get(step.step_run_uuid).await.unwrap().unwrap();
        assert_eq!(item.status, QueueItemStatus::Cancelled);
        assert_eq!(h.repo.in_flight(h.tenant_id, "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_steps_are_failed() {
        let h = Harness::new();
        h.register(vec![
            StepDefinition::new("slow").with_execution_timeout(Duration::from_secs(10))
        ]);
        let run = h.trigger(json!({})).await;
        h.engine.claim_step_run(&h.worker()).await.unwrap().unwrap();

        assert_eq!(h.engine.reap_timed_out_steps(h.tenant_id, h.clock.now()).await.unwrap(), 0);
        h.clock.advance(chrono::Duration::seconds(11));
        assert_eq!(h.engine.reap_timed_out_steps(h.tenant_id, h.clock.now()).await.unwrap(), 1);

        let run = h.engine.get_workflow_run(run.workflow_run_uuid).await.unwrap().unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Failed);
        assert_eq!(run.step_run("slow").unwrap().error.as_deref(), Some(TIMED_OUT));
    }

    #[tokio::test]
    async fn test_enqueue_runnable_steps_is_idempotent() {
        let h = Harness::new();
        h.register(vec![StepDefinition::new("a")]);
        let run = h.trigger(json!({})).await;

        let again = h.engine.enqueue_runnable_steps(run.workflow_run_uuid).await.unwrap();
        assert_eq!(step_status(&again, "a"), StepRunState::Queued);
        assert_eq!(h.repo.queue_items().len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_starts_nothing() {
        let h = Harness::new();
        h.register(vec![StepDefinition::new("a")]);
        let event = TriggerEvent::new("order:create", h.tenant_id, json!({}));
        assert!(h.engine.handle_event(&event).await.unwrap().is_empty());
        assert!(h.repo.queue_items().is_empty());
    }
}

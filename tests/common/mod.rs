//! Shared fixtures for the scenario tests: one in-memory repository wired into
//! a queue, engine and partition managers, all driven by a manual clock.

#![allow(dead_code)]

pub mod strategies;

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tasker_queue::config::QueueConfig;
use tasker_queue::models::{
    ComputeClass, NewQueueItem, QueueItem, StepDefinition, TriggerEvent, WorkerCapabilities,
    WorkflowDefinition, WorkflowRun,
};
use tasker_queue::orchestration::{
    ConcurrencyController, StepRunQueue, TenantPartitionManager, WorkflowEngine, WorkflowRegistry,
};
use tasker_queue::repository::InMemoryRepository;
use tasker_queue::utils::ManualClock;
use uuid::Uuid;

pub struct TestEnv {
    pub repo: InMemoryRepository,
    pub clock: ManualClock,
    pub queue: Arc<StepRunQueue>,
    pub engine: Arc<WorkflowEngine>,
    pub tenant_id: Uuid,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_queue_config(QueueConfig::default())
    }

    pub fn with_queue_config(config: QueueConfig) -> Self {
        let repo = InMemoryRepository::new();
        let clock = ManualClock::new(Utc::now());
        let queue = Arc::new(
            StepRunQueue::new(
                Arc::new(repo.clone()),
                ConcurrencyController::new(Arc::new(repo.clone())),
                Arc::new(clock.clone()),
            )
            .with_config(config)
            .with_retention_period(chrono::Duration::hours(24)),
        );
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(WorkflowRegistry::new()),
            queue.clone(),
            Arc::new(repo.clone()),
        ));
        Self {
            repo,
            clock,
            queue,
            engine,
            tenant_id: Uuid::new_v4(),
        }
    }

    pub fn partition(&self, partition_id: &str) -> TenantPartitionManager {
        TenantPartitionManager::new(
            partition_id,
            Arc::new(self.repo.clone()),
            Arc::new(self.clock.clone()),
        )
    }

    pub fn register(&self, name: &str, steps: Vec<StepDefinition>) -> Arc<WorkflowDefinition> {
        let definition = steps.into_iter().fold(
            WorkflowDefinition::new(self.tenant_id, name, "v1").on_event("user:create"),
            WorkflowDefinition::with_step,
        );
        self.engine
            .registry()
            .register(definition)
            .expect("definition should be valid")
    }

    pub async fn trigger(&self, input: Value) -> Vec<WorkflowRun> {
        self.engine
            .handle_event(&TriggerEvent::new("user:create", self.tenant_id, input))
            .await
            .expect("event should be handled")
    }

    pub fn worker(&self, worker_id: &str) -> WorkerCapabilities {
        WorkerCapabilities::new(worker_id, self.tenant_id)
    }

    /// Enqueue a bare item outside of any workflow run
    pub async fn enqueue_item(&self, tenant_id: Uuid, key: Option<(&str, u32)>) -> Uuid {
        let step_run_uuid = Uuid::new_v4();
        self.queue
            .enqueue(NewQueueItem {
                step_run_uuid,
                workflow_run_uuid: Uuid::new_v4(),
                tenant_id,
                step_id: "step".into(),
                concurrency_key: key.map(|(k, _)| k.to_string()),
                concurrency_limit: key.map(|(_, limit)| limit),
                compute: ComputeClass::default(),
                execution_timeout_secs: 60,
            })
            .await
            .expect("enqueue should succeed");
        step_run_uuid
    }

    /// Enqueue, claim and complete an item so that it finishes at the current clock time
    pub async fn finished_item(&self, tenant_id: Uuid) -> QueueItem {
        let step_run_uuid = self.enqueue_item(tenant_id, None).await;
        self.queue
            .claim(&WorkerCapabilities::new("finisher", tenant_id))
            .await
            .expect("claim should succeed")
            .expect("item should be claimable");
        self.queue
            .complete(step_run_uuid, json!({}))
            .await
            .expect("complete should succeed")
    }
}

//! # Workflow Runs
//!
//! A workflow run owns one [`StepRun`] per step of the definition it was created
//! from. All mutation goes through [`WorkflowRun::apply`], which repositories call
//! while holding an exclusive lock on the run, so the lifecycle rules below hold
//! regardless of which controller applies the update:
//!
//! - step states only move forward (`pending → queued → running → terminal`);
//! - a terminal step never changes state again, although a result (output or
//!   error) arriving after cancellation is still recorded on the step;
//! - a terminal run status never changes again.

use super::compute::ComputeClass;
use super::workflow_definition::WorkflowDefinition;
use crate::error::{TaskerError, TaskerResult};
use crate::state_machine::{StepRunState, WorkflowRunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub step_run_uuid: Uuid,
    pub workflow_run_uuid: Uuid,
    pub tenant_id: Uuid,
    pub step_id: String,
    pub status: StepRunState,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<u32>,
    /// Bound when the step is enqueued
    pub compute: Option<ComputeClass>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRun {
    fn new(workflow_run_uuid: Uuid, tenant_id: Uuid, step_id: &str) -> Self {
        Self {
            step_run_uuid: Uuid::new_v4(),
            workflow_run_uuid,
            tenant_id,
            step_id: step_id.to_string(),
            status: StepRunState::Pending,
            concurrency_key: None,
            concurrency_limit: None,
            compute: None,
            output: None,
            error: None,
            queued_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves the step forward to `target`. Returns false when the step is already
    /// terminal or at/after `target`.
    fn advance(&mut self, target: StepRunState, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || target.rank() <= self.status.rank() {
            return false;
        }
        self.status = target;
        match target {
            StepRunState::Queued => self.queued_at = Some(now),
            StepRunState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        true
    }
}

/// Updates applied atomically to a stored workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowRunUpdate {
    StepQueued {
        step_id: String,
        concurrency_key: Option<String>,
        concurrency_limit: Option<u32>,
        compute: ComputeClass,
    },
    StepStarted {
        step_id: String,
    },
    StepSucceeded {
        step_id: String,
        output: Value,
    },
    /// Fails the step and the run; every other unfinished step is cancelled
    StepFailed {
        step_id: String,
        error: String,
    },
    StepCancelled {
        step_id: String,
    },
    /// Cancels the run and every unfinished step
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_run_uuid: Uuid,
    pub tenant_id: Uuid,
    pub workflow_definition_id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    pub additional_metadata: Value,
    pub status: WorkflowRunStatus,
    pub error: Option<String>,
    /// Keyed by step id
    pub step_runs: BTreeMap<String, StepRun>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// New run with every step pending
    pub fn instantiate(
        definition: &WorkflowDefinition,
        input: Value,
        additional_metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Self {
        let workflow_run_uuid = Uuid::new_v4();
        let step_runs = definition
            .steps
            .iter()
            .map(|step| {
                (
                    step.id.clone(),
                    StepRun::new(workflow_run_uuid, definition.tenant_id, &step.id),
                )
            })
            .collect();

        Self {
            workflow_run_uuid,
            tenant_id: definition.tenant_id,
            workflow_definition_id: definition.id,
            workflow_name: definition.name.clone(),
            input,
            additional_metadata: additional_metadata.unwrap_or_else(|| json!({})),
            status: WorkflowRunStatus::Running,
            error: None,
            step_runs,
            created_at: now,
            finished_at: None,
        }
    }

    pub fn step_run(&self, step_id: &str) -> Option<&StepRun> {
        self.step_runs.get(step_id)
    }

    pub fn step_run_by_uuid(&self, step_run_uuid: Uuid) -> Option<&StepRun> {
        self.step_runs
            .values()
            .find(|s| s.step_run_uuid == step_run_uuid)
    }

    /// The document concurrency expressions are evaluated against
    pub fn trigger_context(&self) -> Value {
        json!({
            "input": self.input,
            "additional_metadata": self.additional_metadata,
        })
    }

    /// Cancelled steps that reached the queue; their queue items may still need
    /// cancelling (which is idempotent). A claim can be recorded before the
    /// enqueue bookkeeping, so a start alone also counts.
    pub fn cancelled_enqueued_steps(&self) -> impl Iterator<Item = &StepRun> {
        self.step_runs.values().filter(|s| {
            s.status == StepRunState::Cancelled && (s.queued_at.is_some() || s.started_at.is_some())
        })
    }

    fn step_mut(&mut self, step_id: &str) -> TaskerResult<&mut StepRun> {
        let run_uuid = self.workflow_run_uuid;
        self.step_runs.get_mut(step_id).ok_or_else(|| {
            TaskerError::NotFound(format!("step '{step_id}' in workflow run {run_uuid}"))
        })
    }

    pub fn apply(&mut self, update: WorkflowRunUpdate, now: DateTime<Utc>) -> TaskerResult<()> {
        match update {
            WorkflowRunUpdate::StepQueued {
                step_id,
                concurrency_key,
                concurrency_limit,
                compute,
            } => {
                let step = self.step_mut(&step_id)?;
                if step.advance(StepRunState::Queued, now) {
                    step.concurrency_key = concurrency_key;
                    step.concurrency_limit = concurrency_limit;
                    step.compute = Some(compute);
                }
            }
            WorkflowRunUpdate::StepStarted { step_id } => {
                self.step_mut(&step_id)?.advance(StepRunState::Running, now);
            }
            WorkflowRunUpdate::StepSucceeded { step_id, output } => {
                let step = self.step_mut(&step_id)?;
                if step.advance(StepRunState::Succeeded, now) {
                    step.output = Some(output);
                } else if step.status == StepRunState::Cancelled && step.output.is_none() {
                    // finished after cancellation: keep the result, not the status
                    step.output = Some(output);
                }
            }
            WorkflowRunUpdate::StepFailed { step_id, error } => {
                let step = self.step_mut(&step_id)?;
                if step.advance(StepRunState::Failed, now) {
                    step.error = Some(error.clone());
                    self.finish(
                        WorkflowRunStatus::Failed,
                        Some(format!("step '{step_id}' failed: {error}")),
                        now,
                    );
                } else if step.status == StepRunState::Cancelled && step.error.is_none() {
                    step.error = Some(error);
                }
            }
            WorkflowRunUpdate::StepCancelled { step_id } => {
                if self.step_mut(&step_id)?.advance(StepRunState::Cancelled, now) {
                    self.finish(WorkflowRunStatus::Cancelled, None, now);
                }
            }
            WorkflowRunUpdate::Cancel => {
                self.finish(WorkflowRunStatus::Cancelled, None, now);
            }
        }

        if self.status == WorkflowRunStatus::Running
            && self
                .step_runs
                .values()
                .all(|s| s.status == StepRunState::Succeeded)
        {
            self.status = WorkflowRunStatus::Succeeded;
            self.finished_at = Some(now);
        }

        Ok(())
    }

    /// Moves a running workflow to a terminal status and cancels every step that
    /// has not finished. No-op once the run is terminal.
    fn finish(&mut self, status: WorkflowRunStatus, error: Option<String>, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        for step in self.step_runs.values_mut() {
            step.advance(StepRunState::Cancelled, now);
        }
    }
}

use super::compute::ComputeClass;
use super::workflow_run::StepRun;
use crate::state_machine::QueueItemStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Pollable projection of a step run, from enqueue until retention deletes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub step_run_uuid: Uuid,
    pub workflow_run_uuid: Uuid,
    pub tenant_id: Uuid,
    pub step_id: String,
    pub status: QueueItemStatus,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<u32>,
    pub compute: ComputeClass,
    pub execution_timeout_secs: u64,
    pub claimed_by: Option<String>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Key and limit, when the item is concurrency limited
    pub fn concurrency(&self) -> Option<(&str, u32)> {
        match (&self.concurrency_key, self.concurrency_limit) {
            (Some(key), Some(limit)) => Some((key.as_str(), limit)),
            _ => None,
        }
    }

    /// Terminal and finished strictly before `cutoff`
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.finished_at.is_some_and(|f| f < cutoff)
    }

    /// Running for longer than its execution timeout
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        let timeout = Duration::seconds(self.execution_timeout_secs as i64);
        self.status == QueueItemStatus::Running
            && self.started_at.is_some_and(|s| s + timeout < now)
    }
}

/// Data needed to enqueue a step run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub step_run_uuid: Uuid,
    pub workflow_run_uuid: Uuid,
    pub tenant_id: Uuid,
    pub step_id: String,
    pub concurrency_key: Option<String>,
    pub concurrency_limit: Option<u32>,
    pub compute: ComputeClass,
    pub execution_timeout_secs: u64,
}

impl NewQueueItem {
    pub fn for_step_run(
        step_run: &StepRun,
        concurrency: Option<(String, u32)>,
        compute: ComputeClass,
        execution_timeout_secs: u64,
    ) -> Self {
        let (concurrency_key, concurrency_limit) = match concurrency {
            Some((key, limit)) => (Some(key), Some(limit)),
            None => (None, None),
        };
        Self {
            step_run_uuid: step_run.step_run_uuid,
            workflow_run_uuid: step_run.workflow_run_uuid,
            tenant_id: step_run.tenant_id,
            step_id: step_run.step_id.clone(),
            concurrency_key,
            concurrency_limit,
            compute,
            execution_timeout_secs,
        }
    }

    pub fn into_queue_item(self, queued_at: DateTime<Utc>) -> QueueItem {
        QueueItem {
            step_run_uuid: self.step_run_uuid,
            workflow_run_uuid: self.workflow_run_uuid,
            tenant_id: self.tenant_id,
            step_id: self.step_id,
            status: QueueItemStatus::Queued,
            concurrency_key: self.concurrency_key,
            concurrency_limit: self.concurrency_limit,
            compute: self.compute,
            execution_timeout_secs: self.execution_timeout_secs,
            claimed_by: None,
            output: None,
            error: None,
            queued_at,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Result of an enqueue call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// An item with this step run id already exists; nothing was written
    AlreadyEnqueued,
}

/// Result of a claim attempt on one item
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The item is now running and holds a slot of its concurrency key
    Claimed(QueueItem),
    /// The item's concurrency key is at its limit; nothing was written
    Saturated,
    /// The item is no longer queued; another claimer or a cancel got there first
    Lost,
}

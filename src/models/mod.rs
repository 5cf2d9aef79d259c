//! # Models
//!
//! Plain data for workflow definitions, runs, queue items, compute classes and
//! tenant partitions. Nothing here performs I/O.

pub mod compute;
pub mod queue_item;
pub mod tenant_partition;
pub mod trigger_event;
pub mod workflow_definition;
pub mod workflow_run;

pub use compute::{is_compatible, ComputeClass, CpuKind, Regions, WorkerCapabilities};
pub use queue_item::{ClaimOutcome, EnqueueOutcome, NewQueueItem, QueueItem};
pub use tenant_partition::{ControllerPartition, TenantPartition};
pub use trigger_event::TriggerEvent;
pub use workflow_definition::{ConcurrencySpec, StepDefinition, WorkflowDefinition};
pub use workflow_run::{StepRun, WorkflowRun, WorkflowRunUpdate};

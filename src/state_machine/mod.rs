// State machine module for step-run queue items
//
// Pure transition logic shared by the in-memory and PostgreSQL repositories.

pub mod events;
pub mod queue_item_state_machine;
pub mod states;

pub use events::QueueItemEvent;
pub use queue_item_state_machine::{determine_target_state, required_states};
pub use states::{QueueItemStatus, StepRunState, WorkflowRunStatus};

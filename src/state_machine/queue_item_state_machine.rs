//! Transition table for queue items.
//!
//! ```text
//! queued  --claim-->    running
//! running --complete--> succeeded
//! running --fail-->     failed
//! queued  --cancel-->   cancelled
//! running --cancel-->   cancelled
//! ```
//!
//! Terminal states accept no events; they are left only by retention deleting
//! the row. Repositories use [`determine_target_state`] to decide whether a
//! transition is legal and then apply it as a single compare-and-swap on the
//! stored status.

use super::{QueueItemEvent, QueueItemStatus};
use crate::error::{TaskerError, TaskerResult};
use uuid::Uuid;

pub fn determine_target_state(
    step_run_uuid: Uuid,
    current: QueueItemStatus,
    event: &QueueItemEvent,
) -> TaskerResult<QueueItemStatus> {
    let target = match (current, event) {
        (QueueItemStatus::Queued, QueueItemEvent::Claim) => QueueItemStatus::Running,
        (QueueItemStatus::Running, QueueItemEvent::Complete(_)) => QueueItemStatus::Succeeded,
        (QueueItemStatus::Running, QueueItemEvent::Fail(_)) => QueueItemStatus::Failed,
        (QueueItemStatus::Queued | QueueItemStatus::Running, QueueItemEvent::Cancel) => {
            QueueItemStatus::Cancelled
        }
        (from, _) => {
            return Err(TaskerError::InvalidTransition {
                step_run_uuid,
                from,
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}

/// The status an item must currently hold for `event` to apply. Used as the
/// expected value of the compare-and-swap.
pub fn required_states(event: &QueueItemEvent) -> &'static [QueueItemStatus] {
    match event {
        QueueItemEvent::Claim => &[QueueItemStatus::Queued],
        QueueItemEvent::Complete(_) | QueueItemEvent::Fail(_) => &[QueueItemStatus::Running],
        QueueItemEvent::Cancel => &[QueueItemStatus::Queued, QueueItemStatus::Running],
    }
}

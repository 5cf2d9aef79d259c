use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a persisted queue item.
///
/// Queue items exist only once a step run has been enqueued, so there is no
/// pending state here; see [`StepRunState`] for the full step run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting for a worker to claim it
    Queued,
    /// Claimed by exactly one worker
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueueItemStatus {
    /// Terminal items are only ever removed by retention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const TERMINAL: [QueueItemStatus; 3] = [Self::Succeeded, Self::Failed, Self::Cancelled];
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid queue item status: {s}")),
        }
    }
}

/// Logical state of a step run inside its workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepRunState {
    /// Not yet runnable or not yet enqueued
    #[default]
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepRunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Only a successful parent unblocks its children.
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Position in the forward-only lifecycle. Updates that would move a step
    /// backwards (e.g. a late "queued" after "running") are ignored.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed | Self::Cancelled => 3,
        }
    }
}

impl From<QueueItemStatus> for StepRunState {
    fn from(status: QueueItemStatus) -> Self {
        match status {
            QueueItemStatus::Queued => Self::Queued,
            QueueItemStatus::Running => Self::Running,
            QueueItemStatus::Succeeded => Self::Succeeded,
            QueueItemStatus::Failed => Self::Failed,
            QueueItemStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl fmt::Display for StepRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Overall status of a workflow run. Terminal statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    #[default]
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow run status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_item_terminal_check() {
        assert!(QueueItemStatus::Succeeded.is_terminal());
        assert!(QueueItemStatus::Failed.is_terminal());
        assert!(QueueItemStatus::Cancelled.is_terminal());
        assert!(!QueueItemStatus::Queued.is_terminal());
        assert!(!QueueItemStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_state_dependency_satisfaction() {
        assert!(StepRunState::Succeeded.satisfies_dependencies());
        assert!(!StepRunState::Pending.satisfies_dependencies());
        assert!(!StepRunState::Running.satisfies_dependencies());
        assert!(!StepRunState::Failed.satisfies_dependencies());
        assert!(!StepRunState::Cancelled.satisfies_dependencies());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(QueueItemStatus::Running.to_string(), "running");
        assert_eq!(
            "cancelled".parse::<QueueItemStatus>().unwrap(),
            QueueItemStatus::Cancelled
        );
        assert!("pending".parse::<QueueItemStatus>().is_err());
        assert_eq!(
            "failed".parse::<WorkflowRunStatus>().unwrap(),
            WorkflowRunStatus::Failed
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&StepRunState::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        let parsed: QueueItemStatus = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(parsed, QueueItemStatus::Queued);
    }
}

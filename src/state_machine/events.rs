use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events that move a queue item through its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QueueItemEvent {
    /// A worker claimed the item
    Claim,
    /// The worker reported success with an output payload
    Complete(Value),
    /// The worker reported failure with an error payload
    Fail(String),
    Cancel,
}

impl QueueItemEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Complete(_) => "complete",
            Self::Fail(_) => "fail",
            Self::Cancel => "cancel",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::Complete(output) => Some(output),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An inbound event pushed by a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub event_name: String,
    pub tenant_id: Uuid,
    pub payload: Value,
    #[serde(default)]
    pub additional_metadata: Option<Value>,
}

impl TriggerEvent {
    pub fn new(event_name: impl Into<String>, tenant_id: Uuid, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            tenant_id,
            payload,
            additional_metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.additional_metadata = Some(metadata);
        self
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Assignment of a tenant to a controller partition. Unassigned tenants are
/// visible to every partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPartition {
    pub tenant_id: Uuid,
    pub partition_id: Option<String>,
}

/// A controller replica and its last liveness signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerPartition {
    pub id: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl ControllerPartition {
    /// Eligible for reassignment once the heartbeat is older than `window`
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.last_heartbeat > window
    }
}

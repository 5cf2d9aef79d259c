//! # Compute Classes
//!
//! Declarative resource requirements attached to a step, and the capabilities a
//! worker declares when it polls for work. Matching between the two is a pure
//! predicate ([`is_compatible`]) so it can be evaluated without touching storage.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Smallest memory tier a step can request, in MB
pub const SMALLEST_MEMORY_TIER_MB: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CpuKind {
    #[default]
    Shared,
    Performance,
}

impl CpuKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Performance => "performance",
        }
    }
}

impl fmt::Display for CpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CpuKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "performance" => Ok(Self::Performance),
            _ => Err(format!("Invalid cpu kind: {s}")),
        }
    }
}

/// Regions a step may be scheduled in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "regions")]
pub enum Regions {
    /// Every region; used by the default compute class
    #[default]
    Any,
    Only(BTreeSet<String>),
}

impl Regions {
    pub fn only<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(regions.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, region: Option<&str>) -> bool {
        match (self, region) {
            (Self::Any, _) => true,
            (Self::Only(allowed), Some(region)) => allowed.contains(region),
            (Self::Only(_), None) => false,
        }
    }

    /// Explicit region list, `None` meaning any region
    pub fn as_list(&self) -> Option<Vec<String>> {
        match self {
            Self::Any => None,
            Self::Only(allowed) => Some(allowed.iter().cloned().collect()),
        }
    }
}

/// Resource class a step run is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeClass {
    /// Worker pool name; `None` is the default pool
    pub pool: Option<String>,
    pub num_replicas: u32,
    pub cpus: u32,
    pub memory_mb: u32,
    pub cpu_kind: CpuKind,
    pub regions: Regions,
}

impl Default for ComputeClass {
    fn default() -> Self {
        Self {
            pool: None,
            num_replicas: 1,
            cpus: 1,
            memory_mb: SMALLEST_MEMORY_TIER_MB,
            cpu_kind: CpuKind::Shared,
            regions: Regions::Any,
        }
    }
}

impl ComputeClass {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidComputeClass {
            reason: reason.to_string(),
        };

        if self.num_replicas < 1 {
            return Err(invalid("num_replicas must be at least 1"));
        }
        if self.cpus < 1 {
            return Err(invalid("cpus must be at least 1"));
        }
        if self.memory_mb < 1 {
            return Err(invalid("memory_mb must be at least 1"));
        }
        if matches!(&self.regions, Regions::Only(r) if r.is_empty()) {
            return Err(invalid("regions must not be empty"));
        }
        if matches!(&self.pool, Some(p) if p.trim().is_empty()) {
            return Err(invalid("pool name must not be blank"));
        }

        Ok(())
    }
}

/// What a polling worker can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub worker_id: String,
    pub tenant_id: Uuid,
    /// Pool the worker serves; `None` is the default pool
    pub pool: Option<String>,
    pub region: Option<String>,
    pub cpu_kind: CpuKind,
    /// Number of step runs the worker executes concurrently
    pub slots: u32,
}

impl WorkerCapabilities {
    pub fn new(worker_id: impl Into<String>, tenant_id: Uuid) -> Self {
        Self {
            worker_id: worker_id.into(),
            tenant_id,
            pool: None,
            region: None,
            cpu_kind: CpuKind::Shared,
            slots: 1,
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_cpu_kind(mut self, cpu_kind: CpuKind) -> Self {
        self.cpu_kind = cpu_kind;
        self
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots.max(1);
        self
    }
}

/// Whether a worker with `capabilities` may run a step bound to `class`.
pub fn is_compatible(class: &ComputeClass, capabilities: &WorkerCapabilities) -> bool {
    class.pool == capabilities.pool
        && class.cpu_kind == capabilities.cpu_kind
        && class.regions.allows(capabilities.region.as_deref())
}

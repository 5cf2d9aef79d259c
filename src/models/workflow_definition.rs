use super::compute::ComputeClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Default time a running step may take before it is failed with `TIMED_OUT`
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Concurrency limit for a step: at most `max_runs` step runs whose
/// `expression` resolves to the same key may be running at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencySpec {
    /// e.g. `input.user_id`
    pub expression: String,
    pub max_runs: u32,
}

impl ConcurrencySpec {
    pub fn new(expression: impl Into<String>, max_runs: u32) -> Self {
        Self {
            expression: expression.into(),
            max_runs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the owning workflow definition
    pub id: String,
    #[serde(default)]
    pub parents: BTreeSet<String>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencySpec>,
    #[serde(default)]
    pub compute: Option<ComputeClass>,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
}

fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT.as_secs()
}

impl StepDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parents: BTreeSet::new(),
            concurrency: None,
            compute: None,
            execution_timeout_secs: default_execution_timeout_secs(),
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents.extend(parents.into_iter().map(Into::into));
        self
    }

    pub fn with_concurrency(mut self, expression: impl Into<String>, max_runs: u32) -> Self {
        self.concurrency = Some(ConcurrencySpec::new(expression, max_runs));
        self
    }

    pub fn with_compute(mut self, compute: ComputeClass) -> Self {
        self.compute = Some(compute);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_secs = timeout.as_secs();
        self
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

/// An immutable, versioned workflow. Publishing a change means registering a
/// new definition with a new id; runs already in flight keep their version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Event names that trigger a run, e.g. `user:create`
    #[serde(default)]
    pub on_events: Vec<String>,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(tenant_id: Uuid, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.into(),
            version: version.into(),
            description: None,
            on_events: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn on_event(mut self, event_name: impl Into<String>) -> Self {
        self.on_events.push(event_name.into());
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_triggered_by(&self, event_name: &str) -> bool {
        self.on_events.iter().any(|e| e == event_name)
    }
}

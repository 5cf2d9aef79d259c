//! # Compute Binder
//!
//! Decides which compute class a step run is queued with. Steps without an
//! explicit class get the default: one shared CPU in the smallest memory tier,
//! any region, default pool.

use crate::models::{is_compatible, ComputeClass, StepDefinition, WorkerCapabilities};

#[derive(Debug, Clone, Default)]
pub struct ComputeBinder {
    default_class: ComputeClass,
}

impl ComputeBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the class used for steps that do not declare one
    pub fn with_default_class(default_class: ComputeClass) -> Self {
        Self { default_class }
    }

    pub fn bind(&self, step: &StepDefinition) -> ComputeClass {
        step.compute
            .clone()
            .unwrap_or_else(|| self.default_class.clone())
    }

    pub fn default_class(&self) -> &ComputeClass {
        &self.default_class
    }

    pub fn is_compatible(class: &ComputeClass, capabilities: &WorkerCapabilities) -> bool {
        is_compatible(class, capabilities)
    }
}

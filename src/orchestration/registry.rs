//! # Workflow Registry
//!
//! In-process registry of validated workflow definitions.
//!
//! Definitions are immutable once registered and shared as `Arc`s, so runs that
//! are already in flight keep resolving the exact version they were created
//! from. Registering a new definition under an existing `(tenant, name)` makes
//! it the active version for new triggers.
//!
//! ## Usage
//!
//! ```rust
//! use tasker_queue::models::{StepDefinition, WorkflowDefinition};
//! use tasker_queue::orchestration::WorkflowRegistry;
//! use uuid::Uuid;
//!
//! let registry = WorkflowRegistry::new();
//! let tenant_id = Uuid::new_v4();
//! let definition = WorkflowDefinition::new(tenant_id, "onboarding", "v1")
//!     .on_event("user:create")
//!     .with_step(StepDefinition::new("send-email"));
//!
//! registry.register(definition).unwrap();
//! assert_eq!(registry.definitions_for_event(tenant_id, "user:create").len(), 1);
//! ```

use crate::error::ValidationError;
use crate::models::WorkflowDefinition;
use crate::orchestration::dag;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Lookup key for the active version of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DefinitionKey {
    pub tenant_id: Uuid,
    pub name: String,
}

impl DefinitionKey {
    pub fn new(tenant_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            tenant_id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DefinitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_definitions: usize,
    pub active_workflows: usize,
    pub tenants: usize,
}

#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: DashMap<Uuid, Arc<WorkflowDefinition>>,
    active: DashMap<DefinitionKey, Uuid>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition, making it the active version of its name
    pub fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, ValidationError> {
        dag::validate(&definition)?;

        let definition = Arc::new(definition);
        match self.definitions.entry(definition.id) {
            Entry::Occupied(_) => {
                return Err(ValidationError::DuplicateDefinition {
                    definition_id: definition.id,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(definition.clone());
            }
        }

        let key = DefinitionKey::new(definition.tenant_id, definition.name.clone());
        let previous = self.active.insert(key.clone(), definition.id);
        info!(
            key = %key,
            version = %definition.version,
            definition_id = %definition.id,
            replaced = previous.is_some(),
            "📋 Workflow definition registered"
        );
        Ok(definition)
    }

    pub fn get(&self, definition_id: Uuid) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .get(&definition_id)
            .map(|entry| entry.value().clone())
    }

    pub fn active_definition(&self, tenant_id: Uuid, name: &str) -> Option<Arc<WorkflowDefinition>> {
        let id = *self.active.get(&DefinitionKey::new(tenant_id, name))?;
        self.get(id)
    }

    /// Active definitions of the tenant triggered by `event_name`, by name
    pub fn definitions_for_event(
        &self,
        tenant_id: Uuid,
        event_name: &str,
    ) -> Vec<Arc<WorkflowDefinition>> {
        let ids: Vec<Uuid> = self
            .active
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .map(|entry| *entry.value())
            .collect();

        let mut matching: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.get(id))
            .filter(|definition| definition.is_triggered_by(event_name))
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        matching
    }

    pub fn stats(&self) -> RegistryStats {
        let mut tenants: Vec<Uuid> = self.active.iter().map(|e| e.key().tenant_id).collect();
        tenants.sort();
        tenants.dedup();
        RegistryStats {
            total_definitions: self.definitions.len(),
            active_workflows: self.active.len(),
            tenants: tenants.len(),
        }
    }
}

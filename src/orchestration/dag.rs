//! # DAG Model
//!
//! Validation and readiness for the step graph of a workflow definition. Pure
//! functions; nothing here touches storage.

use crate::error::ValidationError;
use crate::models::{StepRun, WorkflowDefinition, WorkflowRun};
use crate::orchestration::expression::ConcurrencyExpression;
use crate::state_machine::StepRunState;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Parent/child adjacency of a validated definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagGraph {
    parents: BTreeMap<String, BTreeSet<String>>,
    children: BTreeMap<String, BTreeSet<String>>,
    topological_order: Vec<String>,
}

impl DagGraph {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        if definition.steps.is_empty() {
            return Err(ValidationError::EmptyWorkflow {
                workflow: definition.name.clone(),
            });
        }

        let mut parents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for step in &definition.steps {
            if step.id.trim().is_empty() {
                return Err(ValidationError::EmptyStepId);
            }
            if parents.insert(step.id.clone(), step.parents.clone()).is_some() {
                return Err(ValidationError::DuplicateStep {
                    step_id: step.id.clone(),
                });
            }
        }

        let mut children: BTreeMap<String, BTreeSet<String>> = parents
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (step_id, step_parents) in &parents {
            for parent_id in step_parents {
                match children.get_mut(parent_id) {
                    Some(set) => {
                        set.insert(step_id.clone());
                    }
                    None => {
                        return Err(ValidationError::UnknownParent {
                            step_id: step_id.clone(),
                            parent_id: parent_id.clone(),
                        })
                    }
                }
            }
        }

        let topological_order = topological_sort(&parents, &children)?;
        debug!(
            workflow = %definition.name,
            order = ?topological_order,
            "Workflow DAG validated"
        );

        Ok(Self {
            parents,
            children,
            topological_order,
        })
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    pub fn parents(&self, step_id: &str) -> Option<&BTreeSet<String>> {
        self.parents.get(step_id)
    }

    pub fn children(&self, step_id: &str) -> Option<&BTreeSet<String>> {
        self.children.get(step_id)
    }

    pub fn root_steps(&self) -> impl Iterator<Item = &str> {
        self.parents
            .iter()
            .filter(|(_, p)| p.is_empty())
            .map(|(id, _)| id.as_str())
    }
}

/// Kahn's algorithm; steps left with unmet in-degree form (or hang off) a cycle
fn topological_sort(
    parents: &BTreeMap<String, BTreeSet<String>>,
    children: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, ValidationError> {
    let mut in_degree: BTreeMap<&str, usize> = parents
        .iter()
        .map(|(id, p)| (id.as_str(), p.len()))
        .collect();

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(parents.len());
    while let Some(step_id) = ready.pop_front() {
        order.push(step_id.to_string());
        for child in children.get(step_id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child.as_str());
                }
            }
        }
    }

    if order.len() != parents.len() {
        let steps = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(ValidationError::Cycle { steps });
    }

    Ok(order)
}

/// Full definition check: graph shape, concurrency settings and compute
/// classes. Returns the steps in topological order.
pub fn validate(definition: &WorkflowDefinition) -> Result<Vec<String>, ValidationError> {
    let graph = DagGraph::build(definition)?;

    for step in &definition.steps {
        if let Some(concurrency) = &step.concurrency {
            if concurrency.max_runs == 0 {
                return Err(ValidationError::InvalidConcurrency {
                    step_id: step.id.clone(),
                    reason: "max_runs must be at least 1".to_string(),
                });
            }
            ConcurrencyExpression::parse(&concurrency.expression)?;
        }
        if let Some(compute) = &step.compute {
            compute.validate()?;
        }
    }

    Ok(graph.topological_order)
}

/// Pending step runs whose parents have all succeeded, in step id order.
/// A step with a failed or cancelled parent is never returned.
pub fn runnable_steps<'a>(
    definition: &WorkflowDefinition,
    run: &'a WorkflowRun,
) -> Vec<&'a StepRun> {
    definition
        .steps
        .iter()
        .filter(|step| {
            step.parents.iter().all(|parent| {
                run.step_run(parent)
                    .is_some_and(|p| p.status.satisfies_dependencies())
            })
        })
        .filter_map(|step| run.step_run(&step.id))
        .filter(|step_run| step_run.status == StepRunState::Pending)
        .fold(BTreeMap::new(), |mut sorted, step_run| {
            sorted.insert(step_run.step_id.as_str(), step_run);
            sorted
        })
        .into_values()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComputeClass, StepDefinition, WorkflowRunUpdate};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn definition(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        steps.into_iter().fold(
            WorkflowDefinition::new(Uuid::new_v4(), "wf", "v1"),
            WorkflowDefinition::with_step,
        )
    }

    #[test]
    fn test_diamond_topological_order() {
        let def = definition(vec![
            StepDefinition::new("d").with_parents(["b", "c"]),
            StepDefinition::new("b").with_parents(["a"]),
            StepDefinition::new("c").with_parents(["a"]),
            StepDefinition::new("a"),
        ]);
        let order = validate(&def).unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);

        let graph = DagGraph::build(&def).unwrap();
        assert_eq!(graph.root_steps().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(graph.children("a").unwrap().len(), 2);
        assert!(graph.parents("d").unwrap().contains("c"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let def = definition(vec![
            StepDefinition::new("a").with_parents(["c"]),
            StepDefinition::new("b").with_parents(["a"]),
            StepDefinition::new("c").with_parents(["b"]),
            StepDefinition::new("root"),
        ]);
        match validate(&def) {
            Err(ValidationError::Cycle { steps }) => assert_eq!(steps, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = definition(vec![StepDefinition::new("a").with_parents(["a"])]);
        assert!(matches!(validate(&def), Err(ValidationError::Cycle { .. })));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            validate(&definition(vec![])),
            Err(ValidationError::EmptyWorkflow { .. })
        ));
        assert!(matches!(
            validate(&definition(vec![StepDefinition::new("  ")])),
            Err(ValidationError::EmptyStepId)
        ));
        assert!(matches!(
            validate(&definition(vec![StepDefinition::new("a"), StepDefinition::new("a")])),
            Err(ValidationError::DuplicateStep { step_id }) if step_id == "a"
        ));
        assert!(matches!(
            validate(&definition(vec![StepDefinition::new("b").with_parents(["a"])])),
            Err(ValidationError::UnknownParent { parent_id, .. }) if parent_id == "a"
        ));
    }

    #[test]
    fn test_step_configuration_errors() {
        let zero_limit = definition(vec![StepDefinition::new("a").with_concurrency("input.id", 0)]);
        assert!(matches!(
            validate(&zero_limit),
            Err(ValidationError::InvalidConcurrency { .. })
        ));

        let bad_expression =
            definition(vec![StepDefinition::new("a").with_concurrency("input.", 1)]);
        assert!(matches!(
            validate(&bad_expression),
            Err(ValidationError::ExpressionEval { .. })
        ));

        let bad_compute = definition(vec![StepDefinition::new("a").with_compute(ComputeClass {
            cpus: 0,
            ..ComputeClass::default()
        })]);
        assert!(matches!(
            validate(&bad_compute),
            Err(ValidationError::InvalidComputeClass { .. })
        ));
    }

    #[test]
    fn test_runnable_steps_follow_parent_success() {
        let def = definition(vec![
            StepDefinition::new("b").with_parents(["a"]),
            StepDefinition::new("a"),
            StepDefinition::new("c"),
        ]);
        let now = Utc::now();
        let mut run = WorkflowRun::instantiate(&def, json!({}), None, now);

        let ids = |run: &WorkflowRun| {
            runnable_steps(&def, run)
                .into_iter()
                .map(|s| s.step_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&run), vec!["a", "c"]);

        for update in [
            WorkflowRunUpdate::StepQueued {
                step_id: "a".into(),
                concurrency_key: None,
                concurrency_limit: None,
                compute: ComputeClass::default(),
            },
            WorkflowRunUpdate::StepStarted { step_id: "a".into() },
        ] {
            run.apply(update, now).unwrap();
        }
        assert_eq!(ids(&run), vec!["c"]);

        run.apply(
            WorkflowRunUpdate::StepSucceeded {
                step_id: "a".into(),
                output: json!(1),
            },
            now,
        )
        .unwrap();
        assert_eq!(ids(&run), vec!["b", "c"]);
    }

    #[test]
    fn test_failed_parent_blocks_children() {
        let def = definition(vec![
            StepDefinition::new("a"),
            StepDefinition::new("b").with_parents(["a"]),
        ]);
        let now = Utc::now();
        let mut run = WorkflowRun::instantiate(&def, json!({}), None, now);
        run.apply(
            WorkflowRunUpdate::StepFailed {
                step_id: "a".into(),
                error: "boom".into(),
            },
            now,
        )
        .unwrap();
        assert!(runnable_steps(&def, &run).is_empty());
    }
}

use proptest::prelude::*;
use tasker_queue::models::{StepDefinition, WorkflowDefinition};
use uuid::Uuid;

pub fn step_id(index: usize) -> String {
    format!("step-{index:02}")
}

/// `matrix[child][parent]` adds an edge when `parent < child`, so the result is
/// acyclic. `back_edge = (a, b)` with `a < b` adds `a → b` and `b → a`.
pub fn definition_from_matrix(
    n: usize,
    matrix: &[Vec<bool>],
    back_edge: Option<(usize, usize)>,
) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new(Uuid::nil(), "generated", "v1").on_event("go");
    for child in 0..n {
        let mut parents: Vec<String> = (0..child)
            .filter(|&parent| matrix[child][parent])
            .map(step_id)
            .collect();
        if let Some((a, b)) = back_edge {
            if child == b {
                parents.push(step_id(a));
            }
            if child == a {
                parents.push(step_id(b));
            }
        }
        definition = definition.with_step(StepDefinition::new(step_id(child)).with_parents(parents));
    }
    definition
}

fn adjacency(n: usize) -> impl Strategy<Value = Vec<Vec<bool>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), n), n)
}

pub fn acyclic_definition_strategy() -> impl Strategy<Value = WorkflowDefinition> {
    (1usize..12).prop_flat_map(|n| {
        adjacency(n).prop_map(move |matrix| definition_from_matrix(n, &matrix, None))
    })
}

/// A generated DAG plus a two-step cycle; yields the definition and the cycle's step ids
pub fn cyclic_definition_strategy() -> impl Strategy<Value = (WorkflowDefinition, String, String)> {
    (2usize..12).prop_flat_map(|n| {
        (
            adjacency(n),
            (0..n - 1).prop_flat_map(move |a| (Just(a), (a + 1)..n)),
        )
            .prop_map(move |(matrix, (a, b))| {
                (
                    definition_from_matrix(n, &matrix, Some((a, b))),
                    step_id(a),
                    step_id(b),
                )
            })
    })
}

//! # Orchestration
//!
//! The queue engine built on top of the repository seams.
//!
//! ## Components
//!
//! - **DAG model** (`dag`): validation and runnable-step computation
//! - **ConcurrencyController**: concurrency keys and the shared in-flight counter
//! - **ComputeBinder**: default and declared compute classes
//! - **StepRunQueue**: enqueue, claim, complete, fail, cancel and cleanup
//! - **TenantPartitionManager**: partition heartbeats and tenant ownership
//! - **RetentionController**: budgeted, per-partition cleanup sweeps
//! - **WorkflowRegistry** / **WorkflowEngine**: definitions and run progression
//! - **TimeoutReaper**: fails running steps past their execution timeout
//! - **ClaimPoller**: worker-side polling loop
//!
//! Background loops (`spawn_*`) all follow one shape: a task that sleeps for
//! its interval, runs a single pass, and exits when its `watch` shutdown
//! channel flips to `true`.

pub mod claim_poller;
pub mod compute_binder;
pub mod concurrency;
pub mod dag;
pub mod expression;
pub mod partition_manager;
pub mod registry;
pub mod retention;
pub mod step_queue;
pub mod timeout_reaper;
pub mod workflow_engine;

pub use claim_poller::{spawn_claim_poller, ClaimPoller};
pub use compute_binder::ComputeBinder;
pub use concurrency::ConcurrencyController;
pub use dag::DagGraph;
pub use expression::ConcurrencyExpression;
pub use partition_manager::{spawn_partition_heartbeat, TenantPartitionManager};
pub use registry::{DefinitionKey, RegistryStats, WorkflowRegistry};
pub use retention::{spawn_retention_controller, RetentionController, SweepError, SweepResult};
pub use step_queue::{StepRunClaimer, StepRunQueue};
pub use timeout_reaper::{spawn_timeout_reaper, ReapResult, TimeoutReaper};
pub use workflow_engine::{WorkflowEngine, TIMED_OUT};

#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Queue Core
//!
//! Multi-tenant step-run queue for event-triggered workflow DAGs.
//!
//! ## Overview
//!
//! Tenants register workflow definitions (DAGs of steps). An inbound event
//! creates a workflow run; every step whose parents have succeeded becomes a
//! queue item that compatible workers claim. Claims are limited per
//! concurrency key, computed from the trigger input, across every controller
//! sharing the database. Terminal queue items are deleted by a budgeted
//! retention sweep that each controller runs for the tenants of its partition.
//!
//! ## Module Organization
//!
//! - [`models`] - Workflow definitions, runs, queue items, compute classes
//! - [`state_machine`] - Queue item transitions and step/run statuses
//! - [`repository`] - Persistence traits with in-memory and PostgreSQL backends
//! - [`orchestration`] - Queue, concurrency, partitions, retention, engine
//! - [`database`] - Connection pool and migrations
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//! - [`resilience`] - Retry with backoff
//! - [`logging`] - Tracing subscriber setup
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use tasker_queue::models::{StepDefinition, TriggerEvent, WorkerCapabilities, WorkflowDefinition};
//! use tasker_queue::orchestration::{ConcurrencyController, StepRunQueue, WorkflowEngine, WorkflowRegistry};
//! use tasker_queue::repository::InMemoryRepository;
//! use tasker_queue::utils::SystemClock;
//! use uuid::Uuid;
//!
//! # tokio_test::block_on(async {
//! let repo = InMemoryRepository::new();
//! let queue = Arc::new(StepRunQueue::new(
//!     Arc::new(repo.clone()),
//!     ConcurrencyController::new(Arc::new(repo.clone())),
//!     Arc::new(SystemClock),
//! ));
//! let engine = WorkflowEngine::new(Arc::new(WorkflowRegistry::new()), queue, Arc::new(repo));
//!
//! let tenant_id = Uuid::new_v4();
//! engine.registry().register(
//!     WorkflowDefinition::new(tenant_id, "onboarding", "v1")
//!         .on_event("user:create")
//!         .with_step(StepDefinition::new("welcome").with_concurrency("input.user_id", 1)),
//! ).unwrap();
//!
//! let event = TriggerEvent::new("user:create", tenant_id, json!({"user_id": "u-1"}));
//! engine.handle_event(&event).await.unwrap();
//!
//! let item = engine
//!     .claim_step_run(&WorkerCapabilities::new("worker-1", tenant_id))
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(item.concurrency_key.as_deref(), Some("u-1"));
//! # });
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod repository;
pub mod resilience;
pub mod state_machine;
pub mod utils;

pub use config::{ConfigManager, TaskerConfig};
pub use error::{TaskerError, TaskerResult, ValidationError};
pub use models::{
    ComputeClass, QueueItem, StepDefinition, TriggerEvent, WorkerCapabilities, WorkflowDefinition,
    WorkflowRun,
};
pub use orchestration::{
    RetentionController, StepRunQueue, TenantPartitionManager, TimeoutReaper, WorkflowEngine,
    WorkflowRegistry,
};
pub use state_machine::{QueueItemStatus, StepRunState, WorkflowRunStatus};

//! Core data model for the taskweave workflow orchestration engine.
//!
//! Defines the task and workflow definitions, execution statuses, retry
//! policy, the condition grammar, and the submission-time validation that
//! enforces the structural invariants (unique ids, acyclic dependencies,
//! known references, bounded priorities).
//!
//! # Main types
//!
//! - [`TaskDefinition`] / [`WorkflowDefinition`] — What to run.
//! - [`TaskStatus`] / [`TaskResult`] / [`WorkflowState`] — What happened.
//! - [`Condition`] — Parsed boolean gate for conditional execution.
//! - [`validate_workflow`] — Entry point producing a [`ValidatedWorkflow`].

/// Condition expression grammar and evaluation.
pub mod condition;
/// Shared error type and result alias.
pub mod error;
/// Task-level definitions, statuses, outputs, and results.
pub mod task;
/// Submission-time invariant checks and graph utilities.
pub mod validation;
/// Workflow-level definitions, state snapshots, and progress.
pub mod workflow;

pub use condition::Condition;
pub use error::{WeaveError, WeaveResult};
pub use task::{
    Capability, RetryPolicy, TaskDefinition, TaskError, TaskOutput, TaskResult, TaskStatus,
};
pub use validation::{
    detect_cycle, task_levels, topological_order, validate_workflow, ValidatedWorkflow,
};
pub use workflow::{
    ExecutionStrategy, SkipReason, StateEvent, WorkflowDefinition, WorkflowProgress,
    WorkflowState, WorkflowStatus,
};

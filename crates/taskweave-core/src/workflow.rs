use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::task::{TaskDefinition, TaskOutput, TaskResult, TaskStatus};

/// Execution strategy for workflow tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One task at a time in stable topological order.
    Sequential,
    /// All tasks concurrently; dependencies are rejected at validation.
    Parallel,
    /// Dependency-graph scheduling with bounded concurrency.
    Dag,
    /// DAG scheduling plus condition gates.
    Conditional,
    /// Let the recommender pick.
    Auto,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStrategy::Sequential => "sequential",
            ExecutionStrategy::Parallel => "parallel",
            ExecutionStrategy::Dag => "dag",
            ExecutionStrategy::Conditional => "conditional",
            ExecutionStrategy::Auto => "auto",
        };
        write!(f, "{s}")
    }
}

/// Why a task was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency failed or was cancelled.
    DependencyFailed,
    /// A dependency was itself skipped.
    DependencySkipped,
    /// The task's condition evaluated false.
    ConditionUnmet,
    /// The workflow stopped scheduling after an earlier failure.
    WorkflowHalted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DependencyFailed => "dependency_failed",
            SkipReason::DependencySkipped => "dependency_skipped",
            SkipReason::ConditionUnmet => "condition_unmet",
            SkipReason::WorkflowHalted => "workflow_halted",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Definition of a complete workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default = "default_strategy")]
    pub strategy: ExecutionStrategy,
    /// Default per-task timeout for tasks without their own.
    #[serde(default)]
    pub default_timeout_seconds: Option<f64>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_tasks: usize,
    /// Keep scheduling unrelated tasks after a failure.
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_strategy() -> ExecutionStrategy {
    ExecutionStrategy::Dag
}

fn default_max_parallel() -> usize {
    5
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            strategy: default_strategy(),
            default_timeout_seconds: None,
            max_parallel_tasks: default_max_parallel(),
            continue_on_failure: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskDefinition>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    pub fn with_default_timeout(mut self, seconds: f64) -> Self {
        self.default_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_continue_on_failure(mut self, value: bool) -> Self {
        self.continue_on_failure = value;
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Declared position of a task, used for stable ordering.
    pub fn task_index(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One observed status transition, appended to the workflow event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Snapshot of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Current status per task id.
    pub task_statuses: HashMap<String, TaskStatus>,
    /// Terminal results per task id.
    pub task_results: HashMap<String, TaskResult>,
    pub events: Vec<StateEvent>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.task_statuses.get(task_id).copied()
    }

    pub fn task_output(&self, task_id: &str) -> Option<&TaskOutput> {
        self.task_results
            .get(task_id)
            .and_then(|r| r.output.as_ref())
    }

    pub fn count_with(&self, status: TaskStatus) -> usize {
        self.task_statuses.values().filter(|s| **s == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.task_statuses.values().all(|s| s.is_terminal())
    }

    /// Ids of completed tasks, for condition evaluation.
    pub fn completed_ids(&self) -> Vec<&str> {
        self.task_statuses
            .iter()
            .filter(|(_, s)| **s == TaskStatus::Completed)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Workflow progress counters, as reported to callers and callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub running: usize,
    pub pending: usize,
    /// Percentage of tasks in a terminal status.
    pub percent: f64,
    pub status: WorkflowStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_builder() {
        let wf = WorkflowDefinition::new("wf-1", "Build pipeline")
            .with_task(TaskDefinition::new("a", "first"))
            .with_task(TaskDefinition::new("b", "second").with_dependencies(vec!["a"]))
            .with_strategy(ExecutionStrategy::Dag)
            .with_max_parallel(2);

        assert_eq!(wf.tasks.len(), 2);
        assert_eq!(wf.max_parallel_tasks, 2);
        assert_eq!(wf.task_index("b"), Some(1));
        assert!(wf.task("a").is_some());
        assert!(wf.task("missing").is_none());
    }

    #[test]
    fn test_defaults() {
        let wf = WorkflowDefinition::new("wf", "wf");
        assert_eq!(wf.strategy, ExecutionStrategy::Dag);
        assert_eq!(wf.max_parallel_tasks, 5);
        assert!(!wf.continue_on_failure);
    }

    #[test]
    fn test_skip_reason_strings() {
        assert_eq!(SkipReason::DependencyFailed.as_str(), "dependency_failed");
        assert_eq!(SkipReason::DependencySkipped.as_str(), "dependency_skipped");
        assert_eq!(SkipReason::ConditionUnmet.as_str(), "condition_unmet");
    }

    #[test]
    fn test_strategy_serialization() {
        let json = serde_json::to_string(&ExecutionStrategy::Conditional).unwrap();
        assert_eq!(json, "\"conditional\"");
        let parsed: ExecutionStrategy = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(parsed, ExecutionStrategy::Auto);
    }

    #[test]
    fn test_state_counters() {
        let mut state = WorkflowState {
            workflow_id: "wf".into(),
            status: WorkflowStatus::Running,
            task_statuses: HashMap::new(),
            task_results: HashMap::new(),
            events: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        state.task_statuses.insert("a".into(), TaskStatus::Completed);
        state.task_statuses.insert("b".into(), TaskStatus::Running);

        assert_eq!(state.count_with(TaskStatus::Completed), 1);
        assert!(!state.all_terminal());
        assert_eq!(state.completed_ids(), vec!["a"]);
    }
}

//! Execution metrics: per-task timings, per-workflow aggregates, and
//! cross-workflow statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use taskweave_core::{TaskStatus, WorkflowState, WorkflowStatus};

/// Metrics for a single task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub task_id: String,
    pub status: TaskStatus,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub worker_type: Option<String>,
    pub error: Option<String>,
}

impl TaskMetrics {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }
}

/// Aggregated metrics for one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_retries: u32,

    pub total_duration_seconds: f64,
    pub average_task_duration: f64,
    /// Percentage of tasks that completed.
    pub success_rate: f64,
    /// Retries per task.
    pub retry_rate: f64,

    pub task_metrics: Vec<TaskMetrics>,
}

impl WorkflowMetrics {
    /// Derive metrics from a finished workflow state.
    pub fn from_state(state: &WorkflowState, workflow_name: &str) -> Self {
        let mut task_metrics: Vec<TaskMetrics> = state
            .task_results
            .values()
            .filter_map(|result| {
                let started_at = result.started_at?;
                let completed_at = result.completed_at?;
                Some(TaskMetrics {
                    task_id: result.task_id.clone(),
                    status: result.status,
                    duration_seconds: result.duration_seconds().unwrap_or(0.0),
                    started_at,
                    completed_at,
                    retry_count: result.retry_count(),
                    worker_type: result.worker_type.clone(),
                    error: result.error.as_ref().map(|e| e.message.clone()),
                })
            })
            .collect();
        task_metrics.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let total_tasks = state.task_statuses.len();
        let count = |s: TaskStatus| state.task_statuses.values().filter(|v| **v == s).count();
        let completed_tasks = count(TaskStatus::Completed);
        let total_retries: u32 = task_metrics.iter().map(|t| t.retry_count).sum();

        let total_duration_seconds = match (state.started_at, state.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };

        let succeeded: Vec<&TaskMetrics> =
            task_metrics.iter().filter(|t| t.succeeded()).collect();
        let average_task_duration = if succeeded.is_empty() {
            0.0
        } else {
            succeeded.iter().map(|t| t.duration_seconds).sum::<f64>() / succeeded.len() as f64
        };

        Self {
            workflow_id: state.workflow_id.clone(),
            workflow_name: workflow_name.to_string(),
            status: state.status,
            started_at: state.started_at,
            completed_at: state.completed_at,
            total_tasks,
            completed_tasks,
            failed_tasks: count(TaskStatus::Failed),
            skipped_tasks: count(TaskStatus::Skipped),
            cancelled_tasks: count(TaskStatus::Cancelled),
            total_retries,
            total_duration_seconds,
            average_task_duration,
            success_rate: if total_tasks > 0 {
                completed_tasks as f64 / total_tasks as f64 * 100.0
            } else {
                0.0
            },
            retry_rate: if total_tasks > 0 {
                total_retries as f64 / total_tasks as f64
            } else {
                0.0
            },
            task_metrics,
        }
    }

    /// The slowest completed task, if any.
    pub fn slowest_task(&self) -> Option<&TaskMetrics> {
        self.task_metrics
            .iter()
            .filter(|t| t.succeeded())
            .max_by(|a, b| a.duration_seconds.total_cmp(&b.duration_seconds))
    }

    /// The fastest completed task, if any.
    pub fn fastest_task(&self) -> Option<&TaskMetrics> {
        self.task_metrics
            .iter()
            .filter(|t| t.succeeded())
            .min_by(|a, b| a.duration_seconds.total_cmp(&b.duration_seconds))
    }

    pub fn failed(&self) -> Vec<&TaskMetrics> {
        self.task_metrics.iter().filter(|t| t.failed()).collect()
    }

    /// Human-readable performance report.
    pub fn render_report(&self) -> String {
        let mut lines = vec![
            format!(
                "Workflow Performance Report: {}",
                if self.workflow_name.is_empty() {
                    &self.workflow_id
                } else {
                    &self.workflow_name
                }
            ),
            "=".repeat(70),
            format!("Status: {}", self.status),
            format!("Total Duration: {:.2}s", self.total_duration_seconds),
            String::new(),
            "Task Summary:".to_string(),
            format!("  Total Tasks: {}", self.total_tasks),
            format!(
                "  Completed: {} ({:.1}%)",
                self.completed_tasks, self.success_rate
            ),
            format!("  Failed: {}", self.failed_tasks),
            format!("  Skipped: {}", self.skipped_tasks),
            format!("  Cancelled: {}", self.cancelled_tasks),
            format!(
                "  Total Retries: {} (avg {:.2} per task)",
                self.total_retries, self.retry_rate
            ),
            String::new(),
            "Performance:".to_string(),
            format!("  Average Task Duration: {:.2}s", self.average_task_duration),
        ];

        if let Some(slowest) = self.slowest_task() {
            lines.push(format!(
                "  Slowest Task: {} ({:.2}s)",
                slowest.task_id, slowest.duration_seconds
            ));
        }
        if let Some(fastest) = self.fastest_task() {
            lines.push(format!(
                "  Fastest Task: {} ({:.2}s)",
                fastest.task_id, fastest.duration_seconds
            ));
        }

        let failed = self.failed();
        if !failed.is_empty() {
            lines.push(String::new());
            lines.push("Failed Tasks:".to_string());
            for task in failed {
                lines.push(format!(
                    "  - {}: {}",
                    task.task_id,
                    task.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        lines.join("\n")
    }
}

/// Aggregate statistics across every recorded workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_workflows: usize,
    pub total_tasks: usize,
    pub total_completed: usize,
    pub total_failed: usize,
    pub total_retries: u32,
    pub average_success_rate: f64,
    pub average_duration_seconds: f64,
}

/// Collects and stores metrics for workflow executions.
#[derive(Default)]
pub struct MetricsCollector {
    workflows: RwLock<HashMap<String, WorkflowMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record_workflow(
        &self,
        state: &WorkflowState,
        workflow_name: &str,
    ) -> WorkflowMetrics {
        let metrics = WorkflowMetrics::from_state(state, workflow_name);
        self.workflows
            .write()
            .await
            .insert(state.workflow_id.clone(), metrics.clone());
        metrics
    }

    pub async fn workflow_metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    pub async fn all_metrics(&self) -> Vec<WorkflowMetrics> {
        self.workflows.read().await.values().cloned().collect()
    }

    pub async fn aggregate_stats(&self) -> AggregateStats {
        let workflows = self.workflows.read().await;
        let total_workflows = workflows.len();
        if total_workflows == 0 {
            return AggregateStats {
                total_workflows: 0,
                total_tasks: 0,
                total_completed: 0,
                total_failed: 0,
                total_retries: 0,
                average_success_rate: 0.0,
                average_duration_seconds: 0.0,
            };
        }
        AggregateStats {
            total_workflows,
            total_tasks: workflows.values().map(|m| m.total_tasks).sum(),
            total_completed: workflows.values().map(|m| m.completed_tasks).sum(),
            total_failed: workflows.values().map(|m| m.failed_tasks).sum(),
            total_retries: workflows.values().map(|m| m.total_retries).sum(),
            average_success_rate: workflows.values().map(|m| m.success_rate).sum::<f64>()
                / total_workflows as f64,
            average_duration_seconds: workflows
                .values()
                .map(|m| m.total_duration_seconds)
                .sum::<f64>()
                / total_workflows as f64,
        }
    }

    pub async fn clear(&self) {
        self.workflows.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use taskweave_core::{TaskError, TaskResult};

    fn state_with_results() -> WorkflowState {
        let start = Utc::now();
        let mut task_statuses = HashMap::new();
        let mut task_results = HashMap::new();

        for (id, status, millis, attempts) in [
            ("fast", TaskStatus::Completed, 100i64, 1u32),
            ("slow", TaskStatus::Completed, 2000, 1),
            ("broken", TaskStatus::Failed, 500, 3),
        ] {
            task_statuses.insert(id.to_string(), status);
            task_results.insert(
                id.to_string(),
                TaskResult {
                    task_id: id.to_string(),
                    status,
                    output: None,
                    error: (status == TaskStatus::Failed)
                        .then(|| TaskError::new("TaskFailed", "boom")),
                    started_at: Some(start),
                    completed_at: Some(start + chrono::Duration::milliseconds(millis)),
                    attempts,
                    worker_type: Some("general-purpose".into()),
                    cache_hit: false,
                },
            );
        }

        WorkflowState {
            workflow_id: "wf".into(),
            status: WorkflowStatus::Failed,
            task_statuses,
            task_results,
            events: Vec::new(),
            started_at: Some(start),
            completed_at: Some(start + chrono::Duration::milliseconds(2600)),
            error: Some("one or more tasks failed".into()),
        }
    }

    #[test]
    fn test_from_state_aggregates() {
        let metrics = WorkflowMetrics::from_state(&state_with_results(), "demo");
        assert_eq!(metrics.total_tasks, 3);
        assert_eq!(metrics.completed_tasks, 2);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.total_retries, 2);
        assert!((metrics.success_rate - 66.666).abs() < 0.1);
        assert_eq!(metrics.slowest_task().unwrap().task_id, "slow");
        assert_eq!(metrics.fastest_task().unwrap().task_id, "fast");
        assert!((metrics.total_duration_seconds - 2.6).abs() < 0.001);
    }

    #[test]
    fn test_report_highlights_slowest_and_failures() {
        let metrics = WorkflowMetrics::from_state(&state_with_results(), "demo");
        let report = metrics.render_report();
        assert!(report.contains("Slowest Task: slow"));
        assert!(report.contains("Failed Tasks:"));
        assert!(report.contains("broken: boom"));
        assert!(report.contains("Total Tasks: 3"));
    }

    #[tokio::test]
    async fn test_collector_aggregate_stats() {
        let collector = MetricsCollector::new();
        collector.record_workflow(&state_with_results(), "demo").await;

        let stats = collector.aggregate_stats().await;
        assert_eq!(stats.total_workflows, 1);
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.total_completed, 2);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_retries, 2);

        collector.clear().await;
        assert_eq!(collector.aggregate_stats().await.total_workflows, 0);
    }

    #[tokio::test]
    async fn test_collector_lookup() {
        let collector = MetricsCollector::new();
        collector.record_workflow(&state_with_results(), "demo").await;
        assert!(collector.workflow_metrics("wf").await.is_some());
        assert!(collector.workflow_metrics("ghost").await.is_none());
        assert_eq!(collector.all_metrics().await.len(), 1);
    }
}

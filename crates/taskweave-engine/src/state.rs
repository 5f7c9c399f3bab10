//! Authoritative workflow state. All transitions go through one critical
//! section; other components read snapshots.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use taskweave_core::{
    SkipReason, StateEvent, TaskDefinition, TaskError, TaskOutput, TaskResult, TaskStatus,
    ValidatedWorkflow, WeaveError, WeaveResult, WorkflowProgress, WorkflowState, WorkflowStatus,
};

/// Owns the per-task status map, results, and event log for one run.
pub struct StateManager {
    validated: Arc<ValidatedWorkflow>,
    inner: Mutex<WorkflowState>,
}

impl StateManager {
    pub fn new(validated: Arc<ValidatedWorkflow>) -> Self {
        let workflow = &validated.workflow;
        let task_statuses = workflow
            .tasks
            .iter()
            .map(|t| (t.id.clone(), TaskStatus::Pending))
            .collect();
        let state = WorkflowState {
            workflow_id: workflow.id.clone(),
            status: WorkflowStatus::Pending,
            task_statuses,
            task_results: HashMap::new(),
            events: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        Self {
            validated,
            inner: Mutex::new(state),
        }
    }

    pub fn workflow(&self) -> &ValidatedWorkflow {
        &self.validated
    }

    pub async fn start_workflow(&self) {
        let mut state = self.inner.lock().await;
        state.status = WorkflowStatus::Running;
        state.started_at = Some(Utc::now());
    }

    /// Settle the workflow-level status once every task is terminal.
    pub async fn finish_workflow(&self, cancel_requested: bool) {
        let mut state = self.inner.lock().await;
        if matches!(state.status, WorkflowStatus::Failed) {
            // fail_workflow already recorded a workflow-level error.
            state.completed_at.get_or_insert_with(Utc::now);
            return;
        }
        let any_failed = state
            .task_statuses
            .values()
            .any(|s| *s == TaskStatus::Failed);
        state.status = if cancel_requested {
            WorkflowStatus::Cancelled
        } else if any_failed && !self.validated.workflow.continue_on_failure {
            state.error = Some("one or more tasks failed".into());
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        state.completed_at = Some(Utc::now());
    }

    /// Record a workflow-level error (internal failures, not task failures).
    pub async fn fail_workflow(&self, error: String) {
        let mut state = self.inner.lock().await;
        state.status = WorkflowStatus::Failed;
        state.error = Some(error);
        state.completed_at = Some(Utc::now());
    }

    /// Promote pending tasks whose dependencies cleared and return every
    /// task currently dispatchable, ordered by priority then declaration.
    ///
    /// With `honor_conditions`, a task carrying a condition additionally
    /// waits until every task the condition references is terminal, and a
    /// task blocked only by *skipped* dependencies is still promoted when
    /// its own condition evaluates true.
    pub async fn ready_tasks(&self, honor_conditions: bool) -> Vec<String> {
        let mut state = self.inner.lock().await;
        let mut ready = Vec::new();
        for task in &self.validated.workflow.tasks {
            match state.task_statuses.get(&task.id) {
                Some(TaskStatus::Ready) => {
                    ready.push(task.id.clone());
                    continue;
                }
                Some(TaskStatus::Pending) => {}
                _ => continue,
            }
            if self.is_dispatchable(&state, task, honor_conditions) {
                record_transition(
                    &mut state,
                    &task.id,
                    TaskStatus::Pending,
                    TaskStatus::Ready,
                    None,
                );
                ready.push(task.id.clone());
            }
        }
        ready.sort_by_key(|id| self.order_key(id));
        ready
    }

    fn order_key(&self, id: &str) -> (std::cmp::Reverse<u8>, usize) {
        let workflow = &self.validated.workflow;
        let priority = workflow.task(id).map(|t| t.priority).unwrap_or(0);
        let index = workflow.task_index(id).unwrap_or(usize::MAX);
        (std::cmp::Reverse(priority), index)
    }

    fn is_dispatchable(
        &self,
        state: &WorkflowState,
        task: &TaskDefinition,
        honor_conditions: bool,
    ) -> bool {
        let deps = self.dep_view(state, task);
        let condition = honor_conditions
            .then(|| self.validated.conditions.get(&task.id))
            .flatten();

        if let Some(cond) = condition {
            // Conditions gate dispatch until their references settle.
            let refs_terminal = cond.referenced_ids().iter().all(|id| {
                state
                    .task_statuses
                    .get(id)
                    .is_some_and(|s| s.is_terminal())
            });
            if !refs_terminal {
                return false;
            }
            if deps.all_completed {
                return true;
            }
            // Skipped-only dependencies can be overridden by a true condition.
            return deps.all_terminal
                && !deps.any_failed
                && deps.any_skipped
                && cond.eval(&completed_set(state));
        }

        deps.all_completed
    }

    /// Pending tasks that can never run, with the reason to skip them.
    /// Tasks whose rescue condition is not yet decidable are left alone.
    pub async fn blocked_tasks(&self, honor_conditions: bool) -> Vec<(String, SkipReason)> {
        let state = self.inner.lock().await;
        let mut blocked = Vec::new();
        for task in &self.validated.workflow.tasks {
            if state.task_statuses.get(&task.id) != Some(&TaskStatus::Pending) {
                continue;
            }
            let deps = self.dep_view(&state, task);
            if deps.any_failed {
                blocked.push((task.id.clone(), SkipReason::DependencyFailed));
                continue;
            }
            if !deps.any_skipped {
                continue;
            }
            if honor_conditions {
                if let Some(cond) = self.validated.conditions.get(&task.id) {
                    let refs_terminal = cond.referenced_ids().iter().all(|id| {
                        state
                            .task_statuses
                            .get(id)
                            .is_some_and(|s| s.is_terminal())
                    });
                    if !refs_terminal {
                        continue; // not decidable yet
                    }
                    if deps.all_terminal && cond.eval(&completed_set(&state)) {
                        continue; // rescued; ready_tasks will promote it
                    }
                }
            }
            blocked.push((task.id.clone(), SkipReason::DependencySkipped));
        }
        blocked
    }

    fn dep_view(&self, state: &WorkflowState, task: &TaskDefinition) -> DepView {
        let mut view = DepView {
            all_completed: true,
            all_terminal: true,
            any_failed: false,
            any_skipped: false,
        };
        for dep in &task.depends_on {
            match state.task_statuses.get(dep) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                    view.all_completed = false;
                    view.any_failed = true;
                }
                Some(TaskStatus::Skipped) => {
                    view.all_completed = false;
                    view.any_skipped = true;
                }
                _ => {
                    view.all_completed = false;
                    view.all_terminal = false;
                }
            }
        }
        view
    }

    pub async fn mark_running(&self, id: &str, worker_type: &str) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        self.transition(&mut state, id, TaskStatus::Running, None)?;
        state.task_results.insert(
            id.to_string(),
            TaskResult {
                task_id: id.to_string(),
                status: TaskStatus::Running,
                output: None,
                error: None,
                started_at: Some(Utc::now()),
                completed_at: None,
                attempts: 1,
                worker_type: Some(worker_type.to_string()),
                cache_hit: false,
            },
        );
        Ok(())
    }

    /// Record a retry: the task stays `running` with a bumped attempt count.
    pub async fn record_retry(&self, id: &str) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        if state.task_statuses.get(id) != Some(&TaskStatus::Running) {
            return Err(WeaveError::Internal(format!(
                "retry recorded for non-running task {id}"
            )));
        }
        record_transition(
            &mut state,
            id,
            TaskStatus::Running,
            TaskStatus::Running,
            Some("retry".into()),
        );
        if let Some(result) = state.task_results.get_mut(id) {
            result.attempts += 1;
        }
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str, output: TaskOutput) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        self.transition(&mut state, id, TaskStatus::Completed, None)?;
        if let Some(result) = state.task_results.get_mut(id) {
            result.status = TaskStatus::Completed;
            result.output = Some(output);
            result.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Complete a task straight from the cache, without running a worker.
    pub async fn mark_completed_cached(&self, id: &str, output: TaskOutput) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        self.transition(&mut state, id, TaskStatus::Completed, Some("cache_hit".into()))?;
        let now = Utc::now();
        state.task_results.insert(
            id.to_string(),
            TaskResult {
                task_id: id.to_string(),
                status: TaskStatus::Completed,
                output: Some(output),
                error: None,
                started_at: Some(now),
                completed_at: Some(now),
                attempts: 0,
                worker_type: Some("cache".to_string()),
                cache_hit: true,
            },
        );
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: TaskError) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        self.transition(&mut state, id, TaskStatus::Failed, Some(error.kind.clone()))?;
        let now = Utc::now();
        let result = state
            .task_results
            .entry(id.to_string())
            .or_insert_with(|| TaskResult {
                task_id: id.to_string(),
                status: TaskStatus::Failed,
                output: None,
                error: None,
                started_at: Some(now),
                completed_at: None,
                attempts: 0,
                worker_type: None,
                cache_hit: false,
            });
        result.status = TaskStatus::Failed;
        result.error = Some(error);
        result.completed_at = Some(now);
        Ok(())
    }

    pub async fn mark_skipped(&self, id: &str, reason: SkipReason) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        self.transition(
            &mut state,
            id,
            TaskStatus::Skipped,
            Some(reason.as_str().into()),
        )?;
        let kind = match reason {
            SkipReason::DependencyFailed | SkipReason::DependencySkipped => "DependencyFailed",
            SkipReason::ConditionUnmet | SkipReason::WorkflowHalted => "Skipped",
        };
        let now = Utc::now();
        state.task_results.insert(
            id.to_string(),
            TaskResult {
                task_id: id.to_string(),
                status: TaskStatus::Skipped,
                output: None,
                error: Some(TaskError::new(kind, reason.as_str())),
                started_at: Some(now),
                completed_at: Some(now),
                attempts: 0,
                worker_type: None,
                cache_hit: false,
            },
        );
        Ok(())
    }

    pub async fn mark_cancelled(&self, id: &str) -> WeaveResult<()> {
        let mut state = self.inner.lock().await;
        if state
            .task_statuses
            .get(id)
            .is_some_and(|s| s.is_terminal())
        {
            return Ok(()); // cancellation is idempotent
        }
        self.transition(&mut state, id, TaskStatus::Cancelled, None)?;
        let now = Utc::now();
        let result = state
            .task_results
            .entry(id.to_string())
            .or_insert_with(|| TaskResult {
                task_id: id.to_string(),
                status: TaskStatus::Cancelled,
                output: None,
                error: None,
                started_at: Some(now),
                completed_at: None,
                attempts: 0,
                worker_type: None,
                cache_hit: false,
            });
        result.status = TaskStatus::Cancelled;
        result.error = Some(TaskError::new("Cancelled", "workflow cancelled"));
        result.completed_at = Some(now);
        Ok(())
    }

    /// Cancel every task that has not reached a terminal status.
    pub async fn cancel_remaining(&self) {
        let ids: Vec<String> = {
            let state = self.inner.lock().await;
            state
                .task_statuses
                .iter()
                .filter(|(_, s)| !s.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.mark_cancelled(&id).await {
                warn!(task_id = %id, error = %e, "Failed to cancel task");
            }
        }
    }

    /// Skip every pending or ready task, used when the workflow halts
    /// after a failure.
    pub async fn skip_all_pending(&self, reason: SkipReason) {
        let ids: Vec<String> = {
            let state = self.inner.lock().await;
            state
                .task_statuses
                .iter()
                .filter(|(_, s)| matches!(s, TaskStatus::Pending | TaskStatus::Ready))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.mark_skipped(&id, reason).await {
                warn!(task_id = %id, error = %e, "Failed to skip task");
            }
        }
    }

    pub async fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.inner.lock().await.task_statuses.get(id).copied()
    }

    pub async fn has_failed(&self) -> bool {
        self.inner
            .lock()
            .await
            .task_statuses
            .values()
            .any(|s| *s == TaskStatus::Failed)
    }

    pub async fn all_terminal(&self) -> bool {
        self.inner.lock().await.all_terminal()
    }

    /// Whether the task's condition evaluates true right now.
    /// `None` when the task declares no condition.
    pub async fn condition_met(&self, id: &str) -> Option<bool> {
        let cond = self.validated.conditions.get(id)?;
        let state = self.inner.lock().await;
        Some(cond.eval(&completed_set(&state)))
    }

    /// Outputs of the task's completed dependencies, in declared order.
    pub async fn dependency_outputs(&self, task: &TaskDefinition) -> Vec<(String, TaskOutput)> {
        let state = self.inner.lock().await;
        task.depends_on
            .iter()
            .filter_map(|dep| {
                state
                    .task_results
                    .get(dep)
                    .filter(|r| r.status == TaskStatus::Completed)
                    .and_then(|r| r.output.clone())
                    .map(|out| (dep.clone(), out))
            })
            .collect()
    }

    pub async fn progress(&self) -> WorkflowProgress {
        let state = self.inner.lock().await;
        let total = state.task_statuses.len();
        let count =
            |status: TaskStatus| state.task_statuses.values().filter(|s| **s == status).count();
        let terminal = state
            .task_statuses
            .values()
            .filter(|s| s.is_terminal())
            .count();
        WorkflowProgress {
            total_tasks: total,
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            cancelled: count(TaskStatus::Cancelled),
            running: count(TaskStatus::Running),
            pending: count(TaskStatus::Pending) + count(TaskStatus::Ready),
            percent: if total > 0 {
                terminal as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            status: state.status,
        }
    }

    pub async fn snapshot(&self) -> WorkflowState {
        self.inner.lock().await.clone()
    }

    fn transition(
        &self,
        state: &mut WorkflowState,
        id: &str,
        to: TaskStatus,
        reason: Option<String>,
    ) -> WeaveResult<()> {
        let from = *state
            .task_statuses
            .get(id)
            .ok_or_else(|| WeaveError::Internal(format!("unknown task id {id}")))?;
        if !transition_allowed(from, to) {
            return Err(WeaveError::Internal(format!(
                "illegal transition for task {id}: {from} -> {to}"
            )));
        }
        record_transition(state, id, from, to, reason);
        Ok(())
    }
}

struct DepView {
    all_completed: bool,
    all_terminal: bool,
    any_failed: bool,
    any_skipped: bool,
}

fn completed_set(state: &WorkflowState) -> HashSet<&str> {
    state
        .task_statuses
        .iter()
        .filter(|(_, s)| **s == TaskStatus::Completed)
        .map(|(id, _)| id.as_str())
        .collect()
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match (from, to) {
        (Pending, Ready) => true,
        (Ready, Running) => true,
        (Running, Running) => true, // retry
        (Running, Completed | Failed) => true,
        (Ready, Completed) => true, // cache hit
        (Pending | Ready, Failed) => true, // scheduling errors
        (Pending | Ready, Skipped) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

fn record_transition(
    state: &mut WorkflowState,
    id: &str,
    from: TaskStatus,
    to: TaskStatus,
    reason: Option<String>,
) {
    state.task_statuses.insert(id.to_string(), to);
    state.events.push(StateEvent {
        task_id: id.to_string(),
        from,
        to,
        reason,
        at: Utc::now(),
    });
}

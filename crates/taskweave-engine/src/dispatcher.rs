//! The shared single-task runner: cache probe, worker acquisition,
//! timeout/retry loop, cache store, terminal state recording.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskweave_core::{
    RetryPolicy, TaskDefinition, TaskError, ValidatedWorkflow, WeaveError, WorkflowDefinition,
    WorkflowState,
};
use taskweave_skills::SkillRegistry;

use crate::cache::ResultCache;
use crate::router::{RouteDecision, Router};
use crate::state::StateManager;
use crate::worker::{WorkerRegistry, WorkerRequest};

/// Callback invoked with a read-only snapshot after every state transition.
pub type ProgressCallback = Arc<dyn Fn(&WorkflowState) + Send + Sync>;

/// Shared context for one workflow run, handed to the strategy and the
/// dispatcher.
pub struct RunContext {
    pub validated: Arc<ValidatedWorkflow>,
    pub state: Arc<StateManager>,
    pub router: Arc<Router>,
    pub cache: Arc<ResultCache>,
    pub workers: Arc<WorkerRegistry>,
    pub skills: Arc<SkillRegistry>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

impl RunContext {
    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.validated.workflow
    }

    /// Invoke the progress callback with a fresh snapshot. Panics inside
    /// the callback are caught and logged, never propagated.
    pub async fn notify_progress(&self) {
        if let Some(callback) = &self.progress {
            let snapshot = self.state.snapshot().await;
            if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                warn!(
                    workflow_id = %snapshot.workflow_id,
                    "Progress callback panicked; ignoring"
                );
            }
        }
    }
}

/// Run one task to a terminal status. The state manager observes exactly
/// one terminal transition for the task before this returns.
pub async fn run_task(ctx: &RunContext, task: &TaskDefinition) {
    // Resolve skills up front; a missing skill fails the task without
    // consuming a worker slot.
    let skills = match ctx.skills.resolve(&task.required_skills) {
        Ok(skills) => skills,
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Skill resolution failed");
            record_failure(ctx, &task.id, TaskError::from(&e)).await;
            return;
        }
    };

    let dependency_outputs = ctx.state.dependency_outputs(task).await;

    if let Some(output) = ctx.cache.get(task, &dependency_outputs).await {
        info!(task_id = %task.id, "Serving task from cache");
        if let Err(e) = ctx.state.mark_completed_cached(&task.id, output).await {
            error!(task_id = %task.id, error = %e, "State update failed");
        }
        ctx.notify_progress().await;
        return;
    }

    // Acquire a worker slot, waiting cooperatively when every candidate
    // is at capacity.
    let worker_type = loop {
        if ctx.cancel.is_cancelled() {
            record_cancellation(ctx, &task.id).await;
            return;
        }
        // Register for release notifications before re-checking, so a slot
        // freed in between cannot be missed.
        let mut notified = std::pin::pin!(ctx.router.slot_released());
        notified.as_mut().enable();
        match ctx.router.try_acquire(task) {
            RouteDecision::Acquired(worker_type) => break worker_type,
            RouteDecision::Unroutable => {
                let err = WeaveError::NoWorkerAvailable(format!(
                    "no routing satisfies task {}",
                    task.id
                ));
                error!(task_id = %task.id, "Task is unroutable");
                record_failure(ctx, &task.id, TaskError::from(&err)).await;
                return;
            }
            RouteDecision::Waiting => {
                debug!(task_id = %task.id, "Waiting for a worker slot");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        record_cancellation(ctx, &task.id).await;
                        return;
                    }
                    _ = &mut notified => {}
                }
            }
        }
    };

    // From here on the slot must be released on every exit path.
    let Some(worker) = ctx.workers.get(&worker_type) else {
        ctx.router.release(&worker_type);
        let err = WeaveError::NoWorkerAvailable(format!(
            "no worker implementation registered for type {worker_type}"
        ));
        error!(task_id = %task.id, worker_type = %worker_type, "Missing worker implementation");
        record_failure(ctx, &task.id, TaskError::from(&err)).await;
        return;
    };

    if let Err(e) = ctx.state.mark_running(&task.id, &worker_type).await {
        ctx.router.release(&worker_type);
        error!(task_id = %task.id, error = %e, "State update failed");
        return;
    }
    ctx.notify_progress().await;

    let limit = effective_timeout(task, ctx.workflow());
    let request = WorkerRequest {
        task_id: task.id.clone(),
        description: task.description.clone(),
        parameters: task.parameters.clone(),
        skills,
        dependency_outputs: dependency_outputs.clone(),
    };

    let mut attempt: u32 = 1;
    let outcome = loop {
        let call = worker.run(request.clone());
        let attempt_result = match limit {
            Some(duration) => tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    ctx.router.release(&worker_type);
                    record_cancellation(ctx, &task.id).await;
                    return;
                }
                result = tokio::time::timeout(duration, call) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(WeaveError::TaskTimeout(format!(
                        "task {} exceeded {:.3}s",
                        task.id,
                        duration.as_secs_f64()
                    ))),
                },
            },
            None => tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    ctx.router.release(&worker_type);
                    record_cancellation(ctx, &task.id).await;
                    return;
                }
                result = call => result,
            },
        };

        match attempt_result {
            Ok(output) => break Ok(output),
            Err(err) if attempt <= task.retry_policy.max_retries => {
                let delay = backoff_delay(&task.retry_policy, attempt);
                warn!(
                    task_id = %task.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Attempt failed; retrying"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        ctx.router.release(&worker_type);
                        record_cancellation(ctx, &task.id).await;
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                if let Err(e) = ctx.state.record_retry(&task.id).await {
                    error!(task_id = %task.id, error = %e, "State update failed");
                }
                ctx.notify_progress().await;
            }
            Err(err) => break Err(err),
        }
    };

    ctx.router.release(&worker_type);

    match outcome {
        Ok(output) => {
            ctx.cache.put(task, &dependency_outputs, &output).await;
            info!(task_id = %task.id, worker_type = %worker_type, attempt, "Task completed");
            if let Err(e) = ctx.state.mark_completed(&task.id, output).await {
                error!(task_id = %task.id, error = %e, "State update failed");
            }
        }
        Err(err) => {
            error!(task_id = %task.id, attempts = attempt, error = %err, "Task failed");
            if let Err(e) = ctx.state.mark_failed(&task.id, TaskError::from(&err)).await {
                error!(task_id = %task.id, error = %e, "State update failed");
            }
        }
    }
    ctx.notify_progress().await;
}

async fn record_failure(ctx: &RunContext, task_id: &str, error: TaskError) {
    if let Err(e) = ctx.state.mark_failed(task_id, error).await {
        error!(task_id = %task_id, error = %e, "State update failed");
    }
    ctx.notify_progress().await;
}

async fn record_cancellation(ctx: &RunContext, task_id: &str) {
    if let Err(e) = ctx.state.mark_cancelled(task_id).await {
        error!(task_id = %task_id, error = %e, "State update failed");
    }
    ctx.notify_progress().await;
}

/// The tighter of the task's own timeout and the workflow default.
fn effective_timeout(task: &TaskDefinition, workflow: &WorkflowDefinition) -> Option<Duration> {
    let seconds = match (task.timeout_seconds, workflow.default_timeout_seconds) {
        (Some(t), Some(w)) => Some(t.min(w)),
        (Some(t), None) => Some(t),
        (None, Some(w)) => Some(w),
        (None, None) => None,
    };
    seconds.map(Duration::from_secs_f64)
}

/// Backoff before retrying after the given 1-based attempt, with optional
/// +/-25% jitter. The jitter source is the sub-second clock: cheap and
/// spread is all that is required.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let mut seconds = policy.backoff_seconds(attempt);
    if policy.jitter {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let unit = nanos as f64 / 1_000_000_000.0;
        seconds *= 0.75 + 0.5 * unit;
    }
    Duration::from_secs_f64(seconds.max(0.0))
}

//! Execution strategies: policies deciding which ready tasks the
//! dispatcher runs next. All four drive the same dispatcher and differ
//! only in eligibility and ordering.

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskweave_core::{ExecutionStrategy, SkipReason, TaskStatus, WeaveResult};

use crate::dispatcher::{self, RunContext};

/// A scheduling policy over the shared dispatcher.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn run(&self, ctx: Arc<RunContext>) -> WeaveResult<()>;
}

/// Select the implementation for a strategy tag. `Auto` resolves to DAG;
/// the orchestrator replaces it via the recommender before running.
pub fn strategy_for(strategy: ExecutionStrategy) -> Box<dyn Strategy> {
    match strategy {
        ExecutionStrategy::Sequential => Box::new(Sequential),
        ExecutionStrategy::Parallel => Box::new(Parallel),
        ExecutionStrategy::Dag | ExecutionStrategy::Auto => Box::new(Dag),
        ExecutionStrategy::Conditional => Box::new(Conditional),
    }
}

/// Skip every task that can no longer run, cascading until settled.
async fn apply_skips(ctx: &RunContext, honor_conditions: bool) {
    loop {
        let blocked = ctx.state.blocked_tasks(honor_conditions).await;
        if blocked.is_empty() {
            return;
        }
        for (id, reason) in blocked {
            info!(task_id = %id, reason = %reason, "Skipping unrunnable task");
            if let Err(e) = ctx.state.mark_skipped(&id, reason).await {
                error!(task_id = %id, error = %e, "State update failed");
            }
        }
        ctx.notify_progress().await;
    }
}

/// One task at a time, in stable topological order; stops scheduling on
/// the first failure unless the workflow continues on failure.
pub struct Sequential;

#[async_trait]
impl Strategy for Sequential {
    async fn run(&self, ctx: Arc<RunContext>) -> WeaveResult<()> {
        for id in ctx.validated.topo_order.clone() {
            if ctx.cancel.is_cancelled() {
                ctx.state.cancel_remaining().await;
                ctx.notify_progress().await;
                return Ok(());
            }
            apply_skips(&ctx, false).await;
            ctx.state.ready_tasks(false).await;

            let Some(task) = ctx.workflow().task(&id).cloned() else {
                continue;
            };
            if ctx.state.task_status(&id).await != Some(TaskStatus::Ready) {
                continue; // skipped by the cascade or already terminal
            }

            dispatcher::run_task(&ctx, &task).await;

            if !ctx.workflow().continue_on_failure && ctx.state.has_failed().await {
                apply_skips(&ctx, false).await;
                ctx.state.skip_all_pending(SkipReason::WorkflowHalted).await;
                ctx.notify_progress().await;
                return Ok(());
            }
        }
        apply_skips(&ctx, false).await;
        Ok(())
    }
}

/// Every task at once, bounded by `max_parallel_tasks`. Validation has
/// already rejected workflows with dependencies for this strategy.
pub struct Parallel;

#[async_trait]
impl Strategy for Parallel {
    async fn run(&self, ctx: Arc<RunContext>) -> WeaveResult<()> {
        let semaphore = Arc::new(Semaphore::new(ctx.workflow().max_parallel_tasks));
        ctx.state.ready_tasks(false).await;

        let mut handles = Vec::new();
        for task in ctx.workflow().tasks.clone() {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    _ = ctx.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    if let Err(e) = ctx.state.mark_cancelled(&task.id).await {
                        error!(task_id = %task.id, error = %e, "State update failed");
                    }
                    ctx.notify_progress().await;
                    return;
                };
                dispatcher::run_task(&ctx, &task).await;
            }));
        }
        futures_util::future::join_all(handles).await;

        if ctx.cancel.is_cancelled() {
            ctx.state.cancel_remaining().await;
            ctx.notify_progress().await;
        }
        Ok(())
    }
}

/// Dependency-graph scheduling: dispatch ready tasks up to the parallel
/// bound, recompute the ready set as tasks terminate.
pub struct Dag;

#[async_trait]
impl Strategy for Dag {
    async fn run(&self, ctx: Arc<RunContext>) -> WeaveResult<()> {
        run_graph(ctx, false).await
    }
}

/// DAG scheduling plus condition gates evaluated at dispatch time.
pub struct Conditional;

#[async_trait]
impl Strategy for Conditional {
    async fn run(&self, ctx: Arc<RunContext>) -> WeaveResult<()> {
        run_graph(ctx, true).await
    }
}

async fn run_graph(ctx: Arc<RunContext>, honor_conditions: bool) -> WeaveResult<()> {
    let max_parallel = ctx.workflow().max_parallel_tasks;
    let mut running: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();
    let mut dispatched: HashSet<String> = HashSet::new();
    let mut halted = false;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        apply_skips(&ctx, honor_conditions).await;

        if !halted {
            for id in ctx.state.ready_tasks(honor_conditions).await {
                if running.len() >= max_parallel {
                    break;
                }
                if dispatched.contains(&id) {
                    continue;
                }
                let Some(task) = ctx.workflow().task(&id).cloned() else {
                    continue;
                };

                if honor_conditions && ctx.state.condition_met(&id).await == Some(false) {
                    info!(task_id = %id, "Condition unmet; skipping");
                    dispatched.insert(id.clone());
                    if let Err(e) = ctx.state.mark_skipped(&id, SkipReason::ConditionUnmet).await
                    {
                        error!(task_id = %id, error = %e, "State update failed");
                    }
                    ctx.notify_progress().await;
                    continue;
                }

                dispatched.insert(id.clone());
                let task_ctx = ctx.clone();
                running.push(tokio::spawn(async move {
                    dispatcher::run_task(&task_ctx, &task).await;
                }));
            }
        }

        if running.is_empty() {
            if !ctx.state.blocked_tasks(honor_conditions).await.is_empty() {
                continue; // let the cascade settle
            }
            let undispatched_ready = ctx
                .state
                .ready_tasks(honor_conditions)
                .await
                .into_iter()
                .any(|id| !dispatched.contains(&id));
            if halted || !undispatched_ready {
                break;
            }
        } else {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                joined = running.next() => {
                    if let Some(Err(e)) = joined {
                        error!(error = %e, "Dispatched task panicked");
                    }
                }
            }
            if !ctx.workflow().continue_on_failure && ctx.state.has_failed().await {
                halted = true;
            }
        }
    }

    // Drain in-flight tasks; each observes the cancellation token at its
    // own suspension points.
    while running.next().await.is_some() {}

    if ctx.cancel.is_cancelled() {
        ctx.state.cancel_remaining().await;
        ctx.notify_progress().await;
    } else if halted {
        apply_skips(&ctx, honor_conditions).await;
        ctx.state.skip_all_pending(SkipReason::WorkflowHalted).await;
        ctx.notify_progress().await;
    } else {
        apply_skips(&ctx, honor_conditions).await;
        skip_unresolvable(&ctx).await;
    }
    Ok(())
}

/// Tasks can be left pending when condition references form a cycle that
/// never settles. Skip them rather than spin.
async fn skip_unresolvable(ctx: &RunContext) {
    let snapshot = ctx.state.snapshot().await;
    let mut skipped_any = false;
    for (id, status) in &snapshot.task_statuses {
        if matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
            warn!(task_id = %id, "Unresolvable condition references; skipping task");
            if let Err(e) = ctx.state.mark_skipped(id, SkipReason::ConditionUnmet).await {
                error!(task_id = %id, error = %e, "State update failed");
            }
            skipped_any = true;
        }
    }
    if skipped_any {
        ctx.notify_progress().await;
    }
}

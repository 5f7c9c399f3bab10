//! The orchestrator facade: owns the router, cache, metrics, and
//! registries, and runs workflows through the strategy layer.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use taskweave_core::{
    validate_workflow, ExecutionStrategy, TaskDefinition, TaskResult, WeaveError, WeaveResult,
    WorkflowDefinition, WorkflowProgress, WorkflowState,
};
use taskweave_skills::SkillRegistry;

use crate::cache::{CacheConfig, CacheStats, ResultCache};
use crate::dispatcher::{ProgressCallback, RunContext};
use crate::metrics::{AggregateStats, MetricsCollector, WorkflowMetrics};
use crate::recommender::recommend;
use crate::router::{Router, WorkerRouting};
use crate::state::StateManager;
use crate::strategy::strategy_for;
use crate::worker::WorkerRegistry;

struct RunHandle {
    state: Arc<StateManager>,
    cancel: CancellationToken,
}

/// Top-level engine. One instance owns its mutable state; callers only
/// ever receive snapshots.
pub struct Orchestrator {
    router: Arc<Router>,
    cache: Arc<ResultCache>,
    metrics: Arc<MetricsCollector>,
    workers: Arc<WorkerRegistry>,
    skills: Arc<SkillRegistry>,
    runs: RwLock<HashMap<String, RunHandle>>,
}

impl Orchestrator {
    /// Create an orchestrator with the default routing table, an
    /// in-memory cache, and an empty skill registry.
    pub fn new(workers: WorkerRegistry) -> Self {
        Self {
            router: Arc::new(Router::new(Router::default_routings())),
            cache: Arc::new(ResultCache::with_store(CacheConfig::default(), None)),
            metrics: Arc::new(MetricsCollector::new()),
            workers: Arc::new(workers),
            skills: Arc::new(SkillRegistry::new()),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_routings(mut self, routings: Vec<WorkerRouting>) -> Self {
        self.router = Arc::new(Router::new(routings));
        self
    }

    pub fn with_cache_config(self, config: CacheConfig) -> WeaveResult<Self> {
        Ok(self.with_cache(ResultCache::new(config)?))
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Arc::new(cache);
        self
    }

    pub fn with_skills(mut self, skills: SkillRegistry) -> Self {
        self.skills = Arc::new(skills);
        self
    }

    /// Validate and run a workflow to completion, returning the final
    /// state. Validation errors raise synchronously; task-level failures
    /// are captured in the returned state.
    pub async fn execute_workflow(
        &self,
        workflow: WorkflowDefinition,
        auto_strategy: bool,
        progress: Option<ProgressCallback>,
    ) -> WeaveResult<WorkflowState> {
        let mut workflow = workflow;
        if auto_strategy || workflow.strategy == ExecutionStrategy::Auto {
            let recommendation = recommend(&workflow);
            info!(
                workflow_id = %workflow.id,
                strategy = %recommendation.strategy,
                rationale = %recommendation.rationale,
                "Auto-selected execution strategy"
            );
            workflow.strategy = recommendation.strategy;
        }

        let validated = Arc::new(validate_workflow(workflow)?);
        let workflow_id = validated.workflow.id.clone();
        let workflow_name = validated.workflow.name.clone();
        let strategy = validated.workflow.strategy;

        let state = Arc::new(StateManager::new(validated.clone()));
        let cancel = CancellationToken::new();
        self.runs.write().await.insert(
            workflow_id.clone(),
            RunHandle {
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );

        let ctx = Arc::new(RunContext {
            validated,
            state: state.clone(),
            router: self.router.clone(),
            cache: self.cache.clone(),
            workers: self.workers.clone(),
            skills: self.skills.clone(),
            cancel: cancel.clone(),
            progress,
        });

        info!(workflow_id = %workflow_id, strategy = %strategy, "Starting workflow");
        state.start_workflow().await;
        ctx.notify_progress().await;

        if let Err(e) = strategy_for(strategy).run(ctx.clone()).await {
            error!(workflow_id = %workflow_id, error = %e, "Workflow execution error");
            state.fail_workflow(e.to_string()).await;
        }
        state.finish_workflow(cancel.is_cancelled()).await;

        let final_state = state.snapshot().await;
        self.metrics
            .record_workflow(&final_state, &workflow_name)
            .await;
        ctx.notify_progress().await;

        info!(
            workflow_id = %workflow_id,
            status = %final_state.status,
            "Workflow finished"
        );
        Ok(final_state)
    }

    /// Run a single ad-hoc task through a one-task workflow.
    pub async fn execute_task(&self, task: TaskDefinition) -> WeaveResult<TaskResult> {
        let task_id = task.id.clone();
        let workflow = WorkflowDefinition::new(format!("adhoc-{}", Uuid::new_v4()), "Ad-hoc Task")
            .with_strategy(ExecutionStrategy::Sequential)
            .with_task(task);
        let state = self.execute_workflow(workflow, false, None).await?;
        state.task_results.get(&task_id).cloned().ok_or_else(|| {
            WeaveError::Internal(format!("no result recorded for task {task_id}"))
        })
    }

    /// Cooperative, idempotent cancellation. Returns whether the workflow
    /// was known and still running.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> bool {
        let runs = self.runs.read().await;
        let Some(handle) = runs.get(workflow_id) else {
            return false;
        };
        let was_running = !handle.state.all_terminal().await;
        handle.cancel.cancel();
        info!(workflow_id = %workflow_id, "Cancellation requested");
        was_running
    }

    pub async fn get_workflow_state(&self, workflow_id: &str) -> Option<WorkflowState> {
        let runs = self.runs.read().await;
        let handle = runs.get(workflow_id)?;
        Some(handle.state.snapshot().await)
    }

    pub async fn get_workflow_progress(&self, workflow_id: &str) -> Option<WorkflowProgress> {
        let runs = self.runs.read().await;
        let handle = runs.get(workflow_id)?;
        Some(handle.state.progress().await)
    }

    pub async fn get_workflow_metrics(&self, workflow_id: &str) -> Option<WorkflowMetrics> {
        self.metrics.workflow_metrics(workflow_id).await
    }

    pub async fn get_aggregate_stats(&self) -> AggregateStats {
        self.metrics.aggregate_stats().await
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn invalidate_cache(&self, task_id: &str) -> usize {
        self.cache.invalidate(task_id).await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }
}

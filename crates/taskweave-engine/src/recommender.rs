//! Static analysis of a workflow definition that suggests an execution
//! strategy. Pure: the same workflow always yields the same answer.

use serde::{Deserialize, Serialize};

use taskweave_core::{ExecutionStrategy, WorkflowDefinition};

/// Structural characteristics of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAnalysis {
    pub task_count: usize,
    pub independent_tasks: usize,
    pub total_dependencies: usize,
    pub has_dependencies: bool,
    pub has_conditions: bool,
}

/// A suggested strategy with its supporting analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecommendation {
    pub strategy: ExecutionStrategy,
    pub analysis: WorkflowAnalysis,
    pub rationale: String,
}

pub fn analyze(workflow: &WorkflowDefinition) -> WorkflowAnalysis {
    let total_dependencies = workflow.tasks.iter().map(|t| t.depends_on.len()).sum();
    WorkflowAnalysis {
        task_count: workflow.tasks.len(),
        independent_tasks: workflow
            .tasks
            .iter()
            .filter(|t| t.depends_on.is_empty())
            .count(),
        total_dependencies,
        has_dependencies: total_dependencies > 0,
        has_conditions: workflow.tasks.iter().any(|t| t.condition.is_some()),
    }
}

/// Decision order: conditions win, then dependency-free fan-out, then
/// DAG, then sequential as the safe default.
pub fn recommend(workflow: &WorkflowDefinition) -> StrategyRecommendation {
    let analysis = analyze(workflow);

    let (strategy, rationale) = if analysis.has_conditions {
        (
            ExecutionStrategy::Conditional,
            "workflow contains conditional tasks that require runtime evaluation".to_string(),
        )
    } else if !analysis.has_dependencies && analysis.task_count >= 2 {
        (
            ExecutionStrategy::Parallel,
            "all tasks are independent and can run concurrently".to_string(),
        )
    } else if analysis.has_dependencies {
        (
            ExecutionStrategy::Dag,
            "workflow has dependencies; DAG scheduling maximizes safe parallelism".to_string(),
        )
    } else {
        (
            ExecutionStrategy::Sequential,
            "simple workflow best suited for sequential execution".to_string(),
        )
    };

    StrategyRecommendation {
        strategy,
        analysis,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskweave_core::TaskDefinition;

    #[test]
    fn test_conditions_win() {
        let wf = WorkflowDefinition::new("wf", "cond")
            .with_task(TaskDefinition::new("a", "a"))
            .with_task(
                TaskDefinition::new("b", "b")
                    .with_dependencies(vec!["a"])
                    .with_condition("a"),
            );
        assert_eq!(recommend(&wf).strategy, ExecutionStrategy::Conditional);
    }

    #[test]
    fn test_independent_tasks_parallel() {
        let wf = WorkflowDefinition::new("wf", "par")
            .with_task(TaskDefinition::new("a", "a"))
            .with_task(TaskDefinition::new("b", "b"));
        let rec = recommend(&wf);
        assert_eq!(rec.strategy, ExecutionStrategy::Parallel);
        assert_eq!(rec.analysis.independent_tasks, 2);
    }

    #[test]
    fn test_dependencies_dag() {
        let wf = WorkflowDefinition::new("wf", "dag")
            .with_task(TaskDefinition::new("a", "a"))
            .with_task(TaskDefinition::new("b", "b").with_dependencies(vec!["a"]));
        assert_eq!(recommend(&wf).strategy, ExecutionStrategy::Dag);
    }

    #[test]
    fn test_single_task_sequential() {
        let wf =
            WorkflowDefinition::new("wf", "one").with_task(TaskDefinition::new("a", "only"));
        assert_eq!(recommend(&wf).strategy, ExecutionStrategy::Sequential);
    }

    #[test]
    fn test_empty_workflow_sequential() {
        let wf = WorkflowDefinition::new("wf", "empty");
        assert_eq!(recommend(&wf).strategy, ExecutionStrategy::Sequential);
    }

    #[test]
    fn test_recommendation_is_pure() {
        let wf = WorkflowDefinition::new("wf", "pure")
            .with_task(TaskDefinition::new("a", "a"))
            .with_task(TaskDefinition::new("b", "b").with_dependencies(vec!["a"]));
        assert_eq!(recommend(&wf), recommend(&wf));
    }
}

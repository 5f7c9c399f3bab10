//! Workflow invariant checks, run once at submission.

use std::collections::{HashMap, HashSet};

use crate::condition::Condition;
use crate::error::{WeaveError, WeaveResult};
use crate::task::TaskDefinition;
use crate::workflow::{ExecutionStrategy, WorkflowDefinition};

/// A workflow that passed validation, with conditions parsed and the
/// stable topological order precomputed.
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    pub workflow: WorkflowDefinition,
    /// Parsed condition per task id, for tasks that declare one.
    pub conditions: HashMap<String, Condition>,
    /// Task ids in topological order, stable by priority then declaration.
    pub topo_order: Vec<String>,
}

/// Validate a workflow definition against the submission invariants.
pub fn validate_workflow(workflow: WorkflowDefinition) -> WeaveResult<ValidatedWorkflow> {
    let mut seen = HashSet::new();
    for task in &workflow.tasks {
        if task.id.is_empty() {
            return Err(WeaveError::Validation("task id must not be empty".into()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(WeaveError::Validation(format!(
                "duplicate task id: {}",
                task.id
            )));
        }
    }

    let known: HashSet<&str> = workflow.tasks.iter().map(|t| t.id.as_str()).collect();

    for task in &workflow.tasks {
        for dep in &task.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(WeaveError::Validation(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                )));
            }
        }
        validate_task_bounds(task)?;
    }

    if workflow.max_parallel_tasks < 1 {
        return Err(WeaveError::Validation(
            "max_parallel_tasks must be at least 1".into(),
        ));
    }

    if workflow.strategy == ExecutionStrategy::Parallel
        && workflow.tasks.iter().any(|t| !t.depends_on.is_empty())
    {
        return Err(WeaveError::Validation(
            "parallel strategy requires dependency-free tasks".into(),
        ));
    }

    // Parse conditions once; re-evaluation never re-parses.
    let mut conditions = HashMap::new();
    for task in &workflow.tasks {
        if let Some(expr) = &task.condition {
            let parsed = Condition::parse(expr)?;
            for id in parsed.referenced_ids() {
                if !known.contains(id.as_str()) {
                    return Err(WeaveError::Validation(format!(
                        "condition on task {} references unknown task {}",
                        task.id, id
                    )));
                }
            }
            conditions.insert(task.id.clone(), parsed);
        }
    }

    detect_cycle(&workflow)?;
    let topo_order = topological_order(&workflow);

    Ok(ValidatedWorkflow {
        workflow,
        conditions,
        topo_order,
    })
}

fn validate_task_bounds(task: &TaskDefinition) -> WeaveResult<()> {
    if !(1..=10).contains(&task.priority) {
        return Err(WeaveError::Validation(format!(
            "task {}: priority must be in 1..=10, got {}",
            task.id, task.priority
        )));
    }
    let retry = &task.retry_policy;
    if retry.initial_delay < 0.0 || retry.max_delay < 0.0 {
        return Err(WeaveError::Validation(format!(
            "task {}: retry delays must be non-negative",
            task.id
        )));
    }
    if retry.max_delay < retry.initial_delay {
        return Err(WeaveError::Validation(format!(
            "task {}: max_delay must be >= initial_delay",
            task.id
        )));
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(WeaveError::Validation(format!(
            "task {}: backoff_multiplier must be >= 1.0",
            task.id
        )));
    }
    if let Some(timeout) = task.timeout_seconds {
        if timeout <= 0.0 {
            return Err(WeaveError::Validation(format!(
                "task {}: timeout_seconds must be positive",
                task.id
            )));
        }
    }
    Ok(())
}

/// Reject cyclic dependency graphs, naming the cycle in the error.
pub fn detect_cycle(workflow: &WorkflowDefinition) -> WeaveResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit(
        id: &str,
        workflow: &WorkflowDefinition,
        marks: &mut HashMap<String, Mark>,
        path: &mut Vec<String>,
    ) -> WeaveResult<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                // Back edge: report the cycle from the first repeated id.
                let start = path.iter().position(|p| p == id).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].iter().map(String::as_str).collect();
                cycle.push(id);
                return Err(WeaveError::CyclicDependency(cycle.join(" -> ")));
            }
            None => {}
        }
        marks.insert(id.to_string(), Mark::InProgress);
        path.push(id.to_string());
        if let Some(task) = workflow.task(id) {
            for dep in &task.depends_on {
                visit(dep, workflow, marks, path)?;
            }
        }
        path.pop();
        marks.insert(id.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    for task in &workflow.tasks {
        visit(&task.id, workflow, &mut marks, &mut path)?;
    }
    Ok(())
}

/// Topological order over the workflow's tasks, stable by descending
/// priority then declared position. Assumes the graph is acyclic.
pub fn topological_order(workflow: &WorkflowDefinition) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = workflow
        .tasks
        .iter()
        .map(|t| (t.id.as_str(), t.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in &workflow.tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(&task.id);
        }
    }

    let sort_key = |id: &str| {
        let priority = workflow.task(id).map(|t| t.priority).unwrap_or(0);
        let index = workflow.task_index(id).unwrap_or(usize::MAX);
        (std::cmp::Reverse(priority), index)
    };

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| sort_key(id));

    let mut order = Vec::with_capacity(workflow.tasks.len());
    while let Some(id) = ready.first().copied() {
        ready.remove(0);
        order.push(id.to_string());
        if let Some(deps) = dependents.get(id) {
            for dependent in deps.clone() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(dependent);
                    }
                }
            }
            ready.sort_by_key(|id| sort_key(id));
        }
    }
    order
}

/// Group tasks into levels where each level only depends on earlier ones.
/// Used by the ASCII visualizer.
pub fn task_levels(workflow: &WorkflowDefinition) -> Vec<Vec<String>> {
    let all: HashSet<&str> = workflow.tasks.iter().map(|t| t.id.as_str()).collect();
    let mut assigned: HashSet<&str> = HashSet::new();
    let mut levels = Vec::new();

    while assigned.len() < all.len() {
        let mut level: Vec<&str> = workflow
            .tasks
            .iter()
            .filter(|t| !assigned.contains(t.id.as_str()))
            .filter(|t| t.depends_on.iter().all(|d| assigned.contains(d.as_str())))
            .map(|t| t.id.as_str())
            .collect();

        if level.is_empty() {
            // Cyclic remainder; dump it as a final level.
            let mut remaining: Vec<&str> =
                all.difference(&assigned).copied().collect();
            remaining.sort_unstable();
            levels.push(remaining.iter().map(|s| s.to_string()).collect());
            break;
        }

        level.sort_unstable();
        for id in &level {
            assigned.insert(*id);
        }
        levels.push(level.iter().map(|s| s.to_string()).collect());
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RetryPolicy;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "chain")
            .with_task(TaskDefinition::new("a", "first"))
            .with_task(TaskDefinition::new("b", "second").with_dependencies(vec!["a"]))
            .with_task(TaskDefinition::new("c", "third").with_dependencies(vec!["b"]))
    }

    #[test]
    fn test_valid_chain() {
        let validated = validate_workflow(chain()).unwrap();
        assert_eq!(validated.topo_order, vec!["a", "b", "c"]);
        assert!(validated.conditions.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let wf = WorkflowDefinition::new("wf", "dup")
            .with_task(TaskDefinition::new("a", "one"))
            .with_task(TaskDefinition::new("a", "two"));
        let err = validate_workflow(wf).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert!(err.to_string().contains("duplicate task id"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let wf = WorkflowDefinition::new("wf", "bad")
            .with_task(TaskDefinition::new("a", "one").with_dependencies(vec!["ghost"]));
        let err = validate_workflow(wf).unwrap_err();
        assert!(err.to_string().contains("unknown task ghost"));
    }

    #[test]
    fn test_cycle_named_in_error() {
        let wf = WorkflowDefinition::new("wf", "cycle")
            .with_task(TaskDefinition::new("a", "one").with_dependencies(vec!["b"]))
            .with_task(TaskDefinition::new("b", "two").with_dependencies(vec!["a"]));
        let err = validate_workflow(wf).unwrap_err();
        assert_eq!(err.kind(), "CyclicDependency");
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b'));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let wf = WorkflowDefinition::new("wf", "self")
            .with_task(TaskDefinition::new("a", "loops").with_dependencies(vec!["a"]));
        let err = validate_workflow(wf).unwrap_err();
        assert_eq!(err.kind(), "CyclicDependency");
    }

    #[test]
    fn test_priority_bounds() {
        let wf = WorkflowDefinition::new("wf", "prio")
            .with_task(TaskDefinition::new("a", "one").with_priority(11));
        assert!(validate_workflow(wf).is_err());

        let wf = WorkflowDefinition::new("wf", "prio")
            .with_task(TaskDefinition::new("a", "one").with_priority(0));
        assert!(validate_workflow(wf).is_err());
    }

    #[test]
    fn test_retry_bounds() {
        let bad_delay = RetryPolicy {
            initial_delay: 10.0,
            max_delay: 1.0,
            ..RetryPolicy::default()
        };
        let wf = WorkflowDefinition::new("wf", "retry")
            .with_task(TaskDefinition::new("a", "one").with_retry_policy(bad_delay));
        let err = validate_workflow(wf).unwrap_err();
        assert!(err.to_string().contains("max_delay"));
    }

    #[test]
    fn test_parallel_rejects_dependencies() {
        let wf = chain().with_strategy(ExecutionStrategy::Parallel);
        let err = validate_workflow(wf).unwrap_err();
        assert!(err.to_string().contains("dependency-free"));
    }

    #[test]
    fn test_condition_unknown_reference() {
        let wf = WorkflowDefinition::new("wf", "cond")
            .with_task(TaskDefinition::new("a", "one"))
            .with_task(TaskDefinition::new("b", "two").with_condition("a AND ghost"));
        let err = validate_workflow(wf).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_conditions_parsed_once() {
        let wf = WorkflowDefinition::new("wf", "cond")
            .with_task(TaskDefinition::new("check", "check something"))
            .with_task(TaskDefinition::new("fix", "fix it").with_condition("NOT check"));
        let validated = validate_workflow(wf).unwrap();
        assert!(validated.conditions.contains_key("fix"));
    }

    #[test]
    fn test_topo_order_respects_priority() {
        let wf = WorkflowDefinition::new("wf", "prio")
            .with_task(TaskDefinition::new("low", "low").with_priority(2))
            .with_task(TaskDefinition::new("high", "high").with_priority(9));
        assert_eq!(topological_order(&wf), vec!["high", "low"]);
    }

    #[test]
    fn test_task_levels_diamond() {
        let wf = WorkflowDefinition::new("wf", "diamond")
            .with_task(TaskDefinition::new("a", "root"))
            .with_task(TaskDefinition::new("b", "left").with_dependencies(vec!["a"]))
            .with_task(TaskDefinition::new("c", "right").with_dependencies(vec!["a"]))
            .with_task(TaskDefinition::new("d", "join").with_dependencies(vec!["b", "c"]));
        let levels = task_levels(&wf);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["a"]);
        assert_eq!(levels[1], vec!["b", "c"]);
        assert_eq!(levels[2], vec!["d"]);
    }
}

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use taskweave_core::{TaskOutput, WeaveResult};
use taskweave_skills::Skill;

/// Everything a worker receives for one attempt of one task.
///
/// Each attempt gets an independent request; workers must be re-entrant
/// across retries.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: String,
    pub description: String,
    pub parameters: HashMap<String, serde_json::Value>,
    /// Resolved skill bodies, in the order the task declared them.
    pub skills: Vec<Skill>,
    /// Outputs of completed dependencies, in declared dependency order.
    pub dependency_outputs: Vec<(String, TaskOutput)>,
}

/// The external component that actually performs a task.
///
/// Workers are side-effectful and may suspend on I/O; the dispatcher wraps
/// every call with the task's timeout and retry policy.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, request: WorkerRequest) -> WeaveResult<TaskOutput>;
}

/// Maps worker type ids (as used by the router) to implementations.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    pub fn register(&mut self, worker_type: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.insert(worker_type.into(), worker);
    }

    pub fn get(&self, worker_type: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(worker_type).cloned()
    }

    pub fn types(&self) -> Vec<&str> {
        self.workers.keys().map(String::as_str).collect()
    }

    pub fn count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn run(&self, request: WorkerRequest) -> WeaveResult<TaskOutput> {
            Ok(TaskOutput::Text(request.description))
        }
    }

    #[tokio::test]
    async fn test_registry_register_and_run() {
        let mut registry = WorkerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        assert_eq!(registry.count(), 1);

        let worker = registry.get("echo").unwrap();
        let output = worker
            .run(WorkerRequest {
                task_id: "t".into(),
                description: "hello".into(),
                parameters: HashMap::new(),
                skills: Vec::new(),
                dependency_outputs: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(output.as_text(), Some("hello"));
    }

    #[test]
    fn test_registry_missing_type() {
        let registry = WorkerRegistry::new();
        assert!(registry.get("ghost").is_none());
    }
}

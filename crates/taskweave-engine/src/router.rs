//! Capability- and load-aware selection of a worker type for a task.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use taskweave_core::{Capability, TaskDefinition};

/// Declares one worker type the router may hand tasks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRouting {
    pub worker_type: String,
    pub capabilities: Vec<Capability>,
    /// 1-10, higher is preferred.
    pub priority: u8,
    pub max_concurrent: usize,
}

impl WorkerRouting {
    pub fn new(worker_type: impl Into<String>, capabilities: Vec<Capability>) -> Self {
        Self {
            worker_type: worker_type.into(),
            capabilities,
            priority: 5,
            max_concurrent: 1,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Outcome of a routing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// A slot was acquired on this worker type; release it when done.
    Acquired(String),
    /// Every matching worker is at capacity; wait for a slot to free.
    Waiting,
    /// No routing could ever satisfy this task.
    Unroutable,
}

/// Routes tasks to worker types subject to capability match and
/// per-worker concurrency caps. Slot counters are guarded by one small
/// mutex; waiters are woken whenever a slot is released.
pub struct Router {
    routings: Vec<WorkerRouting>,
    load: Mutex<HashMap<String, usize>>,
    released: Notify,
}

impl Router {
    pub fn new(routings: Vec<WorkerRouting>) -> Self {
        Self {
            routings,
            load: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// The default routing table: a generalist plus six specialists.
    pub fn default_routings() -> Vec<WorkerRouting> {
        use Capability::*;
        vec![
            WorkerRouting::new("general-purpose", vec![General])
                .with_priority(5)
                .with_max_concurrent(3),
            WorkerRouting::new("code-analyzer", vec![CodeAnalysis, Debugging, General])
                .with_priority(7)
                .with_max_concurrent(2),
            WorkerRouting::new("code-generator", vec![CodeGeneration, General])
                .with_priority(7)
                .with_max_concurrent(2),
            WorkerRouting::new("test-specialist", vec![Testing, CodeAnalysis, General])
                .with_priority(6)
                .with_max_concurrent(2),
            WorkerRouting::new("doc-writer", vec![Documentation, General])
                .with_priority(6)
                .with_max_concurrent(2),
            WorkerRouting::new("data-processor", vec![DataProcessing, FileOperations, General])
                .with_priority(6)
                .with_max_concurrent(2),
            WorkerRouting::new("researcher", vec![Research, General])
                .with_priority(5)
                .with_max_concurrent(3),
        ]
    }

    /// Attempt to acquire a worker slot for a task.
    ///
    /// Candidates are the routing with the task's explicit worker type, or
    /// every routing whose capabilities cover the task's requirements.
    /// Among candidates with free slots, the winner is the highest
    /// priority, then the least loaded, then the lexically smallest id.
    pub fn try_acquire(&self, task: &TaskDefinition) -> RouteDecision {
        let candidates: Vec<&WorkerRouting> = match &task.worker_type {
            Some(explicit) => self
                .routings
                .iter()
                .filter(|r| &r.worker_type == explicit)
                .collect(),
            None => self
                .routings
                .iter()
                .filter(|r| covers(&r.capabilities, &task.required_capabilities))
                .collect(),
        };

        if candidates.is_empty() {
            return RouteDecision::Unroutable;
        }

        let mut load = self.load.lock().expect("router lock poisoned");
        let mut available: Vec<(&WorkerRouting, usize)> = candidates
            .iter()
            .map(|r| (*r, *load.get(&r.worker_type).unwrap_or(&0)))
            .filter(|(r, current)| *current < r.max_concurrent)
            .collect();

        if available.is_empty() {
            return RouteDecision::Waiting;
        }

        available.sort_by(|(a, la), (b, lb)| {
            b.priority
                .cmp(&a.priority)
                .then(la.cmp(lb))
                .then(a.worker_type.cmp(&b.worker_type))
        });

        let chosen = available[0].0.worker_type.clone();
        *load.entry(chosen.clone()).or_insert(0) += 1;
        debug!(task_id = %task.id, worker_type = %chosen, "Routed task");
        RouteDecision::Acquired(chosen)
    }

    /// Release a slot previously acquired with [`Router::try_acquire`].
    pub fn release(&self, worker_type: &str) {
        {
            let mut load = self.load.lock().expect("router lock poisoned");
            if let Some(current) = load.get_mut(worker_type) {
                *current = current.saturating_sub(1);
            }
        }
        self.released.notify_waiters();
    }

    /// Future that resolves when any slot is released. Obtain it *before*
    /// the failed `try_acquire` re-check to avoid missed wakeups.
    pub fn slot_released(&self) -> Notified<'_> {
        self.released.notified()
    }

    pub fn load(&self, worker_type: &str) -> usize {
        *self
            .load
            .lock()
            .expect("router lock poisoned")
            .get(worker_type)
            .unwrap_or(&0)
    }

    pub fn load_summary(&self) -> HashMap<String, usize> {
        self.load.lock().expect("router lock poisoned").clone()
    }
}

fn covers(provided: &[Capability], required: &[Capability]) -> bool {
    let provided: HashSet<&Capability> = provided.iter().collect();
    required.iter().all(|c| provided.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskweave_core::TaskDefinition;

    fn task_with(capabilities: Vec<Capability>) -> TaskDefinition {
        TaskDefinition::new("t", "task").with_capabilities(capabilities)
    }

    #[test]
    fn test_capability_superset_match() {
        let router = Router::new(Router::default_routings());
        let task = task_with(vec![Capability::CodeAnalysis, Capability::Debugging]);
        match router.try_acquire(&task) {
            RouteDecision::Acquired(t) => assert_eq!(t, "code-analyzer"),
            other => panic!("expected acquisition, got {other:?}"),
        }
    }

    #[test]
    fn test_explicit_worker_type() {
        let router = Router::new(Router::default_routings());
        let task = task_with(vec![Capability::General]).with_worker_type("researcher");
        assert_eq!(
            router.try_acquire(&task),
            RouteDecision::Acquired("researcher".into())
        );
    }

    #[test]
    fn test_unroutable_capability() {
        let router = Router::new(vec![WorkerRouting::new(
            "general-purpose",
            vec![Capability::General],
        )]);
        let task = task_with(vec![Capability::Research]);
        assert_eq!(router.try_acquire(&task), RouteDecision::Unroutable);
    }

    #[test]
    fn test_unroutable_explicit_type() {
        let router = Router::new(Router::default_routings());
        let task = task_with(vec![Capability::General]).with_worker_type("nonexistent");
        assert_eq!(router.try_acquire(&task), RouteDecision::Unroutable);
    }

    #[test]
    fn test_waiting_at_capacity() {
        let router = Router::new(vec![WorkerRouting::new(
            "general-purpose",
            vec![Capability::General],
        )
        .with_max_concurrent(1)]);
        let task = task_with(vec![Capability::General]);

        assert!(matches!(
            router.try_acquire(&task),
            RouteDecision::Acquired(_)
        ));
        assert_eq!(router.try_acquire(&task), RouteDecision::Waiting);

        router.release("general-purpose");
        assert!(matches!(
            router.try_acquire(&task),
            RouteDecision::Acquired(_)
        ));
    }

    #[test]
    fn test_priority_then_load_then_id() {
        let routings = vec![
            WorkerRouting::new("beta", vec![Capability::General])
                .with_priority(7)
                .with_max_concurrent(2),
            WorkerRouting::new("alpha", vec![Capability::General])
                .with_priority(7)
                .with_max_concurrent(2),
            WorkerRouting::new("gamma", vec![Capability::General])
                .with_priority(3)
                .with_max_concurrent(2),
        ];
        let router = Router::new(routings);
        let task = task_with(vec![Capability::General]);

        // Same priority and load: lexically smallest id wins.
        assert_eq!(
            router.try_acquire(&task),
            RouteDecision::Acquired("alpha".into())
        );
        // alpha now carries load 1, so beta wins on load.
        assert_eq!(
            router.try_acquire(&task),
            RouteDecision::Acquired("beta".into())
        );
        // Higher-priority pair still beats gamma.
        assert_eq!(
            router.try_acquire(&task),
            RouteDecision::Acquired("alpha".into())
        );
    }

    #[test]
    fn test_release_is_bounded_at_zero() {
        let router = Router::new(Router::default_routings());
        router.release("general-purpose");
        assert_eq!(router.load("general-purpose"), 0);
    }

    #[tokio::test]
    async fn test_slot_released_wakes_waiter() {
        let router = std::sync::Arc::new(Router::new(vec![WorkerRouting::new(
            "general-purpose",
            vec![Capability::General],
        )]));
        let task = task_with(vec![Capability::General]);
        assert!(matches!(
            router.try_acquire(&task),
            RouteDecision::Acquired(_)
        ));

        let waiter = {
            let router = router.clone();
            tokio::spawn(async move {
                loop {
                    let notified = router.slot_released();
                    match router.try_acquire(&task_with(vec![Capability::General])) {
                        RouteDecision::Acquired(t) => break t,
                        _ => notified.await,
                    }
                }
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        router.release("general-purpose");
        let acquired = waiter.await.unwrap();
        assert_eq!(acquired, "general-purpose");
    }
}

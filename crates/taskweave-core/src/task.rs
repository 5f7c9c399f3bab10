use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::WeaveError;

/// Status of a task in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// Dependencies satisfied, waiting for dispatch.
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Worker capabilities used for task routing. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    General,
    CodeAnalysis,
    CodeGeneration,
    Testing,
    Debugging,
    Documentation,
    DataProcessing,
    FileOperations,
    ApiIntegration,
    Research,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::General,
        Capability::CodeAnalysis,
        Capability::CodeGeneration,
        Capability::Testing,
        Capability::Debugging,
        Capability::Documentation,
        Capability::DataProcessing,
        Capability::FileOperations,
        Capability::ApiIntegration,
        Capability::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::General => "general",
            Capability::CodeAnalysis => "code_analysis",
            Capability::CodeGeneration => "code_generation",
            Capability::Testing => "testing",
            Capability::Debugging => "debugging",
            Capability::Documentation => "documentation",
            Capability::DataProcessing => "data_processing",
            Capability::FileOperations => "file_operations",
            Capability::ApiIntegration => "api_integration",
            Capability::Research => "research",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| WeaveError::Validation(format!("unknown capability: {s}")))
    }
}

/// Configuration for task retry behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure.
    pub max_retries: u32,
    /// Initial delay in seconds before the first retry.
    pub initial_delay: f64,
    /// Exponential backoff multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Cap on the backoff delay in seconds.
    pub max_delay: f64,
    /// Apply +/-25% jitter to each backoff delay.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: 1.0,
            backoff_multiplier: 2.0,
            max_delay: 60.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff in seconds before retrying after a failed attempt
    /// (`attempt` is 1-based), without jitter applied.
    pub fn backoff_seconds(&self, attempt: u32) -> f64 {
        let exp = attempt.saturating_sub(1);
        let delay = self.initial_delay * self.backoff_multiplier.powi(exp as i32);
        delay.min(self.max_delay)
    }
}

/// Definition of a single task in a workflow. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    /// IDs of tasks that must complete before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_capabilities")]
    pub required_capabilities: Vec<Capability>,
    /// Skill names resolved from the registry before dispatch.
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// 1-10, higher runs first among ready tasks.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Explicit worker type, bypassing capability-based routing.
    #[serde(default)]
    pub worker_type: Option<String>,
    /// Condition expression gating execution (see the condition grammar).
    #[serde(default)]
    pub condition: Option<String>,
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::General]
}

fn default_priority() -> u8 {
    5
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            task_type: None,
            depends_on: Vec::new(),
            required_capabilities: default_capabilities(),
            required_skills: Vec::new(),
            priority: default_priority(),
            timeout_seconds: None,
            retry_policy: RetryPolicy::default(),
            parameters: HashMap::new(),
            worker_type: None,
            condition: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_skills(mut self, skills: Vec<impl Into<String>>) -> Self {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_worker_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = Some(worker_type.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Opaque output envelope for a task. The cache serializes this as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskOutput {
    Text(String),
    Structured(serde_json::Value),
    Binary(Vec<u8>),
}

impl TaskOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TaskOutput::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical JSON view used for cache keying and dependency context.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TaskOutput::Text(s) => serde_json::Value::String(s.clone()),
            TaskOutput::Structured(v) => v.clone(),
            TaskOutput::Binary(b) => serde_json::json!({ "binary_len": b.len() }),
        }
    }
}

impl From<String> for TaskOutput {
    fn from(s: String) -> Self {
        TaskOutput::Text(s)
    }
}

impl From<&str> for TaskOutput {
    fn from(s: &str) -> Self {
        TaskOutput::Text(s.to_string())
    }
}

/// Structured error recorded on a failed task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// One of the stable error kinds (`WeaveError::kind`).
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl From<&WeaveError> for TaskError {
    fn from(err: &WeaveError) -> Self {
        TaskError::new(err.kind(), err.to_string())
    }
}

/// Result of a single task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<TaskOutput>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Total attempts made, including the first.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub worker_type: Option<String>,
    /// Whether the output came from the result cache.
    #[serde(default)]
    pub cache_hit: bool,
}

impl TaskResult {
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Retries beyond the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

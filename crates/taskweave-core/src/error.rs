use thiserror::Error;

pub type WeaveResult<T> = Result<T, WeaveError>;

#[derive(Debug, Error)]
pub enum WeaveError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    #[error("No worker available: {0}")]
    NoWorkerAvailable(String),

    #[error("Task timed out: {0}")]
    TaskTimeout(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Dependency failed: {0}")]
    DependencyFailed(String),

    #[error("Required skill not found: {0}")]
    RequiredSkillNotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WeaveError {
    /// Stable string kind recorded on task results and surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            WeaveError::Validation(_) => "ValidationError",
            WeaveError::CyclicDependency(_) => "CyclicDependency",
            WeaveError::NoWorkerAvailable(_) => "NoWorkerAvailable",
            WeaveError::TaskTimeout(_) => "TaskTimeout",
            WeaveError::TaskFailed(_) => "TaskFailed",
            WeaveError::DependencyFailed(_) => "DependencyFailed",
            WeaveError::RequiredSkillNotFound(_) => "RequiredSkillNotFound",
            WeaveError::Cancelled(_) => "Cancelled",
            WeaveError::Internal(_) | WeaveError::Json(_) | WeaveError::Io(_) => "InternalError",
        }
    }
}

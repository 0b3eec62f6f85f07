use thiserror::Error;

/// Errors surfaced to direct callers of the runtime adapters and trainer.
///
/// Contract violations (`LandmarkCount`, `NotReady`, `NotInitialized`,
/// `ShapeMismatch`, `EmptyBatch`) indicate a caller bug. `Engine` and `Task`
/// wrap failures of a single model call.
#[derive(Debug, Error)]
pub enum GazeError {
    #[error("expected {expected} landmarks, got {actual}")]
    LandmarkCount { expected: usize, actual: usize },

    #[error("inference runtime is not ready")]
    NotReady,

    #[error("training runtime is not initialized")]
    NotInitialized,

    #[error("runtime was already initialized")]
    AlreadyInitialized,

    #[error("empty batch")]
    EmptyBatch,

    #[error("{what}: expected {expected} values, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("model call failed: {0:#}")]
    Engine(#[source] anyhow::Error),

    #[error("model task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type GazeResult<T> = Result<T, GazeError>;

impl GazeError {
    pub fn engine(err: impl Into<anyhow::Error>) -> Self {
        Self::Engine(err.into())
    }
}

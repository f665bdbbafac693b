use std::path::PathBuf;

/// Error enum covering every fatal failure mode of the engine.
///
/// `InvalidWorkflow` and `CorruptState` are raised at startup (config/state
/// loading); `UnknownPhase` is raised once the config is known-good but the
/// persisted state disagrees with it; `HookFailed` is raised mid-run when an
/// init or completion hook exhausts its retries. Per-entity transition hook
/// failures are NOT represented here -- they route the entity to `_failed`
/// and do not abort the run (see `phase_processor`).
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Corrupt state file {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("State file references unknown phase '{phase}'. Known phases: {known}")]
    UnknownPhase { phase: String, known: String },

    #[error("{context} failed after retries")]
    HookFailed { context: String },
}

impl WorkflowError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        WorkflowError::InvalidWorkflow(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

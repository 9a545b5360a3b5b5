use crate::engine::EngineError;
use simrun_core::IdentityError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Stop was requested before the next engine invocation.
    #[error("stop requested")]
    Cancelled,
    #[error("operation_in_progress: {} is held by another process", path.display())]
    LockContention { path: PathBuf },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The job panicked or its worker thread died before reporting it.
    #[error("job aborted by a panic in its worker")]
    WorkerLost,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OrchestrationError {
    /// Stable machine-readable name, used in logs and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::Cancelled => "cancelled",
            OrchestrationError::LockContention { .. } => "lock_contention",
            OrchestrationError::Identity(IdentityError::Conflict { .. }) => "identity_conflict",
            OrchestrationError::Identity(IdentityError::InvalidConfig { .. }) => "invalid_config",
            OrchestrationError::Identity(_) => "identity_error",
            OrchestrationError::Engine(_) => "engine_failure",
            OrchestrationError::WorkerLost => "worker_lost",
            OrchestrationError::Io(_) => "io_error",
        }
    }
}

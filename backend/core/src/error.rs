use thiserror::Error;
use uuid::Uuid;

use crate::experiment::ExperimentStatus;

/// Top-level error type for the havoc agent.
#[derive(Debug, Error)]
pub enum HavocError {
    /// Malformed attack command, rejected before any state is created.
    #[error("invalid attack command: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Persistence(String),

    /// Process spawn or signal failure.
    #[error("attack execution failed: {0}")]
    Execution(String),

    /// Scheduler bookkeeping disagrees with the persisted status.
    #[error("experiment {uid}: {reason}")]
    Consistency { uid: Uuid, reason: String },

    #[error("experiment not found: {0}")]
    NotFound(Uuid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HavocError {
    pub fn missing_task(uid: Uuid) -> Self {
        Self::Consistency {
            uid,
            reason: "missing scheduled task".to_string(),
        }
    }
}

pub type Result<T, E = HavocError> = std::result::Result<T, E>;

use thiserror::Error;

use crate::orchestrator::OrchestratorState;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no usable listening port in {first}..={last}")]
    NoUsablePort { first: u16, last: u16 },

    #[error("cannot {op} while orchestrator is {state}")]
    InvalidState {
        op: &'static str,
        state: OrchestratorState,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid host event '{0}'")]
    InvalidEvent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

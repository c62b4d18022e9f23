use dglab_core::OrchestratorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already listening on port {0}")]
    AlreadyListening(u16),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ServerError> for OrchestratorError {
    fn from(err: ServerError) -> Self {
        OrchestratorError::Transport(err.to_string())
    }
}

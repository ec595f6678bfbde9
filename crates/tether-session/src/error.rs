use std::time::Duration;

use tether_core::{ConnectionError, SessionId};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("connection factory failed: {0}")]
    Factory(ConnectionError),

    #[error("connection error: {0}")]
    Connection(ConnectionError),

    #[error("session start timed out after {0:?}")]
    StartTimeout(Duration),

    #[error("start of {0} aborted by stop or logout")]
    Aborted(SessionId),

    #[error("session manager is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Internal(String),
}

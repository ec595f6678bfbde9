use std::time::Duration;

/// Errors surfaced by a protocol connection or the factory that builds one.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("network error: {0}")]
    Network(String),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("connection already closed")]
    Closed,
    #[error("{0} not supported by this connection")]
    Unsupported(&'static str),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Other(String),
}

impl ConnectionError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Credentials(_) => "credentials",
            Self::Closed => "closed",
            Self::Unsupported(_) => "unsupported",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "other",
        }
    }
}

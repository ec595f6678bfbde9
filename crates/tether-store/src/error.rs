#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("corrupt snapshot {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid store config: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

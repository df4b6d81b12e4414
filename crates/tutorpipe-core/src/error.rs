use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Short error code string used in `error_json` payloads and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config",
            CoreError::Io(_) => "io_error",
            CoreError::Serialization(_) => "serialization_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

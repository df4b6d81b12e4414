use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM connection failed: {0}")]
    Connection(String),

    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("No JSON object found in model output")]
    InvalidJson(String),

    #[error("No usable text in LLM response")]
    BadResponse,

    #[error("circuit breaker open, retry in {retry_in_seconds}s")]
    CircuitOpen { retry_in_seconds: u64 },

    #[error("LLM error: {0}")]
    Other(String),
}

impl LlmError {
    /// Error kind as recorded in `error_json` and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::Timeout => "llm_timeout",
            LlmError::Connection(_) => "llm_connection",
            LlmError::Api { .. } => "llm_error",
            LlmError::InvalidJson(_) => "llm_invalid_json",
            LlmError::BadResponse => "llm_bad_response",
            LlmError::CircuitOpen { .. } => "llm_circuit_open",
            LlmError::Other(_) => "llm_error",
        }
    }

    /// Transient kinds are worth a retry when attempts remain.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout | LlmError::Connection(_) | LlmError::CircuitOpen { .. }
        )
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else if e.is_connect() {
            LlmError::Connection(e.to_string())
        } else {
            LlmError::Other(e.to_string())
        }
    }
}

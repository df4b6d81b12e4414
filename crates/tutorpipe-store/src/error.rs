use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store disabled: missing credentials")]
    Disabled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// PostgREST answers 300 when an RPC name resolves to more than one
    /// overload; surfaced distinctly because it means a schema problem, not
    /// a transient failure.
    #[error("ambiguous RPC overload (HTTP 300): {0}")]
    AmbiguousOverload(String),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Disabled => "store_disabled",
            StoreError::Http(_) => "store_http",
            StoreError::AmbiguousOverload(_) => "store_ambiguous_overload",
            StoreError::Status { .. } => "store_status",
            StoreError::Decode(_) => "store_decode",
        }
    }

    /// Worth a retry: network errors and 5xx/429 responses.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            StoreError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Transient network failure: {0}")]
    RetryableError(String),

    #[error("HTTP {status}: {message}")]
    HttpError {
        status: u16,
        message: String,
        response: Option<String>,
    },

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    ClientError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

impl Error {
    /// Whether the failure happened before a definitive response and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableError(_))
    }

    /// Status code carried by a definitive HTTP failure.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

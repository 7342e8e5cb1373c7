use thiserror::Error;

/// Application-wide error types for Sluice.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed before a status code was available.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Remote answered with a non-success status.
    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// Remote rejected the credentials. Fatal for the whole client.
    #[error("Unauthorized (HTTP 401) from {url}")]
    Unauthorized { url: String },

    /// Status configured as "ignore and continue" (e.g. a disabled feature).
    #[error("Ignored HTTP {status} from {url}")]
    Ignored { status: u16, url: String },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The surrounding task was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Caller-supplied input is malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A required field is absent from caller-supplied input.
    #[error("Missing required field '{0}'")]
    MissingField(String),

    /// Plan construction failed for one scope.
    #[error("Scope #{index} failed to compile: {source}")]
    ScopeCompile {
        index: usize,
        #[source]
        source: Box<AppError>,
    },

    /// A subtask entry point returned an error.
    #[error("Subtask {plugin}/{subtask} failed: {source}")]
    SubtaskFailed {
        plugin: String,
        subtask: String,
        #[source]
        source: Box<AppError>,
    },

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error must abort the whole collection task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Unauthorized { .. })
    }

    /// Returns true if the call should be treated as an empty, successful page.
    pub fn is_soft_skip(&self) -> bool {
        matches!(self, AppError::Ignored { .. })
    }

    /// Remote status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::HttpStatus { status, .. } | AppError::Ignored { status, .. } => {
                Some(*status)
            }
            AppError::Unauthorized { .. } => Some(401),
            AppError::RateLimitExceeded => Some(429),
            AppError::ScopeCompile { source, .. } | AppError::SubtaskFailed { source, .. } => {
                source.status_code()
            }
            _ => None,
        }
    }
}

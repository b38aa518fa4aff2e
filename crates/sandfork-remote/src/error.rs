//! Error types for the remote adapters

use sandfork_core::model::ModelError;
use sandfork_core::sandbox::SandboxError;
use thiserror::Error;

/// Errors raised while talking to a remote collaborator
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Connection refused, DNS failure or timeout
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Any other transport failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status with the server's message
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Body did not have the expected shape
    #[error("unexpected response body: {0}")]
    Decode(String),

    /// Required credential not present in the environment
    #[error("environment variable {0} is not set")]
    MissingCredential(&'static str),

    /// Client could not be constructed
    #[error("client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            RemoteError::Unreachable(err.to_string())
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}

impl From<RemoteError> for SandboxError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable(_) | RemoteError::Http(_) => {
                SandboxError::Unavailable(err.to_string())
            }
            RemoteError::Status { status, .. } if matches!(status, 502..=504) => {
                SandboxError::Unavailable(err.to_string())
            }
            other => SandboxError::Operation(other.to_string()),
        }
    }
}

impl From<RemoteError> for ModelError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable(msg) | RemoteError::Http(msg) => ModelError::Unavailable(msg),
            RemoteError::Status { status: 429, message } => ModelError::RateLimited(message),
            RemoteError::Status { status, message } if status >= 500 => {
                ModelError::Unavailable(format!("HTTP {status}: {message}"))
            }
            RemoteError::Status { status, message } => ModelError::Rejected { status, message },
            other => ModelError::InvalidResponse(other.to_string()),
        }
    }
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

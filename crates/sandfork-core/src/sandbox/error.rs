//! Error types for the sandbox module.

/// Errors returned by a [`SandboxService`](super::service::SandboxService)
/// or [`SandboxProvisioner`](super::service::SandboxProvisioner).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// The primitive ran and failed (missing file, I/O error, bad input).
    #[error("{0}")]
    Operation(String),

    /// The sandbox service could not be reached or refused the sandbox.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Policy construction failures.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid blocked pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("workspace root must be absolute: {0}")]
    RelativeRoot(String),
}

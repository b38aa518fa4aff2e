//! Collaborator contracts for the sandbox runtime.
//!
//! The core never talks to a container directly. An adapter (HTTP client,
//! in-memory fake) implements these traits and is shared across forks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::SandboxResult;

/// Captured output of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }
}

/// Where and how a content search runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepScope {
    /// Absolute directory to search under.
    pub path: String,
    /// File filter relative to `path`.
    pub glob: String,
    /// Stop collecting after this many matches.
    pub max_matches: usize,
}

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line: u64,
    pub text: String,
}

impl std::fmt::Display for GrepMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.path, self.line, self.text)
    }
}

/// File and command primitives of one sandbox.
///
/// Paths are absolute and already policy-checked. Implementations return
/// `SandboxError::Operation` for failures of the primitive itself and
/// `SandboxError::Unavailable` when the sandbox cannot be reached.
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn read(&self, sandbox_id: &str, path: &str) -> SandboxResult<Vec<u8>>;

    async fn write(&self, sandbox_id: &str, path: &str, data: &[u8]) -> SandboxResult<()>;

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> SandboxResult<ExecOutput>;

    /// Paths matching `pattern` under `base`, sorted.
    async fn glob(&self, sandbox_id: &str, pattern: &str, base: &str) -> SandboxResult<Vec<String>>;

    async fn grep(
        &self,
        sandbox_id: &str,
        pattern: &str,
        scope: &GrepScope,
    ) -> SandboxResult<Vec<GrepMatch>>;
}

/// Creates and destroys sandboxes for tasks that do not bring their own.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Returns the new sandbox id.
    async fn create(&self, template: &str) -> SandboxResult<String>;

    async fn kill(&self, sandbox_id: &str) -> SandboxResult<()>;
}

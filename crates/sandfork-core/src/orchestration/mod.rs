//! Fork orchestration: run many agent sessions in parallel.
//!
//! - `progress`: lock-guarded run progress owned by the orchestrator
//! - `runner`: the bounded worker pool, `ForkOrchestrator` and `RunHandle`
//!
//! Every task becomes exactly one `ForkResult`. Run-level problems
//! (validation, worker pool) are `OrchestratorError`; everything that goes
//! wrong inside a fork is folded into that fork's result.

pub mod progress;
pub mod runner;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use progress::ProgressTracker;
pub use runner::{ForkOrchestrator, RunHandle};

/// Default worker pool size.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default cap on forks per run.
pub const DEFAULT_MAX_FORKS: usize = 100;

/// Sandbox template used when provisioning.
pub const DEFAULT_SANDBOX_TEMPLATE: &str = "default";

/// Re-run policy for forks that failed because a collaborator was down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Extra attempts after the first. `0` disables retry.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Run-wide orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub max_forks: usize,
    /// Cancel the rest of the run on the first failed fork.
    pub fail_fast: bool,
    pub retry: RetryPolicy,
    /// Kill provisioned sandboxes of successful forks.
    pub cleanup_on_success: bool,
    /// Kill provisioned sandboxes of failed forks.
    pub cleanup_on_error: bool,
    pub sandbox_template: String,
    /// Directory inside the sandbox that a task's source is cloned into.
    /// No clone happens when unset.
    pub checkout_dir: Option<String>,
    /// Timeout for the clone command.
    pub clone_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_forks: DEFAULT_MAX_FORKS,
            fail_fast: false,
            retry: RetryPolicy::default(),
            cleanup_on_success: false,
            cleanup_on_error: false,
            sandbox_template: DEFAULT_SANDBOX_TEMPLATE.to_string(),
            checkout_dir: None,
            clone_timeout_secs: 300,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let retry = RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 250,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(250));
        assert_eq!(retry.backoff(2), Duration::from_millis(500));
        assert_eq!(retry.backoff(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.max_forks, 100);
        assert!(!config.fail_fast);
        assert_eq!(config.retry.max_retries, 0);
        assert!(!config.cleanup_on_success && !config.cleanup_on_error);
    }
}

//! Structured observability hooks for fork and run lifecycle events.
//!
//! This module provides:
//! - Fork-scoped tracing spans via the `ForkSpan` guard
//! - Emission functions for run start/finish, fork start/finish, policy
//!   denials and log sink failures
//!
//! Events are emitted at `info!` level (filtered via `RUST_LOG`).

use tracing::{info, warn};

use crate::domain::{ForkOrdinal, ForkResult};

/// Guard that keeps a fork-scoped span entered.
///
/// Only for synchronous sections. Async code instruments its future with
/// [`fork_span`] instead, since an entered guard must not be held across
/// an `.await`.
///
/// # Example
///
/// ```ignore
/// let _span = ForkSpan::enter(3, "sb-1234");
/// // tracing calls here carry fork = 3, sandbox = sb-1234
/// ```
pub struct ForkSpan {
    _span: tracing::span::EnteredSpan,
}

impl ForkSpan {
    pub fn enter(fork: ForkOrdinal, sandbox_id: &str) -> Self {
        Self {
            _span: fork_span(fork, sandbox_id).entered(),
        }
    }
}

/// Span tagged with the fork ordinal and sandbox id.
pub fn fork_span(fork: ForkOrdinal, sandbox_id: &str) -> tracing::Span {
    tracing::info_span!("sandfork.fork", fork = fork, sandbox = %sandbox_id)
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, forks: usize, max_concurrency: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        forks = forks,
        max_concurrency = max_concurrency,
    );
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, succeeded: usize, failed: usize, cancelled: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        succeeded = succeeded,
        failed = failed,
        cancelled = cancelled,
    );
}

/// Emit event: a fork session started.
pub fn emit_fork_started(fork: ForkOrdinal, sandbox_id: &str, model: &str) {
    info!(event = "fork.started", fork = fork, sandbox = %sandbox_id, model = %model);
}

/// Emit event: a fork reached its terminal state.
pub fn emit_fork_finished(result: &ForkResult) {
    info!(
        event = "fork.finished",
        fork = result.fork,
        success = result.success,
        turns = result.metrics.turns,
        tool_calls = result.metrics.tool_calls,
        duration_ms = result.duration_ms,
        error = result.error.as_deref().unwrap_or(""),
    );
}

/// Emit event: a tool call was denied by the policy.
pub fn emit_policy_denied(fork: ForkOrdinal, tool: &str, reason: &str) {
    warn!(event = "policy.denied", fork = fork, tool = %tool, reason = %reason);
}

/// Emit event: the fork log sink rejected an entry (warning level).
pub fn emit_log_sink_error(fork: ForkOrdinal, error: &dyn std::fmt::Display) {
    warn!(event = "fork_log.error", fork = fork, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_span_enter() {
        let _span = ForkSpan::enter(1, "sb-test");
        emit_policy_denied(1, "Bash", "command matches blocked pattern");
    }
}

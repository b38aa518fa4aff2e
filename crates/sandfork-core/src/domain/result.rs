//! Fork outcomes and run-level aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{FailureKind, ForkError};
use super::task::ForkOrdinal;

/// Per-fork counters, owned by the session while it runs.
///
/// All counters only ever grow. The session hands a copy to the
/// `ForkResult` when it terminates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForkMetrics {
    pub turns: u32,
    /// Tool calls that consumed a per-turn slot (executed or denied).
    pub tool_calls: u32,
    pub violations: u32,
    pub errors: u32,
    /// Tool calls dropped because the per-turn budget was already spent.
    pub rejected_tool_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl ForkMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Terminal classification of a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForkOutcome {
    Succeeded,
    Failed { kind: FailureKind },
    /// Stopped at a turn boundary because the run was cancelled.
    Cancelled,
    /// Never started because the run was cancelled first.
    Skipped,
}

impl ForkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ForkOutcome::Succeeded)
    }
}

/// Immutable record of one finished fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkResult {
    pub fork: ForkOrdinal,
    pub sandbox_id: Option<String>,
    pub success: bool,
    pub outcome: ForkOutcome,
    pub final_response: String,
    pub metrics: ForkMetrics,
    pub duration_ms: u64,
    /// Number of session attempts, greater than one only when retried.
    pub attempts: u32,
    pub error: Option<String>,
}

impl ForkResult {
    pub fn succeeded(
        fork: ForkOrdinal,
        sandbox_id: Option<String>,
        final_response: String,
        metrics: ForkMetrics,
        duration_ms: u64,
    ) -> Self {
        Self {
            fork,
            sandbox_id,
            success: true,
            outcome: ForkOutcome::Succeeded,
            final_response,
            metrics,
            duration_ms,
            attempts: 1,
            error: None,
        }
    }

    /// Build a failed result from the error that terminated the fork.
    ///
    /// `Cancelled` maps to the `Cancelled` outcome so that callers can tell
    /// an operator stop apart from a genuine failure.
    pub fn failed(
        fork: ForkOrdinal,
        sandbox_id: Option<String>,
        error: &ForkError,
        metrics: ForkMetrics,
        duration_ms: u64,
    ) -> Self {
        let outcome = match error {
            ForkError::Cancelled => ForkOutcome::Cancelled,
            other => ForkOutcome::Failed { kind: other.kind() },
        };
        Self {
            fork,
            sandbox_id,
            success: false,
            outcome,
            final_response: String::new(),
            metrics,
            duration_ms,
            attempts: 1,
            error: Some(error.to_string()),
        }
    }

    pub fn skipped(fork: ForkOrdinal, sandbox_id: Option<String>) -> Self {
        Self {
            fork,
            sandbox_id,
            success: false,
            outcome: ForkOutcome::Skipped,
            final_response: String::new(),
            metrics: ForkMetrics::default(),
            duration_ms: 0,
            attempts: 0,
            error: Some("skipped: run cancelled before fork started".to_string()),
        }
    }
}

/// Point-in-time view of run progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Cancelled or skipped forks.
    pub cancelled: usize,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Aggregate over every `ForkResult` of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether the run was cancelled (fail-fast or external request).
    pub cancelled: bool,
    /// Results in completion order. Key on `ForkResult::fork`, not position.
    pub results: Vec<ForkResult>,
    pub progress: ProgressSnapshot,
}

impl RunSummary {
    pub fn result_for(&self, fork: ForkOrdinal) -> Option<&ForkResult> {
        self.results.iter().find(|r| r.fork == fork)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &ForkResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ForkResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ForkOutcome::Failed { .. }))
    }

    pub fn cancelled_or_skipped(&self) -> impl Iterator<Item = &ForkResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ForkOutcome::Cancelled | ForkOutcome::Skipped))
    }

    pub fn all_succeeded(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.success)
    }

    pub fn stats(&self) -> AggregateStats {
        AggregateStats::from_results(&self.results)
    }
}

/// Totals and averages across forks, for comparing and selecting winners.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_forks: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_turns: u64,
    pub total_tool_calls: u64,
    pub total_errors: u64,
    pub total_violations: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub avg_turns: f64,
    pub avg_tool_calls: f64,
    pub avg_duration_ms: f64,
    pub avg_cost_usd: f64,
    pub successful_forks: Vec<ForkOrdinal>,
    pub failed_forks: Vec<ForkOrdinal>,
}

impl AggregateStats {
    pub fn from_results(results: &[ForkResult]) -> Self {
        let n = results.len();
        if n == 0 {
            return Self::default();
        }

        let mut stats = Self {
            total_forks: n,
            ..Self::default()
        };
        for r in results {
            if r.success {
                stats.successful += 1;
                stats.successful_forks.push(r.fork);
            } else {
                stats.failed += 1;
                stats.failed_forks.push(r.fork);
            }
            stats.total_turns += u64::from(r.metrics.turns);
            stats.total_tool_calls += u64::from(r.metrics.tool_calls);
            stats.total_errors += u64::from(r.metrics.errors);
            stats.total_violations += u64::from(r.metrics.violations);
            stats.total_tokens += r.metrics.total_tokens();
            stats.total_cost_usd += r.metrics.cost_usd;
            stats.total_duration_ms += r.duration_ms;
        }
        stats.successful_forks.sort_unstable();
        stats.failed_forks.sort_unstable();

        let nf = n as f64;
        stats.success_rate = stats.successful as f64 / nf;
        stats.avg_turns = stats.total_turns as f64 / nf;
        stats.avg_tool_calls = stats.total_tool_calls as f64 / nf;
        stats.avg_duration_ms = stats.total_duration_ms as f64 / nf;
        stats.avg_cost_usd = stats.total_cost_usd / nf;
        stats
    }
}

/// Render a human-readable report of a run.
pub fn render_report(summary: &RunSummary) -> String {
    use std::fmt::Write as _;

    let stats = summary.stats();
    let rule = "=".repeat(72);
    let mut out = String::new();

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "FORK RUN {}", summary.run_id);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Total forks:       {}", stats.total_forks);
    let _ = writeln!(
        out,
        "Successful:        {} ({:.1}%)",
        stats.successful,
        stats.success_rate * 100.0
    );
    let _ = writeln!(out, "Failed:            {}", stats.failed);
    if summary.cancelled {
        let _ = writeln!(out, "Run cancelled:     yes");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Total turns:       {}", stats.total_turns);
    let _ = writeln!(out, "Total tool calls:  {}", stats.total_tool_calls);
    let _ = writeln!(out, "Total violations:  {}", stats.total_violations);
    let _ = writeln!(out, "Total errors:      {}", stats.total_errors);
    let _ = writeln!(out, "Total tokens:      {}", stats.total_tokens);
    let _ = writeln!(out, "Total cost:        ${:.4}", stats.total_cost_usd);
    let _ = writeln!(
        out,
        "Total time:        {:.2}s",
        stats.total_duration_ms as f64 / 1000.0
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Avg turns/fork:    {:.1}", stats.avg_turns);
    let _ = writeln!(out, "Avg tools/fork:    {:.1}", stats.avg_tool_calls);
    let _ = writeln!(
        out,
        "Avg time/fork:     {:.2}s",
        stats.avg_duration_ms / 1000.0
    );
    let _ = writeln!(out, "Avg cost/fork:     ${:.4}", stats.avg_cost_usd);
    let _ = writeln!(out, "{rule}");

    let mut unsuccessful: Vec<&ForkResult> = summary.results.iter().filter(|r| !r.success).collect();
    if !unsuccessful.is_empty() {
        unsuccessful.sort_by_key(|r| r.fork);
        let _ = writeln!(out, "Unsuccessful forks:");
        for r in unsuccessful {
            let status = match r.outcome {
                ForkOutcome::Failed { kind } => kind.to_string(),
                ForkOutcome::Cancelled => "cancelled".to_string(),
                ForkOutcome::Skipped => "skipped".to_string(),
                ForkOutcome::Succeeded => "succeeded".to_string(),
            };
            let _ = writeln!(
                out,
                "  Fork {} [{}]: {}",
                r.fork,
                status,
                r.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    out
}

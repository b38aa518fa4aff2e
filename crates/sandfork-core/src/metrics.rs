//! Process-wide atomic counters for SandFork.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit the current values as a single
//! `tracing::info!` event, typically when a run finishes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    forks_started: AtomicU64,
    forks_finished: AtomicU64,
    tool_calls: AtomicU64,
    policy_violations: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            forks_started: AtomicU64::new(0),
            forks_finished: AtomicU64::new(0),
            tool_calls: AtomicU64::new(0),
            policy_violations: AtomicU64::new(0),
        }
    }

    pub fn inc_forks_started(&self) {
        self.forks_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "forks_started", "counter incremented");
    }

    pub fn inc_forks_finished(&self) {
        self.forks_finished.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "forks_finished", "counter incremented");
    }

    /// Tool calls that consumed a per-turn slot.
    pub fn inc_tool_calls(&self) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tool_calls", "counter incremented");
    }

    pub fn inc_policy_violations(&self) {
        self.policy_violations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "policy_violations", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            forks_started = self.forks_started(),
            forks_finished = self.forks_finished(),
            tool_calls = self.tool_calls(),
            policy_violations = self.policy_violations(),
        );
    }

    pub fn forks_started(&self) -> u64 {
        self.forks_started.load(Ordering::Relaxed)
    }

    pub fn forks_finished(&self) -> u64 {
        self.forks_finished.load(Ordering::Relaxed)
    }

    pub fn tool_calls(&self) -> u64 {
        self.tool_calls.load(Ordering::Relaxed)
    }

    pub fn policy_violations(&self) -> u64 {
        self.policy_violations.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.forks_started.store(0, Ordering::Relaxed);
        self.forks_finished.store(0, Ordering::Relaxed);
        self.tool_calls.store(0, Ordering::Relaxed);
        self.policy_violations.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_forks_started();
        m.inc_forks_started();
        m.inc_forks_finished();
        m.inc_tool_calls();
        m.inc_policy_violations();
        assert_eq!(m.forks_started(), 2);
        assert_eq!(m.forks_finished(), 1);
        assert_eq!(m.tool_calls(), 1);
        assert_eq!(m.policy_violations(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_forks_started();
        m.inc_tool_calls();
        m.reset();
        assert_eq!(m.forks_started(), 0);
        assert_eq!(m.tool_calls(), 0);
    }
}

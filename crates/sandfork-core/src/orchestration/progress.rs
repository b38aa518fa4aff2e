//! Run progress, updated only by the orchestrator.

use std::sync::Mutex;

use crate::domain::{ForkOutcome, ProgressSnapshot};

/// Mutex-guarded counters behind [`ProgressSnapshot`].
///
/// Transitions are `pending -> in_progress -> {completed, failed, cancelled}`
/// or `pending -> cancelled` for skipped forks. Counts never go negative; a
/// transition from an empty bucket is ignored.
#[derive(Debug)]
pub struct ProgressTracker {
    inner: Mutex<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            inner: Mutex::new(ProgressSnapshot {
                total,
                pending: total,
                ..ProgressSnapshot::default()
            }),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        match self.inner.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn mark_started(&self) {
        self.update(|p| {
            if p.pending > 0 {
                p.pending -= 1;
                p.in_progress += 1;
            }
        });
    }

    /// A fork that was started has finished.
    pub fn mark_finished(&self, outcome: &ForkOutcome) {
        self.update(|p| {
            if p.in_progress > 0 {
                p.in_progress -= 1;
                bump(p, outcome);
            }
        });
    }

    /// A fork that never started was skipped.
    pub fn mark_skipped(&self) {
        self.update(|p| {
            if p.pending > 0 {
                p.pending -= 1;
                p.cancelled += 1;
            }
        });
    }

    fn update(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

fn bump(p: &mut ProgressSnapshot, outcome: &ForkOutcome) {
    match outcome {
        ForkOutcome::Succeeded => p.completed += 1,
        ForkOutcome::Failed { .. } => p.failed += 1,
        ForkOutcome::Cancelled | ForkOutcome::Skipped => p.cancelled += 1,
    }
}

//! Domain models for SandFork.
//!
//! Canonical definitions for the core entities:
//! - `AgentTask`: immutable input to one fork
//! - `ForkResult` / `ForkMetrics`: terminal record of one fork
//! - `RunSummary` / `ProgressSnapshot`: run-level aggregation

pub mod error;
pub mod result;
pub mod task;

pub use error::{FailureKind, ForkError, OrchestratorError, Result};
pub use result::{
    render_report, AggregateStats, ForkMetrics, ForkOutcome, ForkResult, ProgressSnapshot,
    RunSummary,
};
pub use task::{
    AgentTask, ForkOrdinal, SourceRef, DEFAULT_MAX_TOOL_CALLS_PER_TURN, DEFAULT_MAX_TURNS,
    DEFAULT_WALL_CLOCK_BUDGET,
};

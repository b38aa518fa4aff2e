//! SandFork Core Library
//!
//! Runs N independent coding agents ("forks") in parallel, each in its own
//! sandbox, with every tool call gated by a policy engine, and aggregates
//! their results.
//!
//! Layers, bottom up:
//! - [`sandbox`]: policy engine and tool executor
//! - [`model`]: model collaborator contract and pricing
//! - [`session`]: the per-fork turn loop
//! - [`orchestration`]: bounded pool, progress, cancellation
//! - [`fork_log`]: per-fork structured logs

pub mod config;
pub mod domain;
pub mod fakes;
pub mod fork_log;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod orchestration;
pub mod sandbox;
pub mod session;
pub mod telemetry;

pub use config::{ConfigError, SandforkConfig};

pub use domain::{
    render_report, AgentTask, AggregateStats, FailureKind, ForkError, ForkMetrics, ForkOrdinal,
    ForkOutcome, ForkResult, OrchestratorError, ProgressSnapshot, RunSummary, SourceRef,
};

pub use fork_log::{
    ForkLogEntry, ForkLogEvent, ForkLogSink, JsonlForkLog, MemoryForkLog, NullForkLog,
    TracingForkLog,
};

pub use model::{
    CompletionRequest, CompletionResponse, ModelError, ModelService, PriceTable, StopReason,
    Usage,
};

pub use orchestration::{ForkOrchestrator, OrchestratorConfig, RetryPolicy, RunHandle};

pub use sandbox::{
    ExecOutput, PolicyConfig, PolicyDecision, PolicyEngine, SandboxError, SandboxProvisioner,
    SandboxService, ToolCallRequest, ToolExecutor, ToolKind, ToolResult,
};

pub use session::{AgentSession, SessionDeps};

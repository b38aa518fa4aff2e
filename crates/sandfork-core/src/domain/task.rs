//! `AgentTask`: the immutable input to a single fork.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of model turns a fork may take.
pub const DEFAULT_MAX_TURNS: u32 = 100;

/// Default number of tool calls honoured within a single turn.
pub const DEFAULT_MAX_TOOL_CALLS_PER_TURN: u32 = 50;

/// Default wall-clock budget for one fork (one hour).
pub const DEFAULT_WALL_CLOCK_BUDGET: Duration = Duration::from_secs(3600);

/// Ordinal identifying a fork within one run.
pub type ForkOrdinal = u32;

/// Repository the fork works on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub repo_url: String,
    pub branch: Option<String>,
}

impl SourceRef {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Branch name, falling back to `main`.
    pub fn branch_or_default(&self) -> &str {
        self.branch.as_deref().unwrap_or("main")
    }
}

/// Immutable description of one fork.
///
/// Built once by the caller before a run starts. The orchestrator never
/// mutates a task; when `sandbox_id` is `None` a sandbox is provisioned for
/// the fork and recorded on its `ForkResult` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    /// Unique within a run.
    pub fork: ForkOrdinal,
    /// Pre-existing sandbox to run in. `None` requests provisioning.
    pub sandbox_id: Option<String>,
    pub source: Option<SourceRef>,
    /// Model identifier or alias (`sonnet`, `opus`, `haiku`).
    pub model: String,
    pub prompt: String,
    pub max_turns: u32,
    pub max_tool_calls_per_turn: u32,
    pub wall_clock_budget: Duration,
}

impl AgentTask {
    /// Create a task with the default budgets.
    pub fn new(fork: ForkOrdinal, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            fork,
            sandbox_id: None,
            source: None,
            model: model.into(),
            prompt: prompt.into(),
            max_turns: DEFAULT_MAX_TURNS,
            max_tool_calls_per_turn: DEFAULT_MAX_TOOL_CALLS_PER_TURN,
            wall_clock_budget: DEFAULT_WALL_CLOCK_BUDGET,
        }
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.sandbox_id = Some(sandbox_id.into());
        self
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_max_tool_calls_per_turn(mut self, max: u32) -> Self {
        self.max_tool_calls_per_turn = max;
        self
    }

    pub fn with_wall_clock_budget(mut self, budget: Duration) -> Self {
        self.wall_clock_budget = budget;
        self
    }

    /// Build `count` tasks sharing one prompt, ordinals `0..count`.
    ///
    /// `sandbox_ids`, when given, must have exactly `count` entries; this is
    /// checked by the orchestrator's run validation, extra or missing ids are
    /// simply left unassigned here.
    pub fn fan_out(
        count: u32,
        model: &str,
        prompt: &str,
        source: Option<&SourceRef>,
        sandbox_ids: Option<&[String]>,
    ) -> Vec<Self> {
        (0..count)
            .map(|fork| {
                let mut task = AgentTask::new(fork, model, prompt);
                task.source = source.cloned();
                task.sandbox_id = sandbox_ids.and_then(|ids| ids.get(fork as usize).cloned());
                task
            })
            .collect()
    }
}

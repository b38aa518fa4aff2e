//! `sandfork.toml` configuration.
//!
//! Every section is optional and every field defaulted, so an empty file is
//! a valid configuration. Secrets never live here; the remote adapters read
//! them from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{
    AgentTask, DEFAULT_MAX_TOOL_CALLS_PER_TURN, DEFAULT_MAX_TURNS, DEFAULT_WALL_CLOCK_BUDGET,
};
use crate::model::{PriceTable, DEFAULT_MAX_TOKENS};
use crate::orchestration::OrchestratorConfig;
use crate::sandbox::{ExecutorConfig, PolicyConfig, PolicyEngine, PolicyError};
use crate::session::DEFAULT_SYSTEM_PROMPT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Per-fork budget defaults applied to tasks built from the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_turns: u32,
    pub max_tool_calls_per_turn: u32,
    pub wall_clock_budget_secs: u64,
    pub max_tokens: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_tool_calls_per_turn: DEFAULT_MAX_TOOL_CALLS_PER_TURN,
            wall_clock_budget_secs: DEFAULT_WALL_CLOCK_BUDGET.as_secs(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl LimitsConfig {
    pub fn apply(&self, task: AgentTask) -> AgentTask {
        task.with_max_turns(self.max_turns)
            .with_max_tool_calls_per_turn(self.max_tool_calls_per_turn)
            .with_wall_clock_budget(Duration::from_secs(self.wall_clock_budget_secs))
    }
}

/// Model endpoint and prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Alias or full identifier used when a task does not name one.
    pub default_model: String,
    pub api_url: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
    /// Inline system prompt template.
    pub system_prompt: Option<String>,
    /// Template file, read when `system_prompt` is unset.
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_version: "2023-06-01".to_string(),
            request_timeout_secs: 300,
            system_prompt: None,
            system_prompt_path: None,
        }
    }
}

impl ModelConfig {
    /// The system prompt template to use: inline, file, or the stock one.
    pub fn system_prompt_template(&self) -> Result<String> {
        if let Some(inline) = &self.system_prompt {
            return Ok(inline.clone());
        }
        match &self.system_prompt_path {
            Some(path) => std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            }),
            None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

/// Sandbox REST service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxEndpointConfig {
    pub base_url: String,
    /// Working directory for commands.
    pub cwd: String,
    /// Lifetime requested for provisioned sandboxes.
    pub sandbox_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SandboxEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            cwd: "/home/user".to_string(),
            sandbox_timeout_secs: 3600,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Where per-fork JSONL logs go.
    pub log_dir: PathBuf,
    /// JSON output for the process log.
    pub json: bool,
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            json: false,
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandforkConfig {
    pub orchestrator: OrchestratorConfig,
    pub limits: LimitsConfig,
    pub policy: PolicyConfig,
    pub executor: ExecutorConfig,
    pub pricing: PriceTable,
    pub model: ModelConfig,
    pub sandbox: SandboxEndpointConfig,
    pub logging: LoggingConfig,
}

impl SandforkConfig {
    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Endpoint and directory overrides from process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overrides from any key lookup. Unparseable numbers are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SANDFORK_SANDBOX_URL") {
            self.sandbox.base_url = url;
        }
        if let Some(url) = lookup("SANDFORK_MODEL_URL") {
            self.model.api_url = url;
        }
        if let Some(model) = lookup("SANDFORK_MODEL") {
            self.model.default_model = model;
        }
        if let Some(dir) = lookup("SANDFORK_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(dir);
        }
        if let Some(n) = lookup("SANDFORK_MAX_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.orchestrator.max_concurrency = n;
        }
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_concurrency == 0 {
            return Err(invalid("orchestrator.max_concurrency", "must be at least 1"));
        }
        if o.max_forks == 0 {
            return Err(invalid("orchestrator.max_forks", "must be at least 1"));
        }
        if o.sandbox_template.trim().is_empty() {
            return Err(invalid("orchestrator.sandbox_template", "must not be empty"));
        }
        if self.limits.max_turns == 0 {
            return Err(invalid("limits.max_turns", "must be at least 1"));
        }
        if self.limits.max_tool_calls_per_turn == 0 {
            return Err(invalid("limits.max_tool_calls_per_turn", "must be at least 1"));
        }
        if self.limits.wall_clock_budget_secs == 0 {
            return Err(invalid("limits.wall_clock_budget_secs", "must be at least 1"));
        }
        if self.limits.max_tokens == 0 {
            return Err(invalid("limits.max_tokens", "must be at least 1"));
        }
        if self.executor.max_command_timeout_ms == 0 {
            return Err(invalid("executor.max_command_timeout_ms", "must be at least 1"));
        }
        if self.executor.command_timeout_ms > self.executor.max_command_timeout_ms {
            return Err(invalid(
                "executor.command_timeout_ms",
                "exceeds executor.max_command_timeout_ms",
            ));
        }
        if self.pricing.fallback.input_per_mtok < 0.0 || self.pricing.fallback.output_per_mtok < 0.0
        {
            return Err(invalid("pricing.fallback", "prices must not be negative"));
        }
        if let Some((name, _)) = self
            .pricing
            .models
            .iter()
            .find(|(_, p)| p.input_per_mtok < 0.0 || p.output_per_mtok < 0.0)
        {
            return Err(ConfigError::Invalid {
                field: "pricing.models",
                reason: format!("negative price for {name}"),
            });
        }
        // Compiles the patterns and checks the roots.
        PolicyEngine::new(self.policy.clone())?;
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

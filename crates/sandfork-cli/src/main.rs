//! SandFork CLI
//!
//! The `sandfork` command fans one prompt out to N agents, each in its own
//! sandbox, and reports how they did.
//!
//! ## Commands
//!
//! - `fork`: run N forks and print the aggregate report
//! - `check-command`: dry-run the command policy
//! - `check-path`: dry-run the path policy for one tool

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn, Level};

use sandfork_core::sandbox::{SandboxProvisioner, SandboxService};
use sandfork_core::{
    render_report, AgentTask, ForkOrchestrator, JsonlForkLog, ModelService, PolicyEngine,
    ProgressSnapshot, SandforkConfig, SessionDeps, SourceRef, ToolCallRequest, ToolKind,
};
use sandfork_remote::{AnthropicClient, AnthropicConfig, HttpSandboxClient, SandboxClientConfig};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "sandfork")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run parallel, policy-gated coding agents in sandboxes", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and a JSON run summary
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "SANDFORK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run N forks of one prompt in parallel
    Fork(ForkArgs),

    /// Show whether the policy would allow a shell command
    CheckCommand {
        /// Command line as the agent would send it
        command: String,
    },

    /// Show whether the policy would allow a tool to touch a path
    CheckPath {
        /// Tool name: Read, Write, Edit, Glob or Grep
        tool: String,

        /// Path as the agent would send it
        path: String,
    },
}

#[derive(Args)]
struct ForkArgs {
    /// Task prompt given to every fork
    #[arg(short, long)]
    prompt: String,

    /// Number of forks
    #[arg(short = 'n', long, default_value = "3")]
    forks: u32,

    /// Model alias or identifier (default from config)
    #[arg(short, long)]
    model: Option<String>,

    /// Repository to clone into each sandbox
    #[arg(long)]
    repo: Option<String>,

    /// Branch to clone
    #[arg(long, requires = "repo")]
    branch: Option<String>,

    /// Directory inside the sandbox to clone into
    #[arg(long, requires = "repo")]
    checkout_dir: Option<String>,

    /// Existing sandbox per fork, in fork order (repeat once per fork)
    #[arg(long = "sandbox-id")]
    sandbox_ids: Vec<String>,

    /// Maximum forks running at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Cancel the remaining forks after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Directory for per-fork JSONL logs
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        config.logging.level.parse().unwrap_or(Level::INFO)
    };
    let json = cli.json || config.logging.json;
    sandfork_core::telemetry::init_tracing(json, level);

    match cli.command {
        Commands::Fork(args) => cmd_fork(config, args, json).await,
        Commands::CheckCommand { command } => cmd_check_command(&config, &command),
        Commands::CheckPath { tool, path } => cmd_check_path(&config, &tool, &path),
    }
}

fn load_config(path: Option<&Path>) -> Result<SandforkConfig> {
    match path {
        Some(path) => SandforkConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => SandforkConfig::from_env().context("Invalid configuration from environment"),
    }
}

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut SandforkConfig, args: &ForkArgs) {
    if let Some(k) = args.max_concurrency {
        config.orchestrator.max_concurrency = k;
    }
    if args.fail_fast {
        config.orchestrator.fail_fast = true;
    }
    if let Some(dir) = &args.checkout_dir {
        config.orchestrator.checkout_dir = Some(dir.clone());
    }
    if let Some(dir) = &args.log_dir {
        config.logging.log_dir = dir.clone();
    }
}

fn build_tasks(config: &SandforkConfig, args: &ForkArgs) -> Vec<AgentTask> {
    let model = args
        .model
        .clone()
        .unwrap_or_else(|| config.model.default_model.clone());
    let source = args.repo.as_ref().map(|url| {
        let source = SourceRef::new(url);
        match &args.branch {
            Some(branch) => source.with_branch(branch),
            None => source,
        }
    });
    let sandbox_ids = (!args.sandbox_ids.is_empty()).then_some(args.sandbox_ids.as_slice());

    AgentTask::fan_out(args.forks, &model, &args.prompt, source.as_ref(), sandbox_ids)
        .into_iter()
        .map(|task| config.limits.apply(task))
        .collect()
}

fn progress_line(p: &ProgressSnapshot) -> String {
    format!(
        "[{}/{}] running {}, completed {}, failed {}, cancelled {}",
        p.finished(),
        p.total,
        p.in_progress,
        p.completed,
        p.failed,
        p.cancelled
    )
}

async fn cmd_fork(mut config: SandforkConfig, args: ForkArgs, json: bool) -> Result<ExitCode> {
    apply_overrides(&mut config, &args);
    let tasks = build_tasks(&config, &args);

    let policy = PolicyEngine::new(config.policy.clone()).context("Invalid policy configuration")?;
    let system_prompt = config
        .model
        .system_prompt_template()
        .context("Failed to read system prompt")?;

    let sandbox = Arc::new(
        HttpSandboxClient::new(SandboxClientConfig::from_endpoint(&config.sandbox))
            .context("Failed to build sandbox client")?,
    );
    let model: Arc<dyn ModelService> = Arc::new(
        AnthropicClient::new(
            AnthropicConfig::from_env(&config.model).context("Model credentials missing")?,
        )
        .context("Failed to build model client")?,
    );
    let log = Arc::new(JsonlForkLog::new(&config.logging.log_dir));

    let sandbox_service: Arc<dyn SandboxService> = sandbox.clone();
    let provisioner: Arc<dyn SandboxProvisioner> = sandbox;
    let deps = SessionDeps::new(model, sandbox_service, Arc::new(policy))
        .with_log(log)
        .with_prices(config.pricing.clone())
        .with_executor_config(config.executor.clone())
        .with_max_tokens(config.limits.max_tokens)
        .with_system_prompt(system_prompt);

    let orchestrator =
        ForkOrchestrator::new(deps, config.orchestrator.clone()).with_provisioner(provisioner);

    info!(
        forks = tasks.len(),
        max_concurrency = config.orchestrator.max_concurrency,
        log_dir = %config.logging.log_dir.display(),
        "starting run"
    );
    let handle = orchestrator.spawn_run(tasks)?;

    let mut last = None;
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = handle.progress();
                if last != Some(snapshot) {
                    eprintln!("{}", progress_line(&snapshot));
                    last = Some(snapshot);
                }
                if snapshot.is_complete() {
                    break;
                }
            }
            _ = &mut ctrl_c, if !handle.is_cancelled() => {
                warn!("interrupt received, cancelling remaining forks");
                handle.cancel();
            }
        }
    }

    let summary = handle.wait().await?;
    if json {
        let out = json!({
            "summary": summary,
            "stats": summary.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", render_report(&summary));
    }

    Ok(if summary.failed().next().is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_check_command(config: &SandforkConfig, command: &str) -> Result<ExitCode> {
    let policy = PolicyEngine::new(config.policy.clone()).context("Invalid policy configuration")?;
    let request = ToolCallRequest::new("check", "Bash", json!({ "command": command }));
    Ok(print_decision(&policy, &request))
}

fn cmd_check_path(config: &SandforkConfig, tool: &str, path: &str) -> Result<ExitCode> {
    let policy = PolicyEngine::new(config.policy.clone()).context("Invalid policy configuration")?;
    let request = path_request(tool, path)?;
    Ok(print_decision(&policy, &request))
}

/// A minimal well-formed request for `tool` that targets `path`.
fn path_request(tool: &str, path: &str) -> Result<ToolCallRequest> {
    let Some(kind) = ToolKind::from_name(tool) else {
        bail!("Unknown tool '{tool}' (expected Read, Write, Edit, Glob or Grep)");
    };
    let arguments = match kind {
        ToolKind::Read => json!({ "file_path": path }),
        ToolKind::Write => json!({ "file_path": path, "content": "" }),
        ToolKind::Edit => json!({ "file_path": path, "old_string": "", "new_string": "" }),
        ToolKind::Glob => json!({ "pattern": "*", "path": path }),
        ToolKind::Grep => json!({ "pattern": ".", "path": path }),
        ToolKind::Bash => bail!("Bash takes a command, use check-command"),
    };
    Ok(ToolCallRequest::new("check", kind.as_str(), arguments))
}

fn print_decision(policy: &PolicyEngine, request: &ToolCallRequest) -> ExitCode {
    let decision = policy.evaluate(request);
    if decision.is_allowed() {
        println!("allowed: {}", decision.reason);
        ExitCode::SUCCESS
    } else {
        println!("denied: {}", decision.reason);
        ExitCode::FAILURE
    }
}

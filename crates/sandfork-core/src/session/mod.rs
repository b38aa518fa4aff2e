//! Agent session: one fork's conversation and turn loop.
//!
//! ```text
//! Initializing -> AwaitingModel -> ProcessingToolCalls -> AwaitingModel ...
//!                      |                                       |
//!                      +--> Terminated(success | failure) <----+
//! ```
//!
//! Budgets and cancellation are checked at the turn boundary, before each
//! model call, in this order: cancellation, wall clock, turn count. A model
//! or tool call already in flight is never pre-empted.

pub mod prompt;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::domain::{AgentTask, ForkError, ForkMetrics, ForkResult};
use crate::fork_log::{ForkLogEvent, ForkLogSink, ForkRecorder, NullForkLog};
use crate::metrics::METRICS;
use crate::model::{
    tool_schemas, CompletionRequest, Message, ModelService, PriceTable, StopReason,
    DEFAULT_MAX_TOKENS,
};
use crate::obs;
use crate::sandbox::{
    ExecutorConfig, PolicyDecision, PolicyEngine, SandboxService, ToolCallRequest, ToolExecutor,
    ToolResult,
};

pub use prompt::{render, PromptVars, DEFAULT_SYSTEM_PROMPT};

/// Content returned for calls beyond the per-turn budget.
pub const TURN_BUDGET_OVERFLOW: &str = "tool-call budget exceeded for this turn";

/// Collaborators and settings shared by every session of a run.
#[derive(Clone)]
pub struct SessionDeps {
    pub model: Arc<dyn ModelService>,
    pub sandbox: Arc<dyn SandboxService>,
    pub policy: Arc<PolicyEngine>,
    pub prices: Arc<PriceTable>,
    pub log: Arc<dyn ForkLogSink>,
    pub executor: ExecutorConfig,
    pub max_tokens: u32,
    pub system_prompt: Arc<str>,
}

impl SessionDeps {
    pub fn new(
        model: Arc<dyn ModelService>,
        sandbox: Arc<dyn SandboxService>,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            model,
            sandbox,
            policy,
            prices: Arc::new(PriceTable::default()),
            log: Arc::new(NullForkLog),
            executor: ExecutorConfig::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: Arc::from(DEFAULT_SYSTEM_PROMPT),
        }
    }

    pub fn with_log(mut self, log: Arc<dyn ForkLogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = Arc::new(prices);
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, template: impl Into<Arc<str>>) -> Self {
        self.system_prompt = template.into();
        self
    }
}

/// Where the turn loop currently is.
#[derive(Debug)]
enum SessionState {
    Initializing,
    AwaitingModel,
    ProcessingToolCalls(Vec<ToolCallRequest>),
    Terminated(Result<String, ForkError>),
}

/// Runs one [`AgentTask`] to a single [`ForkResult`].
pub struct AgentSession {
    task: AgentTask,
    sandbox_id: String,
    deps: SessionDeps,
    cancel: watch::Receiver<bool>,
    executor: ToolExecutor,
    recorder: ForkRecorder,
    /// False when the caller owns the recorder and writes `ForkFinished`.
    records_finish: bool,
    model_id: String,
    system: String,
    history: Vec<Message>,
    metrics: ForkMetrics,
    turn: u32,
    /// Usage of the model reply whose tool calls are being processed.
    pending_usage: (u64, u64),
}

impl AgentSession {
    pub fn new(
        task: AgentTask,
        sandbox_id: impl Into<String>,
        deps: SessionDeps,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let sandbox_id = sandbox_id.into();
        let executor = ToolExecutor::new(
            deps.sandbox.clone(),
            sandbox_id.clone(),
            deps.policy.clone(),
            deps.executor.clone(),
        );
        let recorder = ForkRecorder::new(deps.log.clone(), task.fork);
        let model_id = deps.prices.resolve_model(&task.model);
        Self {
            task,
            sandbox_id,
            deps,
            cancel,
            executor,
            recorder,
            records_finish: true,
            model_id,
            system: String::new(),
            history: Vec::new(),
            metrics: ForkMetrics::default(),
            turn: 0,
            pending_usage: (0, 0),
        }
    }

    /// Write into a recorder owned by the caller. The session then leaves
    /// `ForkFinished` to the caller, which knows the final result.
    pub fn with_recorder(mut self, recorder: ForkRecorder) -> Self {
        self.recorder = recorder;
        self.records_finish = false;
        self
    }

    /// Session that can only be stopped by its own budgets.
    pub fn uncancellable(task: AgentTask, sandbox_id: impl Into<String>, deps: SessionDeps) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(task, sandbox_id, deps, rx)
    }

    /// Drive the session to its terminal state. Never panics on collaborator
    /// errors; every outcome is folded into the returned `ForkResult`.
    pub async fn run(self) -> ForkResult {
        let span = obs::fork_span(self.task.fork, &self.sandbox_id);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) -> ForkResult {
        let started = Instant::now();
        METRICS.inc_forks_started();

        let mut state = SessionState::Initializing;
        let outcome = loop {
            state = match state {
                SessionState::Initializing => self.initialize().await,
                SessionState::AwaitingModel => self.await_model(started).await,
                SessionState::ProcessingToolCalls(calls) => self.process_tool_calls(calls).await,
                SessionState::Terminated(outcome) => break outcome,
            };
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(text) => ForkResult::succeeded(
                self.task.fork,
                Some(self.sandbox_id.clone()),
                text,
                self.metrics.clone(),
                duration_ms,
            ),
            Err(e) => ForkResult::failed(
                self.task.fork,
                Some(self.sandbox_id.clone()),
                &e,
                self.metrics.clone(),
                duration_ms,
            ),
        };

        if self.records_finish {
            self.recorder.record(ForkLogEvent::finished(&result)).await;
        }
        obs::emit_fork_finished(&result);
        METRICS.inc_forks_finished();
        result
    }

    async fn initialize(&mut self) -> SessionState {
        let source = self.task.source.as_ref();
        self.system = render(
            &self.deps.system_prompt,
            &PromptVars {
                sandbox_id: &self.sandbox_id,
                fork_num: self.task.fork,
                repo_url: source.map(|s| s.repo_url.as_str()),
                branch: source.and_then(|s| s.branch.as_deref()),
                task_prompt: &self.task.prompt,
                allowed_dirs: &self.deps.policy.config().allowed_dirs,
            },
        );
        self.history = vec![Message::user_text(self.task.prompt.clone())];
        self.turn = 0;

        obs::emit_fork_started(self.task.fork, &self.sandbox_id, &self.model_id);
        self.recorder
            .record(ForkLogEvent::ForkStarted {
                sandbox_id: self.sandbox_id.clone(),
                model: self.model_id.clone(),
                prompt: self.task.prompt.clone(),
            })
            .await;
        SessionState::AwaitingModel
    }

    fn check_boundary(&self, started: Instant) -> Result<(), ForkError> {
        if *self.cancel.borrow() {
            return Err(ForkError::Cancelled);
        }
        if started.elapsed() >= self.task.wall_clock_budget {
            return Err(ForkError::TimeBudgetExceeded {
                limit_secs: self.task.wall_clock_budget.as_secs(),
            });
        }
        if self.turn >= self.task.max_turns {
            return Err(ForkError::TurnBudgetExceeded {
                limit: self.task.max_turns,
            });
        }
        Ok(())
    }

    async fn await_model(&mut self, started: Instant) -> SessionState {
        if let Err(e) = self.check_boundary(started) {
            info!(turn = self.turn, reason = %e, "fork stopped at turn boundary");
            return SessionState::Terminated(Err(e));
        }

        self.turn += 1;
        self.metrics.turns = self.turn;
        debug!(turn = self.turn, max_turns = self.task.max_turns, "turn started");
        self.recorder
            .record(ForkLogEvent::TurnStarted { turn: self.turn })
            .await;

        let request = CompletionRequest {
            model: self.model_id.clone(),
            system: self.system.clone(),
            messages: self.history.clone(),
            tools: tool_schemas(),
            max_tokens: self.deps.max_tokens,
        };
        let response = match self.deps.model.complete(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(turn = self.turn, error = %e, "model call failed");
                return SessionState::Terminated(Err(ForkError::ModelUnavailable(e.to_string())));
            }
        };

        self.metrics.input_tokens += response.usage.input_tokens;
        self.metrics.output_tokens += response.usage.output_tokens;
        self.metrics.cost_usd += self.deps.prices.cost(&self.model_id, &response.usage);

        if response.tool_calls.is_empty() {
            if response.stop_reason == StopReason::MaxTokens {
                warn!(turn = self.turn, "final response truncated at max_tokens");
            }
            self.end_turn(0, response.usage.input_tokens, response.usage.output_tokens)
                .await;
            return SessionState::Terminated(Ok(response.text));
        }

        self.history
            .push(Message::assistant(&response.text, &response.tool_calls));
        self.pending_usage = (response.usage.input_tokens, response.usage.output_tokens);
        SessionState::ProcessingToolCalls(response.tool_calls)
    }

    async fn process_tool_calls(&mut self, calls: Vec<ToolCallRequest>) -> SessionState {
        let budget = self.task.max_tool_calls_per_turn;
        let mut used = 0u32;
        let mut results = Vec::with_capacity(calls.len());

        for call in calls {
            used += 1;
            if used > budget {
                self.metrics.rejected_tool_calls += 1;
                let decision = PolicyDecision::deny(TURN_BUDGET_OVERFLOW);
                self.log_call(&call, decision, None).await;
                results.push((call.id, ToolResult::failed(TURN_BUDGET_OVERFLOW)));
                continue;
            }

            self.metrics.tool_calls += 1;
            METRICS.inc_tool_calls();

            let decision = self.deps.policy.evaluate(&call);
            if !decision.allow {
                self.metrics.violations += 1;
                METRICS.inc_policy_violations();
                obs::emit_policy_denied(self.task.fork, &call.name, &decision.reason);
                let denied = ToolResult::failed(format!("SECURITY VIOLATION: {}", decision.reason));
                self.log_call(&call, decision, None).await;
                results.push((call.id, denied));
                continue;
            }

            let result = match self.executor.execute(&call).await {
                Ok(result) => result,
                Err(e) => {
                    self.log_call(&call, decision, Some(ToolResult::failed(e.to_string())))
                        .await;
                    return SessionState::Terminated(Err(e));
                }
            };
            if !result.success {
                self.metrics.errors += 1;
            }
            self.log_call(&call, decision, Some(result.clone())).await;
            results.push((call.id, result));
        }

        let (input, output) = std::mem::take(&mut self.pending_usage);
        self.end_turn(used.min(budget), input, output).await;
        self.history.push(Message::tool_results(results));
        SessionState::AwaitingModel
    }

    async fn end_turn(&mut self, tool_calls: u32, input_tokens: u64, output_tokens: u64) {
        self.recorder
            .record(ForkLogEvent::TurnEnded {
                turn: self.turn,
                tool_calls,
                input_tokens,
                output_tokens,
            })
            .await;
    }

    async fn log_call(
        &mut self,
        call: &ToolCallRequest,
        decision: PolicyDecision,
        result: Option<ToolResult>,
    ) {
        self.recorder
            .record(ForkLogEvent::ToolCall {
                turn: self.turn,
                call_id: call.id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                decision,
                result,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, ForkOutcome};
    use crate::fakes::{MemorySandbox, ScriptedModel};
    use crate::fork_log::MemoryForkLog;
    use crate::model::{CompletionResponse, Usage};
    use serde_json::json;
    use std::time::Duration;

    fn usage() -> Usage {
        Usage {
            input_tokens: 100,
            output_tokens: 50,
        }
    }

    fn bash(id: &str, cmd: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "Bash", json!({ "command": cmd }))
    }

    fn deps(model: Arc<ScriptedModel>, sandbox: Arc<MemorySandbox>) -> SessionDeps {
        SessionDeps::new(model, sandbox, Arc::new(PolicyEngine::standard().unwrap()))
    }

    #[tokio::test]
    async fn test_final_answer_on_first_turn() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(CompletionResponse::text(
            "all done",
            usage(),
        ))]));
        let sandbox = Arc::new(MemorySandbox::new());
        let task = AgentTask::new(0, "haiku", "say done");
        let result = AgentSession::uncancellable(task, "sb-0", deps(model.clone(), sandbox))
            .run()
            .await;

        assert!(result.success);
        assert_eq!(result.final_response, "all done");
        assert_eq!(result.metrics.turns, 1);
        assert_eq!(result.metrics.total_tokens(), 150);
        // haiku at $1/MTok flat.
        assert!((result.metrics.cost_usd - 150.0 / 1_000_000.0).abs() < 1e-12);

        let req = &model.requests()[0];
        assert_eq!(req.model, "claude-3-5-haiku-20241022");
        assert!(req.system.contains("say done"));
        assert_eq!(req.tools.len(), 6);
    }

    #[tokio::test]
    async fn test_tool_round_trip_feeds_results_back() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(CompletionResponse::tool_use(vec![bash("t1", "ls -la")], usage())),
            Ok(CompletionResponse::text("listed", usage())),
        ]));
        let sandbox = Arc::new(MemorySandbox::new());
        let log = Arc::new(MemoryForkLog::new());
        let task = AgentTask::new(1, "sonnet", "list files");
        let result = AgentSession::uncancellable(
            task,
            "sb-1",
            deps(model.clone(), sandbox.clone()).with_log(log.clone()),
        )
        .run()
        .await;

        assert!(result.success);
        assert_eq!(result.metrics.turns, 2);
        assert_eq!(result.metrics.tool_calls, 1);
        assert_eq!(sandbox.commands(), vec!["ls -la".to_string()]);

        let second = &model.requests()[1];
        assert_eq!(second.messages.len(), 3);

        let kinds: Vec<&str> = log.entries_for(1).iter().map(|e| e.event.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "fork_started",
                "turn_started",
                "tool_call",
                "turn_ended",
                "turn_started",
                "turn_ended",
                "fork_finished"
            ]
        );
    }

    #[tokio::test]
    async fn test_denied_call_counts_violation_and_skips_executor() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(CompletionResponse::tool_use(
                vec![ToolCallRequest::new(
                    "w1",
                    "Write",
                    json!({"file_path": "/etc/passwd", "content": "x"}),
                )],
                usage(),
            )),
            Ok(CompletionResponse::text("gave up", usage())),
        ]));
        let sandbox = Arc::new(MemorySandbox::new());
        let result = AgentSession::uncancellable(
            AgentTask::new(0, "sonnet", "t"),
            "sb",
            deps(model.clone(), sandbox.clone()),
        )
        .run()
        .await;

        assert!(result.success);
        assert_eq!(result.metrics.violations, 1);
        assert_eq!(result.metrics.tool_calls, 1);
        assert_eq!(sandbox.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_model_fault_fails_fork() {
        let model = Arc::new(ScriptedModel::new(vec![Err(
            crate::model::ModelError::Unavailable("connection refused".into()),
        )]));
        let result = AgentSession::uncancellable(
            AgentTask::new(0, "sonnet", "t"),
            "sb",
            deps(model, Arc::new(MemorySandbox::new())),
        )
        .run()
        .await;
        assert!(!result.success);
        assert_eq!(
            result.outcome,
            ForkOutcome::Failed {
                kind: FailureKind::CollaboratorFault
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_observed_at_turn_boundary() {
        let model = Arc::new(ScriptedModel::repeating(CompletionResponse::tool_use(
            vec![bash("t", "ls")],
            usage(),
        )));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = AgentSession::new(
            AgentTask::new(0, "sonnet", "t"),
            "sb",
            deps(model.clone(), Arc::new(MemorySandbox::new())),
            rx,
        )
        .run()
        .await;
        assert_eq!(result.outcome, ForkOutcome::Cancelled);
        assert_eq!(result.metrics.turns, 0);
        assert!(model.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_checked_before_turn_budget() {
        let model = Arc::new(
            ScriptedModel::repeating(CompletionResponse::tool_use(vec![bash("t", "ls")], usage()))
                .with_delay(Duration::from_secs(40)),
        );
        let task = AgentTask::new(0, "sonnet", "t")
            .with_max_turns(2)
            .with_wall_clock_budget(Duration::from_secs(60));
        let result = AgentSession::uncancellable(
            task,
            "sb",
            deps(model, Arc::new(MemorySandbox::new())),
        )
        .run()
        .await;
        // After two 40s turns both budgets are spent; time wins.
        assert_eq!(result.error.as_deref(), Some("time budget exceeded"));
        assert_eq!(result.metrics.turns, 2);
    }
}

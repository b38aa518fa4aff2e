//! Bounded worker pool that turns `AgentTask`s into `ForkResult`s.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{
    AgentTask, FailureKind, ForkError, ForkMetrics, ForkOrdinal, ForkOutcome, ForkResult,
    OrchestratorError, ProgressSnapshot, Result, RunSummary,
};
use crate::fork_log::{ForkLogEvent, ForkRecorder};
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{SandboxError, SandboxProvisioner};
use crate::session::{AgentSession, SessionDeps};

use super::progress::ProgressTracker;
use super::OrchestratorConfig;

/// Runs batches of forks against shared collaborators.
pub struct ForkOrchestrator {
    deps: SessionDeps,
    provisioner: Option<Arc<dyn SandboxProvisioner>>,
    config: OrchestratorConfig,
}

impl ForkOrchestrator {
    pub fn new(deps: SessionDeps, config: OrchestratorConfig) -> Self {
        Self {
            deps,
            provisioner: None,
            config,
        }
    }

    /// Provisioner for tasks that carry no sandbox id.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn SandboxProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Reject runs that cannot be started.
    pub fn validate(&self, tasks: &[AgentTask]) -> Result<()> {
        if tasks.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "task list is empty".to_string(),
            ));
        }
        if self.config.max_concurrency == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if tasks.len() > self.config.max_forks {
            return Err(OrchestratorError::InvalidRequest(format!(
                "{} forks requested, the limit is {}",
                tasks.len(),
                self.config.max_forks
            )));
        }

        let mut ordinals = HashSet::new();
        let mut sandboxes = HashSet::new();
        for task in tasks {
            if !ordinals.insert(task.fork) {
                return Err(OrchestratorError::DuplicateOrdinal(task.fork));
            }
            match &task.sandbox_id {
                Some(id) => {
                    if !sandboxes.insert(id.as_str()) {
                        return Err(OrchestratorError::SharedSandbox {
                            sandbox_id: id.clone(),
                        });
                    }
                }
                None if self.provisioner.is_none() => {
                    return Err(OrchestratorError::InvalidRequest(format!(
                        "fork {} has no sandbox and no provisioner is configured",
                        task.fork
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Run every task and wait for all of them.
    pub async fn run_forks(&self, tasks: Vec<AgentTask>) -> Result<RunSummary> {
        self.spawn_run(tasks)?.wait().await
    }

    /// Start a run in the background. Must be called inside a Tokio runtime.
    pub fn spawn_run(&self, tasks: Vec<AgentTask>) -> Result<RunHandle> {
        self.validate(&tasks)?;

        let run_id = Uuid::new_v4();
        let (cancel, _) = watch::channel(false);
        let ctx = Arc::new(RunContext {
            deps: self.deps.clone(),
            provisioner: self.provisioner.clone(),
            config: self.config.clone(),
            progress: ProgressTracker::new(tasks.len()),
            results: Mutex::new(Vec::with_capacity(tasks.len())),
            recorders: Mutex::new(HashMap::with_capacity(tasks.len())),
            cancel,
        });

        obs::emit_run_started(&run_id.to_string(), tasks.len(), self.config.max_concurrency);
        let driver = tokio::spawn(drive(Arc::clone(&ctx), tasks));

        Ok(RunHandle {
            run_id,
            started_at: Utc::now(),
            ctx,
            driver,
        })
    }
}

/// State shared by the driver, the workers and the handle.
struct RunContext {
    deps: SessionDeps,
    provisioner: Option<Arc<dyn SandboxProvisioner>>,
    config: OrchestratorConfig,
    progress: ProgressTracker,
    results: Mutex<Vec<ForkResult>>,
    /// One log stream per fork, shared by every attempt.
    recorders: Mutex<HashMap<ForkOrdinal, ForkRecorder>>,
    cancel: watch::Sender<bool>,
}

type Worker = (ForkOrdinal, Option<String>, JoinHandle<()>);

/// Caller's view of a running batch.
pub struct RunHandle {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    ctx: Arc<RunContext>,
    driver: JoinHandle<Vec<Worker>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.ctx.progress.snapshot()
    }

    /// Skip forks that have not started; running forks stop at their next
    /// turn boundary.
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "run cancellation requested");
        self.ctx.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.ctx.cancel.borrow()
    }

    /// Results finished so far, in completion order.
    pub fn results_so_far(&self) -> Vec<ForkResult> {
        self.ctx.lock_results().clone()
    }

    /// Wait for every fork and build the summary.
    pub async fn wait(self) -> Result<RunSummary> {
        let RunHandle {
            run_id,
            started_at,
            ctx,
            driver,
        } = self;
        let workers = driver
            .await
            .map_err(|e| OrchestratorError::WorkerPool(e.to_string()))?;

        for (fork, sandbox_id, handle) in workers {
            let Err(e) = handle.await else { continue };
            if !e.is_panic() {
                return Err(OrchestratorError::WorkerPool(e.to_string()));
            }
            error!(fork = fork, "fork worker panicked");
            let result = ForkResult::failed(
                fork,
                sandbox_id,
                &ForkError::Internal("fork worker panicked".to_string()),
                ForkMetrics::default(),
                0,
            );
            ctx.finish(result).await;
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled: *ctx.cancel.borrow(),
            progress: ctx.progress.snapshot(),
            results: ctx.lock_results().clone(),
        };
        obs::emit_run_finished(
            &run_id.to_string(),
            summary.succeeded().count(),
            summary.failed().count(),
            summary.cancelled,
        );
        METRICS.flush();
        Ok(summary)
    }
}

/// Hand out permits in task order and spawn one worker per task.
async fn drive(ctx: Arc<RunContext>, tasks: Vec<AgentTask>) -> Vec<Worker> {
    let sem = Arc::new(Semaphore::new(ctx.config.max_concurrency));
    let mut workers = Vec::with_capacity(tasks.len());
    let mut cancel_rx = ctx.cancel.subscribe();

    for task in tasks {
        let cancelled = async {
            let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
        };
        let permit = tokio::select! {
            biased;
            _ = cancelled => None,
            permit = Arc::clone(&sem).acquire_owned() => permit.ok(),
        };

        // Cancelled while queued.
        let Some(permit) = permit else {
            ctx.skip(&task).await;
            continue;
        };

        ctx.progress.mark_started();
        let fork = task.fork;
        let sandbox_id = task.sandbox_id.clone();
        let worker_ctx = Arc::clone(&ctx);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let result = worker_ctx.execute(task).await;
            worker_ctx.finish(result).await;
        });
        workers.push((fork, sandbox_id, handle));
    }
    workers
}

impl RunContext {
    fn lock_results(&self) -> std::sync::MutexGuard<'_, Vec<ForkResult>> {
        match self.results.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, result: ForkResult) {
        self.lock_results().push(result);
    }

    /// The fork's log stream, created on first use.
    fn recorder(&self, fork: ForkOrdinal) -> ForkRecorder {
        let mut recorders = match self.recorders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        recorders
            .entry(fork)
            .or_insert_with(|| ForkRecorder::new(self.deps.log.clone(), fork))
            .clone()
    }

    async fn skip(&self, task: &AgentTask) {
        let result = ForkResult::skipped(task.fork, task.sandbox_id.clone());
        self.recorder(task.fork)
            .record(ForkLogEvent::finished(&result))
            .await;
        self.progress.mark_skipped();
        self.push(result);
    }

    /// Record a started fork's result.
    async fn finish(&self, result: ForkResult) {
        if self.config.fail_fast && matches!(result.outcome, ForkOutcome::Failed { .. }) {
            warn!(fork = result.fork, "fail-fast: cancelling remaining forks");
            self.cancel.send_replace(true);
        }
        self.recorder(result.fork)
            .record(ForkLogEvent::finished(&result))
            .await;
        let outcome = result.outcome;
        self.push(result);
        self.progress.mark_finished(&outcome);
    }

    /// One fork, including retries of collaborator faults.
    async fn execute(&self, task: AgentTask) -> ForkResult {
        let started = Instant::now();
        let retry = self.config.retry;
        let recorder = self.recorder(task.fork);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut result = self.attempt(&task, &recorder).await;
            result.attempts = attempt;
            result.duration_ms = started.elapsed().as_millis() as u64;

            let retryable = result.outcome
                == ForkOutcome::Failed {
                    kind: FailureKind::CollaboratorFault,
                };
            if !retryable || attempt > retry.max_retries || *self.cancel.borrow() {
                return result;
            }

            let delay = retry.backoff(attempt);
            warn!(
                fork = task.fork,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or(""),
                "retrying fork after collaborator fault"
            );
            recorder
                .record(ForkLogEvent::Retrying {
                    attempt,
                    error: result.error.clone(),
                    delay_ms: delay.as_millis() as u64,
                })
                .await;
            let mut cancel_rx = self.cancel.subscribe();
            let cancelled = async move {
                let _ = cancel_rx.wait_for(|cancelled| *cancelled).await;
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled => return result,
            }
        }
    }

    async fn attempt(&self, task: &AgentTask, recorder: &ForkRecorder) -> ForkResult {
        let (sandbox_id, provisioned) = match &task.sandbox_id {
            Some(id) => (id.clone(), false),
            None => match self.provision().await {
                Ok(id) => (id, true),
                Err(e) => {
                    warn!(fork = task.fork, error = %e, "sandbox provisioning failed");
                    return ForkResult::failed(task.fork, None, &e, ForkMetrics::default(), 0);
                }
            },
        };

        let result = match self.checkout(task, &sandbox_id).await {
            Ok(()) => {
                AgentSession::new(
                    task.clone(),
                    sandbox_id.clone(),
                    self.deps.clone(),
                    self.cancel.subscribe(),
                )
                .with_recorder(recorder.clone())
                .run()
                .await
            }
            Err(e) => {
                warn!(fork = task.fork, sandbox = %sandbox_id, error = %e, "source checkout failed");
                ForkResult::failed(
                    task.fork,
                    Some(sandbox_id.clone()),
                    &e,
                    ForkMetrics::default(),
                    0,
                )
            }
        };

        if provisioned {
            self.cleanup(&sandbox_id, result.success).await;
        }
        result
    }

    async fn provision(&self) -> std::result::Result<String, ForkError> {
        let provisioner = self
            .provisioner
            .as_ref()
            .ok_or_else(|| ForkError::Provisioning("no provisioner configured".to_string()))?;
        provisioner
            .create(&self.config.sandbox_template)
            .await
            .map_err(|e| ForkError::Provisioning(e.to_string()))
    }

    /// Shallow-clone the task's source when a checkout directory is set.
    async fn checkout(
        &self,
        task: &AgentTask,
        sandbox_id: &str,
    ) -> std::result::Result<(), ForkError> {
        let (Some(source), Some(dir)) = (&task.source, &self.config.checkout_dir) else {
            return Ok(());
        };
        let command = clone_command(&source.repo_url, source.branch_or_default(), dir);
        info!(fork = task.fork, sandbox = %sandbox_id, repo = %source.repo_url, "cloning source");

        let timeout = Duration::from_secs(self.config.clone_timeout_secs);
        match self.deps.sandbox.exec(sandbox_id, &command, timeout).await {
            Ok(out) if out.exit_code == 0 => Ok(()),
            Ok(out) => Err(ForkError::Provisioning(format!(
                "git clone failed with exit code {}: {}",
                out.exit_code,
                out.stderr.trim()
            ))),
            Err(SandboxError::Unavailable(msg)) => Err(ForkError::SandboxUnavailable(msg)),
            Err(SandboxError::Operation(msg)) => Err(ForkError::Provisioning(msg)),
        }
    }

    async fn cleanup(&self, sandbox_id: &str, success: bool) {
        let wanted = if success {
            self.config.cleanup_on_success
        } else {
            self.config.cleanup_on_error
        };
        let Some(provisioner) = self.provisioner.as_ref().filter(|_| wanted) else {
            return;
        };
        if let Err(e) = provisioner.kill(sandbox_id).await {
            warn!(sandbox = %sandbox_id, error = %e, "failed to kill sandbox");
        }
    }
}

fn clone_command(repo_url: &str, branch: &str, dir: &str) -> String {
    format!(
        "git clone --depth 1 --branch {} {} {}",
        shell_quote(branch),
        shell_quote(repo_url),
        shell_quote(dir)
    )
}

/// Single-quote for POSIX shells.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemorySandbox, ScriptedModel};
    use crate::sandbox::PolicyEngine;

    fn orchestrator(config: OrchestratorConfig) -> ForkOrchestrator {
        let deps = SessionDeps::new(
            Arc::new(ScriptedModel::new(vec![])),
            Arc::new(MemorySandbox::new()),
            Arc::new(PolicyEngine::standard().unwrap()),
        );
        ForkOrchestrator::new(deps, config)
    }

    fn task(fork: ForkOrdinal, sandbox: &str) -> AgentTask {
        AgentTask::new(fork, "sonnet", "p").with_sandbox(sandbox)
    }

    #[test]
    fn test_validate_rejects_bad_runs() {
        let orch = orchestrator(OrchestratorConfig::default());
        assert!(matches!(
            orch.validate(&[]),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert!(matches!(
            orch.validate(&[task(1, "a"), task(1, "b")]),
            Err(OrchestratorError::DuplicateOrdinal(1))
        ));
        assert!(matches!(
            orch.validate(&[task(1, "a"), task(2, "a")]),
            Err(OrchestratorError::SharedSandbox { .. })
        ));
        // No sandbox and no provisioner.
        assert!(orch
            .validate(&[AgentTask::new(0, "sonnet", "p")])
            .is_err());
        assert!(orch.validate(&[task(0, "a"), task(1, "b")]).is_ok());
    }

    #[test]
    fn test_validate_limits() {
        let orch = orchestrator(OrchestratorConfig::default().with_max_concurrency(0));
        assert!(orch.validate(&[task(0, "a")]).is_err());

        let mut config = OrchestratorConfig::default();
        config.max_forks = 2;
        let orch = orchestrator(config);
        let tasks: Vec<_> = (0..3).map(|i| task(i, &format!("sb-{i}"))).collect();
        let err = orch.validate(&tasks).unwrap_err();
        assert!(err.to_string().contains("the limit is 2"));
    }

    #[test]
    fn test_clone_command_quotes_arguments() {
        assert_eq!(
            clone_command("https://example.com/r.git", "main", "repo"),
            "git clone --depth 1 --branch 'main' 'https://example.com/r.git' 'repo'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}

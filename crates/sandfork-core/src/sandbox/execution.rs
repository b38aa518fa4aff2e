//! Tool executor: dispatches allowed tool calls to the sandbox service.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::ForkError;

use super::capability::ToolKind;
use super::engine::PolicyEngine;
use super::error::{SandboxError, SandboxResult};
use super::request::{ToolCallRequest, ToolResult};
use super::service::{GrepScope, SandboxService};

/// Executor timeouts and caps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Default shell command timeout (milliseconds).
    pub command_timeout_ms: u64,
    /// Ceiling for a per-call `timeout_ms` override.
    pub max_command_timeout_ms: u64,
    /// Wall-clock limit for file primitives, and slack added on top of the
    /// command timeout before the executor gives up on a command.
    pub op_timeout_ms: u64,
    pub grep_max_matches: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 120_000,
            max_command_timeout_ms: 600_000,
            op_timeout_ms: 30_000,
            grep_max_matches: 100,
        }
    }
}

/// Executes policy-approved tool calls against one sandbox.
///
/// Stateless apart from its configuration: every call goes straight to the
/// service. Operational failures come back as an unsuccessful `ToolResult`;
/// only an unreachable sandbox is an `Err`.
pub struct ToolExecutor {
    service: Arc<dyn SandboxService>,
    sandbox_id: String,
    engine: Arc<PolicyEngine>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(
        service: Arc<dyn SandboxService>,
        sandbox_id: impl Into<String>,
        engine: Arc<PolicyEngine>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            service,
            sandbox_id: sandbox_id.into(),
            engine,
            config,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Run one tool call. Must only be called after the policy allowed it.
    #[instrument(skip(self, request), fields(sandbox = %self.sandbox_id, tool = %request.name, call_id = %request.id))]
    pub async fn execute(&self, request: &ToolCallRequest) -> Result<ToolResult, ForkError> {
        let Some(kind) = request.kind() else {
            return Ok(ToolResult::failed(format!("unknown tool: {}", request.name)));
        };
        let arg = |key: &str| request.str_arg(key).unwrap_or_default();

        let result = match kind {
            ToolKind::Bash => {
                let requested = request
                    .arguments
                    .get("timeout_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(self.config.command_timeout_ms);
                self.bash(arg("command"), requested).await?
            }
            ToolKind::Read => self.read(arg("file_path")).await?,
            ToolKind::Write => self.write(arg("file_path"), arg("content")).await?,
            ToolKind::Edit => {
                self.edit(arg("file_path"), arg("old_string"), arg("new_string"))
                    .await?
            }
            ToolKind::Glob => self.glob(arg("pattern"), request.str_arg("path")).await?,
            ToolKind::Grep => {
                self.grep(arg("pattern"), request.str_arg("path"), request.str_arg("glob"))
                    .await?
            }
        };

        if result.success {
            debug!(output_len = result.output.len(), "tool call succeeded");
        } else {
            debug!(error = ?result.error, "tool call failed");
        }
        Ok(result)
    }

    async fn bash(&self, command: &str, timeout_ms: u64) -> Result<ToolResult, ForkError> {
        let timeout_ms = timeout_ms.min(self.config.max_command_timeout_ms).max(1);
        let limit = Duration::from_millis(timeout_ms.saturating_add(self.config.op_timeout_ms));
        let out = match self
            .guarded(
                limit,
                self.service
                    .exec(&self.sandbox_id, command, Duration::from_millis(timeout_ms)),
            )
            .await?
        {
            Guarded::Done(out) => out,
            Guarded::Failed(msg) => return Ok(ToolResult::failed(msg)),
            Guarded::TimedOut => {
                return Ok(ToolResult::failed(format!(
                    "command timed out after {timeout_ms} ms"
                )))
            }
        };

        let mut output = out.stdout;
        if !out.stderr.is_empty() {
            output.push_str("\nSTDERR:\n");
            output.push_str(&out.stderr);
        }
        if out.exit_code != 0 {
            output.push_str(&format!("\nExit code: {}", out.exit_code));
            return Ok(ToolResult {
                success: false,
                output,
                error: Some(format!("command exited with code {}", out.exit_code)),
            });
        }
        if output.is_empty() {
            output = "Command executed successfully (no output)".to_string();
        }
        Ok(ToolResult::ok(output))
    }

    async fn read(&self, file_path: &str) -> Result<ToolResult, ForkError> {
        let path = self.resolve(file_path);
        Ok(match self.file_op(self.service.read(&self.sandbox_id, &path)).await? {
            Ok(bytes) => ToolResult::ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => ToolResult::failed(e),
        })
    }

    async fn write(&self, file_path: &str, content: &str) -> Result<ToolResult, ForkError> {
        let path = self.resolve(file_path);
        Ok(
            match self
                .file_op(self.service.write(&self.sandbox_id, &path, content.as_bytes()))
                .await?
            {
                Ok(()) => ToolResult::ok(format!(
                    "Successfully wrote {} bytes to {}",
                    content.len(),
                    self.display(&path)
                )),
                Err(e) => ToolResult::failed(e),
            },
        )
    }

    async fn edit(
        &self,
        file_path: &str,
        old_string: &str,
        new_string: &str,
    ) -> Result<ToolResult, ForkError> {
        if old_string.is_empty() {
            return Ok(ToolResult::failed("old_string must not be empty"));
        }
        let path = self.resolve(file_path);
        let shown = self.display(&path);

        let bytes = match self.file_op(self.service.read(&self.sandbox_id, &path)).await? {
            Ok(bytes) => bytes,
            Err(e) => return Ok(ToolResult::failed(e)),
        };
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            Err(_) => {
                return Ok(ToolResult::failed(format!(
                    "{shown} is not valid UTF-8 and cannot be edited"
                )))
            }
        };
        match content.matches(old_string).count() {
            0 => {
                return Ok(ToolResult::failed(format!(
                    "old_string not found in {shown}"
                )))
            }
            1 => {}
            n => {
                return Ok(ToolResult::failed(format!(
                    "old_string appears {n} times in {shown}, not unique"
                )))
            }
        }

        let updated = content.replacen(old_string, new_string, 1);
        Ok(
            match self
                .file_op(self.service.write(&self.sandbox_id, &path, updated.as_bytes()))
                .await?
            {
                Ok(()) => ToolResult::ok(format!("Successfully replaced 1 occurrence in {shown}")),
                Err(e) => ToolResult::failed(e),
            },
        )
    }

    async fn glob(&self, pattern: &str, path: Option<&str>) -> Result<ToolResult, ForkError> {
        let base = self.base(path);
        let found = match self
            .file_op(self.service.glob(&self.sandbox_id, pattern, &base))
            .await?
        {
            Ok(found) => found,
            Err(e) => return Ok(ToolResult::failed(e)),
        };
        if found.is_empty() {
            return Ok(ToolResult::ok(format!(
                "No files found matching pattern: {pattern}"
            )));
        }
        let lines: Vec<String> = found.iter().map(|p| self.display(p)).collect();
        Ok(ToolResult::ok(lines.join("\n")))
    }

    async fn grep(
        &self,
        pattern: &str,
        path: Option<&str>,
        glob: Option<&str>,
    ) -> Result<ToolResult, ForkError> {
        let scope = GrepScope {
            path: self.base(path),
            glob: glob.unwrap_or("**/*").to_string(),
            max_matches: self.config.grep_max_matches,
        };
        let mut matches = match self
            .file_op(self.service.grep(&self.sandbox_id, pattern, &scope))
            .await?
        {
            Ok(m) => m,
            Err(e) => return Ok(ToolResult::failed(e)),
        };
        if matches.is_empty() {
            return Ok(ToolResult::ok(format!(
                "No matches found for pattern: {pattern}"
            )));
        }
        matches.truncate(self.config.grep_max_matches);
        let lines: Vec<String> = matches
            .into_iter()
            .map(|mut m| {
                m.path = self.display(&m.path);
                m.to_string()
            })
            .collect();
        Ok(ToolResult::ok(lines.join("\n")))
    }

    fn resolve(&self, raw: &str) -> String {
        self.engine.resolve_path(raw).display().to_string()
    }

    fn base(&self, path: Option<&str>) -> String {
        match path {
            Some(p) if !p.is_empty() => self.resolve(p),
            _ => self.engine.workspace_root().display().to_string(),
        }
    }

    /// Path relative to the workspace root when it lies inside it.
    fn display(&self, path: &str) -> String {
        Path::new(path)
            .strip_prefix(self.engine.workspace_root())
            .map(|rel| rel.display().to_string())
            .unwrap_or_else(|_| path.to_string())
    }

    async fn file_op<T, F>(&self, fut: F) -> Result<Result<T, String>, ForkError>
    where
        F: Future<Output = SandboxResult<T>>,
    {
        let limit = Duration::from_millis(self.config.op_timeout_ms);
        Ok(match self.guarded(limit, fut).await? {
            Guarded::Done(value) => Ok(value),
            Guarded::Failed(msg) => Err(msg),
            Guarded::TimedOut => Err(format!(
                "operation timed out after {} ms",
                self.config.op_timeout_ms
            )),
        })
    }

    /// Apply the executor-level timeout. An unreachable sandbox is the only
    /// outcome that escapes as an error.
    async fn guarded<T, F>(&self, limit: Duration, fut: F) -> Result<Guarded<T>, ForkError>
    where
        F: Future<Output = SandboxResult<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(Guarded::Done(value)),
            Ok(Err(SandboxError::Operation(msg))) => Ok(Guarded::Failed(msg)),
            Ok(Err(SandboxError::Unavailable(msg))) => {
                warn!(sandbox = %self.sandbox_id, error = %msg, "sandbox unavailable");
                Err(ForkError::SandboxUnavailable(msg))
            }
            Err(_elapsed) => Ok(Guarded::TimedOut),
        }
    }
}

enum Guarded<T> {
    Done(T),
    Failed(String),
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemorySandbox;
    use crate::sandbox::service::ExecOutput;
    use serde_json::json;

    fn executor(sandbox: Arc<MemorySandbox>) -> ToolExecutor {
        ToolExecutor::new(
            sandbox,
            "sb-1",
            Arc::new(PolicyEngine::standard().unwrap()),
            ExecutorConfig::default(),
        )
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::new("c1", name, args)
    }

    #[tokio::test]
    async fn test_bash_output_formatting() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.on_command(
            "make",
            ExecOutput {
                stdout: "built".into(),
                stderr: "warning: x".into(),
                exit_code: 2,
            },
        );
        let exec = executor(sandbox.clone());

        let r = exec.execute(&call("Bash", json!({"command": "make"}))).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.output, "built\nSTDERR:\nwarning: x\nExit code: 2");

        let r = exec.execute(&call("Bash", json!({"command": "true"}))).await.unwrap();
        assert!(r.success);
        assert_eq!(r.output, "Command executed successfully (no output)");
        assert_eq!(sandbox.exec_calls(), 2);
    }

    #[tokio::test]
    async fn test_read_write_use_resolved_paths() {
        let sandbox = Arc::new(MemorySandbox::new());
        let exec = executor(sandbox.clone());

        let w = exec
            .execute(&call("Write", json!({"file_path": "temp/out.txt", "content": "hello"})))
            .await
            .unwrap();
        assert!(w.success);
        assert_eq!(w.output, "Successfully wrote 5 bytes to temp/out.txt");
        assert_eq!(sandbox.file("/home/user/temp/out.txt").as_deref(), Some("hello"));

        let r = exec
            .execute(&call("Read", json!({"file_path": "./temp/../temp/out.txt"})))
            .await
            .unwrap();
        assert_eq!(r.output, "hello");

        let missing = exec
            .execute(&call("Read", json!({"file_path": "src/nope.rs"})))
            .await
            .unwrap();
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match() {
        let sandbox = Arc::new(MemorySandbox::new().with_file("/home/user/src/a.rs", "foo foo bar"));
        let exec = executor(sandbox.clone());

        let dup = exec
            .execute(&call(
                "Edit",
                json!({"file_path": "src/a.rs", "old_string": "foo", "new_string": "baz"}),
            ))
            .await
            .unwrap();
        assert_eq!(
            dup.error.as_deref(),
            Some("old_string appears 2 times in src/a.rs, not unique")
        );

        let absent = exec
            .execute(&call(
                "Edit",
                json!({"file_path": "src/a.rs", "old_string": "qux", "new_string": "baz"}),
            ))
            .await
            .unwrap();
        assert_eq!(absent.error.as_deref(), Some("old_string not found in src/a.rs"));

        let ok = exec
            .execute(&call(
                "Edit",
                json!({"file_path": "src/a.rs", "old_string": "bar", "new_string": "baz"}),
            ))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(sandbox.file("/home/user/src/a.rs").as_deref(), Some("foo foo baz"));
    }

    #[tokio::test]
    async fn test_edit_refuses_non_utf8_file() {
        let sandbox = Arc::new(MemorySandbox::new());
        let original = vec![0xff, 0xfe, b'b', b'a', b'r'];
        sandbox
            .write("sb-1", "/home/user/src/blob.bin", &original)
            .await
            .unwrap();
        let exec = executor(sandbox.clone());

        let r = exec
            .execute(&call(
                "Edit",
                json!({"file_path": "src/blob.bin", "old_string": "bar", "new_string": "baz"}),
            ))
            .await
            .unwrap();
        assert!(!r.success);
        assert!(r.error.unwrap().contains("not valid UTF-8"));
        assert_eq!(
            sandbox.read("sb-1", "/home/user/src/blob.bin").await.unwrap(),
            original
        );
        assert_eq!(sandbox.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_ceiling_still_runs_commands() {
        let sandbox = Arc::new(MemorySandbox::new());
        let exec = ToolExecutor::new(
            sandbox.clone(),
            "sb-1",
            Arc::new(PolicyEngine::standard().unwrap()),
            ExecutorConfig {
                command_timeout_ms: 0,
                max_command_timeout_ms: 0,
                op_timeout_ms: u64::MAX,
                ..ExecutorConfig::default()
            },
        );
        let r = exec.execute(&call("Bash", json!({"command": "ls"}))).await.unwrap();
        assert!(r.success);
        assert_eq!(sandbox.exec_calls(), 1);
    }

    #[tokio::test]
    async fn test_glob_and_grep_relative_output() {
        let sandbox = Arc::new(
            MemorySandbox::new()
                .with_file("/home/user/src/lib.rs", "fn main() {}\n// TODO: x\n")
                .with_file("/home/user/src/util.rs", "// TODO: y\n")
                .with_file("/home/user/docs/readme.md", "hi\n"),
        );
        let exec = executor(sandbox);

        let g = exec.execute(&call("Glob", json!({"pattern": "src/*.rs"}))).await.unwrap();
        assert_eq!(g.output, "src/lib.rs\nsrc/util.rs");

        let none = exec.execute(&call("Glob", json!({"pattern": "*.py"}))).await.unwrap();
        assert_eq!(none.output, "No files found matching pattern: *.py");

        let m = exec
            .execute(&call("Grep", json!({"pattern": "TODO", "path": "src"})))
            .await
            .unwrap();
        assert_eq!(m.output, "src/lib.rs:2:// TODO: x\nsrc/util.rs:1:// TODO: y");
    }

    #[tokio::test]
    async fn test_grep_caps_matches() {
        let body: String = (0..10).map(|i| format!("hit {i}\n")).collect();
        let sandbox = Arc::new(MemorySandbox::new().with_file("/home/user/data/big.txt", &body));
        let exec = ToolExecutor::new(
            sandbox,
            "sb-1",
            Arc::new(PolicyEngine::standard().unwrap()),
            ExecutorConfig {
                grep_max_matches: 3,
                ..ExecutorConfig::default()
            },
        );
        let m = exec.execute(&call("Grep", json!({"pattern": "hit"}))).await.unwrap();
        assert_eq!(m.output.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_sandbox_is_fork_error() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.set_unavailable(true);
        let exec = executor(sandbox);
        let err = exec
            .execute(&call("Read", json!({"file_path": "src/a.rs"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ForkError::SandboxUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_command_times_out_as_tool_failure() {
        let sandbox = Arc::new(MemorySandbox::new());
        sandbox.set_exec_delay(Duration::from_secs(3600));
        let exec = ToolExecutor::new(
            sandbox,
            "sb-1",
            Arc::new(PolicyEngine::standard().unwrap()),
            ExecutorConfig {
                op_timeout_ms: 10,
                ..ExecutorConfig::default()
            },
        );
        let r = exec
            .execute(&call("Bash", json!({"command": "sleep 9999", "timeout_ms": 50})))
            .await
            .unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("command timed out after 50 ms"));
    }
}

//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `ScriptedModel`, `MemorySandbox`, and `MemoryProvisioner` that
//! satisfy the trait contracts without a network or a container runtime.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::model::{
    CompletionRequest, CompletionResponse, ContentBlock, ModelError, ModelService,
};
use crate::sandbox::{
    ExecOutput, GlobFilter, GrepMatch, GrepScope, SandboxError, SandboxProvisioner,
    SandboxResult, SandboxService,
};

/// One scripted model reply.
pub type Reply = Result<CompletionResponse, ModelError>;

// ---------------------------------------------------------------------------
// ScriptedModel
// ---------------------------------------------------------------------------

/// Model that replays canned replies.
///
/// Scripts are keyed by the task prompt (the first user message) so one
/// shared model can drive several forks differently. The empty key is the
/// script for any prompt without its own.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    delays: Mutex<HashMap<String, Duration>>,
    fallback: Option<CompletionResponse>,
    delay: Duration,
    requests: Mutex<Vec<CompletionRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedModel {
    /// Replies in order for every prompt.
    pub fn new(script: Vec<Reply>) -> Self {
        let model = Self::default();
        model
            .scripts
            .lock()
            .unwrap()
            .insert(String::new(), script.into());
        model
    }

    /// Same reply forever.
    pub fn repeating(reply: CompletionResponse) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::default()
        }
    }

    /// Replies for the task whose prompt is exactly `prompt`.
    pub fn with_script_for(self, prompt: &str, script: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(prompt.to_string(), script.into());
        self
    }

    /// Latency added to every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Latency for calls of one task, overriding `with_delay`.
    pub fn with_delay_for(self, prompt: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(prompt.to_string(), delay);
        self
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Highest number of calls that were in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        for key in [prompt, ""] {
            if let Some(reply) = scripts.get_mut(key).and_then(|q| q.pop_front()) {
                return reply;
            }
        }
        self.fallback
            .clone()
            .ok_or_else(|| ModelError::InvalidResponse("script exhausted".to_string()))
    }
}

fn task_prompt(request: &CompletionRequest) -> String {
    request
        .messages
        .first()
        .and_then(|m| m.content.first())
        .and_then(|b| match b {
            ContentBlock::Text { text } => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ModelError> {
        let prompt = task_prompt(&request);
        self.requests.lock().unwrap().push(request);

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&prompt)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.next_reply(&prompt)
    }
}

// ---------------------------------------------------------------------------
// MemorySandbox
// ---------------------------------------------------------------------------

/// In-memory sandbox: a flat `path -> bytes` map plus scripted commands.
///
/// Files are shared by every sandbox id. Each primitive is counted.
#[derive(Debug, Default)]
pub struct MemorySandbox {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    command_outputs: Mutex<Vec<(String, ExecOutput)>>,
    commands: Mutex<Vec<(String, String)>>,
    exec_delay: Mutex<Duration>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    execs: AtomicUsize,
    searches: AtomicUsize,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    /// Commands containing `needle` produce `output`. First match wins;
    /// unmatched commands succeed with no output.
    pub fn on_command(&self, needle: &str, output: ExecOutput) {
        self.command_outputs
            .lock()
            .unwrap()
            .push((needle.to_string(), output));
    }

    /// Make every primitive fail with `SandboxError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Commands run, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Commands run in one sandbox, in order.
    pub fn commands_in(&self, sandbox_id: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(sb, _)| sb == sandbox_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn exec_calls(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.exec_calls()
            + self.read_calls()
            + self.write_calls()
            + self.searches.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> SandboxResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SandboxError::Unavailable("memory sandbox offline".to_string()));
        }
        Ok(())
    }

    /// Files under `base` whose path relative to `base` matches `pattern`.
    fn matching_files(&self, pattern: &str, base: &str) -> SandboxResult<Vec<String>> {
        let filter = GlobFilter::new(pattern, base)?;
        let files = self.files.lock().unwrap();
        Ok(files.keys().filter(|p| filter.matches(p)).cloned().collect())
    }
}

#[async_trait]
impl SandboxService for MemorySandbox {
    async fn read(&self, _sandbox_id: &str, path: &str) -> SandboxResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::Operation(format!("file not found: {path}")))
    }

    async fn write(&self, _sandbox_id: &str, path: &str, data: &[u8]) -> SandboxResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        _timeout: Duration,
    ) -> SandboxResult<ExecOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.commands
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), command.to_string()));

        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outputs = self.command_outputs.lock().unwrap();
        Ok(outputs
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn glob(&self, _sandbox_id: &str, pattern: &str, base: &str) -> SandboxResult<Vec<String>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.matching_files(pattern, base)
    }

    async fn grep(
        &self,
        _sandbox_id: &str,
        pattern: &str,
        scope: &GrepScope,
    ) -> SandboxResult<Vec<GrepMatch>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let re = Regex::new(pattern)
            .map_err(|e| SandboxError::Operation(format!("invalid pattern: {e}")))?;
        let paths = self.matching_files(&scope.glob, &scope.path)?;

        let files = self.files.lock().unwrap();
        let mut matches = Vec::new();
        'files: for path in paths {
            let Some(bytes) = files.get(&path) else { continue };
            let text = String::from_utf8_lossy(bytes);
            for (idx, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(GrepMatch {
                        path: path.clone(),
                        line: idx as u64 + 1,
                        text: line.to_string(),
                    });
                    if matches.len() >= scope.max_matches {
                        break 'files;
                    }
                }
            }
        }
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// MemoryProvisioner
// ---------------------------------------------------------------------------

/// Hands out `mem-{template}-{n}` ids and records kills.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    next: AtomicU32,
    created: Mutex<Vec<String>>,
    killed: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvisioner for MemoryProvisioner {
    async fn create(&self, template: &str) -> SandboxResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SandboxError::Unavailable("provisioner offline".to_string()));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let id = format!("mem-{template}-{n}");
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn kill(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.killed.lock().unwrap().push(sandbox_id.to_string());
        Ok(())
    }
}

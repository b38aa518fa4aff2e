//! Append-only per-fork structured log.
//!
//! Each fork writes an ordered stream of [`ForkLogEntry`] values: fork
//! started, turn started, every tool call with its decision and result,
//! turn ended, a retry marker between attempts, fork finished. Sinks are
//! shared across forks; ordering is per fork via `seq`.
//!
//! Sink failures never fail a fork. [`ForkRecorder`] turns them into a
//! warning and carries on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::domain::{ForkMetrics, ForkOrdinal, ForkOutcome, ForkResult};
use crate::obs;
use crate::sandbox::{PolicyDecision, ToolResult};

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("log sink rejected entry: {0}")]
    Rejected(String),
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForkLogEvent {
    ForkStarted {
        sandbox_id: String,
        model: String,
        prompt: String,
    },
    TurnStarted {
        turn: u32,
    },
    ToolCall {
        turn: u32,
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
        decision: PolicyDecision,
        /// `None` when the call was denied before execution.
        result: Option<ToolResult>,
    },
    TurnEnded {
        turn: u32,
        tool_calls: u32,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// The previous attempt hit a collaborator fault; another follows.
    Retrying {
        attempt: u32,
        error: Option<String>,
        delay_ms: u64,
    },
    ForkFinished {
        success: bool,
        outcome: ForkOutcome,
        error: Option<String>,
        metrics: ForkMetrics,
        duration_ms: u64,
    },
}

impl ForkLogEvent {
    pub fn finished(result: &ForkResult) -> Self {
        ForkLogEvent::ForkFinished {
            success: result.success,
            outcome: result.outcome,
            error: result.error.clone(),
            metrics: result.metrics.clone(),
            duration_ms: result.duration_ms,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ForkLogEvent::ForkStarted { .. } => "fork_started",
            ForkLogEvent::TurnStarted { .. } => "turn_started",
            ForkLogEvent::ToolCall { .. } => "tool_call",
            ForkLogEvent::TurnEnded { .. } => "turn_ended",
            ForkLogEvent::Retrying { .. } => "retrying",
            ForkLogEvent::ForkFinished { .. } => "fork_finished",
        }
    }
}

/// One log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkLogEntry {
    pub fork: ForkOrdinal,
    /// Strictly increasing within one fork, starting at 0.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: ForkLogEvent,
}

#[async_trait]
pub trait ForkLogSink: Send + Sync {
    async fn append(&self, entry: &ForkLogEntry) -> Result<(), LogSinkError>;
}

/// Per-fork writer that stamps sequence numbers and swallows sink errors.
///
/// Clones share one sequence counter, so every attempt of a fork writes
/// into the same ordered stream.
#[derive(Clone)]
pub struct ForkRecorder {
    sink: Arc<dyn ForkLogSink>,
    fork: ForkOrdinal,
    next_seq: Arc<AtomicU64>,
}

impl ForkRecorder {
    pub fn new(sink: Arc<dyn ForkLogSink>, fork: ForkOrdinal) -> Self {
        Self {
            sink,
            fork,
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn fork(&self) -> ForkOrdinal {
        self.fork
    }

    pub async fn record(&self, event: ForkLogEvent) {
        let entry = ForkLogEntry {
            fork: self.fork,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };
        if let Err(e) = self.sink.append(&entry).await {
            obs::emit_log_sink_error(self.fork, &e);
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullForkLog;

#[async_trait]
impl ForkLogSink for NullForkLog {
    async fn append(&self, _entry: &ForkLogEntry) -> Result<(), LogSinkError> {
        Ok(())
    }
}

/// One JSON-lines file per fork: `fork_{n}_{YYYYmmdd_HHMMSS}.jsonl`.
pub struct JsonlForkLog {
    dir: PathBuf,
    session_stamp: String,
    files: tokio::sync::Mutex<HashMap<ForkOrdinal, tokio::fs::File>>,
}

impl JsonlForkLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            session_stamp: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            files: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, fork: ForkOrdinal) -> PathBuf {
        self.dir
            .join(format!("fork_{fork}_{}.jsonl", self.session_stamp))
    }
}

#[async_trait]
impl ForkLogSink for JsonlForkLog {
    async fn append(&self, entry: &ForkLogEntry) -> Result<(), LogSinkError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut files = self.files.lock().await;
        if !files.contains_key(&entry.fork) {
            tokio::fs::create_dir_all(&self.dir).await?;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(entry.fork))
                .await?;
            files.insert(entry.fork, file);
        }
        let file = files
            .get_mut(&entry.fork)
            .ok_or_else(|| LogSinkError::Rejected("log file handle missing".to_string()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Shared stream through `tracing`, tagged with the fork ordinal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingForkLog;

#[async_trait]
impl ForkLogSink for TracingForkLog {
    async fn append(&self, entry: &ForkLogEntry) -> Result<(), LogSinkError> {
        let detail = serde_json::to_string(&entry.event)?;
        tracing::info!(
            target: "sandfork::fork_log",
            fork = entry.fork,
            seq = entry.seq,
            kind = entry.event.kind(),
            detail = %detail,
        );
        Ok(())
    }
}

/// Keeps entries in memory. Used by tests and by callers that inspect the
/// log after a run.
#[derive(Debug, Default)]
pub struct MemoryForkLog {
    entries: Mutex<Vec<ForkLogEntry>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryForkLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent append fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn entries(&self) -> Vec<ForkLogEntry> {
        self.entries
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, fork: ForkOrdinal) -> Vec<ForkLogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.fork == fork)
            .collect()
    }
}

#[async_trait]
impl ForkLogSink for MemoryForkLog {
    async fn append(&self, entry: &ForkLogEntry) -> Result<(), LogSinkError> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(LogSinkError::Rejected("memory log set to fail".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| LogSinkError::Rejected("memory log poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}

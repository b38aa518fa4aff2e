//! Tool call request, policy decision and tool result types.

use serde::{Deserialize, Serialize};

use super::capability::ToolKind;

/// One proposed action emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call id assigned by the model; echoed back with the result.
    pub id: String,
    /// Tool name as emitted (e.g. "Bash", "Read").
    pub name: String,
    /// JSON argument map.
    pub arguments: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn kind(&self) -> Option<ToolKind> {
        ToolKind::from_name(&self.name)
    }

    /// String argument by key. `None` when absent or not a string.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }

    /// Whether `key` is present but holds something other than a string.
    pub(crate) fn has_non_string_arg(&self, key: &str) -> bool {
        matches!(self.arguments.get(key), Some(v) if !v.is_string() && !v.is_null())
    }
}

/// Outcome of evaluating a tool call against the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: String,
}

impl PolicyDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allow
    }
}

/// Normalized result of a tool call, fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Text returned to the model as the tool result body.
    pub fn content(&self) -> String {
        match (&self.error, self.success) {
            (Some(err), false) if self.output.is_empty() => format!("Error: {err}"),
            (Some(err), false) => format!("{}\nError: {err}", self.output),
            _ => self.output.clone(),
        }
    }
}

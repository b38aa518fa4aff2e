//! Language-model collaborator contract.
//!
//! The session talks to the model only through [`ModelService`]; the HTTP
//! client lives in `sandfork-remote`, the scripted fake in [`crate::fakes`].

pub mod pricing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::sandbox::{ToolCallRequest, ToolKind, ToolResult};

pub use pricing::{ModelPrice, PriceTable};

/// Default completion size cap per turn.
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// The assistant turn as the model produced it: text then tool uses.
    pub fn assistant(text: &str, tool_calls: &[ToolCallRequest]) -> Self {
        let mut content = Vec::with_capacity(tool_calls.len() + 1);
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        content.extend(tool_calls.iter().map(|c| ContentBlock::ToolUse {
            id: c.id.clone(),
            name: c.name.clone(),
            input: c.arguments.clone(),
        }));
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// A user message carrying one tool result per call, in call order.
    pub fn tool_results(results: Vec<(String, ToolResult)>) -> Self {
        Self {
            role: Role::User,
            content: results
                .into_iter()
                .map(|(id, r)| ContentBlock::ToolResult {
                    tool_use_id: id,
                    content: r.content(),
                    is_error: !r.success,
                })
                .collect(),
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Schemas for every [`ToolKind`].
pub fn tool_schemas() -> Vec<ToolSchema> {
    ToolKind::ALL.iter().map(|k| schema_for(*k)).collect()
}

fn schema_for(kind: ToolKind) -> ToolSchema {
    let (description, properties) = match kind {
        ToolKind::Bash => (
            "Execute a bash command in the sandbox",
            json!({
                "command": {"type": "string", "description": "The bash command to execute"},
                "timeout_ms": {"type": "integer", "description": "Optional timeout in milliseconds"}
            }),
        ),
        ToolKind::Read => (
            "Read a file from the sandbox filesystem",
            json!({
                "file_path": {"type": "string", "description": "Path to the file to read"}
            }),
        ),
        ToolKind::Write => (
            "Write content to a file in the sandbox",
            json!({
                "file_path": {"type": "string", "description": "Path to the file to write"},
                "content": {"type": "string", "description": "Content to write to the file"}
            }),
        ),
        ToolKind::Edit => (
            "Edit a file by replacing old_string with new_string",
            json!({
                "file_path": {"type": "string", "description": "Path to the file to edit"},
                "old_string": {"type": "string", "description": "The exact string to replace; must occur once"},
                "new_string": {"type": "string", "description": "The replacement string"}
            }),
        ),
        ToolKind::Glob => (
            "Find files matching a glob pattern",
            json!({
                "pattern": {"type": "string", "description": "Glob pattern (e.g. '**/*.rs')"},
                "path": {"type": "string", "description": "Directory to search in (optional)"}
            }),
        ),
        ToolKind::Grep => (
            "Search for a regular expression in files",
            json!({
                "pattern": {"type": "string", "description": "Regular expression to search for"},
                "path": {"type": "string", "description": "Directory to search in (optional)"},
                "glob": {"type": "string", "description": "Glob filter for file names (optional)"}
            }),
        ),
    };
    ToolSchema {
        name: kind.as_str().to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": kind.required_args(),
        }),
    }
}

/// Everything the model needs for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Fully resolved model identifier.
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Other(s) => s,
        }
    }
}

impl From<String> for StopReason {
    fn from(raw: String) -> Self {
        StopReason::parse(&raw)
    }
}

impl From<StopReason> for String {
    fn from(reason: StopReason) -> Self {
        reason.as_str().to_string()
    }
}

/// The model's reply for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    /// Tool calls in the order the model emitted them.
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

impl CompletionResponse {
    /// A final answer without tool calls.
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage,
            stop_reason: StopReason::EndTurn,
        }
    }

    pub fn tool_use(tool_calls: Vec<ToolCallRequest>, usage: Usage) -> Self {
        Self {
            text: String::new(),
            tool_calls,
            usage,
            stop_reason: StopReason::ToolUse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("model service unreachable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

/// One completion per call. Implementations do not retry internally.
#[async_trait]
pub trait ModelService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_schemas_list_required_args() {
        let schemas = tool_schemas();
        assert_eq!(schemas.len(), 6);
        let edit = schemas.iter().find(|s| s.name == "Edit").unwrap();
        assert_eq!(
            edit.input_schema["required"],
            json!(["file_path", "old_string", "new_string"])
        );
    }

    #[test]
    fn test_tool_result_message_marks_errors() {
        let msg = Message::tool_results(vec![
            ("a".into(), ToolResult::ok("fine")),
            ("b".into(), ToolResult::failed("denied")),
        ]);
        assert_eq!(msg.role, Role::User);
        match &msg.content[1] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "b");
                assert_eq!(content, "Error: denied");
                assert!(is_error);
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn test_stop_reason_parse() {
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(
            StopReason::parse("refusal"),
            StopReason::Other("refusal".into())
        );
    }
}

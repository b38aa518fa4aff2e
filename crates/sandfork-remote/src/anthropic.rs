//! Anthropic Messages API client
//!
//! Implements [`ModelService`] with tool use. One HTTP request per
//! `complete` call; no retries here, the orchestrator owns retry policy.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use sandfork_core::config::ModelConfig;
use sandfork_core::model::{
    CompletionRequest, CompletionResponse, ModelError, ModelService, StopReason, Usage,
};
use sandfork_core::sandbox::ToolCallRequest;

use crate::error::{RemoteError, Result};

/// Environment variable holding the API key.
pub const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Messages API configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub api_url: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for AnthropicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicConfig")
            .field("api_key", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl AnthropicConfig {
    /// Endpoint settings from `model`, key from `ANTHROPIC_API_KEY`.
    pub fn from_env(model: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(RemoteError::MissingCredential(API_KEY_VAR))?;
        Ok(Self::new(api_key, model))
    }

    pub fn new(api_key: impl Into<String>, model: &ModelConfig) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: model.api_url.clone(),
            api_version: model.api_version.clone(),
            request_timeout_secs: model.request_timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// HTTP implementation of [`ModelService`].
pub struct AnthropicClient {
    config: AnthropicConfig,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sandfork/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        Ok(Self { config, http })
    }

    async fn send(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "sending completion request"
        );
        let response = self
            .http
            .post(&self.config.api_url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&request_body(request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        parse_response(&body)
    }
}

/// Messages API request body.
fn request_body(request: &CompletionRequest) -> Value {
    json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": request.messages,
        "tools": request.tools,
    })
}

fn parse_response(body: &str) -> Result<CompletionResponse> {
    let parsed: MessagesResponse = serde_json::from_str(body)?;
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in parsed.content {
        match block {
            ResponseBlock::Text { text } => texts.push(text),
            ResponseBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCallRequest::new(id, name, input))
            }
            ResponseBlock::Other => {}
        }
    }
    Ok(CompletionResponse {
        text: texts.join("\n"),
        tool_calls,
        usage: parsed.usage,
        stop_reason: parsed
            .stop_reason
            .map(|s| StopReason::parse(&s))
            .unwrap_or(StopReason::EndTurn),
    })
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}

#[async_trait]
impl ModelService for AnthropicClient {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ModelError> {
        Ok(self.send(&request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandfork_core::model::{tool_schemas, Message};
    use sandfork_core::sandbox::ToolResult;

    #[test]
    fn test_request_body_uses_messages_api_shape() {
        let call = ToolCallRequest::new("tu_1", "Bash", json!({"command": "ls"}));
        let request = CompletionRequest {
            model: "claude-sonnet-4-5-20250929".to_string(),
            system: "be careful".to_string(),
            messages: vec![
                Message::user_text("list files"),
                Message::assistant("", &[call]),
                Message::tool_results(vec![("tu_1".to_string(), ToolResult::ok("a\nb"))]),
            ],
            tools: tool_schemas(),
            max_tokens: 8192,
        };
        let body = request_body(&request);

        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["system"], "be careful");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(body["messages"][1]["content"][0]["input"]["command"], "ls");
        let result = &body["messages"][2]["content"][0];
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["tool_use_id"], "tu_1");
        assert_eq!(result["content"], "a\nb");
        assert!(result.get("is_error").is_none());
        assert_eq!(body["tools"].as_array().unwrap().len(), 6);
        assert!(body["tools"][0].get("input_schema").is_some());
    }

    #[test]
    fn test_parse_tool_use_response() {
        let body = r#"{
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "tu_9", "name": "Read", "input": {"file_path": "src/lib.rs"}},
                {"type": "thinking", "thinking": "..."}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 120, "output_tokens": 30}
        }"#;
        let response = parse_response(body).unwrap();
        assert_eq!(response.text, "Let me look.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "tu_9");
        assert_eq!(response.tool_calls[0].str_arg("file_path"), Some("src/lib.rs"));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 120);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_response("not json"),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert_eq!(error_message(body), "Overloaded");
        assert_eq!(error_message("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = AnthropicConfig::new("sk-secret", &ModelConfig::default());
        let shown = format!("{config:?}");
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("api.anthropic.com"));
    }
}

//! Wire types for the chat-completions endpoint.

use serde::Deserialize;
use serde_json::Value;

use crate::message::ToolCall;

/// Non-streaming response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    /// Completion choices; only the first is read.
    #[serde(default)]
    pub choices: Vec<Choice>,
    /// Token usage, forwarded opaquely.
    #[serde(default)]
    pub usage: Option<Value>,
}

/// One completion choice.
#[derive(Debug, Clone, Deserialize)]
pub struct Choice {
    /// The assistant message.
    pub message: ResponseMessage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Assistant message fields we read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    /// Text content.
    #[serde(default)]
    pub content: Option<String>,
    /// Reasoning content from reasoning models.
    #[serde(default)]
    pub reasoning_content: Option<String>,
    /// Native tool calls.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Streaming chunk body (one SSE `data:` payload).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    /// Delta choices; may be empty on usage-only chunks.
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    /// Token usage, present on the final chunk for some backends.
    #[serde(default)]
    pub usage: Option<Value>,
}

/// One streamed choice.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    /// The incremental delta.
    #[serde(default)]
    pub delta: Delta,
    /// Why generation stopped, on the final chunk.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Incremental assistant delta.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    /// Content fragment.
    #[serde(default)]
    pub content: Option<String>,
    /// Reasoning-content fragment.
    #[serde(default)]
    pub reasoning_content: Option<String>,
    /// Tool-call fragments, accumulated by `index`.
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Fragment of one tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    /// Accumulation slot.
    #[serde(default)]
    pub index: usize,
    /// Call id, on the first fragment.
    #[serde(default)]
    pub id: Option<String>,
    /// Function fragment.
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

/// Fragment of a function call.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDelta {
    /// Function name, on the first fragment.
    #[serde(default)]
    pub name: Option<String>,
    /// Raw argument-string fragment.
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Error body shape of OpenAI-compatible backends.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    /// The error payload.
    pub error: ErrorBody,
}

/// Error payload fields.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Machine-readable type.
    #[serde(default, rename = "type")]
    pub error_type: String,
    /// Optional provider error code.
    #[serde(default)]
    pub code: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reasoning_and_tool_calls() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": "done",
                    "reasoning_content": "thinking...",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let msg = &parsed.choices[0].message;
        assert_eq!(msg.content.as_deref(), Some("done"));
        assert_eq!(msg.reasoning_content.as_deref(), Some("thinking..."));
        assert_eq!(msg.tool_calls.as_ref().unwrap()[0].name(), "search");
    }

    #[test]
    fn parses_stream_delta() {
        let body = r#"{
            "choices": [{
                "delta": {
                    "tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{\"a\""}}]
                }
            }]
        }"#;
        let parsed: StreamChunk = serde_json::from_str(body).unwrap();
        let delta = &parsed.choices[0].delta;
        let tc = &delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.index, 0);
        assert_eq!(tc.function.as_ref().unwrap().arguments.as_deref(), Some("{\"a\""));
    }
}

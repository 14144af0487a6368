//! The chat client: one assistant turn per call, with retry and streaming
//! reassembly.

use std::time::Duration;

use eventsource_stream::Eventsource as _;
use futures::StreamExt as _;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{API_MAX_RETRY_TIMES, API_RETRY_SLEEP_SECS, ModelConfig};
use crate::error::{LlmError, Result};
use crate::message::{ChatMessage, ToolCall, ToolCallAccumulator, normalize_for_api};
use crate::retry::RetryPolicy;
use crate::tool::ToolDefinition;

use super::types::{ChatCompletionResponse, ErrorResponse, StreamChunk};

/// A single assistant turn, or the distinguished null payload.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    /// Assistant text content.
    pub content: Option<String>,
    /// Reasoning content, when the model surfaces it.
    pub reasoning: Option<String>,
    /// Tool calls issued by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage, forwarded opaquely.
    pub usage: Option<Value>,
    /// Why the call produced no payload (context overflow, exhausted
    /// retries). `None` on success.
    pub failure: Option<String>,
}

impl ChatOutcome {
    /// The null payload: no content, with the reason attached.
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Whether this is the null payload.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.failure.is_some()
    }

    /// Content as a `&str`, empty when absent.
    #[must_use]
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// OpenAI-compatible chat client. Cheap to clone; holds only the HTTP pool.
#[derive(Debug, Clone, Default)]
pub struct ChatClient {
    http: reqwest::Client,
}

impl ChatClient {
    /// Create a client with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// One chat completion without tools.
    pub async fn chat(&self, messages: &[ChatMessage], cfg: &ModelConfig) -> Result<ChatOutcome> {
        self.chat_with_tools(messages, &[], cfg).await
    }

    /// One chat completion, advertising `tools` when non-empty.
    ///
    /// Transient errors retry up to [`API_MAX_RETRY_TIMES`] with a fixed
    /// [`API_RETRY_SLEEP_SECS`] sleep. Context overflow short-circuits; both
    /// it and retry exhaustion return the null outcome rather than an error.
    pub async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        cfg: &ModelConfig,
    ) -> Result<ChatOutcome> {
        let body = build_body(messages, tools, cfg);
        let body = &body;
        let policy = RetryPolicy::fixed(API_MAX_RETRY_TIMES, Duration::from_secs(API_RETRY_SLEEP_SECS));

        let result =
            crate::retry::retry(policy, LlmError::is_retryable, || self.attempt(body, cfg)).await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(err @ LlmError::ContextOverflow { .. }) => {
                warn!(model = %cfg.model, error = %err, "context overflow; returning null payload");
                Ok(ChatOutcome::failure(err.to_string()))
            }
            Err(err) => {
                warn!(model = %cfg.model, error = %err, "chat failed; returning null payload");
                Ok(ChatOutcome::failure(err.to_string()))
            }
        }
    }

    async fn attempt(&self, body: &Value, cfg: &ModelConfig) -> std::result::Result<ChatOutcome, LlmError> {
        debug!(model = %cfg.model, stream = cfg.stream, "chat completion request");
        let response = self
            .http
            .post(cfg.chat_url())
            .bearer_auth(&cfg.api_key)
            .json(body)
            .send()
            .await
            .map_err(LlmError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(&cfg.model, status.as_u16(), &body));
        }

        if cfg.stream {
            read_stream(response).await
        } else {
            read_response(response).await
        }
    }
}

fn build_body(messages: &[ChatMessage], tools: &[ToolDefinition], cfg: &ModelConfig) -> Value {
    let normalized = normalize_for_api(messages);
    let mut body = json!({
        "model": cfg.model,
        "messages": normalized,
        "temperature": cfg.temperature,
        "top_p": cfg.top_p,
        "max_tokens": cfg.max_tokens,
        "stream": cfg.stream,
    });
    if cfg.stream {
        body["stream_options"] = json!({"include_usage": true});
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.iter().map(ToolDefinition::to_openai).collect());
    }
    if let Some(Value::Object(extra)) = &cfg.extra_body
        && let Some(map) = body.as_object_mut()
    {
        for (key, value) in extra {
            map.insert(key.clone(), value.clone());
        }
    }
    body
}

/// Markers backends use to report a request past the context window.
fn is_context_overflow_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("context length")
        || lower.contains("context window")
        || (lower.contains("longer than") && lower.contains("tokens"))
}

fn classify_http_error(model: &str, status: u16, body: &str) -> LlmError {
    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        let message = parsed.error.message;
        debug!(
            model,
            status,
            error_type = %parsed.error.error_type,
            code = ?parsed.error.code,
            "backend error response",
        );
        if is_context_overflow_message(&message) {
            return LlmError::context_overflow(message);
        }
        return match status {
            401 | 403 => LlmError::auth(model, message),
            429 => LlmError::rate_limited(model),
            _ => LlmError::http_status(status, message),
        };
    }
    if is_context_overflow_message(body) {
        return LlmError::context_overflow(body.to_owned());
    }
    match status {
        401 | 403 => LlmError::auth(model, body.to_owned()),
        429 => LlmError::rate_limited(model),
        _ => LlmError::http_status(status, body.to_owned()),
    }
}

async fn read_response(response: reqwest::Response) -> std::result::Result<ChatOutcome, LlmError> {
    let parsed: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|e| LlmError::response_format("chat completion body", e.to_string()))?;

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::response_format("at least one choice", "empty choices"))?;

    Ok(ChatOutcome {
        content: choice.message.content,
        reasoning: choice.message.reasoning_content,
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        usage: parsed.usage,
        failure: None,
    })
}

async fn read_stream(response: reqwest::Response) -> std::result::Result<ChatOutcome, LlmError> {
    let mut events = response.bytes_stream().eventsource();
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut usage = None;
    let mut calls = ToolCallAccumulator::new();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| LlmError::stream(e.to_string()))?;
        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == "[DONE]" {
            break;
        }
        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "skipping malformed SSE chunk");
                continue;
            }
        };
        if let Some(u) = chunk.usage {
            usage = Some(u);
        }
        for choice in &chunk.choices {
            if let Some(piece) = &choice.delta.content {
                content.push_str(piece);
            }
            if let Some(piece) = &choice.delta.reasoning_content {
                reasoning.push_str(piece);
            }
            if let Some(deltas) = &choice.delta.tool_calls {
                for tc in deltas {
                    let (name, args) = tc
                        .function
                        .as_ref()
                        .map_or((None, None), |f| (f.name.as_deref(), f.arguments.as_deref()));
                    calls.push(tc.index, tc.id.as_deref(), name, args);
                }
            }
        }
    }

    Ok(ChatOutcome {
        content: (!content.is_empty()).then_some(content),
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls: calls.finish(),
        usage,
        failure: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(server: &MockServer, stream: bool) -> ModelConfig {
        let mut cfg = ModelConfig::new("test-model", format!("{}/v1", server.uri()));
        cfg.stream = stream;
        cfg
    }

    #[tokio::test]
    async fn non_streaming_reads_fields_directly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": "84",
                        "reasoning_content": "12 times 7",
                        "tool_calls": null
                    }
                }],
                "usage": {"total_tokens": 10}
            })))
            .mount(&server)
            .await;

        let client = ChatClient::new();
        let out = client
            .chat(&[ChatMessage::user("12*7?")], &cfg(&server, false))
            .await
            .unwrap();
        assert!(!out.is_null());
        assert_eq!(out.text(), "84");
        assert_eq!(out.reasoning.as_deref(), Some("12 times 7"));
    }

    #[tokio::test]
    async fn streaming_reassembles_content_and_tool_calls() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hm\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Let me\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" check\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"search\",\"arguments\":\"{\\\"q\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"x\\\"}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let client = ChatClient::new();
        let out = client
            .chat(&[ChatMessage::user("q")], &cfg(&server, true))
            .await
            .unwrap();
        assert_eq!(out.text(), "Let me check");
        assert_eq!(out.reasoning.as_deref(), Some("hm"));
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].id, "call_a");
        assert_eq!(out.tool_calls[0].function.arguments, "{\"q\":\"x\"}");
    }

    #[tokio::test]
    async fn context_overflow_returns_null_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "message": "This model's maximum context length is 51200 tokens, request is longer than that (60000 tokens)",
                    "type": "invalid_request_error"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatClient::new();
        let out = client
            .chat(&[ChatMessage::user("huge")], &cfg(&server, false))
            .await
            .unwrap();
        assert!(out.is_null());
        assert!(out.failure.unwrap().contains("context"));
    }

    use serde_json::json;
}

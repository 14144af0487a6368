//! Chat message types shared by the LLM client, agent runner and scorers.
//!
//! The on-disk trajectory format is the chat-completions wire format:
//! messages with roles in {system, user, assistant, tool}, assistant
//! messages optionally carrying `tool_calls`, tool messages carrying a
//! `tool_call_id` that references an earlier assistant call. Unknown fields
//! round-trip through [`ChatMessage::extra`] so stages stay additive.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing instructions.
    System,
    /// User message.
    User,
    /// Assistant (model) message.
    Assistant,
    /// Tool response message.
    Tool,
    /// Legacy single-call role, normalized to an assistant `tool_calls`
    /// entry before any request leaves the process.
    Function,
}

impl Role {
    /// String form used on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Function => "function",
        }
    }
}

/// The function half of a tool call. Arguments stay a raw JSON string, as
/// the wire format delivers them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the function to call.
    pub name: String,
    /// Arguments as a raw JSON string.
    #[serde(default)]
    pub arguments: String,
}

impl FunctionCall {
    /// Parse the argument string as a JSON value. Empty strings parse as
    /// an empty object.
    pub fn parse_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// A tool call issued by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for the call.
    pub id: String,
    /// Call type, always `"function"`.
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    /// The function being called.
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_owned()
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Name of the function being called.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// A chat message in a conversation or trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the sender.
    pub role: Role,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning content surfaced by reasoning models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Tool calls carried by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// The assistant call a tool message responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Legacy single function call, normalized away before requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    /// Unknown fields, preserved across stages.
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

impl ChatMessage {
    fn bare(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
            function_call: None,
            extra: HashMap::new(),
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(Role::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            reasoning_content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            function_call: None,
            extra: HashMap::new(),
        }
    }

    /// Create a tool response message.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            function_call: None,
            extra: HashMap::new(),
        }
    }

    /// Whether this message carries at least one tool call.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Text content, or the empty string.
    #[must_use]
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

/// Normalize an internal message sequence into the API shape.
///
/// Two legacy forms are rewritten:
///
/// - runs of consecutive assistant messages that each carry a single
///   `function_call` are merged into one assistant message with a
///   `tool_calls` array, each element given a synthesized stable id;
/// - `function`-role messages become `tool`-role messages, with the
///   `tool_call_id` back-filled from the nearest preceding assistant's
///   matching call.
#[must_use]
pub fn normalize_for_api(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending: Vec<ToolCall> = Vec::new();
    let mut pending_content: Option<String> = None;
    let mut synth_counter = 0usize;

    let flush = |out: &mut Vec<ChatMessage>,
                 pending: &mut Vec<ToolCall>,
                 pending_content: &mut Option<String>| {
        if !pending.is_empty() {
            out.push(ChatMessage::assistant_tool_calls(
                pending_content.take(),
                std::mem::take(pending),
            ));
        }
    };

    for msg in messages {
        match (&msg.role, &msg.function_call) {
            (Role::Assistant, Some(fc)) if msg.tool_calls.is_none() => {
                let id = format!("call_{synth_counter}");
                synth_counter += 1;
                pending.push(ToolCall::new(id, fc.name.clone(), fc.arguments.clone()));
                if pending_content.is_none() {
                    pending_content = msg.content.clone().filter(|c| !c.is_empty());
                }
            }
            (Role::Function, _) => {
                flush(&mut out, &mut pending, &mut pending_content);
                let call_id = msg.tool_call_id.clone().or_else(|| {
                    out.iter().rev().find_map(|m| {
                        (m.role == Role::Assistant)
                            .then(|| m.tool_calls.as_ref())
                            .flatten()
                            .and_then(|calls| calls.first())
                            .map(|c| c.id.clone())
                    })
                });
                let mut tool_msg = msg.clone();
                tool_msg.role = Role::Tool;
                tool_msg.function_call = None;
                tool_msg.tool_call_id = call_id;
                out.push(tool_msg);
            }
            _ => {
                flush(&mut out, &mut pending, &mut pending_content);
                let mut plain = msg.clone();
                if plain.role == Role::Tool && plain.tool_call_id.is_none() {
                    plain.tool_call_id = out.iter().rev().find_map(|m| {
                        (m.role == Role::Assistant)
                            .then(|| m.tool_calls.as_ref())
                            .flatten()
                            .and_then(|calls| calls.first())
                            .map(|c| c.id.clone())
                    });
                }
                out.push(plain);
            }
        }
    }
    flush(&mut out, &mut pending, &mut pending_content);
    out
}

/// Accumulator for streamed tool-call deltas, keyed by index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: HashMap<usize, (Option<String>, String, String)>,
}

impl ToolCallAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta in: ids replace, names replace, argument fragments
    /// concatenate as raw strings.
    pub fn push(&mut self, index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) {
        let slot = self
            .slots
            .entry(index)
            .or_insert_with(|| (None, String::new(), String::new()));
        if let Some(id) = id {
            slot.0 = Some(id.to_owned());
        }
        if let Some(name) = name {
            slot.1 = name.to_owned();
        }
        if let Some(args) = args {
            slot.2.push_str(args);
        }
    }

    /// Whether any delta was folded in.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Finish accumulation, yielding calls in index order. Missing ids are
    /// synthesized as `call_{index}`.
    #[must_use]
    pub fn finish(self) -> Vec<ToolCall> {
        let mut entries: Vec<_> = self.slots.into_iter().collect();
        entries.sort_by_key(|(idx, _)| *idx);
        entries
            .into_iter()
            .map(|(idx, (id, name, args))| {
                ToolCall::new(id.unwrap_or_else(|| format!("call_{idx}")), name, args)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn merges_consecutive_function_calls() {
        let mut first = ChatMessage::assistant("");
        first.content = None;
        first.function_call = Some(FunctionCall {
            name: "lookup".into(),
            arguments: r#"{"city":"Tokyo"}"#.into(),
        });
        let mut second = first.clone();
        second.function_call = Some(FunctionCall {
            name: "lookup".into(),
            arguments: r#"{"city":"Osaka"}"#.into(),
        });
        let mut obs = ChatMessage::bare(Role::Function, "13960000");
        obs.tool_call_id = None;

        let out = normalize_for_api(&[ChatMessage::user("q"), first, second, obs]);

        assert_eq!(out.len(), 3);
        let calls = out[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(out[2].role, Role::Tool);
        assert_eq!(out[2].tool_call_id.as_deref(), Some("call_0"));
    }

    #[test]
    fn normalize_is_identity_on_modern_messages() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("q"),
            ChatMessage::assistant_tool_calls(None, vec![ToolCall::new("call_a", "f", "{}")]),
            ChatMessage::tool("call_a", "ok"),
            ChatMessage::assistant("done"),
        ];
        let out = normalize_for_api(&messages);
        assert_eq!(out.len(), messages.len());
        assert_eq!(out[3].tool_call_id.as_deref(), Some("call_a"));
    }

    #[test]
    fn accumulator_concatenates_argument_fragments() {
        let mut acc = ToolCallAccumulator::new();
        acc.push(0, Some("call_x"), Some("search"), Some(r#"{"q":"#));
        acc.push(0, None, None, Some(r#""rust"}"#));
        acc.push(1, None, Some("fetch"), Some("{}"));

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_x");
        assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].name(), "fetch");
    }
}

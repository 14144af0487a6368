//! The mock tool provider: an LLM role-plays the tool server.
//!
//! When `call_info.mock_tool` is set, every invocation is routed to a
//! model that answers as the tool would. The prompt carries the tool
//! definitions, the invocation(s) with parsed arguments, the server
//! description, optionally the user query, and up to the last five
//! `(function_call, observation)` pairs so repeated calls stay consistent.

use serde_json::{Value, json};
use tracing::warn;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::llm::ChatClient;
use crate::message::{ChatMessage, ToolCall};
use crate::parse::{split_reasoning, strip_code_fences};
use crate::runtime::Runtime;
use crate::tool::ToolDefinition;

/// How many prior call/observation pairs the mock prompt carries.
const HISTORY_WINDOW: usize = 5;

/// One prior exchange with the mocked server.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The invocation, rendered as `name(arguments)`.
    pub function_call: String,
    /// What the mock returned.
    pub observation: String,
}

/// An LLM standing in for one tool server.
#[derive(Debug)]
pub struct MockToolProvider<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
    cfg: &'a ModelConfig,
    tools: Vec<ToolDefinition>,
    server_description: String,
    query: Option<String>,
}

impl<'a> MockToolProvider<'a> {
    /// Bind a provider to its model and the server it imitates.
    #[must_use]
    pub fn new(
        runtime: &'a Runtime,
        client: &'a ChatClient,
        cfg: &'a ModelConfig,
        tools: Vec<ToolDefinition>,
        server_description: impl Into<String>,
        query: Option<String>,
    ) -> Self {
        Self {
            runtime,
            client,
            cfg,
            tools,
            server_description: server_description.into(),
            query,
        }
    }

    /// The mocked server's tool catalog.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Simulate one batch of (possibly parallel) tool calls, returning one
    /// observation string per call, in call order.
    pub async fn call(&self, calls: &[ToolCall], history: &[HistoryEntry]) -> Result<Vec<String>> {
        let tool_defs: String = self
            .tools
            .iter()
            .map(|t| format!("{}\n", serde_json::to_string(t).unwrap_or_default()))
            .collect();
        let invocations: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "name": call.name(),
                    "arguments": call.function.parse_arguments().unwrap_or(Value::Null),
                })
            })
            .collect();
        let tool_calls_text = serde_json::to_string(&invocations)?;

        let template = match (history.is_empty(), self.query.as_deref()) {
            (true, None) => "tool_mock",
            (true, Some(_)) => "tool_mock_with_query",
            (false, None) => "tool_mock_with_history",
            (false, Some(_)) => "tool_mock_with_history_and_query",
        };
        let history_text = render_history(history);
        let mut vars: Vec<(&str, &str)> = vec![
            ("tool_defs", tool_defs.as_str()),
            ("tool_calls", tool_calls_text.as_str()),
            ("server_description", self.server_description.as_str()),
            ("history", history_text.as_str()),
        ];
        if let Some(query) = self.query.as_deref() {
            vars.push(("query", query));
        }
        let prompt = self.runtime.prompts.render(template, &vars)?;

        let messages = [
            ChatMessage::system(self.runtime.prompts.get("tool_role_system")?),
            ChatMessage::user(prompt),
        ];
        let outcome = self.client.chat(&messages, self.cfg).await?;
        if outcome.is_null() {
            return Err(crate::error::Error::internal(
                outcome.failure.unwrap_or_else(|| "mock tool call failed".to_owned()),
            ));
        }

        Ok(distribute_results(outcome.text(), calls))
    }
}

/// Render the last [`HISTORY_WINDOW`] exchanges for the prompt.
fn render_history(history: &[HistoryEntry]) -> String {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    history[start..]
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            format!(
                "<function_call_{i}> {} </function_call_{i}>\n<observation_{i}> {} </observation_{i}>\n",
                entry.function_call, entry.observation
            )
        })
        .collect()
}

/// Map the mock's reply onto one observation per call.
///
/// The reply should be a JSON list `[{name, results}]`; entries are matched
/// to calls by name (first unclaimed match), and anything unmatched falls
/// back to the raw reply text so the agent always gets an observation.
fn distribute_results(reply: &str, calls: &[ToolCall]) -> Vec<String> {
    let (_, body) = split_reasoning(reply);
    let cleaned = strip_code_fences(body);

    let parsed: Vec<Value> = match serde_json::from_str::<Value>(cleaned) {
        Ok(Value::Array(items)) => items,
        Ok(other @ Value::Object(_)) => vec![other],
        _ => {
            warn!("mock reply was not a JSON list; returning raw text");
            return calls.iter().map(|_| cleaned.to_owned()).collect();
        }
    };

    let mut claimed = vec![false; parsed.len()];
    calls
        .iter()
        .map(|call| {
            let slot = parsed.iter().enumerate().find(|(idx, entry)| {
                !claimed[*idx]
                    && entry.get("name").and_then(Value::as_str) == Some(call.name())
            });
            match slot {
                Some((idx, entry)) => {
                    claimed[idx] = true;
                    render_results(entry.get("results"))
                }
                None => cleaned.to_owned(),
            }
        })
        .collect()
}

fn render_results(results: Option<&Value>) -> String {
    match results {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ToolCall {
        ToolCall::new("call_0", name, "{}")
    }

    #[test]
    fn history_window_is_five() {
        let history: Vec<HistoryEntry> = (0..8)
            .map(|i| HistoryEntry {
                function_call: format!("f{i}()"),
                observation: format!("o{i}"),
            })
            .collect();
        let text = render_history(&history);
        assert!(!text.contains("f2()"));
        assert!(text.contains("f3()"));
        assert!(text.contains("<observation_4> o7 </observation_4>"));
    }

    #[test]
    fn results_distribute_by_name() {
        let reply = r#"[
            {"name": "get_weather", "results": {"temp_c": 14}},
            {"name": "plan_route", "results": "take the N9"}
        ]"#;
        let calls = vec![call("plan_route"), call("get_weather")];
        let out = distribute_results(reply, &calls);
        assert_eq!(out[0], "take the N9");
        assert_eq!(out[1], r#"{"temp_c":14}"#);
    }

    #[test]
    fn duplicate_tool_names_claim_distinct_entries() {
        let reply = r#"[
            {"name": "search", "results": "first"},
            {"name": "search", "results": "second"}
        ]"#;
        let calls = vec![call("search"), call("search")];
        let out = distribute_results(reply, &calls);
        assert_eq!(out, vec!["first", "second"]);
    }

    #[test]
    fn unparseable_reply_falls_back_to_raw_text() {
        let reply = "```json\nService temporarily degraded\n```";
        let calls = vec![call("a"), call("b")];
        let out = distribute_results(reply, &calls);
        assert_eq!(out, vec!["Service temporarily degraded"; 2]);
    }
}

//! Prompt-based function calling.
//!
//! Backends without native tool support get their tool catalog rendered
//! into the system prompt and emit calls as `<tool_call>` JSON blocks
//! (the Hermes/Nous convention). This module renders the catalog and
//! parses the blocks back out of assistant text.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::message::ToolCall;
use crate::tool::ToolDefinition;

/// Render the tool catalog into a system-prompt section.
#[must_use]
pub fn render_tools_system(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "You may call tools to help with the user's request.\n\
         You are provided with function signatures within <tools></tools> XML tags:\n<tools>\n",
    );
    for tool in tools {
        out.push_str(&serde_json::to_string(&tool.to_openai()).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(
        "</tools>\n\nFor each function call, return a JSON object with the function \
         name and arguments within <tool_call></tool_call> XML tags:\n\
         <tool_call>\n{\"name\": <function-name>, \"arguments\": <args-json-object>}\n</tool_call>",
    );
    out
}

static TOOL_CALL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<tool_call>(.*?)</tool_call>")
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

/// Parse `<tool_call>` blocks out of assistant text.
///
/// Returns the text with the blocks removed plus the parsed calls, each
/// given a synthesized id. Malformed blocks are skipped.
#[must_use]
pub fn parse_prompted_tool_calls(text: &str) -> (String, Vec<ToolCall>) {
    let mut calls = Vec::new();
    for caps in TOOL_CALL_BLOCK.captures_iter(text) {
        let Ok(parsed) = serde_json::from_str::<Value>(caps[1].trim()) else {
            continue;
        };
        let Some(name) = parsed.get("name").and_then(Value::as_str) else {
            continue;
        };
        let arguments = parsed
            .get("arguments")
            .map_or_else(|| "{}".to_owned(), Value::to_string);
        calls.push(ToolCall::new(
            format!("call_{}", calls.len()),
            name,
            arguments,
        ));
    }
    let content = TOOL_CALL_BLOCK.replace_all(text, "").trim().to_owned();
    (content, calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_renders_every_tool() {
        let tools = vec![
            ToolDefinition::new("a", "first", json!({"type": "object", "properties": {}})),
            ToolDefinition::new("b", "second", json!({"type": "object", "properties": {}})),
        ];
        let system = render_tools_system(&tools);
        assert!(system.contains("<tools>"));
        assert!(system.contains("\"name\":\"a\""));
        assert!(system.contains("\"name\":\"b\""));
        assert!(system.contains("<tool_call>"));
    }

    #[test]
    fn blocks_parse_into_calls() {
        let text = concat!(
            "I will look both up.\n",
            "<tool_call>\n{\"name\": \"get_weather\", \"arguments\": {\"city\": \"Ghent\"}}\n</tool_call>\n",
            "<tool_call>{\"name\": \"plan_route\", \"arguments\": {\"to\": \"Ghent\"}}</tool_call>",
        );
        let (content, calls) = parse_prompted_tool_calls(text);
        assert_eq!(content, "I will look both up.");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name(), "get_weather");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].id, "call_1");
        let args: Value = serde_json::from_str(&calls[1].function.arguments).unwrap();
        assert_eq!(args["to"], "Ghent");
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        let text = "<tool_call>not json</tool_call><tool_call>{\"name\": \"ok\"}</tool_call>";
        let (_, calls) = parse_prompted_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "ok");
        assert_eq!(calls[0].function.arguments, "{}");
    }
}

//! Recovery parsing for free-form LLM output.
//!
//! Judges and synthesizers never trust the model to return clean JSON or
//! XML. Every parser here walks a recovery ladder — strip reasoning, strip
//! code fences, strict parse, regex extraction — and reports failure through
//! [`Parsed::err`] instead of an `Err`, so callers can substitute their
//! safe-default score without unwinding.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Result of a tolerant parse attempt. Never constructed through a failure
/// path that panics; `err` is the only failure signal.
#[derive(Debug, Clone, Default)]
pub struct Parsed {
    /// The recovered JSON value, if any.
    pub value: Option<Value>,
    /// Reasoning text preceding a `</think>` marker, if present.
    pub thought: Option<String>,
    /// The cleaned text the final parse attempt ran against.
    pub raw: String,
    /// Why parsing failed, if it did.
    pub err: Option<String>,
}

impl Parsed {
    /// Whether a value was recovered.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.value.is_some() && self.err.is_none()
    }

    /// The recovered object, if the value is a JSON object.
    #[must_use]
    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.value.as_ref().and_then(Value::as_object)
    }
}

/// Split reasoning from payload: everything up to and including the last
/// `</think>` is the thought, the remainder is the payload.
#[must_use]
pub fn split_reasoning(text: &str) -> (Option<String>, &str) {
    match text.rfind("</think>") {
        Some(pos) => {
            let thought = text[..pos].trim();
            let rest = text[pos + "</think>".len()..].trim_start();
            (
                (!thought.is_empty()).then(|| thought.to_owned()),
                rest,
            )
        }
        None => (None, text),
    }
}

/// Strip one leading markdown fence (optionally tagged, e.g. ```` ```json ````)
/// and one trailing fence.
#[must_use]
pub fn strip_code_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop the language tag up to the first newline, if any.
        s = match rest.find('\n') {
            Some(idx) if rest[..idx].chars().all(|c| c.is_ascii_alphanumeric()) => &rest[idx + 1..],
            _ => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
        };
        s = s.trim_start();
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest.trim_end();
    }
    s
}

/// Parse JSON out of free-form model output.
///
/// Ladder: trim, drop through `</think>`, strip fences, strict parse, then
/// regex-extract the widest `{…}` or `[…]` span. Never panics.
#[must_use]
pub fn parse_json(text: &str) -> Parsed {
    let (thought, rest) = split_reasoning(text.trim_start());
    let cleaned = strip_code_fences(rest).to_owned();

    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => Parsed {
            value: Some(value),
            thought,
            raw: cleaned,
            err: None,
        },
        Err(first_err) => match extract_json_span(&cleaned) {
            Some(value) => Parsed {
                value: Some(value),
                thought,
                raw: cleaned,
                err: None,
            },
            None => Parsed {
                value: None,
                thought,
                raw: cleaned,
                err: Some(first_err.to_string()),
            },
        },
    }
}

/// Parse a JSON list out of free-form model output.
///
/// A bare object is wrapped as a singleton list; anything unrecoverable
/// yields an empty list.
#[must_use]
pub fn parse_json_list(text: &str) -> Vec<Value> {
    let parsed = parse_json(text);
    match parsed.value {
        Some(Value::Array(items)) => items,
        Some(obj @ Value::Object(_)) => vec![obj],
        Some(other) => {
            tracing::warn!(kind = json_kind(&other), "unexpected JSON type for list parse");
            Vec::new()
        }
        None => Vec::new(),
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extract the widest `{…}` or `[…]` slice that parses.
#[must_use]
pub fn extract_json_span(text: &str) -> Option<Value> {
    let obj_start = text.find('{');
    let arr_start = text.find('[');
    let start = match (obj_start, arr_start) {
        (Some(o), Some(a)) => o.min(a),
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    let obj_end = text.rfind('}');
    let arr_end = text.rfind(']');
    let end = obj_end.max(arr_end)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| RegexBuilder::new(r"<!--.*?-->").dot_matches_new_line(true).build().unwrap());

/// Remove HTML comment markers, tolerating unpaired occurrences.
#[must_use]
pub fn clean_html_comments(text: &str) -> String {
    let cleaned = HTML_COMMENT.replace_all(text, "");
    cleaned.replace("<!--", "").replace("-->", "").trim().to_owned()
}

fn tag_regex(tag: &str, cdata: bool) -> Regex {
    let pattern = if cdata {
        format!(r"<{tag}\b[^>]*>\s*<!\[CDATA\[(.*?)\]\]>\s*</{tag}>")
    } else {
        format!(r"<{tag}\b[^>]*>(.*?)</{tag}>")
    };
    RegexBuilder::new(&pattern)
        .dot_matches_new_line(true)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| Regex::new("$^").unwrap())
}

/// Extract the content of an XML tag: CDATA form first, then plain form.
/// Embedded HTML comments are stripped from the result.
#[must_use]
pub fn extract_xml_field(text: &str, tag: &str) -> String {
    if let Some(caps) = tag_regex(tag, true).captures(text) {
        return clean_html_comments(&caps[1]);
    }
    if let Some(caps) = tag_regex(tag, false).captures(text) {
        return clean_html_comments(&caps[1]);
    }
    String::new()
}

/// One parsed augmentation variation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variation {
    /// 1-based index of the variation block.
    pub index: usize,
    /// The varied question.
    pub question: String,
    /// Optional surrounding context.
    pub context: String,
    /// Optional constraints text.
    pub constraints: String,
    /// Augmentation mode the variation came from.
    pub mode: String,
}

static VARIATION_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<variation_\d+\b[^>]*>(.*?)</variation_\d+>")
        .dot_matches_new_line(true)
        .case_insensitive(true)
        .build()
        .unwrap()
});

static QUESTION_TAG: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<question\b[^>]*>(.*?)</question>")
        .dot_matches_new_line(true)
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// Parse `<variation_N>` blocks out of an augmentation reply.
///
/// Falls back to bare `<question>` enumeration when no variation block
/// yields a question.
#[must_use]
pub fn parse_variations(text: &str, mode: &str) -> Vec<Variation> {
    let scope = {
        let inner = extract_xml_field(text, "variations");
        if inner.is_empty() { text.to_owned() } else { inner }
    };

    let mut parsed = Vec::new();
    for (idx, caps) in VARIATION_BLOCK.captures_iter(&scope).enumerate() {
        let block = &caps[1];
        let question = extract_xml_field(block, "question").trim().to_owned();
        if question.is_empty() {
            continue;
        }
        parsed.push(Variation {
            index: idx + 1,
            question,
            context: extract_xml_field(block, "context").trim().to_owned(),
            constraints: extract_xml_field(block, "constraints").trim().to_owned(),
            mode: mode.to_owned(),
        });
    }

    if parsed.is_empty() {
        for (idx, caps) in QUESTION_TAG.captures_iter(&scope).enumerate() {
            let question = caps[1].trim().to_owned();
            if question.is_empty() {
                continue;
            }
            parsed.push(Variation {
                index: idx + 1,
                question,
                context: String::new(),
                constraints: String::new(),
                mode: mode.to_owned(),
            });
        }
    }
    parsed
}

/// Ensure a call statement is a bare call expression: a single `print(…)`
/// wrapper is unwrapped.
#[must_use]
pub fn normalize_call_statement(statement: &str) -> String {
    let s = statement.trim();
    if let Some(inner) = s.strip_prefix("print(").and_then(|r| r.strip_suffix(')')) {
        let inner = inner.trim();
        if !inner.is_empty() {
            return inner.to_owned();
        }
    }
    s.to_owned()
}

static DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*def\s+([A-Za-z_]\w*)\s*\(([^)]*)\)").unwrap());

/// Name and parameter names of the first `def` in a Python source, without
/// default values or annotations.
#[must_use]
pub fn first_function_signature(code: &str) -> (Option<String>, Vec<String>) {
    let Some(caps) = DEF_RE.captures(code) else {
        return (None, Vec::new());
    };
    let name = caps[1].to_owned();
    let args = caps[2]
        .split(',')
        .map(|raw| {
            raw.trim()
                .trim_start_matches('*')
                .split([':', '='])
                .next()
                .unwrap_or("")
                .trim()
                .to_owned()
        })
        .filter(|a| !a.is_empty())
        .collect();
    (Some(name), args)
}

/// Strip an enclosing `<tag>…</tag>` wrapper from a query, if the whole
/// string is one wrapped element.
#[must_use]
pub fn strip_enclosing_tag(text: &str) -> String {
    static WRAPPED: LazyLock<Regex> = LazyLock::new(|| {
        RegexBuilder::new(r"^<(\w+)>(.*)</(\w+)>$")
            .dot_matches_new_line(true)
            .build()
            .unwrap()
    });
    let trimmed = text.trim();
    if let Some(caps) = WRAPPED.captures(trimmed)
        && caps[1] == caps[3]
    {
        return caps[2].trim().to_owned();
    }
    trimmed.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_json_parses_same_as_bare() {
        let bare = r#"{"score": 1, "reason": "ok"}"#;
        let fenced = format!("```json\n{bare}\n```");
        assert_eq!(parse_json(bare).value, parse_json(&fenced).value);
    }

    #[test]
    fn reasoning_is_split_off() {
        let text = "I should check the schema.</think>\n{\"score\": 0}";
        let parsed = parse_json(text);
        assert_eq!(parsed.value, Some(json!({"score": 0})));
        assert_eq!(parsed.thought.as_deref(), Some("I should check the schema."));
    }

    #[test]
    fn embedded_object_is_recovered() {
        let text = "Here is my verdict:\n{\"is_valid\": true}\nThanks!";
        let parsed = parse_json(text);
        assert_eq!(parsed.value, Some(json!({"is_valid": true})));
    }

    #[test]
    fn garbage_reports_err_without_panic() {
        let parsed = parse_json("no json here at all");
        assert!(parsed.value.is_none());
        assert!(parsed.err.is_some());
    }

    #[test]
    fn object_wraps_into_singleton_list() {
        let items = parse_json_list(r#"{"_uuid": 1}"#);
        assert_eq!(items.len(), 1);
        let items = parse_json_list(r#"[{"_uuid": 1}, {"_uuid": 2}]"#);
        assert_eq!(items.len(), 2);
        assert!(parse_json_list("42").is_empty());
    }

    #[test]
    fn xml_field_prefers_cdata() {
        let text = "<question><![CDATA[What is 12 x 7?]]></question>";
        assert_eq!(extract_xml_field(text, "question"), "What is 12 x 7?");
        let text = "<question>plain <!-- note --> form</question>";
        assert_eq!(extract_xml_field(text, "question"), "plain  form");
    }

    #[test]
    fn variations_parse_with_fallback() {
        let text = r"<variations>
            <variation_1><question>Q1</question><context>C1</context><constraints></constraints></variation_1>
            <variation_2><question>Q2</question></variation_2>
        </variations>";
        let vars = parse_variations(text, "diverse");
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[0].question, "Q1");
        assert_eq!(vars[0].context, "C1");
        assert_eq!(vars[1].mode, "diverse");

        let fallback = "<question>only</question>";
        let vars = parse_variations(fallback, "complicate");
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].question, "only");
    }

    #[test]
    fn print_wrapper_is_unwrapped() {
        assert_eq!(
            normalize_call_statement("print(multiply(a=3, b=4))"),
            "multiply(a=3, b=4)"
        );
        assert_eq!(normalize_call_statement("multiply(a=3)"), "multiply(a=3)");
        assert_eq!(normalize_call_statement("print()"), "print()");
    }

    #[test]
    fn signature_extraction() {
        let code = "import math\n\ndef convert_units(value, unit: str = 'm', *, precision=2):\n    return value";
        let (name, args) = first_function_signature(code);
        assert_eq!(name.as_deref(), Some("convert_units"));
        assert_eq!(args, vec!["value", "unit", "precision"]);

        assert_eq!(first_function_signature("x = 1"), (None, Vec::new()));
    }

    #[test]
    fn enclosing_tag_is_stripped() {
        assert_eq!(strip_enclosing_tag("<question>What?</question>"), "What?");
        assert_eq!(strip_enclosing_tag("plain text"), "plain text");
        assert_eq!(strip_enclosing_tag("<a>x</b>"), "<a>x</b>");
    }
}

//! Raw-generation ingest.
//!
//! The pipeline's very first artifacts are raw completion records:
//! `{prompt, params}` in, `{prompt, params, response, reasoning_content}`
//! out. Post-processing recovers the JSON list inside each response,
//! stamps every item with a fresh uuid and its generation metadata, and
//! reports hop-level statistics over the resulting decomposition records.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::llm::ChatClient;
use crate::message::ChatMessage;
use crate::parse::parse_json_list;
use crate::stage::{StageOptions, StageOutcome, StageReport, field_keyer, run_stage};

/// Run one completion per input record (`{prompt, ...}` or
/// `{messages, ...}`), committing the input plus `response` and
/// `reasoning_content`. Resume is keyed on the prompt text.
pub async fn run_completions(
    client: &ChatClient,
    cfg: &ModelConfig,
    inputs: Vec<Value>,
    out_path: impl AsRef<std::path::Path>,
    concurrency: usize,
) -> Result<StageReport> {
    let keyer = field_keyer("prompt");
    let opts = StageOptions {
        concurrency,
        append: true,
    };
    run_stage(inputs, &keyer, out_path, &opts, |mut input| async move {
        let messages = completion_messages(&input)?;
        let outcome = client.chat(&messages, cfg).await?;
        if let Some(map) = input.as_object_mut() {
            map.insert(
                "response".to_owned(),
                outcome.content.clone().map_or(Value::Null, Value::String),
            );
            map.insert(
                "reasoning_content".to_owned(),
                outcome.reasoning.clone().map_or(Value::Null, Value::String),
            );
        }
        Ok(StageOutcome::Emit(input))
    })
    .await
}

/// Build the chat messages for one completion input: a `messages` array
/// wins, else the `prompt` string becomes a single user message.
pub fn completion_messages(input: &Value) -> Result<Vec<ChatMessage>> {
    if let Some(messages) = input.get("messages") {
        return serde_json::from_value(messages.clone()).map_err(Into::into);
    }
    let prompt = input
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| crate::error::Error::record("input has neither messages nor prompt"))?;
    Ok(vec![ChatMessage::user(prompt)])
}

/// Generation metadata carried on every ingested record.
#[must_use]
pub fn build_metadata(params: &Value, model_name: &str) -> Value {
    let mut metadata = json!({
        "domain": params.get("domain").cloned().unwrap_or_else(|| json!("unknown")),
        "language": params.get("lang").cloned().unwrap_or_else(|| json!("unknown")),
        "knowledge_corpus": params
            .get("knowledge_corpus")
            .cloned()
            .filter(|v| v.as_str().is_none_or(|s| !s.is_empty()))
            .unwrap_or(Value::Null),
        "model_name": model_name,
    });
    for key in ["num_hops", "min_num_hops", "max_num_hops"] {
        if let Some(v) = params.get(key) {
            metadata[key] = v.clone();
        }
    }
    metadata
}

/// Hop-level statistics over ingested records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Records per maximum hop level.
    pub by_max_hop: BTreeMap<u64, usize>,
    /// Records per step count.
    pub by_node_count: BTreeMap<usize, usize>,
    /// Records ingested.
    pub total: usize,
    /// Raw lines whose response yielded nothing.
    pub empty_responses: usize,
}

/// Post-process raw completion lines into decomposition records: parse the
/// JSON list in each `response`, stamp `uuid` and `_metadata`, collect hop
/// statistics.
#[must_use]
pub fn post_process(raw_lines: &[Value], model_name: &str) -> (Vec<Value>, IngestStats) {
    let mut records = Vec::new();
    let mut stats = IngestStats::default();

    for line in raw_lines {
        let response = line.get("response").and_then(Value::as_str).unwrap_or_default();
        let params = line.get("params").cloned().unwrap_or_else(|| json!({}));
        let items = parse_json_list(response);
        if items.is_empty() {
            stats.empty_responses += 1;
            continue;
        }
        let metadata = build_metadata(&params, model_name);
        for item in items {
            let Value::Object(mut map) = item else {
                warn!("ingested item is not an object; skipped");
                continue;
            };
            map.insert("uuid".to_owned(), json!(uuid::Uuid::new_v4().to_string()));
            map.insert("_metadata".to_owned(), metadata.clone());

            if let Some(trace) = map.get("decomposition_trace").and_then(Value::as_array) {
                let max_hop = trace
                    .iter()
                    .filter_map(|s| s.get("hop_level").and_then(Value::as_u64))
                    .max()
                    .unwrap_or(0);
                *stats.by_max_hop.entry(max_hop).or_default() += 1;
                *stats.by_node_count.entry(trace.len()).or_default() += 1;
            }
            stats.total += 1;
            records.push(Value::Object(map));
        }
    }

    info!(
        total = stats.total,
        empty = stats.empty_responses,
        hops = ?stats.by_max_hop,
        nodes = ?stats.by_node_count,
        "ingest post-processing done",
    );
    (records, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_carries_hop_range() {
        let params = json!({"domain": "finance", "lang": "en", "min_num_hops": 2, "max_num_hops": 4});
        let metadata = build_metadata(&params, "gen-v1");
        assert_eq!(metadata["domain"], "finance");
        assert_eq!(metadata["model_name"], "gen-v1");
        assert_eq!(metadata["min_num_hops"], 2);
        assert_eq!(metadata["max_num_hops"], 4);
        assert_eq!(metadata["knowledge_corpus"], Value::Null);
        assert!(metadata.get("num_hops").is_none());
    }

    #[test]
    fn post_process_stamps_uuid_and_counts_hops() {
        let raw = vec![json!({
            "params": {"domain": "d", "lang": "en"},
            "response": r#"[
                {"main_question": "q1", "decomposition_trace": [
                    {"_uuid": 1, "hop_level": 1}, {"_uuid": 2, "hop_level": 2}
                ]},
                {"main_question": "q2", "decomposition_trace": [
                    {"_uuid": 1, "hop_level": 1}
                ]}
            ]"#
        })];
        let (records, stats) = post_process(&raw, "m");
        assert_eq!(records.len(), 2);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_max_hop[&2], 1);
        assert_eq!(stats.by_max_hop[&1], 1);
        assert_eq!(stats.by_node_count[&2], 1);
        assert!(records[0]["uuid"].as_str().unwrap().len() >= 32);
        assert_eq!(records[0]["_metadata"]["domain"], "d");
        // Distinct uuids per item.
        assert_ne!(records[0]["uuid"], records[1]["uuid"]);
    }

    #[test]
    fn unparseable_responses_count_as_empty() {
        let raw = vec![json!({"params": {}, "response": "no json"})];
        let (records, stats) = post_process(&raw, "m");
        assert!(records.is_empty());
        assert_eq!(stats.empty_responses, 1);
    }
}

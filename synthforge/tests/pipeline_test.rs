//! Integration tests over the shared substrate and the pipeline data laws.

#![allow(clippy::unwrap_used, clippy::panic)]

use serde_json::{Value, json};
use synthforge::graph::ToolGraph;
use synthforge::jsonl::read_values;
use synthforge::message::{ChatMessage, Role, ToolCall, normalize_for_api};
use synthforge::parse::{parse_json, strip_code_fences};
use synthforge::reward::{language_consistent, plan_segments, tool_batches, tool_ids_resolve};
use synthforge::stage::{StageOptions, StageOutcome, field_keyer, run_stage};
use synthforge::trace::DecompositionRecord;

fn numbered_inputs(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({"key": format!("rec-{i}"), "payload": i}))
        .collect()
}

/// Run a stage on 1000 inputs, kill after 300 written, re-run; the output
/// holds exactly 1000 lines with no duplicates.
#[tokio::test]
async fn stage_resume_reaches_exact_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("stage.jsonl");
    let keyer = field_keyer("key");
    let opts = StageOptions {
        concurrency: 8,
        append: true,
    };

    // "Killed" first run: only 300 of the inputs made it in.
    let partial: Vec<Value> = numbered_inputs(1000).into_iter().take(300).collect();
    run_stage(partial, &keyer, &out, &opts, |v| async move {
        Ok(StageOutcome::Emit(v))
    })
    .await
    .unwrap();
    assert_eq!(read_values(&out).unwrap().len(), 300);

    // Full re-run.
    let report = run_stage(numbered_inputs(1000), &keyer, &out, &opts, |v| async move {
        Ok(StageOutcome::Emit(v))
    })
    .await
    .unwrap();
    assert_eq!(report.skipped, 300);
    assert_eq!(report.processed, 700);

    let lines = read_values(&out).unwrap();
    assert_eq!(lines.len(), 1000);
    let mut keys: Vec<String> = lines
        .iter()
        .map(|l| l["key"].as_str().unwrap().to_owned())
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 1000, "no duplicates, no drops");

    // A third run with identical inputs writes nothing new.
    let report = run_stage(numbered_inputs(1000), &keyer, &out, &opts, |v| async move {
        Ok(StageOutcome::Emit(v))
    })
    .await
    .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(read_values(&out).unwrap().len(), 1000);
}

/// Round-trip law: parsing a fenced payload equals parsing the bare one.
#[test]
fn parser_fence_round_trip() {
    let payloads = [
        r#"{"score": 1}"#,
        r#"[{"a": 1}, {"a": 2}]"#,
        r#"{"nested": {"deep": [1, 2, 3]}}"#,
    ];
    for payload in payloads {
        let fenced = format!("```json\n{payload}\n```");
        assert_eq!(parse_json(payload).value, parse_json(&fenced).value);
        assert_eq!(strip_code_fences(&fenced), payload);
    }
}

/// Round-trip law: normalizing legacy messages yields an equivalent modern
/// form, and normalizing that again is the identity.
#[test]
fn message_normalization_round_trip() {
    let legacy: Vec<ChatMessage> = serde_json::from_value(json!([
        {"role": "user", "content": "two lookups please"},
        {"role": "assistant", "content": null, "function_call": {"name": "lookup", "arguments": "{\"id\":1}"}},
        {"role": "assistant", "content": null, "function_call": {"name": "lookup", "arguments": "{\"id\":2}"}},
        {"role": "function", "content": "first result"},
        {"role": "assistant", "content": "done"}
    ]))
    .unwrap();

    let normalized = normalize_for_api(&legacy);
    assert_eq!(normalized.len(), 4);
    assert_eq!(normalized[1].tool_calls.as_ref().unwrap().len(), 2);
    assert_eq!(normalized[2].role, Role::Tool);
    assert!(normalized[2].tool_call_id.is_some());

    let again = normalize_for_api(&normalized);
    assert_eq!(serde_json::to_value(&again).unwrap(), serde_json::to_value(&normalized).unwrap());
}

/// Sub-chain law: enumeration equals the simple paths of bounded length.
#[test]
fn sub_chain_enumeration_law() {
    let chains: Vec<Vec<String>> = [["search", "fetch", "summarize"], ["search", "rank", "summarize"]]
        .iter()
        .map(|c| c.iter().map(|s| (*s).to_owned()).collect())
        .collect();
    let graph = ToolGraph::from_chains(chains.iter().map(Vec::as_slice));

    let subs = graph.enumerate_sub_chains(2, 3);
    // Edges: search->fetch, fetch->summarize, search->rank, rank->summarize.
    assert_eq!(subs.iter().filter(|c| c.len() == 2).count(), 4);
    assert_eq!(subs.iter().filter(|c| c.len() == 3).count(), 2);
    assert!(graph.enumerate_sub_chains(4, 9).is_empty());
}

/// A query needing two independent lookups produces one assistant turn
/// with two tool calls, answered by one parallel batch — which the reward
/// segmentation treats as a single plan segment.
#[test]
fn parallel_calls_form_one_batch_and_one_plan_segment() {
    let trajectory = vec![
        ChatMessage::user("compare weather in Ghent and Lille"),
        ChatMessage::assistant_tool_calls(
            None,
            vec![
                ToolCall::new("call_0", "get_weather", r#"{"city":"Ghent"}"#),
                ToolCall::new("call_1", "get_weather", r#"{"city":"Lille"}"#),
            ],
        ),
        ChatMessage::tool("call_0", "rain"),
        ChatMessage::tool("call_1", "sun"),
        ChatMessage::assistant_tool_calls(
            None,
            vec![ToolCall::new("call_2", "summarize", "{}")],
        ),
        ChatMessage::tool("call_2", "summary text"),
        ChatMessage::assistant("Ghent: rain. Lille: sun."),
    ];

    assert!(tool_ids_resolve(&trajectory));

    let batches = tool_batches(&trajectory);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].end - batches[0].start, 2, "one parallel batch");

    let segments = plan_segments(&trajectory);
    assert_eq!(segments.len(), 1, "the follow-up turn is the only plan segment");
    assert_eq!(segments[0].call_count, 1);
}

/// Boundary: a Chinese answer to an English query is inconsistent without
/// any model involvement; an answer with no letters at all passes.
#[test]
fn language_gate_boundaries() {
    assert!(!language_consistent("Which city is larger?", "东京更大。"));
    assert!(language_consistent("Which city is larger?", "12,000,000 > 9,000,000"));
}

/// Two-hop trace: the structural invariants hold and the dependency lookup
/// sees the upstream pair.
#[test]
fn two_hop_trace_validates() {
    let record: DecompositionRecord = serde_json::from_value(json!({
        "uuid": "rec",
        "main_question": "population of Tokyo in thousands?",
        "final_answer": "13960",
        "decomposition_trace": [
            {"_uuid": 1, "hop_level": 1, "sub_question": "population of Tokyo", "sub_answer": "13960000", "dependency": null},
            {"_uuid": 2, "hop_level": 2, "sub_question": "divide by 1000", "sub_answer": "13960", "dependency": [1]}
        ]
    }))
    .unwrap();
    record.validate().unwrap();

    let pair = synthforge::synth::qa_pair_for_step(&record, 2).unwrap();
    assert!(pair.question.contains("Additional Information"));
    assert!(pair.question.contains("13960000"));
}

//! Tool-necessity annotation.
//!
//! One LLM call per record decides, for every step, whether answering its
//! sub-question genuinely needs a tool. The reply must align 1:1 with the
//! trace (same length, same uuids) or the attempt is discarded. After
//! annotation, `tool_necessity_legitimacy` is computed: every step cited as
//! a dependency of any other step must itself be tool-necessary, otherwise
//! the record is illegitimate and later stages skip it.

use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::llm::ChatClient;
use crate::message::ChatMessage;
use crate::parse::parse_json_list;
use crate::runtime::Runtime;
use crate::trace::DecompositionRecord;

const NECESSITY_MAX_RETRIES: u32 = 3;
const NECESSITY_RETRY_SLEEP: Duration = Duration::from_secs(5);

/// Annotate every step with `tool_necessity`/`reason` and set
/// `tool_necessity_legitimacy` on the record.
///
/// Exhausting retries marks the record illegitimate instead of failing it,
/// so the stage always commits something.
pub async fn check_necessity(
    runtime: &Runtime,
    client: &ChatClient,
    cfg: &ModelConfig,
    record: &mut DecompositionRecord,
) -> Result<()> {
    if record.main_question.is_empty() || record.decomposition_trace.is_empty() {
        return Err(Error::record(
            "main_question or decomposition_trace is empty",
        ));
    }
    info!(uuid = %record.uuid, "checking tool necessity");

    let prompt = runtime.prompts.render(
        "check_tool_necessity",
        &[
            ("main_question", record.main_question.as_str()),
            (
                "decomposition_trace",
                &serde_json::to_string(&record.decomposition_trace)?,
            ),
        ],
    )?;

    let mut attempt = 0u32;
    loop {
        let result = async {
            let outcome = client.chat(&[ChatMessage::user(&prompt)], cfg).await?;
            if outcome.is_null() || outcome.text().is_empty() {
                return Err(Error::internal("empty response from model"));
            }
            apply_necessity(&parse_json_list(outcome.text()), record)
        }
        .await;

        match result {
            Ok(()) => {
                apply_legitimacy(record);
                info!(
                    uuid = %record.uuid,
                    legitimate = record.tool_necessity_legitimacy,
                    "tool necessity check done",
                );
                return Ok(());
            }
            Err(e) => {
                attempt += 1;
                if attempt > NECESSITY_MAX_RETRIES {
                    warn!(uuid = %record.uuid, error = %e, "necessity check exhausted retries");
                    record.tool_necessity_legitimacy = Some(false);
                    return Ok(());
                }
                warn!(uuid = %record.uuid, attempt, error = %e, "necessity attempt failed");
                tokio::time::sleep(NECESSITY_RETRY_SLEEP).await;
            }
        }
    }
}

/// Fold a parsed necessity reply into the trace. The reply must carry one
/// entry per step with matching uuids; nothing is mutated on mismatch.
fn apply_necessity(entries: &[Value], record: &mut DecompositionRecord) -> Result<()> {
    if entries.len() != record.decomposition_trace.len() {
        return Err(Error::record(format!(
            "result length mismatch: {} entries for {} steps",
            entries.len(),
            record.decomposition_trace.len()
        )));
    }
    for (entry, step) in entries.iter().zip(&record.decomposition_trace) {
        let entry_uuid = entry.get("_uuid").and_then(Value::as_i64);
        if entry_uuid != Some(step.uuid) {
            return Err(Error::record(format!(
                "result uuid mismatch: {entry_uuid:?} vs step {}",
                step.uuid
            )));
        }
    }
    for (entry, step) in entries.iter().zip(record.decomposition_trace.iter_mut()) {
        step.tool_necessity = Some(
            entry
                .get("tool_necessity")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        );
        step.reason = entry
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned);
    }
    Ok(())
}

fn apply_legitimacy(record: &mut DecompositionRecord) {
    let depended = record.depended_on_uuids();
    let legitimate = record
        .decomposition_trace
        .iter()
        .filter(|step| depended.contains(&step.uuid))
        .all(|step| step.tool_necessity.unwrap_or(false));
    record.tool_necessity_legitimacy = Some(legitimate);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_hop() -> DecompositionRecord {
        serde_json::from_value(json!({
            "uuid": "r1",
            "main_question": "m",
            "final_answer": "f",
            "decomposition_trace": [
                {"_uuid": 1, "hop_level": 1, "sub_question": "q1", "sub_answer": "a1", "dependency": null},
                {"_uuid": 2, "hop_level": 2, "sub_question": "q2", "sub_answer": "a2", "dependency": [1]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn aligned_reply_annotates_steps() {
        let mut rec = two_hop();
        let entries = vec![
            json!({"_uuid": 1, "tool_necessity": true, "reason": "needs lookup"}),
            json!({"_uuid": 2, "tool_necessity": false, "reason": "pure arithmetic"}),
        ];
        apply_necessity(&entries, &mut rec).unwrap();
        assert_eq!(rec.decomposition_trace[0].tool_necessity, Some(true));
        assert_eq!(rec.decomposition_trace[1].tool_necessity, Some(false));
        assert_eq!(
            rec.decomposition_trace[1].reason.as_deref(),
            Some("pure arithmetic")
        );
    }

    #[test]
    fn misaligned_reply_leaves_record_untouched() {
        let mut rec = two_hop();
        // Wrong length.
        assert!(apply_necessity(&[json!({"_uuid": 1})], &mut rec).is_err());
        // Wrong uuid order.
        let swapped = vec![json!({"_uuid": 2}), json!({"_uuid": 1})];
        assert!(apply_necessity(&swapped, &mut rec).is_err());
        assert!(rec.decomposition_trace[0].tool_necessity.is_none());
    }

    #[test]
    fn legitimacy_requires_necessary_dependencies() {
        let mut rec = two_hop();
        rec.decomposition_trace[0].tool_necessity = Some(false);
        rec.decomposition_trace[1].tool_necessity = Some(true);
        apply_legitimacy(&mut rec);
        assert_eq!(rec.tool_necessity_legitimacy, Some(false));

        rec.decomposition_trace[0].tool_necessity = Some(true);
        rec.decomposition_trace[1].tool_necessity = Some(false);
        apply_legitimacy(&mut rec);
        // Step 2 is depended on by nobody; its necessity does not matter.
        assert_eq!(rec.tool_necessity_legitimacy, Some(true));
    }
}

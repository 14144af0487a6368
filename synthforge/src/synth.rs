//! The multi-stage tool synthesizer.
//!
//! For one QA pair, produce a tool document, scale it to a realistic
//! complexity, generate a call statement, synthesize the implementation,
//! and keep going until executing `code + print(call)` in the sandbox
//! yields stdout containing the known answer. Each prompt stage retries
//! independently; the outer loop re-runs statement and deployment with the
//! scaled document held fixed.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{
    ENV_SYNTHESIS_INNER_MAX_RETRY_TIMES, ENV_SYNTHESIS_OUTER_MAX_RETRY_TIMES, ModelConfig,
};
use crate::error::Result;
use crate::llm::ChatClient;
use crate::message::ChatMessage;
use crate::parse::parse_json;
use crate::runtime::Runtime;
use crate::trace::{DecompositionRecord, EnvData, EnvResult, EnvSynthesisResult};

/// One question/answer pair handed to the synthesizer.
#[derive(Debug, Clone)]
pub struct QaPair {
    /// The (possibly dependency-augmented) question.
    pub question: String,
    /// The answer that must appear in the tool's stdout.
    pub answer: String,
    /// Originating step uuid.
    pub uuid: i64,
    /// Originating hop level.
    pub hop_level: u32,
}

/// Output of one prompt stage: the payload plus the model's analysis.
#[derive(Debug, Clone)]
struct StagePayload {
    content: Value,
    analysis: Value,
}

impl StagePayload {
    fn to_info(&self) -> Value {
        json!({ "content": self.content, "analysis": self.analysis })
    }
}

/// The four-stage synthesizer bound to a model and a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct ToolSynthesizer<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
    cfg: &'a ModelConfig,
}

impl<'a> ToolSynthesizer<'a> {
    /// Bind a synthesizer to its runtime, client and model.
    #[must_use]
    pub const fn new(runtime: &'a Runtime, client: &'a ChatClient, cfg: &'a ModelConfig) -> Self {
        Self {
            runtime,
            client,
            cfg,
        }
    }

    /// Run one prompt stage: render, chat, parse, validate required keys.
    /// Retries up to the inner limit; `None` when the stage never parsed.
    async fn prompt_stage(
        &self,
        template: &str,
        vars: &[(&str, &str)],
        content_key: &str,
    ) -> Result<Option<StagePayload>> {
        let prompt = self.runtime.prompts.render(template, vars)?;
        for attempt in 0..ENV_SYNTHESIS_INNER_MAX_RETRY_TIMES {
            let outcome = self.client.chat(&[ChatMessage::user(&prompt)], self.cfg).await?;
            if outcome.is_null() {
                debug!(template, attempt, "null model payload");
                continue;
            }
            let parsed = parse_json(outcome.text());
            if let Some(map) = parsed.as_object()
                && let Some(content) = map.get(content_key)
                && map.contains_key("analysis")
            {
                return Ok(Some(StagePayload {
                    content: content.clone(),
                    analysis: map.get("analysis").cloned().unwrap_or(Value::Null),
                }));
            }
            debug!(template, attempt, "stage output missing required keys");
        }
        info!(template, "stage exhausted retries");
        Ok(None)
    }

    /// Stage 4: synthesize the implementation and reject code the sandbox
    /// cannot even load.
    async fn deployment(
        &self,
        document: &Value,
        pair: &QaPair,
        call_statement: &str,
    ) -> Result<Option<StagePayload>> {
        let sandbox = self.runtime.sandbox()?;
        let document_text = serde_json::to_string_pretty(document)?;
        let pairs_text = format!("question: {}\nexpected answer: {}", pair.question, pair.answer);
        let prompt = self.runtime.prompts.render(
            "tool_deployment",
            &[
                ("document", document_text.as_str()),
                ("pairs", pairs_text.as_str()),
                ("call_statement", call_statement),
            ],
        )?;

        for attempt in 0..ENV_SYNTHESIS_INNER_MAX_RETRY_TIMES {
            let outcome = self.client.chat(&[ChatMessage::user(&prompt)], self.cfg).await?;
            if outcome.is_null() {
                continue;
            }
            let parsed = parse_json(outcome.text());
            let Some(map) = parsed.as_object() else {
                debug!(attempt, "deployment output did not parse");
                continue;
            };
            let (Some(function), true) = (map.get("function"), map.contains_key("analysis")) else {
                debug!(attempt, "deployment output missing required keys");
                continue;
            };
            let Some(code) = function.as_str() else { continue };

            // The implementation must define the documented function.
            let expected_name = document.get("name").and_then(Value::as_str);
            let (defined_name, _) = crate::parse::first_function_signature(code);
            if let (Some(expected), Some(defined)) = (expected_name, defined_name.as_deref())
                && expected != defined
            {
                warn!(attempt, expected, defined, "function name does not match the document");
                continue;
            }

            // The function body alone must at least load.
            let check = sandbox.run_code(code).await?;
            if !check.is_success() {
                debug!(attempt, "deployment code failed to load in sandbox");
                continue;
            }
            return Ok(Some(StagePayload {
                content: Value::String(code.to_owned()),
                analysis: map.get("analysis").cloned().unwrap_or(Value::Null),
            }));
        }
        info!("deployment exhausted retries");
        Ok(None)
    }

    /// Synthesize a verified environment for one QA pair, or `None` when
    /// every attempt failed.
    pub async fn synthesize(&self, pair: &QaPair) -> Result<Option<EnvResult>> {
        info!(uuid = pair.uuid, "tool document generation");
        let Some(document) = self
            .prompt_stage(
                "tool_document_generation",
                &[("question", pair.question.as_str())],
                "tool",
            )
            .await?
        else {
            return Ok(None);
        };

        info!(uuid = pair.uuid, "tool document complexity scaling");
        let document_text = serde_json::to_string(&document.content)?;
        let Some(scaled) = self
            .prompt_stage(
                "tool_document_complexity_scaling",
                &[("tool", document_text.as_str())],
                "refined_version",
            )
            .await?
        else {
            return Ok(None);
        };

        let scaled_text = serde_json::to_string_pretty(&scaled.content)?;
        let sandbox = self.runtime.sandbox()?;

        for attempt in 0..ENV_SYNTHESIS_OUTER_MAX_RETRY_TIMES {
            let Some(statement) = self
                .prompt_stage(
                    "call_statement",
                    &[
                        ("question", pair.question.as_str()),
                        ("tool_description", scaled_text.as_str()),
                    ],
                    "call",
                )
                .await?
            else {
                continue;
            };
            let Some(call) = statement.content.as_str().map(str::trim) else {
                continue;
            };
            if call.contains("http") {
                warn!(uuid = pair.uuid, attempt, "call statement carries a URL; rejected");
                continue;
            }

            let Some(deployed) = self.deployment(&scaled.content, pair, call).await? else {
                continue;
            };
            let code = deployed.content.as_str().unwrap_or_default().to_owned();

            let final_code = format!("{code}\nprint({call})");
            let run = sandbox.run_code(&final_code).await?;
            if run.is_success() && run.run_result.stdout.contains(&pair.answer) {
                info!(uuid = pair.uuid, attempt, "environment synthesis succeeded");
                return Ok(Some(EnvResult {
                    question: pair.question.clone(),
                    answer: pair.answer.clone(),
                    env_synthesis_result: EnvSynthesisResult {
                        data: EnvData {
                            tool_document: Some(scaled.content.clone()),
                            tool_call_statement: Some(call.to_owned()),
                            code: Some(code),
                            tool_call_ans: Some(run.run_result.stdout),
                        },
                        extra_info: json!({
                            "tool_document_generation_result": document.to_info(),
                            "tool_document_complexity_scaling_result": scaled.to_info(),
                            "tool_call_statement_result": statement.to_info(),
                            "tool_deployment_result": deployed.to_info(),
                        }),
                    },
                    merge_flag: None,
                }));
            }
            debug!(uuid = pair.uuid, attempt, "test case not passed");
        }

        info!(uuid = pair.uuid, "environment synthesis failed");
        Ok(None)
    }
}

/// Build the QA pair for one step, augmenting non-leaf questions with the
/// `(question, answer)` pairs of every dependency resolvable in the record.
#[must_use]
pub fn qa_pair_for_step(record: &DecompositionRecord, step_uuid: i64) -> Option<QaPair> {
    let step = record.step(step_uuid)?;
    let base_question = step.question();
    let answer = step.answer();

    let question = if step.hop_level > 1 && step.has_dependencies() {
        let mut refs = Vec::new();
        for dep in step.dependency_ids() {
            match record.step(dep) {
                Some(dep_step) => refs.push(json!({
                    "question": dep_step.question(),
                    "answer": dep_step.answer(),
                })),
                None => {
                    warn!(uuid = step_uuid, dep, "dependency uuid not found in trace");
                }
            }
        }
        if refs.is_empty() {
            base_question
        } else {
            format!(
                "{base_question}\n- Additional Information\n{}",
                serde_json::to_string(&refs).unwrap_or_default()
            )
        }
    } else {
        base_question
    };

    Some(QaPair {
        question,
        answer,
        uuid: step.uuid,
        hop_level: step.hop_level,
    })
}

/// Synthesize environments for every tool-necessary step of a record,
/// filling `env_result` (a `null` entry per skipped or failed step).
pub async fn synthesize_record(
    synthesizer: &ToolSynthesizer<'_>,
    record: &mut DecompositionRecord,
) -> Result<()> {
    let step_uuids: Vec<i64> = record.decomposition_trace.iter().map(|s| s.uuid).collect();
    let mut env_result = record.env_result.take().unwrap_or_default();

    for uuid in step_uuids {
        let necessary = record
            .step(uuid)
            .and_then(|s| s.tool_necessity)
            .unwrap_or(true);
        if !necessary {
            env_result.insert(uuid.to_string(), None);
            continue;
        }
        let Some(pair) = qa_pair_for_step(record, uuid) else {
            env_result.insert(uuid.to_string(), None);
            continue;
        };
        let outcome = synthesizer.synthesize(&pair).await?;
        env_result.insert(uuid.to_string(), outcome);
    }

    record.env_result = Some(env_result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> DecompositionRecord {
        serde_json::from_value(json!({
            "uuid": "r",
            "main_question": "m",
            "final_answer": "13960",
            "decomposition_trace": [
                {"_uuid": 1, "hop_level": 1, "sub_question": "population of Tokyo", "sub_answer": "13960000", "dependency": null, "tool_necessity": true},
                {"_uuid": 2, "hop_level": 2, "sub_question": "divide by 1000", "sub_answer": "13960", "dependency": [1], "tool_necessity": true}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn leaf_question_is_unaugmented() {
        let pair = qa_pair_for_step(&record(), 1).unwrap();
        assert_eq!(pair.question, "population of Tokyo");
        assert_eq!(pair.answer, "13960000");
        assert_eq!(pair.hop_level, 1);
    }

    #[test]
    fn dependent_question_gets_additional_information() {
        let pair = qa_pair_for_step(&record(), 2).unwrap();
        assert!(pair.question.starts_with("divide by 1000"));
        assert!(pair.question.contains("- Additional Information"));
        assert!(pair.question.contains("population of Tokyo"));
        assert!(pair.question.contains("13960000"));
    }

    #[test]
    fn unresolvable_dependency_falls_back_to_bare_question() {
        let mut rec = record();
        rec.decomposition_trace[1].dependency = Some(json!([42]));
        let pair = qa_pair_for_step(&rec, 2).unwrap();
        assert_eq!(pair.question, "divide by 1000");
    }
}

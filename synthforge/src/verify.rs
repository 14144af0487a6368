//! Decomposition verification: four independent judges over one record.
//!
//! Dependency necessity, atomicity, forced serialization and sub-question
//! completeness each produce a [`Scored`]; the composite is their
//! arithmetic mean and the record's `verify_result` carries both the
//! composite and every sub-judgement. Every failure path inside a judge
//! resolves to that judge's safe default — a broken judge must never fail a
//! good record.

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::judge::{Scored, gather_scored, mean_scores};
use crate::llm::ChatClient;
use crate::message::ChatMessage;
use crate::parse::parse_json;
use crate::runtime::Runtime;
use crate::trace::{DecompositionRecord, TraceStep};

/// Safe default for the dependency judge.
pub const SAFE_DEPENDENCY_SCORE: f64 = 1.0;
/// Safe default for the atomicity judge.
pub const SAFE_ATOMICITY_SCORE: f64 = 1.0;
/// Safe default for the forced-serialization judge.
pub const SAFE_FORCED_SERIAL_SCORE: f64 = 1.0;
/// Safe default for the completeness judge.
pub const SAFE_COMPLETENESS_SCORE: f64 = 1.0;

/// Sentinel score for a record whose dependency references cannot be
/// resolved at all; always fails any sane threshold.
pub const DEPENDENCY_ERROR_SCORE: f64 = -100.0;

/// The four-judge decomposition verifier.
#[derive(Debug, Clone, Copy)]
pub struct Verifier<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
    cfg: &'a ModelConfig,
}

impl<'a> Verifier<'a> {
    /// Bind a verifier to its runtime, client and judge model.
    #[must_use]
    pub const fn new(runtime: &'a Runtime, client: &'a ChatClient, cfg: &'a ModelConfig) -> Self {
        Self {
            runtime,
            client,
            cfg,
        }
    }

    /// Run all four judges concurrently and write `verify_result` onto the
    /// record.
    pub async fn verify(&self, record: &mut DecompositionRecord) -> Result<()> {
        info!(uuid = %record.uuid, "verifying decomposition");
        let (dependency, atomicity, serialization, completeness) = tokio::join!(
            self.verify_dependency(record),
            self.verify_atomicity(record),
            self.verify_forced_serialization(record),
            self.verify_completeness(record),
        );

        let scores = [
            dependency.score,
            atomicity.score,
            serialization.score,
            completeness.score,
        ];
        let composite = mean_scores(&scores).unwrap_or(SAFE_DEPENDENCY_SCORE);

        record.verify_result = Some(json!({
            "score": composite,
            "dependency": dependency,
            "atomicity": atomicity,
            "forced_serialization": serialization,
            "completeness": completeness,
        }));
        info!(uuid = %record.uuid, score = composite, "verification completed");
        Ok(())
    }

    // ----- dependency necessity ------------------------------------------

    /// One judged sample per step that declares dependencies; the judge
    /// sees the step's question plus every upstream `(query, answer)` pair
    /// and scores 0/1 on whether the citation set is exactly right.
    async fn verify_dependency(&self, record: &DecompositionRecord) -> Scored {
        let (samples, broken) = split_dependency_samples(record);
        if !broken.is_empty() {
            warn!(uuid = %record.uuid, ?broken, "unresolvable dependency references");
            return Scored::with_info(
                DEPENDENCY_ERROR_SCORE,
                json!({ "dependency_error_all_uuid": broken }),
            );
        }
        if samples.is_empty() {
            return Scored::with_info(
                SAFE_DEPENDENCY_SCORE,
                json!({
                    "info": [{"reason": "no dependent steps", "is_safe_score": 1}],
                    "is_safe_score": 1,
                }),
            );
        }

        let tasks: Vec<_> = samples
            .iter()
            .map(|sample| async move {
                let prompt = self.runtime.prompts.render(
                    "verify_dependency",
                    &[
                        ("dependency", sample.dependency_text.as_str()),
                        ("query", sample.query.as_str()),
                    ],
                )?;
                let outcome = self.client.chat(&[ChatMessage::user(prompt)], self.cfg).await?;
                if outcome.is_null() {
                    return Ok(Scored::safe(
                        SAFE_DEPENDENCY_SCORE,
                        outcome.failure.unwrap_or_default(),
                    ));
                }
                Ok(parse_dependency_verdict(outcome.text(), sample.uuid))
            })
            .collect();

        let results = gather_scored(
            self.runtime.semaphores.get("dependency_score"),
            "dependency_score",
            SAFE_DEPENDENCY_SCORE,
            tasks,
        )
        .await;

        let scores: Vec<f64> = results.iter().map(|r| r.score).collect();
        let score = mean_scores(&scores).unwrap_or(SAFE_DEPENDENCY_SCORE);
        Scored::with_info(score, json!({ "scores": scores, "info": results }))
    }

    // ----- atomicity ------------------------------------------------------

    /// A single judge returns a per-step map `{idx: {is_atomic, reason}}`;
    /// the judge score is the mean of the per-step flags.
    async fn verify_atomicity(&self, record: &DecompositionRecord) -> Scored {
        let result: Result<Scored> = async {
            let prompt = self.runtime.prompts.render(
                "verify_atomicity",
                &[
                    ("main_question", record.main_question.as_str()),
                    ("final_answer", &crate::trace::text_of(&record.final_answer)),
                    (
                        "decomposition_trace",
                        &serde_json::to_string_pretty(&record.decomposition_trace)?,
                    ),
                ],
            )?;
            let messages = [
                ChatMessage::system("You are a helpful assistant that verifies data quality."),
                ChatMessage::user(prompt),
            ];
            let outcome = self.client.chat(&messages, self.cfg).await?;
            if outcome.is_null() {
                return Ok(Scored::safe(
                    SAFE_ATOMICITY_SCORE,
                    outcome.failure.unwrap_or_default(),
                ));
            }

            let parsed = parse_json(outcome.text());
            let Some(map) = parsed.as_object() else {
                warn!(uuid = %record.uuid, "atomicity reply was not a JSON object; using safe score");
                return Ok(Scored::safe(
                    SAFE_ATOMICITY_SCORE,
                    parsed.err.unwrap_or_else(|| "not a JSON object".to_owned()),
                ));
            };

            let mut scores = Vec::new();
            for (key, value) in map {
                if key == "think" {
                    continue;
                }
                let Some(entry) = value.as_object() else { continue };
                scores.push(lenient_number(entry.get("is_atomic")).unwrap_or(SAFE_ATOMICITY_SCORE));
            }
            if scores.is_empty() {
                scores.push(SAFE_ATOMICITY_SCORE);
            }
            let score = mean_scores(&scores).unwrap_or(SAFE_ATOMICITY_SCORE);
            Ok(Scored::with_info(
                score,
                json!({
                    "scores": scores,
                    "reason": Value::Object(map.clone()),
                    "think": parsed.thought.clone(),
                }),
            ))
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(uuid = %record.uuid, error = %e, "atomicity judge failed; using safe score");
            Scored::safe(SAFE_ATOMICITY_SCORE, e.to_string())
        })
    }

    // ----- forced serialization ------------------------------------------

    /// The judge names problematic step ids; each named step scores 0,
    /// every other step 1, and the judge score is the per-step mean.
    async fn verify_forced_serialization(&self, record: &DecompositionRecord) -> Scored {
        let traj = &record.decomposition_trace;
        if traj.is_empty() {
            return Scored::safe(SAFE_FORCED_SERIAL_SCORE, "empty trace");
        }

        let result: Result<Scored> = async {
            let prompt = self
                .runtime
                .prompts
                .render("verify_forced_serialization", &[("traj_text", &format_traj(traj))])?;
            let outcome = self.client.chat(&[ChatMessage::user(prompt)], self.cfg).await?;
            if outcome.is_null() || outcome.text().is_empty() {
                return Ok(Scored::safe(
                    SAFE_FORCED_SERIAL_SCORE,
                    outcome.failure.unwrap_or_else(|| "empty response".to_owned()),
                ));
            }

            let parsed = parse_json(outcome.text());
            let Some(map) = parsed.as_object() else {
                return Ok(Scored::safe(
                    SAFE_FORCED_SERIAL_SCORE,
                    parsed.err.unwrap_or_else(|| "not a JSON object".to_owned()),
                ));
            };

            // The judge-level verdict must be exactly 0 or 1.
            let verdict = match lenient_number(map.get("score")) {
                Some(v) if v == 0.0 || v == 1.0 => v,
                other => {
                    warn!(uuid = %record.uuid, ?other, "invalid forced-serialization verdict");
                    SAFE_FORCED_SERIAL_SCORE
                }
            };

            let problematic: Vec<i64> = map
                .get("problematic_steps")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| match v {
                            Value::Number(n) => n.as_i64(),
                            Value::String(s) => s.trim().parse().ok(),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let step_scores: Vec<f64> = traj
                .iter()
                .map(|step| if problematic.contains(&step.uuid) { 0.0 } else { 1.0 })
                .collect();
            let score = mean_scores(&step_scores).unwrap_or(SAFE_FORCED_SERIAL_SCORE);

            Ok(Scored::with_info(
                score,
                json!({
                    "step_scores": step_scores,
                    "verdict": verdict,
                    "problematic_steps": problematic,
                    "reasoning": map.get("reasoning").cloned().unwrap_or(Value::Null),
                    "think": parsed.thought.clone(),
                }),
            ))
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(uuid = %record.uuid, error = %e, "forced-serialization judge failed; using safe score");
            let step_scores = vec![SAFE_FORCED_SERIAL_SCORE; traj.len()];
            Scored::with_info(
                SAFE_FORCED_SERIAL_SCORE,
                json!({ "step_scores": step_scores, "error": e.to_string(), "is_safe_score": 1 }),
            )
        })
    }

    // ----- completeness ---------------------------------------------------

    /// Does the union of sub-questions cover every requirement of the main
    /// question?
    async fn verify_completeness(&self, record: &DecompositionRecord) -> Scored {
        let result: Result<Scored> = async {
            let sub_questions: String = record
                .decomposition_trace
                .iter()
                .enumerate()
                .map(|(idx, step)| format!("{}. {}\n", idx + 1, step.question()))
                .collect();
            let prompt = self.runtime.prompts.render(
                "verify_subqa_completeness",
                &[
                    ("main_question", record.main_question.as_str()),
                    ("sub_questions", sub_questions.as_str()),
                ],
            )?;
            let outcome = self.client.chat(&[ChatMessage::user(prompt)], self.cfg).await?;
            if outcome.is_null() {
                return Ok(Scored::safe(
                    SAFE_COMPLETENESS_SCORE,
                    outcome.failure.unwrap_or_default(),
                ));
            }

            let parsed = parse_json(outcome.text());
            let Some(map) = parsed.as_object() else {
                return Ok(Scored::safe(
                    SAFE_COMPLETENESS_SCORE,
                    parsed.err.unwrap_or_else(|| "not a JSON object".to_owned()),
                ));
            };
            let score = lenient_number(map.get("score")).unwrap_or(SAFE_COMPLETENESS_SCORE);
            Ok(Scored::with_info(
                score,
                json!({
                    "main_question_requirements": map.get("main_question_requirements").cloned().unwrap_or(Value::Null),
                    "coverage_analysis": map.get("coverage_analysis").cloned().unwrap_or(Value::Null),
                    "think": parsed.thought.clone(),
                }),
            ))
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(uuid = %record.uuid, error = %e, "completeness judge failed; using safe score");
            Scored::safe(SAFE_COMPLETENESS_SCORE, e.to_string())
        })
    }
}

/// One dependency-judged sample.
#[derive(Debug, Clone)]
struct DependencySample {
    uuid: i64,
    query: String,
    dependency_text: String,
}

/// Build one sample per dependent step; uuids whose dependency lookups fail
/// land in the second list.
fn split_dependency_samples(record: &DecompositionRecord) -> (Vec<DependencySample>, Vec<i64>) {
    let index = record.step_index();
    let mut samples = Vec::new();
    let mut broken = Vec::new();

    for step in &record.decomposition_trace {
        let deps = step.dependency_ids();
        if deps.is_empty() {
            continue;
        }
        let mut text = String::new();
        let mut ok = true;
        for dep in &deps {
            match index.get(dep).map(|&i| &record.decomposition_trace[i]) {
                Some(dep_step) => {
                    text.push_str(&format!(
                        " step_{dep}_query:{}\nstep_{dep}_answer: {}\n\n",
                        dep_step.question(),
                        dep_step.answer()
                    ));
                }
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            samples.push(DependencySample {
                uuid: step.uuid,
                query: step.question(),
                dependency_text: text,
            });
        } else {
            broken.push(step.uuid);
        }
    }
    (samples, broken)
}

/// Parse one dependency verdict; anything unparseable scores safe.
fn parse_dependency_verdict(text: &str, uuid: i64) -> Scored {
    let parsed = parse_json(text);
    let Some(map) = parsed.as_object() else {
        warn!(uuid, "dependency verdict parse failed; using safe score");
        return Scored::with_info(
            SAFE_DEPENDENCY_SCORE,
            json!({
                "uuid": uuid,
                "error": parsed.err.unwrap_or_else(|| "no JSON found".to_owned()),
                "think": parsed.thought,
                "string": parsed.raw,
                "is_safe_score": 1,
            }),
        );
    };

    let score = lenient_number(map.get("score")).unwrap_or_else(|| {
        warn!(uuid, "dependency verdict score missing or invalid; using safe score");
        SAFE_DEPENDENCY_SCORE
    });
    Scored::with_info(
        score,
        json!({
            "uuid": uuid,
            "reason": map.get("reason").cloned().unwrap_or(Value::Null),
            "think": parsed.thought.clone(),
            "string": parsed.raw.clone(),
        }),
    )
}

/// Read a score that may arrive as a number or a digit string.
fn lenient_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compact one-line-per-step rendering for the forced-serialization judge.
fn format_traj(traj: &[TraceStep]) -> String {
    traj.iter()
        .map(|step| {
            format!(
                "- id:{} hop:{} is_parallel:{:?} dep:{:?} q:{} a:{}",
                step.uuid,
                step.hop_level,
                step.is_parallel,
                step.dependency_ids(),
                step.question(),
                step.answer()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(raw: Value) -> DecompositionRecord {
        serde_json::from_value(raw).unwrap()
    }

    fn two_hop() -> DecompositionRecord {
        record(json!({
            "uuid": "r",
            "main_question": "m",
            "final_answer": "f",
            "decomposition_trace": [
                {"_uuid": 1, "hop_level": 1, "sub_question": "population of Tokyo", "sub_answer": "13960000", "dependency": null},
                {"_uuid": 2, "hop_level": 2, "sub_question": "divide by 1000", "sub_answer": "13960", "dependency": [1]}
            ]
        }))
    }

    #[test]
    fn dependency_samples_carry_upstream_pairs() {
        let (samples, broken) = split_dependency_samples(&two_hop());
        assert!(broken.is_empty());
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].uuid, 2);
        assert!(samples[0].dependency_text.contains("step_1_query:population of Tokyo"));
        assert!(samples[0].dependency_text.contains("step_1_answer: 13960000"));
    }

    #[test]
    fn unresolvable_dependency_is_reported() {
        let rec = record(json!({
            "uuid": "r",
            "main_question": "m",
            "final_answer": "f",
            "decomposition_trace": [
                {"_uuid": 2, "hop_level": 2, "sub_question": "q", "sub_answer": "a", "dependency": [99]}
            ]
        }));
        let (samples, broken) = split_dependency_samples(&rec);
        assert!(samples.is_empty());
        assert_eq!(broken, vec![2]);
    }

    #[test]
    fn dependency_verdict_parsing() {
        let scored = parse_dependency_verdict(r#"{"score": 1, "reason": "all needed"}"#, 2);
        assert_eq!(scored.score, 1.0);
        assert!(!scored.is_safe());

        let scored = parse_dependency_verdict(r#"{"score": "0"}"#, 2);
        assert_eq!(scored.score, 0.0);

        let scored = parse_dependency_verdict("not json", 2);
        assert_eq!(scored.score, SAFE_DEPENDENCY_SCORE);
        assert!(scored.is_safe());
    }

    #[test]
    fn lenient_number_accepts_digit_strings() {
        assert_eq!(lenient_number(Some(&json!(1))), Some(1.0));
        assert_eq!(lenient_number(Some(&json!("0"))), Some(0.0));
        assert_eq!(lenient_number(Some(&json!("0.5"))), Some(0.5));
        assert_eq!(lenient_number(Some(&json!("maybe"))), None);
        assert_eq!(lenient_number(None), None);
    }

    #[test]
    fn traj_formatting_is_one_line_per_step() {
        let text = format_traj(&two_hop().decomposition_trace);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("- id:1 hop:1"));
        assert!(text.contains("dep:[1]"));
    }
}

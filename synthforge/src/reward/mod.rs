//! The reward scorer: seven judge dimensions over one trajectory.
//!
//! Dimensions: tool conciseness, final answer (correlation + summary),
//! tool-call success, intermediate plan, tool-return understanding, global
//! understanding, and global plan. Each dimension runs under its own named
//! semaphore and resolves every failure to its safe default with
//! `is_safe_score: 1`; the overall reward is the arithmetic mean of the
//! seven dimension scores.

mod language;
mod segments;

pub use language::{
    ANSWER_LANGUAGE_THRESHOLD, Language, QUERY_LANGUAGE_THRESHOLD, dominant_language,
    language_consistent, language_profile,
};
pub use segments::{
    PlanSegment, ToolBatch, final_answer, first_assistant, plan_segments, render_messages,
    tool_batches, tool_call_count, tool_ids_resolve, user_query,
};

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use tracing::warn;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::judge::{Scored, gather_scored, mean_scores};
use crate::llm::ChatClient;
use crate::message::{ChatMessage, Role};
use crate::parse::parse_json;
use crate::runtime::Runtime;
use crate::tool::ToolDefinition;

/// Safe default for the conciseness judge.
pub const SAFE_TOOL_CONCISE_SCORE: f64 = 1.0;
/// Safe default for the correlation judge.
pub const SAFE_FINAL_ANSWER_SCORE_CORRELATION: f64 = 1.0;
/// Safe default for the summary judge.
pub const SAFE_FINAL_ANSWER_SCORE_SUMMARY: f64 = 1.0;
/// Safe default for the tool-call success dimension.
pub const SAFE_TOOL_CALL_SCORE: f64 = 1.0;
/// Safe default verdict for one tool call's status.
pub const SAFE_TOOL_STATUS: bool = true;
/// Safe default for the intermediate-plan judge.
pub const SAFE_TOOL_CONTENT_PLAN_SCORE: f64 = 1.0;
/// Safe default for the tool-return-understanding judge.
pub const SAFE_TOOL_CONTENT_UNDERSTAND_SCORE: f64 = 1.0;
/// Safe default for the global understanding and global plan judges.
pub const SAFE_GLOBAL_PLAN_SCORE: f64 = 1.0;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s)\]>"']+"#).unwrap());

/// Extract URLs from text.
#[must_use]
pub fn extract_urls(text: &str) -> Vec<&str> {
    URL_RE.find_iter(text).map(|m| m.as_str()).collect()
}

/// The seven-dimension scorer.
#[derive(Debug, Clone, Copy)]
pub struct RewardScorer<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
    cfg: &'a ModelConfig,
}

impl<'a> RewardScorer<'a> {
    /// Bind the scorer to its runtime, client and judge model.
    #[must_use]
    pub const fn new(runtime: &'a Runtime, client: &'a ChatClient, cfg: &'a ModelConfig) -> Self {
        Self {
            runtime,
            client,
            cfg,
        }
    }

    /// Score a full record: reads `trajectory` and the tool catalog from
    /// `mcp_info`, writes `reward` back onto the record.
    pub async fn score_record(&self, record: &mut Value) -> Result<()> {
        let trajectory: Vec<ChatMessage> = record
            .get("trajectory")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let tools: Vec<ToolDefinition> = record
            .pointer("/mcp_info/base_info/tool_list")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let reward = self.score(&trajectory, &tools).await;
        if let Some(map) = record.as_object_mut() {
            map.insert("reward".to_owned(), serde_json::to_value(&reward)?);
        }
        Ok(())
    }

    /// Score one trajectory along all seven dimensions.
    pub async fn score(&self, trajectory: &[ChatMessage], tools: &[ToolDefinition]) -> Scored {
        let query = user_query(trajectory).unwrap_or_default().to_owned();
        let answer = final_answer(trajectory).unwrap_or_default().to_owned();

        let (concise, correlation, summary, status, plan, understanding, global) = tokio::join!(
            self.tool_conciseness(trajectory, &query),
            self.final_answer_correlation(&query, &answer),
            self.final_answer_summary(trajectory, &answer),
            self.tool_call_success(trajectory),
            self.intermediate_plan(trajectory, tools),
            self.tool_return_understanding(trajectory),
            self.global_judges(&query, tools, trajectory),
        );
        let (global_understanding, global_plan) = global;

        let final_answer_score =
            mean_scores(&[correlation.score, summary.score]).unwrap_or(SAFE_FINAL_ANSWER_SCORE_CORRELATION);
        let dimension_scores = [
            concise.score,
            final_answer_score,
            status.score,
            plan.score,
            understanding.score,
            global_understanding.score,
            global_plan.score,
        ];
        let overall = mean_scores(&dimension_scores).unwrap_or(1.0);

        Scored::with_info(
            overall,
            json!({
                "tool_conciseness": concise,
                "final_answer": {
                    "score": final_answer_score,
                    "correlation": correlation,
                    "summary": summary,
                },
                "tool_call_success": status,
                "intermediate_plan": plan,
                "tool_return_understanding": understanding,
                "global_understanding": global_understanding,
                "global_plan": global_plan,
            }),
        )
    }

    /// Ask one judge for a JSON object; `None` when the call or parse
    /// fails.
    async fn judge_object(&self, prompt: String) -> Option<Value> {
        let outcome = self
            .client
            .chat(&[ChatMessage::user(prompt)], self.cfg)
            .await
            .ok()?;
        if outcome.is_null() {
            return None;
        }
        let parsed = parse_json(outcome.text());
        parsed.as_object().map(|m| Value::Object(m.clone()))
    }

    // ----- 1. tool conciseness -------------------------------------------

    async fn tool_conciseness(&self, trajectory: &[ChatMessage], query: &str) -> Scored {
        if tool_call_count(trajectory) == 0 {
            return Scored::safe(SAFE_TOOL_CONCISE_SCORE, "trajectory has no tool calls");
        }
        let result: Result<Scored> = async {
            let prompt = self.runtime.prompts.render(
                "reward_concise",
                &[
                    ("query", query),
                    ("trajectory", &render_messages(trajectory)),
                ],
            )?;
            let Some(reply) = self.judge_object(prompt).await else {
                return Ok(Scored::safe(SAFE_TOOL_CONCISE_SCORE, "judge reply unparseable"));
            };
            let call_scores: Vec<f64> = reply
                .get("calls")
                .and_then(Value::as_array)
                .map(|calls| {
                    calls
                        .iter()
                        .filter_map(|c| c.get("score"))
                        .filter_map(Value::as_f64)
                        .filter(|s| *s == 0.0 || *s == 1.0)
                        .collect()
                })
                .unwrap_or_default();
            if call_scores.is_empty() {
                return Ok(Scored::safe(SAFE_TOOL_CONCISE_SCORE, "no per-call scores"));
            }
            let score = mean_scores(&call_scores).unwrap_or(SAFE_TOOL_CONCISE_SCORE);
            Ok(Scored::with_info(
                score,
                json!({ "call_scores": call_scores, "calls": reply.get("calls") }),
            ))
        }
        .await;
        result.unwrap_or_else(|e| Scored::safe(SAFE_TOOL_CONCISE_SCORE, e.to_string()))
    }

    // ----- 2. final-answer correlation -----------------------------------

    async fn final_answer_correlation(&self, query: &str, answer: &str) -> Scored {
        if !language_consistent(query, answer) {
            return Scored::with_info(
                0.0,
                json!({ "reason": "answer language differs from query language" }),
            );
        }
        let result: Result<Scored> = async {
            let prompt = self.runtime.prompts.render(
                "reward_final_answer_correlation",
                &[("query", query), ("final_answer", answer)],
            )?;
            Ok(self
                .discrete_judge(prompt, &[0.0, 0.5, 1.0], SAFE_FINAL_ANSWER_SCORE_CORRELATION)
                .await)
        }
        .await;
        result.unwrap_or_else(|e| Scored::safe(SAFE_FINAL_ANSWER_SCORE_CORRELATION, e.to_string()))
    }

    // ----- 3. final-answer summary ---------------------------------------

    async fn final_answer_summary(&self, trajectory: &[ChatMessage], answer: &str) -> Scored {
        let result: Result<Scored> = async {
            let rendered = render_messages(trajectory);
            let novel_urls: Vec<&str> = extract_urls(answer)
                .into_iter()
                .filter(|url| !rendered.contains(*url))
                .collect();
            if !novel_urls.is_empty() {
                let prompt = self.runtime.prompts.render(
                    "reward_url",
                    &[
                        ("urls", &novel_urls.join("\n")),
                        ("trajectory", &rendered),
                        ("final_answer", answer),
                    ],
                )?;
                let fabricated = self
                    .judge_object(prompt)
                    .await
                    .and_then(|r| r.get("fabricated").and_then(Value::as_bool))
                    .unwrap_or(false);
                if fabricated {
                    return Ok(Scored::with_info(
                        0.0,
                        json!({ "reason": "fabricated URLs in final answer", "urls": novel_urls }),
                    ));
                }
            }
            let prompt = self.runtime.prompts.render(
                "reward_final_answer_summary",
                &[("trajectory", &rendered), ("final_answer", answer)],
            )?;
            Ok(self
                .discrete_judge(prompt, &[0.0, 0.5, 1.0], SAFE_FINAL_ANSWER_SCORE_SUMMARY)
                .await)
        }
        .await;
        result.unwrap_or_else(|e| Scored::safe(SAFE_FINAL_ANSWER_SCORE_SUMMARY, e.to_string()))
    }

    // ----- 4. tool-call success ------------------------------------------

    async fn tool_call_success(&self, trajectory: &[ChatMessage]) -> Scored {
        let observations: Vec<(String, String)> = trajectory
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| {
                let invocation = m
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| find_invocation(trajectory, id))
                    .unwrap_or_else(|| "(unknown invocation)".to_owned());
                (invocation, m.text().to_owned())
            })
            .collect();
        if observations.is_empty() {
            return Scored::safe(SAFE_TOOL_CALL_SCORE, "trajectory has no tool messages");
        }

        let tasks: Vec<_> = observations
            .iter()
            .map(|(invocation, observation)| async move {
                let prompt = self.runtime.prompts.render(
                    "tool_status",
                    &[
                        ("invocation", invocation.as_str()),
                        ("observation", observation.as_str()),
                    ],
                )?;
                let status = self
                    .judge_object(prompt)
                    .await
                    .and_then(|r| r.get("tool_status").and_then(Value::as_bool))
                    .unwrap_or(SAFE_TOOL_STATUS);
                Ok(Scored::with_info(
                    if status { 1.0 } else { 0.0 },
                    json!({ "tool_status": status }),
                ))
            })
            .collect();

        let verdicts = gather_scored(
            self.runtime.semaphores.get("tool_call_status"),
            "tool_call_status",
            1.0,
            tasks,
        )
        .await;

        let ok = verdicts.iter().filter(|v| v.score >= 1.0).count();
        let failed = verdicts.len() - ok;
        // Failed calls still earn half credit: execution happened.
        let score = (ok as f64).mul_add(1.0, failed as f64 * 0.5) / verdicts.len() as f64;
        Scored::with_info(
            score,
            json!({ "success": ok, "failed": failed, "total": verdicts.len(), "verdicts": verdicts }),
        )
    }

    // ----- 5. intermediate plan ------------------------------------------

    async fn intermediate_plan(&self, trajectory: &[ChatMessage], tools: &[ToolDefinition]) -> Scored {
        let segments = plan_segments(trajectory);
        if segments.is_empty() {
            return Scored::safe(SAFE_TOOL_CONTENT_PLAN_SCORE, "no plan segments");
        }
        let tool_defs = serde_json::to_string(tools).unwrap_or_default();

        let tasks: Vec<_> = segments
            .iter()
            .map(|segment| {
                let tool_defs = tool_defs.clone();
                async move {
                    let context = render_messages(&trajectory[..segment.index]);
                    let plan = render_messages(&trajectory[segment.index..=segment.index]);
                    let prompt = self.runtime.prompts.render(
                        "tool_content_plan",
                        &[
                            ("tool_defs", tool_defs.as_str()),
                            ("context", context.as_str()),
                            ("plan", plan.as_str()),
                        ],
                    )?;
                    // A single-call segment is right or wrong; 0.5 only
                    // exists for partially-correct parallel batches.
                    let allowed: &[f64] = if segment.call_count > 1 {
                        &[0.0, 0.5, 1.0]
                    } else {
                        &[0.0, 1.0]
                    };
                    Ok(self
                        .discrete_judge(prompt, allowed, SAFE_TOOL_CONTENT_PLAN_SCORE)
                        .await)
                }
            })
            .collect();

        let verdicts = gather_scored(
            self.runtime.semaphores.get("tool_content_plan"),
            "tool_content_plan",
            SAFE_TOOL_CONTENT_PLAN_SCORE,
            tasks,
        )
        .await;
        let scores: Vec<f64> = verdicts.iter().map(|v| v.score).collect();
        Scored::with_info(
            mean_scores(&scores).unwrap_or(SAFE_TOOL_CONTENT_PLAN_SCORE),
            json!({ "segment_scores": scores, "segments": verdicts }),
        )
    }

    // ----- 6. tool-return understanding ----------------------------------

    async fn tool_return_understanding(&self, trajectory: &[ChatMessage]) -> Scored {
        let batches = tool_batches(trajectory);
        // The last batch normally precedes the final answer, which the
        // summary judge already covers.
        let judged: Vec<&ToolBatch> = if batches.len() > 1 {
            batches[..batches.len() - 1].iter().collect()
        } else {
            Vec::new()
        };
        if judged.is_empty() {
            return Scored::safe(SAFE_TOOL_CONTENT_UNDERSTAND_SCORE, "no judged batches");
        }

        let tasks: Vec<_> = judged
            .iter()
            .map(|batch| async move {
                let observations = render_messages(&trajectory[batch.start..batch.end]);
                let reaction = batch
                    .following_assistant
                    .map(|idx| render_messages(&trajectory[idx..=idx]))
                    .unwrap_or_default();
                let prompt = self.runtime.prompts.render(
                    "tool_content_understand",
                    &[
                        ("observations", observations.as_str()),
                        ("reaction", reaction.as_str()),
                    ],
                )?;
                Ok(self
                    .discrete_judge(prompt, &[0.0, 0.5, 1.0], SAFE_TOOL_CONTENT_UNDERSTAND_SCORE)
                    .await)
            })
            .collect();

        let verdicts = gather_scored(
            self.runtime.semaphores.get("tool_content_understand"),
            "tool_content_understand",
            SAFE_TOOL_CONTENT_UNDERSTAND_SCORE,
            tasks,
        )
        .await;
        let scores: Vec<f64> = verdicts.iter().map(|v| v.score).collect();
        Scored::with_info(
            mean_scores(&scores).unwrap_or(SAFE_TOOL_CONTENT_UNDERSTAND_SCORE),
            json!({ "batch_scores": scores, "batches": verdicts }),
        )
    }

    // ----- 7. global understanding and global plan -----------------------

    async fn global_judges(
        &self,
        query: &str,
        tools: &[ToolDefinition],
        trajectory: &[ChatMessage],
    ) -> (Scored, Scored) {
        let Some(first) = first_assistant(trajectory) else {
            return (
                Scored::safe(SAFE_GLOBAL_PLAN_SCORE, "no assistant turn"),
                Scored::safe(SAFE_GLOBAL_PLAN_SCORE, "no assistant turn"),
            );
        };
        let first_turn = render_messages(std::slice::from_ref(first));
        let tool_defs = serde_json::to_string(tools).unwrap_or_default();

        let understanding = async {
            let prompt = self.runtime.prompts.render(
                "query_understand",
                &[("query", query), ("first_turn", first_turn.as_str())],
            )?;
            Ok::<Scored, crate::error::Error>(
                self.discrete_judge(prompt, &[0.0, 0.5, 1.0], SAFE_GLOBAL_PLAN_SCORE)
                    .await,
            )
        };
        let plan = async {
            let prompt = self.runtime.prompts.render(
                "query_plan",
                &[
                    ("query", query),
                    ("tool_defs", tool_defs.as_str()),
                    ("first_turn", first_turn.as_str()),
                ],
            )?;
            Ok::<Scored, crate::error::Error>(
                self.discrete_judge(prompt, &[0.0, 0.5, 1.0], SAFE_GLOBAL_PLAN_SCORE)
                    .await,
            )
        };
        let (understanding, plan) = tokio::join!(understanding, plan);
        (
            understanding.unwrap_or_else(|e| Scored::safe(SAFE_GLOBAL_PLAN_SCORE, e.to_string())),
            plan.unwrap_or_else(|e| Scored::safe(SAFE_GLOBAL_PLAN_SCORE, e.to_string())),
        )
    }

    /// One judge call whose score must land in `allowed`; anything else is
    /// the safe default.
    async fn discrete_judge(&self, prompt: String, allowed: &[f64], safe: f64) -> Scored {
        let Some(reply) = self.judge_object(prompt).await else {
            return Scored::safe(safe, "judge reply unparseable");
        };
        let score = reply.get("score").and_then(Value::as_f64);
        match score {
            Some(score) if allowed.contains(&score) => Scored::with_info(
                score,
                json!({ "reason": reply.get("reason").cloned().unwrap_or(Value::Null) }),
            ),
            other => {
                warn!(?other, "judge score outside allowed set; using safe default");
                Scored::safe(safe, format!("score {other:?} outside allowed set"))
            }
        }
    }
}

/// Find the assistant invocation a tool message answers, rendered as
/// `name(arguments)`.
fn find_invocation(trajectory: &[ChatMessage], call_id: &str) -> Option<String> {
    trajectory.iter().find_map(|m| {
        m.tool_calls.as_ref().and_then(|calls| {
            calls
                .iter()
                .find(|c| c.id == call_id)
                .map(|c| format!("{}({})", c.name(), c.function.arguments))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_extraction() {
        let urls = extract_urls("see https://a.example/x and (http://b.example/y).");
        assert_eq!(urls, vec!["https://a.example/x", "http://b.example/y"]);
        assert!(extract_urls("no links").is_empty());
    }

    #[test]
    fn invocation_lookup_by_call_id() {
        let trajectory = vec![
            ChatMessage::assistant_tool_calls(
                None,
                vec![crate::message::ToolCall::new("call_7", "search", r#"{"q":"x"}"#)],
            ),
            ChatMessage::tool("call_7", "result"),
        ];
        assert_eq!(
            find_invocation(&trajectory, "call_7").unwrap(),
            r#"search({"q":"x"})"#
        );
        assert!(find_invocation(&trajectory, "call_9").is_none());
    }

    #[test]
    fn failed_calls_earn_half_credit_formula() {
        // 2 successes + 2 failures over 4 calls: (2*1.0 + 2*0.5) / 4.
        let ok = 2usize;
        let failed = 2usize;
        let score = (ok as f64).mul_add(1.0, failed as f64 * 0.5) / 4.0;
        assert_eq!(score, 0.75);
    }
}

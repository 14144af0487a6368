//! Chain verification operators.
//!
//! Each enumerated sub-chain becomes its own record; the operators judge
//! whether a realistic task exists for it. Two operators ship: a
//! multi-sample vote over one model, and back-translation across several
//! models (chain → query → chain, accepted iff the round trip reproduces
//! the chain tool-for-tool). Operator payloads land under
//! `chain_info.operator_results[<name>]`, with failures recorded in-band.

use serde_json::{Value, json};
use tracing::warn;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::judge::{chains_match, majority_vote};
use crate::llm::ChatClient;
use crate::message::ChatMessage;
use crate::parse::parse_json;
use crate::runtime::Runtime;

const BACK_TRANSLATION_RETRIES: u32 = 3;

/// One record per sub-chain: copy `mcp_info` and `graph`, and set
/// `chain_info.sub_chain`.
#[must_use]
pub fn split_sub_chains(record: &Value) -> Vec<Value> {
    let sub_chains = crate::graph::sub_chains_of(record);
    if sub_chains.is_empty() {
        let group = record
            .pointer("/mcp_info/base_info/group_info/group_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        warn!(group, "record has no sub_chains; skipping");
        return Vec::new();
    }
    sub_chains
        .into_iter()
        .map(|chain| {
            json!({
                "mcp_info": record.get("mcp_info").cloned().unwrap_or(Value::Null),
                "graph": record.get("graph").cloned().unwrap_or(Value::Null),
                "chain_info": { "sub_chain": chain },
            })
        })
        .collect()
}

fn group_info(record: &Value) -> Value {
    record
        .pointer("/mcp_info/base_info/group_info")
        .cloned()
        .unwrap_or(Value::Null)
}

fn tool_list(record: &Value) -> Vec<Value> {
    record
        .pointer("/mcp_info/base_info/tool_list")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn sub_chain(record: &Value) -> Vec<String> {
    record
        .pointer("/chain_info/sub_chain")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// A chain-verification operator.
#[derive(Debug, Clone)]
pub enum Operator {
    /// N independent samples from one model, majority vote over `is_valid`.
    VoteVerify {
        /// Samples to draw.
        n_samples: usize,
    },
    /// Chain → query → chain across several models, majority vote over the
    /// round-trip match.
    BackTranslation {
        /// Model names to verify with (each keys into the config table).
        models: Vec<String>,
    },
}

impl Operator {
    /// The name the operator's payload is stored under.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VoteVerify { .. } => "vote_verify_chain",
            Self::BackTranslation { .. } => "back_translation_verify_chain",
        }
    }
}

/// Chain verification bound to a runtime and client.
#[derive(Debug, Clone, Copy)]
pub struct ChainVerifier<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
}

impl<'a> ChainVerifier<'a> {
    /// Bind the verifier.
    #[must_use]
    pub const fn new(runtime: &'a Runtime, client: &'a ChatClient) -> Self {
        Self { runtime, client }
    }

    /// Run `operators` in sequence over one record, writing each payload
    /// (or an in-band failure) under `chain_info.operator_results`.
    pub async fn run_operators(
        &self,
        record: &mut Value,
        operators: &[Operator],
        cfg: &ModelConfig,
    ) -> Result<()> {
        for operator in operators {
            let result = match operator {
                Operator::VoteVerify { n_samples } => {
                    self.vote_verify(record, cfg, *n_samples).await
                }
                Operator::BackTranslation { models } => {
                    self.back_translation_verify(record, models).await
                }
            };
            let payload = match result {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(operator = operator.name(), error = %e, "operator failed");
                    json!({ "error": e.to_string(), "status": "failed" })
                }
            };
            let results = record
                .pointer_mut("/chain_info")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| Error::record("record has no chain_info object"))?;
            let slot = results
                .entry("operator_results".to_owned())
                .or_insert_with(|| json!({}));
            if let Some(map) = slot.as_object_mut() {
                map.insert(operator.name().to_owned(), payload);
            }
        }
        Ok(())
    }

    /// Multi-sample vote: ask the judge `n_samples` times whether a
    /// realistic task needs this chain, majority over `is_valid`.
    pub async fn vote_verify(
        &self,
        record: &Value,
        cfg: &ModelConfig,
        n_samples: usize,
    ) -> Result<Value> {
        let api_info = json!({
            "group_info": group_info(record),
            "tool_list": tool_list(record),
        });
        let prompt = self.runtime.prompts.render(
            "verify_graph",
            &[
                ("api_info", &serde_json::to_string(&api_info)?),
                ("graph_paths_str", &serde_json::to_string(&sub_chain(record))?),
            ],
        )?;

        let mut answers = Vec::with_capacity(n_samples.max(1));
        for _ in 0..n_samples.max(1) {
            let outcome = self.client.chat(&[ChatMessage::user(&prompt)], cfg).await?;
            answers.push(outcome.text().to_owned());
        }

        let vote = vote_answers(&answers);
        Ok(json!({
            "vote_verify": { "answers": answers },
            "vote_result": vote,
        }))
    }

    /// Back-translation across `models`: each model synthesizes a query
    /// from the chain, then a chain from that query; the record passes a
    /// model when the chains match tool-for-tool.
    pub async fn back_translation_verify(&self, record: &Value, models: &[String]) -> Result<Value> {
        let chain = sub_chain(record);
        let tools = tool_list(record);
        let scenery = serde_json::to_string(&group_info(record))?;
        let semaphore = self.runtime.semaphores.get("chain_verify");

        let tasks = models.iter().map(|model| {
            let semaphore = semaphore.clone();
            let chain = chain.clone();
            let tools = tools.clone();
            let scenery = scenery.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::internal(e.to_string()))?;
                let cfg = self.runtime.configs.get(model)?;
                Ok::<Value, Error>(self.do_verify(&scenery, &tools, &chain, cfg).await)
            }
        });

        let mut verifies = Vec::new();
        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(verify) => verifies.push(verify),
                Err(e) => warn!(error = %e, "back-translation worker failed"),
            }
        }

        let votes: Vec<bool> = verifies
            .iter()
            .map(|v| v.get("valid").and_then(Value::as_bool).unwrap_or(false))
            .collect();
        Ok(json!({
            "vote_valid": majority_vote(&votes),
            "back_verifies": verifies,
        }))
    }

    async fn do_verify(
        &self,
        scenery: &str,
        tools: &[Value],
        chain: &[String],
        cfg: &ModelConfig,
    ) -> Value {
        let query = match self.query_from_chain(scenery, tools, chain, cfg).await {
            Ok(Some(query)) => query,
            Ok(None) => {
                return json!({ "valid": false, "verify": "fail", "back_translation": Value::Null });
            }
            Err(e) => {
                warn!(error = %e, "query synthesis failed");
                return json!({ "valid": false, "verify": "fail", "back_translation": Value::Null });
            }
        };

        match self.chain_from_query(scenery, tools, &query, cfg).await {
            Ok(Some(round_trip)) => {
                let produced: Vec<String> = round_trip
                    .get("chain")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_owned)
                            .collect()
                    })
                    .unwrap_or_default();
                let valid = chains_match(chain, &produced);
                json!({ "valid": valid, "verify": "succeed", "back_translation": round_trip })
            }
            Ok(None) | Err(_) => {
                json!({ "valid": false, "verify": "fail", "back_translation": Value::Null })
            }
        }
    }

    /// Chain → query. `None` when the model marks the chain unnatural or
    /// retries run out.
    async fn query_from_chain(
        &self,
        scenery: &str,
        tools: &[Value],
        chain: &[String],
        cfg: &ModelConfig,
    ) -> Result<Option<String>> {
        let prompt = self.runtime.prompts.render(
            "gen_query_from_chain",
            &[
                ("tools", &serde_json::to_string(tools)?),
                ("scenery", scenery),
                ("chain", &serde_json::to_string(chain)?),
            ],
        )?;
        for _ in 0..=BACK_TRANSLATION_RETRIES {
            let outcome = self.client.chat(&[ChatMessage::user(&prompt)], cfg).await?;
            let parsed = parse_json(outcome.text());
            let Some(map) = parsed.as_object() else { continue };
            if map.get("valid").and_then(Value::as_bool) == Some(true) {
                if let Some(query) = map.get("query").and_then(Value::as_str) {
                    return Ok(Some(query.to_owned()));
                }
            } else if map.contains_key("valid") {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Query → chain. Every produced tool must exist in the tool list.
    async fn chain_from_query(
        &self,
        scenery: &str,
        tools: &[Value],
        query: &str,
        cfg: &ModelConfig,
    ) -> Result<Option<Value>> {
        let known: Vec<&str> = tools
            .iter()
            .filter_map(|t| t.get("name").and_then(Value::as_str))
            .collect();
        let prompt = self.runtime.prompts.render(
            "gen_chain_from_query",
            &[
                ("scenery", scenery),
                ("tools", &serde_json::to_string(tools)?),
                ("query", query),
            ],
        )?;
        for _ in 0..=BACK_TRANSLATION_RETRIES {
            let outcome = self.client.chat(&[ChatMessage::user(&prompt)], cfg).await?;
            let parsed = parse_json(outcome.text());
            let Some(map) = parsed.as_object() else { continue };
            let Some(chain) = map.get("chain").and_then(Value::as_array) else {
                continue;
            };
            if chain.is_empty() {
                continue;
            }
            let all_known = chain
                .iter()
                .filter_map(Value::as_str)
                .all(|tool| known.contains(&tool));
            if !all_known {
                warn!("round-trip chain names an unknown tool");
                continue;
            }
            let mut payload = Value::Object(map.clone());
            payload["query"] = Value::String(query.to_owned());
            return Ok(Some(payload));
        }
        Ok(None)
    }
}

/// Vote result over multiple judge samples.
#[must_use]
pub fn vote_answers(answers: &[String]) -> Value {
    let mut vote_true = 0usize;
    let mut vote_false = 0usize;
    let mut parse_errors = 0usize;
    let mut selected: Option<(usize, Value)> = None;

    for (idx, answer) in answers.iter().enumerate() {
        let parsed = parse_json(answer);
        let Some(map) = parsed.as_object() else {
            parse_errors += 1;
            continue;
        };
        if map.get("is_valid").and_then(Value::as_bool).unwrap_or(false) {
            vote_true += 1;
            if selected.is_none() {
                selected = Some((idx, Value::Object(map.clone())));
            }
        } else {
            vote_false += 1;
        }
    }

    let is_valid = vote_true > vote_false;
    let mut result = json!({
        "is_valid": is_valid,
        "task_description": "",
        "user_query": "",
        "task_plan": "",
        "vote_count": {
            "true": vote_true,
            "false": vote_false,
            "parse_error": parse_errors,
        },
        "selected_answer_index": Value::Null,
    });
    if is_valid && let Some((idx, answer)) = selected {
        result["task_description"] = answer.get("task_description").cloned().unwrap_or_default();
        result["user_query"] = answer.get("user_query").cloned().unwrap_or_default();
        result["task_plan"] = answer.get("task_plan").cloned().unwrap_or_default();
        result["selected_answer_index"] = json!(idx);
    }
    result
}

/// Whether a sub-chain record passed its operators (used to gate query
/// generation).
#[must_use]
pub fn chain_accepted(record: &Value) -> bool {
    let vote_ok = record
        .pointer("/chain_info/operator_results/vote_verify_chain/vote_result/is_valid")
        .and_then(Value::as_bool);
    let back_ok = record
        .pointer("/chain_info/operator_results/back_translation_verify_chain/vote_valid")
        .and_then(Value::as_bool);
    match (vote_ok, back_ok) {
        (Some(v), Some(b)) => v && b,
        (Some(v), None) => v,
        (None, Some(b)) => b,
        (None, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitting_yields_one_record_per_chain() {
        let record = json!({
            "mcp_info": {"base_info": {"group_info": {"group_id": "g"}, "tool_list": []}},
            "graph": {"sub_chains": [["a", "b"], ["b", "c"]]},
        });
        let split = split_sub_chains(&record);
        assert_eq!(split.len(), 2);
        assert_eq!(split[0]["chain_info"]["sub_chain"], json!(["a", "b"]));
        assert_eq!(split[1]["mcp_info"]["base_info"]["group_info"]["group_id"], "g");
    }

    #[test]
    fn vote_counts_and_selects_first_valid() {
        let answers = vec![
            r#"{"is_valid": true, "task_description": "d1", "user_query": "q1", "task_plan": "p1"}"#.to_owned(),
            "garbage".to_owned(),
            r#"{"is_valid": false}"#.to_owned(),
            r#"{"is_valid": true, "task_description": "d2"}"#.to_owned(),
        ];
        let vote = vote_answers(&answers);
        assert_eq!(vote["is_valid"], true);
        assert_eq!(vote["vote_count"]["true"], 2);
        assert_eq!(vote["vote_count"]["false"], 1);
        assert_eq!(vote["vote_count"]["parse_error"], 1);
        assert_eq!(vote["selected_answer_index"], 0);
        assert_eq!(vote["user_query"], "q1");
    }

    #[test]
    fn tie_votes_reject() {
        let answers = vec![
            r#"{"is_valid": true}"#.to_owned(),
            r#"{"is_valid": false}"#.to_owned(),
        ];
        let vote = vote_answers(&answers);
        assert_eq!(vote["is_valid"], false);
        assert_eq!(vote["selected_answer_index"], Value::Null);
    }

    #[test]
    fn acceptance_requires_all_present_operators() {
        let both = json!({"chain_info": {"operator_results": {
            "vote_verify_chain": {"vote_result": {"is_valid": true}},
            "back_translation_verify_chain": {"vote_valid": true}
        }}});
        assert!(chain_accepted(&both));

        let split_verdict = json!({"chain_info": {"operator_results": {
            "vote_verify_chain": {"vote_result": {"is_valid": true}},
            "back_translation_verify_chain": {"vote_valid": false}
        }}});
        assert!(!chain_accepted(&split_verdict));

        assert!(!chain_accepted(&json!({"chain_info": {}})));
    }
}

//! The cluster-merge engine.
//!
//! After per-step synthesis, sub-questions with the same intent each carry
//! their own tool. This stage clusters them, rewrites one member's code so
//! a single implementation serves every member (only the mock-data portion
//! may change; the signature must not), regenerates each member's call
//! statement, re-verifies every member against the sandbox, and rewrites
//! the passing members' environments with the merged artifact.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::{API_MAX_RETRY_TIMES, API_RETRY_SLEEP_SECS, MERGE_MAX_RETRY_TIMES, ModelConfig};
use crate::error::Result;
use crate::llm::ChatClient;
use crate::message::ChatMessage;
use crate::parse::{
    extract_json_span, first_function_signature, normalize_call_statement, split_reasoning,
    strip_code_fences,
};
use crate::retry::RetryPolicy;
use crate::runtime::Runtime;
use crate::trace::{Cluster, DecompositionRecord};

/// One cluster member's QA and code, extracted from `env_result`.
#[derive(Debug, Clone, Default)]
pub struct QaCode {
    /// Step uuid.
    pub uuid: i64,
    /// The question the member's tool was built for.
    pub question: String,
    /// The expected answer.
    pub answer: String,
    /// The member's synthesized code.
    pub code: String,
    /// The member's tool name.
    pub tool_name: String,
    /// The member's tool document.
    pub tool_document: Value,
    /// The member's call statement.
    pub tool_call_statement: String,
}

/// Verdict for one member against the merged code.
#[derive(Debug, Clone)]
pub struct MemberTest {
    /// Step uuid.
    pub uuid: i64,
    /// `passed`, `failed`, `error` or `skipped`.
    pub status: &'static str,
    /// Stdout on executed members.
    pub stdout: Option<String>,
    /// Failure detail.
    pub reason: Option<String>,
}

impl MemberTest {
    fn to_value(&self) -> Value {
        json!({
            "uuid": self.uuid,
            "status": self.status,
            "stdout": self.stdout,
            "reason": self.reason,
        })
    }
}

/// The merge engine bound to a model and a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct MergeEngine<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
    cfg: &'a ModelConfig,
}

impl<'a> MergeEngine<'a> {
    /// Bind the engine to its runtime, client and model.
    #[must_use]
    pub const fn new(runtime: &'a Runtime, client: &'a ChatClient, cfg: &'a ModelConfig) -> Self {
        Self {
            runtime,
            client,
            cfg,
        }
    }

    /// Run the full merge pipeline on one record.
    ///
    /// Returns the enriched record, the record unchanged when nothing needs
    /// merging, or `None` when the record must be dropped (invalid
    /// environments or a post-processing mismatch).
    pub async fn merge_tools(
        &self,
        mut record: DecompositionRecord,
    ) -> Result<Option<DecompositionRecord>> {
        if record.env_result.is_none() {
            return Ok(Some(record));
        }
        if !check_env(&record) {
            error!(uuid = %record.uuid, "env_result failed validation; dropping record");
            return Ok(None);
        }

        let clusters = self.intent_aggregation(&record).await?;
        info!(uuid = %record.uuid, clusters = clusters.len(), "intent aggregation done");
        record.clusters = Some(clusters.clone());

        let mut aggregated = Vec::new();
        let mut merged_any = false;
        for (idx, cluster) in clusters.iter().enumerate() {
            if cluster.uuids.len() <= 1 {
                continue;
            }
            merged_any = true;
            info!(
                uuid = %record.uuid,
                cluster = idx + 1,
                members = cluster.uuids.len(),
                intent = %cluster.intent_summary,
                "merging cluster",
            );
            let merged = self.merge_cluster(&record, cluster).await?;
            aggregated.push(merged);
        }

        if !merged_any {
            info!(uuid = %record.uuid, "no multi-member clusters; record unchanged");
            return Ok(Some(record));
        }
        record.aggregated_env = Some(aggregated);

        match post_process(record) {
            Some(record) => Ok(Some(record)),
            None => Ok(None),
        }
    }

    /// One LLM call groups sub-questions by shared intent. Retries with
    /// exponential backoff; exhaustion yields no clusters, leaving the
    /// record unchanged downstream.
    pub async fn intent_aggregation(&self, record: &DecompositionRecord) -> Result<Vec<Cluster>> {
        let candidates: Vec<Value> = record
            .decomposition_trace
            .iter()
            .filter(|step| step.tool_necessity.unwrap_or(true))
            .map(|step| {
                json!({
                    "_uuid": step.uuid,
                    "question": step.question(),
                    "answer": step.answer(),
                    "function_implementation": {},
                })
            })
            .collect();

        let prompt = self.runtime.prompts.render(
            "merge_intent_aggregation",
            &[("questions", &serde_json::to_string(&candidates)?)],
        )?;

        let policy = RetryPolicy::exponential(
            API_MAX_RETRY_TIMES,
            Duration::from_secs(API_RETRY_SLEEP_SECS),
        );
        let prompt = prompt.as_str();
        let result = crate::retry::retry(policy, |_| true, || {
            async move {
                let outcome = self.client.chat(&[ChatMessage::user(prompt)], self.cfg).await?;
                if outcome.is_null() || outcome.text().is_empty() {
                    return Err(crate::error::Error::internal("empty aggregation response"));
                }
                let parsed = crate::parse::parse_json(outcome.text());
                let clusters = parsed
                    .value
                    .as_ref()
                    .and_then(|v| match v {
                        Value::Array(items) => items.first(),
                        obj @ Value::Object(_) => Some(obj),
                        _ => None,
                    })
                    .and_then(|obj| obj.get("clusters"))
                    .cloned()
                    .ok_or_else(|| crate::error::Error::internal("no clusters field in reply"))?;
                let clusters: Vec<Cluster> = serde_json::from_value(clusters)?;
                Ok(clusters)
            }
        })
        .await;

        match result {
            Ok(clusters) => Ok(clusters),
            Err(e) => {
                error!(uuid = %record.uuid, error = %e, "intent aggregation exhausted retries");
                Ok(Vec::new())
            }
        }
    }

    /// Ask the model to regenerate every member's call statement against
    /// the merged code.
    async fn generate_call_statements(
        &self,
        code: &str,
        members: &[QaCode],
    ) -> Result<HashMap<i64, String>> {
        let (fn_name, arg_names) = first_function_signature(code);
        let qa_section: String = members
            .iter()
            .enumerate()
            .map(|(i, qa)| {
                format!(
                    "### QA {}\n_uuid: {}\nquestion: {}\nanswer: {}\n",
                    i + 1,
                    qa.uuid,
                    qa.question,
                    qa.answer
                )
            })
            .collect();
        let prompt = self.runtime.prompts.render(
            "merge_tool_call_gen",
            &[
                ("fn_name", fn_name.as_deref().unwrap_or("FUNCTION_NAME_UNKNOWN")),
                ("arg_list", &arg_names.join(", ")),
                ("qa_section", &qa_section),
                ("code", code),
            ],
        )?;

        let outcome = self.client.chat(&[ChatMessage::user(prompt)], self.cfg).await?;
        let mut mapping = HashMap::new();
        let Some(Value::Array(items)) = extract_json_span(outcome.text()) else {
            return Ok(mapping);
        };
        for item in items {
            let Some(obj) = item.as_object() else { continue };
            let uuid = match obj.get("_uuid") {
                Some(Value::Number(n)) => n.as_i64(),
                Some(Value::String(s)) => s.trim().parse().ok(),
                _ => None,
            };
            let statement = obj
                .get("tool_call_statement")
                .and_then(Value::as_str)
                .map(normalize_call_statement)
                .filter(|s| !s.is_empty());
            if let (Some(uuid), Some(statement)) = (uuid, statement) {
                mapping.insert(uuid, statement);
            }
        }
        Ok(mapping)
    }

    /// Execute every member's statement against the merged code and check
    /// the answer-in-stdout invariant.
    async fn verify_merged_code(
        &self,
        merged_code: &str,
        members: &[QaCode],
    ) -> Result<(bool, Vec<MemberTest>)> {
        let sandbox = self.runtime.sandbox()?;
        let mut tests = Vec::with_capacity(members.len());
        let mut all_passed = true;
        let mut ran_any = false;

        for member in members {
            let statement = normalize_call_statement(&member.tool_call_statement);
            if statement.is_empty() {
                all_passed = false;
                tests.push(MemberTest {
                    uuid: member.uuid,
                    status: "skipped",
                    stdout: None,
                    reason: Some("no tool_call_statement".to_owned()),
                });
                continue;
            }
            ran_any = true;
            let final_code = format!("{merged_code}\nprint({statement})");
            match sandbox.run_code(&final_code).await {
                Ok(run) if run.is_success() => {
                    let stdout = run.run_result.stdout;
                    if stdout.contains(&member.answer) {
                        tests.push(MemberTest {
                            uuid: member.uuid,
                            status: "passed",
                            stdout: Some(stdout),
                            reason: None,
                        });
                    } else {
                        all_passed = false;
                        tests.push(MemberTest {
                            uuid: member.uuid,
                            status: "failed",
                            stdout: Some(stdout),
                            reason: Some(format!("answer '{}' not in stdout", member.answer)),
                        });
                    }
                }
                Ok(run) => {
                    all_passed = false;
                    tests.push(MemberTest {
                        uuid: member.uuid,
                        status: "error",
                        stdout: None,
                        reason: run.error.or(Some("sandbox reported failure".to_owned())),
                    });
                }
                Err(e) => {
                    all_passed = false;
                    tests.push(MemberTest {
                        uuid: member.uuid,
                        status: "error",
                        stdout: None,
                        reason: Some(e.to_string()),
                    });
                }
            }
        }

        Ok((all_passed && ran_any, tests))
    }

    /// Merge one cluster: patch mock data, regenerate statements, verify,
    /// and keep the best attempt across the retry budget.
    pub async fn merge_cluster(
        &self,
        record: &DecompositionRecord,
        cluster: &Cluster,
    ) -> Result<Value> {
        let mut members = extract_qa_code(record, &cluster.uuids);
        let original_members: Vec<Value> = members.iter().map(qa_code_to_value).collect();
        if members.is_empty() {
            warn!(intent = %cluster.intent_summary, "no member data found for cluster");
            return Ok(json!({
                "intent_summary": cluster.intent_summary,
                "reason": cluster.reason,
                "main_uuid": cluster.main_uuid,
                "_uuids": cluster.uuids,
                "status": "no_data",
                "merged_code": Value::Null,
                "original_qa_code": [],
            }));
        }

        let base_code = members[0].code.trim().to_owned();
        let tool_document = members[0].tool_document.clone();
        let tool_names: Vec<String> = {
            let mut names: Vec<String> = members
                .iter()
                .map(|m| m.tool_name.clone())
                .filter(|n| !n.is_empty())
                .collect();
            names.sort_unstable();
            names.dedup();
            names
        };

        let mut best: Option<(usize, String, Vec<MemberTest>, u32)> = None;
        for attempt in 0..MERGE_MAX_RETRY_TIMES {
            let result: Result<(String, Vec<MemberTest>, bool)> = async {
                let mut prompt = self.patch_mock_prompt(&base_code, &members, &cluster.intent_summary)?;
                if attempt > 0 {
                    prompt.push_str(&format!(
                        "\n\nNote: this is attempt {}. Fix the mock data so every instance passes.",
                        attempt + 1
                    ));
                }
                let outcome = self.client.chat(&[ChatMessage::user(prompt)], self.cfg).await?;
                let (_, body) = split_reasoning(outcome.text());
                let merged_code = strip_code_fences(body).to_owned();
                if merged_code.is_empty() {
                    return Err(crate::error::Error::internal("empty merged code"));
                }

                let statements = self.generate_call_statements(&merged_code, &members).await?;
                for member in &mut members {
                    if let Some(statement) = statements.get(&member.uuid) {
                        member.tool_call_statement.clone_from(statement);
                    } else {
                        member.tool_call_statement.clear();
                    }
                }

                let (all_passed, tests) = self.verify_merged_code(&merged_code, &members).await?;
                Ok((merged_code, tests, all_passed))
            }
            .await;

            let (merged_code, tests, all_passed) = match result {
                Ok(t) => t,
                Err(e) => {
                    warn!(attempt, error = %e, "merge attempt failed");
                    continue;
                }
            };

            let passed = tests.iter().filter(|t| t.status == "passed").count();
            info!(
                intent = %cluster.intent_summary,
                attempt,
                passed,
                total = tests.len(),
                "merge verification round",
            );

            if all_passed {
                return Ok(self.cluster_payload(
                    cluster,
                    "success",
                    &merged_code,
                    &tool_names,
                    &tool_document,
                    &members,
                    &tests,
                    &original_members,
                    attempt,
                    true,
                ));
            }
            if best.as_ref().is_none_or(|(best_passed, ..)| passed >= *best_passed) {
                best = Some((passed, merged_code, tests, attempt));
            }
        }

        match best {
            Some((passed, merged_code, tests, retry_count)) => {
                info!(
                    intent = %cluster.intent_summary,
                    passed,
                    total = members.len(),
                    "best merge kept after exhausting retries",
                );
                Ok(self.cluster_payload(
                    cluster,
                    "partial_success",
                    &merged_code,
                    &tool_names,
                    &tool_document,
                    &members,
                    &tests,
                    &original_members,
                    retry_count,
                    false,
                ))
            }
            None => Ok(json!({
                "intent_summary": cluster.intent_summary,
                "reason": cluster.reason,
                "main_uuid": cluster.main_uuid,
                "_uuids": cluster.uuids,
                "status": "failed",
                "error": format!("all {MERGE_MAX_RETRY_TIMES} retries failed"),
                "merged_code": Value::Null,
                "original_qa_code": original_members,
            })),
        }
    }

    fn patch_mock_prompt(
        &self,
        base_code: &str,
        members: &[QaCode],
        intent_summary: &str,
    ) -> Result<String> {
        let (fn_name, arg_names) = first_function_signature(base_code);
        let fn_hint = fn_name.map_or_else(
            || "(unable to parse function signature)".to_owned(),
            |name| format!("{name}({})", arg_names.join(", ")),
        );
        let qa_section: String = members
            .iter()
            .enumerate()
            .map(|(i, qa)| {
                format!(
                    "### instance {}\nquestion: {}\nanswer (must appear as a substring of the printed result): {}\ntool_call_statement: {}\n",
                    i + 1,
                    qa.question,
                    qa.answer,
                    qa.tool_call_statement
                )
            })
            .collect();
        let intent_line = if intent_summary.is_empty() {
            String::new()
        } else {
            format!("tool intent: {intent_summary}")
        };
        self.runtime.prompts.render(
            "merge_tools_code",
            &[
                ("intent_line", intent_line.as_str()),
                ("fn_hint", fn_hint.as_str()),
                ("qa_section", qa_section.as_str()),
                ("base_code", base_code),
            ],
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn cluster_payload(
        &self,
        cluster: &Cluster,
        status: &str,
        merged_code: &str,
        tool_names: &[String],
        tool_document: &Value,
        members: &[QaCode],
        tests: &[MemberTest],
        original_members: &[Value],
        retry_count: u32,
        all_passed: bool,
    ) -> Value {
        let statements: Vec<Value> = members
            .iter()
            .map(|qa| {
                json!({
                    "_uuid": qa.uuid,
                    "tool_call_statement": qa.tool_call_statement,
                    "question": qa.question,
                    "answer": qa.answer,
                })
            })
            .collect();
        let passed_count = tests.iter().filter(|t| t.status == "passed").count();
        json!({
            "intent_summary": cluster.intent_summary,
            "reason": cluster.reason,
            "main_uuid": cluster.main_uuid,
            "_uuids": cluster.uuids,
            "status": status,
            "merged_code": merged_code,
            "tool_names": tool_names,
            "tool_document": tool_document,
            "tool_call_statements": statements,
            "original_qa_code": original_members,
            "verification": {
                "all_tests_passed": all_passed,
                "test_results": tests.iter().map(MemberTest::to_value).collect::<Vec<_>>(),
                "passed_count": passed_count,
                "total_count": members.len(),
                "retry_count": retry_count,
            },
        })
    }
}

fn qa_code_to_value(qa: &QaCode) -> Value {
    json!({
        "_uuid": qa.uuid,
        "question": qa.question,
        "answer": qa.answer,
        "code": qa.code,
        "tool_name": qa.tool_name,
        "tool_document": qa.tool_document,
        "tool_call_statement": qa.tool_call_statement,
    })
}

/// Validate every non-null environment before merging: statement, code,
/// document and stdout present; document carries name/description/
/// parameters; statement is URL-free; answer appears in the stdout.
#[must_use]
pub fn check_env(record: &DecompositionRecord) -> bool {
    let Some(env_result) = &record.env_result else {
        return true;
    };
    for env in env_result.values().flatten() {
        let data = &env.env_synthesis_result.data;
        let (Some(statement), Some(_code), Some(doc), Some(stdout)) = (
            data.tool_call_statement.as_ref(),
            data.code.as_ref(),
            data.tool_document.as_ref(),
            data.tool_call_ans.as_ref(),
        ) else {
            return false;
        };
        if doc.get("name").is_none() || doc.get("description").is_none() || doc.get("parameters").is_none()
        {
            return false;
        }
        if statement.contains("http") {
            return false;
        }
        if !stdout.contains(&env.answer) {
            return false;
        }
    }
    true
}

/// Pull each member's QA and code out of `env_result`.
#[must_use]
pub fn extract_qa_code(record: &DecompositionRecord, uuids: &[i64]) -> Vec<QaCode> {
    let Some(env_result) = &record.env_result else {
        return Vec::new();
    };
    let mut members = Vec::new();
    for uuid in uuids {
        let Some(Some(env)) = env_result.get(&uuid.to_string()) else {
            warn!(uuid, "no environment found for cluster member");
            continue;
        };
        let data = &env.env_synthesis_result.data;
        let tool_document = data.tool_document.clone().unwrap_or(Value::Null);
        members.push(QaCode {
            uuid: *uuid,
            question: env.question.clone(),
            answer: env.answer.clone(),
            code: data.code.clone().unwrap_or_default(),
            tool_name: tool_document
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            tool_document,
            tool_call_statement: data.tool_call_statement.clone().unwrap_or_default(),
        });
    }
    members
}

/// Rewrite passing members' environments with the merged artifact.
///
/// Returns `None` (drop the record) when any cluster test did not pass or
/// when a passing test's stdout no longer contains the member's answer.
#[must_use]
pub fn post_process(mut record: DecompositionRecord) -> Option<DecompositionRecord> {
    let aggregated = record.aggregated_env.clone().unwrap_or_default();
    let clusters = record.clusters.clone().unwrap_or_default();

    let mut by_uuids: HashMap<String, &Value> = HashMap::new();
    for entry in &aggregated {
        let Some(uuids) = entry.get("_uuids") else {
            error!(uuid = %record.uuid, "aggregated entry without _uuids");
            return None;
        };
        by_uuids.insert(uuids.to_string(), entry);
    }

    let env_result = record.env_result.as_mut()?;
    for cluster in &clusters {
        if cluster.uuids.len() <= 1 {
            continue;
        }
        let key = serde_json::to_value(&cluster.uuids).ok()?.to_string();
        let entry = by_uuids.get(&key)?;
        let merged_code = entry.get("merged_code").and_then(Value::as_str)?;
        let tool_document = entry.get("tool_document").cloned().unwrap_or(Value::Null);
        let statements: HashMap<i64, &Value> = entry
            .get("tool_call_statements")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|s| s.get("_uuid").and_then(Value::as_i64).map(|u| (u, s)))
                    .collect()
            })
            .unwrap_or_default();

        let tests = entry
            .pointer("/verification/test_results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for test in &tests {
            let status = test.get("status").and_then(Value::as_str).unwrap_or("");
            let member_uuid = test.get("uuid").and_then(Value::as_i64).unwrap_or_default();
            if status != "passed" {
                error!(uuid = %record.uuid, member_uuid, status, "cluster test not passed; dropping record");
                return None;
            }
            let stdout = test.get("stdout").and_then(Value::as_str).unwrap_or_default();
            let Some(Some(env)) = env_result.get_mut(&member_uuid.to_string()) else {
                error!(uuid = %record.uuid, member_uuid, "passed test for unknown member; dropping record");
                return None;
            };
            if !stdout.contains(&env.answer) {
                error!(
                    uuid = %record.uuid,
                    member_uuid,
                    "answer missing from merged stdout; dropping record",
                );
                return None;
            }
            let data = &mut env.env_synthesis_result.data;
            data.code = Some(merged_code.to_owned());
            data.tool_document = Some(tool_document.clone());
            data.tool_call_statement = statements
                .get(&member_uuid)
                .and_then(|s| s.get("tool_call_statement"))
                .and_then(Value::as_str)
                .map(str::to_owned);
            data.tool_call_ans = Some(stdout.to_owned());
            env.merge_flag = Some(true);
        }
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn synthesized_record() -> DecompositionRecord {
        serde_json::from_value(json!({
            "uuid": "r",
            "main_question": "m",
            "final_answer": "f",
            "decomposition_trace": [
                {"_uuid": 1, "hop_level": 1, "sub_question": "3 times 4", "sub_answer": "12", "dependency": null, "tool_necessity": true},
                {"_uuid": 2, "hop_level": 1, "sub_question": "5 times 6", "sub_answer": "30", "dependency": null, "tool_necessity": true}
            ],
            "env_result": {
                "1": {
                    "question": "3 times 4",
                    "answer": "12",
                    "env_synthesis_result": {
                        "data": {
                            "tool_document": {"name": "multiply", "description": "d", "parameters": {"type": "object", "properties": {}}},
                            "tool_call_statement": "multiply(a=3, b=4)",
                            "code": "def multiply(a, b):\n    return a * b",
                            "tool_call_ans": "12\n"
                        },
                        "extra_info": {}
                    }
                },
                "2": {
                    "question": "5 times 6",
                    "answer": "30",
                    "env_synthesis_result": {
                        "data": {
                            "tool_document": {"name": "multiply", "description": "d", "parameters": {"type": "object", "properties": {}}},
                            "tool_call_statement": "multiply(a=5, b=6)",
                            "code": "def multiply(a, b):\n    return a * b",
                            "tool_call_ans": "30\n"
                        },
                        "extra_info": {}
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn check_env_accepts_valid_record() {
        assert!(check_env(&synthesized_record()));
    }

    #[test]
    fn check_env_rejects_http_statement() {
        let mut rec = synthesized_record();
        if let Some(Some(env)) = rec.env_result.as_mut().unwrap().get_mut("1") {
            env.env_synthesis_result.data.tool_call_statement =
                Some("fetch(url='http://x')".to_owned());
        }
        assert!(!check_env(&rec));
    }

    #[test]
    fn check_env_rejects_answer_mismatch() {
        let mut rec = synthesized_record();
        if let Some(Some(env)) = rec.env_result.as_mut().unwrap().get_mut("2") {
            env.env_synthesis_result.data.tool_call_ans = Some("29\n".to_owned());
        }
        assert!(!check_env(&rec));
    }

    #[test]
    fn extract_members_reads_env_result() {
        let members = extract_qa_code(&synthesized_record(), &[1, 2]);
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].tool_name, "multiply");
        assert_eq!(members[1].answer, "30");
    }

    #[test]
    fn post_process_rewrites_passing_members() {
        let mut rec = synthesized_record();
        rec.clusters = Some(vec![Cluster {
            intent_summary: "multiplication".into(),
            reason: "same op".into(),
            uuids: vec![1, 2],
            main_uuid: None,
        }]);
        rec.aggregated_env = Some(vec![json!({
            "_uuids": [1, 2],
            "status": "success",
            "merged_code": "def multiply(a, b):\n    return a * b",
            "tool_document": {"name": "multiply", "description": "d", "parameters": {}},
            "tool_call_statements": [
                {"_uuid": 1, "tool_call_statement": "multiply(a=3, b=4)"},
                {"_uuid": 2, "tool_call_statement": "multiply(a=5, b=6)"}
            ],
            "verification": {
                "all_tests_passed": true,
                "test_results": [
                    {"uuid": 1, "status": "passed", "stdout": "12\n"},
                    {"uuid": 2, "status": "passed", "stdout": "30\n"}
                ]
            }
        })]);

        let out = post_process(rec).unwrap();
        let env = out.env_result.as_ref().unwrap()["1"].as_ref().unwrap();
        assert_eq!(env.merge_flag, Some(true));
        assert!(env.env_synthesis_result.data.code.as_ref().unwrap().contains("def multiply"));
    }

    #[test]
    fn post_process_drops_on_failed_test() {
        let mut rec = synthesized_record();
        rec.clusters = Some(vec![Cluster {
            intent_summary: "multiplication".into(),
            reason: String::new(),
            uuids: vec![1, 2],
            main_uuid: None,
        }]);
        rec.aggregated_env = Some(vec![json!({
            "_uuids": [1, 2],
            "merged_code": "def multiply(a, b): return 0",
            "tool_document": {},
            "tool_call_statements": [],
            "verification": {
                "test_results": [
                    {"uuid": 1, "status": "passed", "stdout": "12\n"},
                    {"uuid": 2, "status": "failed", "stdout": "0\n"}
                ]
            }
        })]);
        assert!(post_process(rec).is_none());
    }
}

//! Decomposition-trace records — the environment-synthesis data model.
//!
//! A record is a multi-hop question with its ordered decomposition into
//! steps. Stages annotate it in place on disk: necessity adds
//! `tool_necessity` per step and `tool_necessity_legitimacy` on the record,
//! verification adds `verify_result`, synthesis adds `env_result`, merging
//! adds `clusters` and `aggregated_env`. Unknown fields ride along in
//! `extra` so the files stay additive.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One step (hop) of a decomposition trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// Step identifier, unique within the record.
    #[serde(rename = "_uuid")]
    pub uuid: i64,
    /// Hop level; 1 is a leaf.
    #[serde(default = "default_hop")]
    pub hop_level: u32,
    /// The sub-question. Upstream generators sometimes emit lists; use
    /// [`text_of`] to flatten.
    #[serde(default)]
    pub sub_question: Value,
    /// The known sub-answer.
    #[serde(default)]
    pub sub_answer: Value,
    /// Upstream step uuids this step depends on. May be absent, `null`,
    /// the strings `"null"`/`"None"`, one id, or a list of ids.
    #[serde(default)]
    pub dependency: Option<Value>,
    /// Whether the step may run alongside its hop siblings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_parallel: Option<bool>,
    /// Whether answering this step genuinely needs a tool (set by the
    /// necessity stage).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_necessity: Option<bool>,
    /// The necessity judge's reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unknown fields, preserved.
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

const fn default_hop() -> u32 {
    1
}

/// Flatten a possibly-list value into display text.
#[must_use]
pub fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl TraceStep {
    /// The sub-question as text.
    #[must_use]
    pub fn question(&self) -> String {
        text_of(&self.sub_question)
    }

    /// The sub-answer as text.
    #[must_use]
    pub fn answer(&self) -> String {
        text_of(&self.sub_answer)
    }

    /// Declared dependency ids, normalized. Absent, `null`, `"null"`,
    /// `"None"` and the empty list all read as empty.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<i64> {
        match &self.dependency {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => {
                let s = s.trim();
                if s.is_empty() || s == "null" || s == "None" {
                    Vec::new()
                } else {
                    s.parse::<i64>().map(|id| vec![id]).unwrap_or_default()
                }
            }
            Some(Value::Number(n)) => n.as_i64().map(|id| vec![id]).unwrap_or_default(),
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
            Some(_) => Vec::new(),
        }
    }

    /// Whether the step declares at least one dependency.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        !self.dependency_ids().is_empty()
    }
}

/// A full decomposition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionRecord {
    /// Record identifier.
    #[serde(default)]
    pub uuid: String,
    /// The multi-hop question.
    #[serde(default)]
    pub main_question: String,
    /// The known final answer.
    #[serde(default)]
    pub final_answer: Value,
    /// Ordered decomposition steps.
    #[serde(default)]
    pub decomposition_trace: Vec<TraceStep>,
    /// Whether every step cited as a dependency has `tool_necessity = true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_necessity_legitimacy: Option<bool>,
    /// Composite verification payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_result: Option<Value>,
    /// Per-step synthesis results, keyed by stringified step uuid. `null`
    /// means tool not needed or synthesis failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_result: Option<HashMap<String, Option<EnvResult>>>,
    /// Intent clusters over synthesized steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<Vec<Cluster>>,
    /// Per-cluster merge outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_env: Option<Vec<Value>>,
    /// Unknown fields, preserved.
    #[serde(flatten, default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

/// One step's environment-synthesis payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvResult {
    /// The (possibly dependency-augmented) question the tool was built for.
    #[serde(default)]
    pub question: String,
    /// The expected answer.
    #[serde(default)]
    pub answer: String,
    /// The synthesis artifact.
    pub env_synthesis_result: EnvSynthesisResult,
    /// Set when the step's tool was replaced by a cluster merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_flag: Option<bool>,
}

/// The synthesis artifact: data plus per-stage diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSynthesisResult {
    /// The executable artifact.
    pub data: EnvData,
    /// Per-stage analysis payloads.
    #[serde(default)]
    pub extra_info: Value,
}

/// The executable half of a synthesized tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvData {
    /// The tool document (name, description, parameters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_document: Option<Value>,
    /// The call expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_statement: Option<String>,
    /// The function implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Stdout of executing code + call in the sandbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_ans: Option<String>,
}

/// One intent cluster of synthesized steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// What the clustered tools do.
    #[serde(default)]
    pub intent_summary: String,
    /// Why the members cluster together.
    #[serde(default)]
    pub reason: String,
    /// Member step uuids.
    #[serde(rename = "_uuids", default)]
    pub uuids: Vec<i64>,
    /// Representative member, when the aggregator names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_uuid: Option<Value>,
}

impl DecompositionRecord {
    /// Map from step uuid to step index.
    #[must_use]
    pub fn step_index(&self) -> HashMap<i64, usize> {
        self.decomposition_trace
            .iter()
            .enumerate()
            .map(|(idx, step)| (step.uuid, idx))
            .collect()
    }

    /// Look up a step by uuid.
    #[must_use]
    pub fn step(&self, uuid: i64) -> Option<&TraceStep> {
        self.decomposition_trace.iter().find(|s| s.uuid == uuid)
    }

    /// Validate the structural invariants of the trace:
    ///
    /// - step uuids unique within the record;
    /// - every dependency references an earlier step;
    /// - hop level non-decreasing along dependency edges.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<i64> = HashSet::new();
        for step in &self.decomposition_trace {
            if !seen.insert(step.uuid) {
                return Err(Error::record(format!(
                    "record {}: duplicate step uuid {}",
                    self.uuid, step.uuid
                )));
            }
        }
        let index = self.step_index();
        for (pos, step) in self.decomposition_trace.iter().enumerate() {
            for dep in step.dependency_ids() {
                let Some(&dep_pos) = index.get(&dep) else {
                    return Err(Error::record(format!(
                        "record {}: step {} depends on unknown uuid {dep}",
                        self.uuid, step.uuid
                    )));
                };
                if dep_pos >= pos {
                    return Err(Error::record(format!(
                        "record {}: step {} depends on non-earlier step {dep}",
                        self.uuid, step.uuid
                    )));
                }
                let dep_step = &self.decomposition_trace[dep_pos];
                if dep_step.hop_level > step.hop_level {
                    return Err(Error::record(format!(
                        "record {}: hop level decreases along edge {dep} -> {}",
                        self.uuid, step.uuid
                    )));
                }
            }
        }
        Ok(())
    }

    /// Step uuids that appear in some other step's dependency list.
    #[must_use]
    pub fn depended_on_uuids(&self) -> HashSet<i64> {
        self.decomposition_trace
            .iter()
            .flat_map(TraceStep::dependency_ids)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn record(steps: Vec<TraceStep>) -> DecompositionRecord {
        DecompositionRecord {
            uuid: "rec-1".into(),
            main_question: "q".into(),
            final_answer: json!("a"),
            decomposition_trace: steps,
            tool_necessity_legitimacy: None,
            verify_result: None,
            env_result: None,
            clusters: None,
            aggregated_env: None,
            extra: HashMap::new(),
        }
    }

    pub(crate) fn step(uuid: i64, hop: u32, deps: Value) -> TraceStep {
        TraceStep {
            uuid,
            hop_level: hop,
            sub_question: json!(format!("q{uuid}")),
            sub_answer: json!(format!("a{uuid}")),
            dependency: Some(deps),
            is_parallel: None,
            tool_necessity: None,
            reason: None,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn dependency_normalization() {
        assert!(step(1, 1, json!(null)).dependency_ids().is_empty());
        assert!(step(1, 1, json!("null")).dependency_ids().is_empty());
        assert!(step(1, 1, json!("None")).dependency_ids().is_empty());
        assert_eq!(step(2, 2, json!([1])).dependency_ids(), vec![1]);
        assert_eq!(step(2, 2, json!(1)).dependency_ids(), vec![1]);
        assert_eq!(step(3, 2, json!([1, 2])).dependency_ids(), vec![1, 2]);
    }

    #[test]
    fn valid_two_hop_record() {
        let rec = record(vec![step(1, 1, json!(null)), step(2, 2, json!([1]))]);
        rec.validate().unwrap();
        assert_eq!(rec.depended_on_uuids(), HashSet::from([1]));
    }

    #[test]
    fn duplicate_uuid_rejected() {
        let rec = record(vec![step(1, 1, json!(null)), step(1, 1, json!(null))]);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn forward_dependency_rejected() {
        let rec = record(vec![step(1, 1, json!([2])), step(2, 1, json!(null))]);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn hop_decrease_rejected() {
        let rec = record(vec![step(1, 3, json!(null)), step(2, 2, json!([1]))]);
        assert!(rec.validate().is_err());
    }

    #[test]
    fn list_sub_question_flattens() {
        let mut s = step(1, 1, json!(null));
        s.sub_question = json!(["part one", "part two"]);
        assert_eq!(s.question(), "part one part two");
    }

    #[test]
    fn round_trips_unknown_fields() {
        let line = json!({
            "uuid": "r",
            "main_question": "m",
            "final_answer": "f",
            "decomposition_trace": [
                {"_uuid": 1, "hop_level": 1, "sub_question": "q", "sub_answer": "a", "dependency": null, "custom": 7}
            ],
            "pipeline_tag": "v2"
        });
        let rec: DecompositionRecord = serde_json::from_value(line).unwrap();
        assert_eq!(rec.extra["pipeline_tag"], "v2");
        assert_eq!(rec.decomposition_trace[0].extra["custom"], 7);
        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back["pipeline_tag"], "v2");
    }
}

//! Prompt templates.
//!
//! Templates are immutable strings fetched by name. Defaults are embedded;
//! a directory named by `PROMPT_DIR` can override any of them with a file
//! called `<name>.md`. Substitution is a straight `{placeholder}` string
//! replace with no logic.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Named prompt templates with `{placeholder}` substitution.
#[derive(Debug, Clone)]
pub struct PromptStore {
    templates: HashMap<String, String>,
}

impl Default for PromptStore {
    fn default() -> Self {
        Self::embedded()
    }
}

impl PromptStore {
    /// The embedded default templates.
    #[must_use]
    pub fn embedded() -> Self {
        let mut templates = HashMap::new();
        for (name, text) in DEFAULT_TEMPLATES {
            templates.insert((*name).to_owned(), (*text).to_owned());
        }
        Self { templates }
    }

    /// Embedded defaults overridden by any `<name>.md` files in `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let mut store = Self::embedded();
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(store);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            store.templates.insert(name.to_owned(), text);
        }
        Ok(store)
    }

    /// Load from the directory named by `PROMPT_DIR`, or embedded defaults
    /// when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var("PROMPT_DIR") {
            Ok(dir) => Self::load(dir),
            Err(_) => Ok(Self::embedded()),
        }
    }

    /// Fetch a template by name.
    pub fn get(&self, name: &str) -> Result<&str> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::config(format!("unknown prompt template '{name}'")))
    }

    /// Fetch and substitute: each `{key}` is replaced by its value.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let mut text = self.get(name)?.to_owned();
        for (key, value) in vars {
            text = text.replace(&format!("{{{key}}}"), value);
        }
        Ok(text)
    }
}

macro_rules! template {
    ($name:ident, $key:literal, $text:literal) => {
        /// Embedded default for the template of the same name.
        pub const $name: &str = $text;
    };
}

template!(
    VERIFY_DEPENDENCY,
    "verify_dependency",
    r#"You are auditing one step of a multi-hop question decomposition.

The step's sub-question was written using the results of earlier steps. Here
are the upstream steps it claims to depend on:

{dependency}

And here is the sub-question itself:

{query}

Judge whether the declared dependency set is exactly right: every cited
upstream step must be genuinely needed to construct this sub-question, and no
needed upstream step may be missing. Irrelevant citations and missing
citations both fail.

Return a JSON object and nothing else:
{"score": 0 or 1, "reason": "one or two sentences"}"#
);

template!(
    VERIFY_ATOMICITY,
    "verify_atomicity",
    r#"You are checking whether each step of a question decomposition is atomic.

Main question: {main_question}
Final answer: {final_answer}

Decomposition trace:
{decomposition_trace}

A step is atomic when it is independent, carries a single task, and could be
verified by exactly one tool call. The terminal summary step is exempt and
should be scored 1.

Return a JSON object keyed by step index (1-based), one entry per step:
{"1": {"is_atomic": 0 or 1, "reason_atomic": "..."}, "2": {...}, ...}"#
);

template!(
    VERIFY_FORCED_SERIALIZATION,
    "verify_forced_serialization",
    r#"You are checking a question decomposition for forced serialization:
steps placed in later hops even though they do not use any earlier result.

Steps (id, hop, parallel flag, declared dependencies, question, answer):
{traj_text}

A step is problematic when its hop level implies it must wait for earlier
steps, yet its question could be asked without any of their answers. Steps
that genuinely consume upstream answers are fine.

Return a JSON object and nothing else:
{"score": 0 or 1, "problematic_steps": [ids], "reasoning": "..."}
Use score 1 when no step is problematic, 0 otherwise."#
);

template!(
    VERIFY_SUBQA_COMPLETENESS,
    "verify_subqa_completeness",
    r#"You are checking whether a set of sub-questions fully covers its main
question.

Main question: {main_question}

Sub-questions:
{sub_questions}

List every requirement the main question imposes, then check each against
the union of sub-questions. The decomposition passes only when nothing is
missing.

Return a JSON object and nothing else:
{
  "main_question_requirements": ["..."],
  "coverage_analysis": {"covered_requirements": ["..."], "missing_requirements": ["..."]},
  "score": 0 or 1
}"#
);

template!(
    CHECK_TOOL_NECESSITY,
    "check_tool_necessity",
    r#"For each step of the decomposition below, decide whether answering its
sub-question genuinely requires an external tool (lookup, computation,
retrieval), or whether it is pure reasoning over results that are already
present in the trace.

Main question: {main_question}

Decomposition trace:
{decomposition_trace}

Return a JSON array with exactly one entry per step, in the same order:
[{"_uuid": <step uuid>, "tool_necessity": true or false, "reason": "..."}]"#
);

template!(
    TOOL_DOCUMENT_GENERATION,
    "tool_document_generation",
    r#"Design a tool that could answer the question below. The tool must feel
like a real, reusable API: a general capability, not a lookup keyed to this
one question.

Question: {question}

Return a JSON object and nothing else:
{
  "analysis": "what capability the question needs and why this tool shape fits",
  "tool": {
    "name": "snake_case_function_name",
    "description": "...",
    "parameters": {"type": "object", "properties": {...}, "required": [...]}
  }
}"#
);

template!(
    TOOL_DOCUMENT_COMPLEXITY_SCALING,
    "tool_document_complexity_scaling",
    r#"Below is a tool document. Rewrite it into a richer, more realistic
version: add optional parameters, defaults, enums and a fuller description,
while keeping every existing parameter unchanged so that any call valid
against the original stays valid against the refined version.

Tool document:
{tool}

Return a JSON object and nothing else:
{"analysis": "...", "refined_version": {"name": ..., "description": ..., "parameters": {...}}}"#
);

template!(
    CALL_STATEMENT,
    "call_statement",
    r#"Write one call expression for the tool below that would answer the
question. Use keyword arguments only, strictly using parameter names from
the document. The expression must be a single line, must not wrap the call
in print(), and must not contain any URL. If the document declares defaults,
cover any parameter whose default would not produce the needed answer.

Question: {question}

Tool document:
{tool_description}

Return a JSON object and nothing else:
{"analysis": "...", "call": "tool_name(param=value, ...)"}"#
);

template!(
    TOOL_DEPLOYMENT,
    "tool_deployment",
    r#"Implement the tool described below as a single self-contained Python
function using only the standard library. The function name and parameter
names must match the document exactly. Validate inputs defensively (types,
required parameters, ranges) and raise ValueError on bad input. Use mock
data chosen so that for inputs matching the test case below, the returned
value contains the expected answer as a substring. Make the mock data look
plausible for nearby inputs too.

Tool document:
{document}

Test case (question / expected answer):
{pairs}

The call that will be executed:
{call_statement}

Return a JSON object and nothing else:
{"analysis": "...", "function": "def ...\n    ..."}"#
);

template!(
    MERGE_INTENT_AGGREGATION,
    "merge_intent_aggregation",
    r#"Below are sub-questions from one record, each already backed by a
synthesized tool. Group them into clusters that could share a single
parameterized tool: same underlying logic and algorithm, compatible
parameter structure, same return shape. Singleton clusters are allowed.
Every _uuid must appear in exactly one cluster.

Sub-questions:
{questions}

Return a JSON object and nothing else:
{"clusters": [{"intent_summary": "...", "_uuids": [...], "reason": "..."}]}"#
);

template!(
    MERGE_TOOLS_CODE,
    "merge_tools_code",
    r#"{intent_line}
The function below must serve every instance listed. Modify ONLY the mock
data / static data portion of the code so that executing each instance's
call statement prints output containing that instance's expected answer.
Do not change the function signature: keep {fn_hint} exactly.

Instances:
{qa_section}

Base code:
```python
{base_code}
```

Return only the complete modified Python code."#
);

template!(
    MERGE_TOOL_CALL_GEN,
    "merge_tool_call_gen",
    r#"For each QA below, write one call expression for the function
{fn_name}({arg_list}) defined in the code at the bottom. Use keyword
arguments only, strictly using the parameter names of the signature. The
call must be chosen so its printed result contains the QA's answer.

{qa_section}

Code:
```python
{code}
```

Return a JSON array and nothing else:
[{"_uuid": ..., "tool_call_statement": "name(arg=value, ...)"}]"#
);

template!(
    TOOL_GRAPH_DETECT,
    "tool_graph_detect",
    r#"Below is a tool server and its tools. Identify plausible dependency
chains: ordered sequences of tools where each tool's output feeds the next
tool's input in a realistic task.

Server:
{group_info}

Tools (one JSON document per line):
{tool_list}

Return a JSON array and nothing else. Each element:
{
  "tool_graph_detect": "yes" | "no" | "not sure",
  "tool_graph_detect_chain": ["tool_a", "tool_b", ...],
  "tool_graph_detect_task": "a task a user might ask that needs this chain"
}
Only emit chains whose every tool name appears in the tool list."#
);

template!(
    VERIFY_GRAPH,
    "verify_graph",
    r#"Given the tool server below and a proposed tool chain, judge whether a
realistic user task exists that requires exactly this chain in this order.

Server and tools:
{api_info}

Proposed chain:
{graph_paths_str}

Return a JSON object and nothing else:
{
  "is_valid": true or false,
  "task_description": "...",
  "user_query": "...",
  "task_plan": "..."
}"#
);

template!(
    GEN_QUERY_FROM_CHAIN,
    "gen_query_from_chain",
    r#"Tools:
{tools}

Scenario:
{scenery}

Write one natural user query whose correct resolution would require calling
exactly this chain of tools, in order:
{chain}

If no natural query exists for this chain, mark it invalid.

Return a JSON object and nothing else:
{"valid": true or false, "query": "..."}"#
);

template!(
    GEN_CHAIN_FROM_QUERY,
    "gen_chain_from_query",
    r#"Scenario:
{scenery}

Tools:
{tools}

For the user query below, plan the sequence of tool calls needed to resolve
it. Use only tool names from the list, in execution order.

Query: {query}

Return a JSON object and nothing else:
{"chain": ["tool_a", "tool_b", ...], "plan": "..."}"#
);

template!(
    GEN_QUERY,
    "gen_query",
    r#"You are writing a realistic user question for an assistant connected to
the tool server below.

Server:
{server_info}

Tools:
{tool_list}

The question must require using these tools, in this order:
{sub_chain}

Write the question the way a real user would: a concrete goal, no mention of
tools or APIs.

Reply in XML:
<response>
  <server_analysis>what the server is for and what the chain accomplishes</server_analysis>
  <target_tools>tool_a, tool_b</target_tools>
  <question>the user question</question>
</response>"#
);

template!(
    AUGMENT_DIVERSE,
    "augment_diverse",
    r#"Rewrite the user question below into {variations_count} diverse
variations. Each variation must still require the same target tools but vary
the phrasing, the surface scenario and the specifics.

Original question: {original_question}
Target tools: {target_tools}
Tool descriptions:
{tool_descriptions}

Reply in XML:
<response>
  <analysis>...</analysis>
  <variations>
    <variation_1><question>...</question><context>...</context><constraints>...</constraints></variation_1>
    ...
  </variations>
</response>"#
);

template!(
    AUGMENT_COMPLICATE,
    "augment_complicate",
    r#"Rewrite the user question below into {variations_count} harder
variations: add realistic constraints, edge conditions or multi-part goals,
while keeping the same target tools sufficient to answer.

Original question: {original_question}
Target tools: {target_tools}
Tool descriptions:
{tool_descriptions}

Reply in XML:
<response>
  <analysis>...</analysis>
  <variations>
    <variation_1><question>...</question><context>...</context><constraints>...</constraints></variation_1>
    ...
  </variations>
</response>"#
);

template!(
    AUGMENT_ADD_UG,
    "augment_add_ug",
    r#"Rewrite the user question below into {variations_count} variations as
they would be asked by the following person. Let their occupation, skills
and interests color the wording and the scenario, but keep the same target
tools sufficient to answer.

Persona:
- age: {persona_age}
- occupation: {persona_occupation}
- education: {persona_education}
- background: {persona_professional}
- skills: {persona_skills}
- hobbies: {persona_hobbies}

Original question: {original_question}
Target tools: {target_tools}
Tool descriptions:
{tool_descriptions}

Reply in XML:
<response>
  <analysis>...</analysis>
  <variations>
    <variation_1><question>...</question><context>...</context><constraints>...</constraints></variation_1>
    ...
  </variations>
</response>"#
);

template!(
    QUERY_SCORE,
    "query_score",
    r#"Assess the quality of the generated user question below, given the tool
server it targets.

Server:
{server_info}

Available tools:
{tool_list}

Intended tools: {target_tools}
Question: {question}

Rate four dimensions. Use exactly these rating words:
- tool_selection_difficulty: very easy / easy / medium / hard / very hard
- tool_selection_uniqueness: not unique / somewhat unique / moderately unique / quite unique / highly unique
- question_quality: very poor / poor / average / good / excellent
- scenario_realism: unrealistic / somewhat unrealistic / moderately realistic / realistic / highly realistic

Reply in XML:
<response>
  <tool_selection_difficulty><reasoning>...</reasoning><rating>...</rating></tool_selection_difficulty>
  <tool_selection_uniqueness><reasoning>...</reasoning><rating>...</rating></tool_selection_uniqueness>
  <question_quality><reasoning>...</reasoning><rating>...</rating></question_quality>
  <scenario_realism><reasoning>...</reasoning><rating>...</rating></scenario_realism>
</response>"#
);

template!(
    TOOL_ROLE_SYSTEM,
    "tool_role_system",
    r#"You are role-playing a tool server. You receive tool definitions and an
invocation, and you answer exactly as the real tool would: structured,
terse, no commentary. Real tools sometimes fail; occasionally return a
realistic error payload instead of a success."#
);

template!(
    TOOL_MOCK,
    "tool_mock",
    r#"Tool definitions:
{tool_defs}

Server description: {server_description}

Invocation(s):
{tool_calls}

Produce the output the real tool(s) would return for these arguments. Keep
values internally consistent and plausible.

Return a JSON array and nothing else, one element per invocation:
[{"name": "tool_name", "results": <the tool's return value>}]"#
);

template!(
    TOOL_MOCK_WITH_QUERY,
    "tool_mock_with_query",
    r#"Tool definitions:
{tool_defs}

Server description: {server_description}

The user's overall request: {query}

Invocation(s):
{tool_calls}

Produce the output the real tool(s) would return for these arguments. The
output should be consistent with a world in which the user's request can be
worked on. Keep values plausible.

Return a JSON array and nothing else, one element per invocation:
[{"name": "tool_name", "results": <the tool's return value>}]"#
);

template!(
    TOOL_MOCK_WITH_HISTORY,
    "tool_mock_with_history",
    r#"Tool definitions:
{tool_defs}

Server description: {server_description}

Earlier calls and observations in this session:
{history}

Invocation(s):
{tool_calls}

Produce the output the real tool(s) would return for these arguments,
consistent with the earlier observations above.

Return a JSON array and nothing else, one element per invocation:
[{"name": "tool_name", "results": <the tool's return value>}]"#
);

template!(
    TOOL_MOCK_WITH_HISTORY_AND_QUERY,
    "tool_mock_with_history_and_query",
    r#"Tool definitions:
{tool_defs}

Server description: {server_description}

The user's overall request: {query}

Earlier calls and observations in this session:
{history}

Invocation(s):
{tool_calls}

Produce the output the real tool(s) would return for these arguments,
consistent with both the user's request and the earlier observations.

Return a JSON array and nothing else, one element per invocation:
[{"name": "tool_name", "results": <the tool's return value>}]"#
);

template!(
    REWARD_CONCISE,
    "reward_concise",
    r#"Below is an assistant trajectory answering a user query with tools.
Enumerate every tool call in order and score each one:

- necessity: was this call needed to make progress (0/1)
- parameters: were the arguments correct and well-formed (0/1)
- information gain: did the call return information not already held (0/1)

A call scores 1 only when all three hold.

Query: {query}

Trajectory:
{trajectory}

Return a JSON object and nothing else:
{"calls": [{"index": 1, "tool": "...", "score": 0 or 1, "reason": "..."}]}"#
);

template!(
    REWARD_FINAL_ANSWER_CORRELATION,
    "reward_final_answer_correlation",
    r#"Judge whether the assistant's final answer actually addresses the user
query.

Query: {query}

Final answer:
{final_answer}

Score 1.0 when the answer directly and fully addresses the query, 0.5 when
it partially addresses it, 0.0 when it misses or refuses without cause.

Return a JSON object and nothing else:
{"score": 0.0 or 0.5 or 1.0, "reason": "..."}"#
);

template!(
    REWARD_FINAL_ANSWER_SUMMARY,
    "reward_final_answer_summary",
    r#"Judge whether the assistant's final answer faithfully summarizes what
the tool results in the trajectory actually established. Penalize claims
that no tool result supports.

Trajectory:
{trajectory}

Final answer:
{final_answer}

Return a JSON object and nothing else:
{"score": 0.0 or 0.5 or 1.0, "reason": "..."}"#
);

template!(
    REWARD_URL,
    "reward_url",
    r#"The final answer below cites URLs that do not appear anywhere in the
trajectory's tool results. Judge whether these URLs are plausibly fabricated.

URLs: {urls}

Trajectory:
{trajectory}

Final answer:
{final_answer}

Return a JSON object and nothing else:
{"fabricated": true or false, "reason": "..."}"#
);

template!(
    TOOL_STATUS,
    "tool_status",
    r#"Below is one tool invocation and the raw message the tool returned.
Decide whether the tool executed successfully (a real result, even an empty
one) or failed (error payload, timeout, refusal, malformed output).

Invocation: {invocation}

Tool return:
{observation}

Return a JSON object and nothing else:
{"tool_status": true or false, "reason": "..."}"#
);

template!(
    TOOL_CONTENT_PLAN,
    "tool_content_plan",
    r#"Below is the context an assistant had accumulated, followed by the tool
calls it chose to issue next. Judge whether this plan step is correct: the
right tool(s), the right arguments, issued at the right time.

Available tools:
{tool_defs}

Context so far:
{context}

The assistant's next tool calls:
{plan}

Scoring: with a single call, score 0 or 1. With several parallel calls,
score 1 when all are right, 0.5 when some are, 0 when none are.

Return a JSON object and nothing else:
{"score": 0 or 0.5 or 1, "reason": "..."}"#
);

template!(
    TOOL_CONTENT_UNDERSTAND,
    "tool_content_understand",
    r#"Below is a batch of tool results, followed by the assistant's next turn.
Judge whether that turn demonstrates a correct reading of the results:
key facts picked up, errors recognized, no invented values. A redundant
repeat of the same tool with the same strategy after these results scores 0.

Tool results:
{observations}

Assistant's following turn:
{reaction}

Return a JSON object and nothing else:
{"score": 0 or 0.5 or 1, "reason": "..."}"#
);

template!(
    QUERY_UNDERSTAND,
    "query_understand",
    r#"Below is a user query and the assistant's first turn. Judge whether the
assistant correctly understood what the user wants: the goal, the
constraints, the deliverable.

Query: {query}

First assistant turn:
{first_turn}

Return a JSON object and nothing else:
{"score": 0 or 0.5 or 1, "reason": "..."}"#
);

template!(
    QUERY_PLAN,
    "query_plan",
    r#"Below is a user query, the tools available, and the assistant's first
turn. Judge whether the assistant's opening plan is a sound way to resolve
the query with these tools.

Query: {query}

Available tools:
{tool_defs}

First assistant turn:
{first_turn}

Return a JSON object and nothing else:
{"score": 0 or 0.5 or 1, "reason": "..."}"#
);

/// Name → text pairs of every embedded template.
pub const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    ("verify_dependency", VERIFY_DEPENDENCY),
    ("verify_atomicity", VERIFY_ATOMICITY),
    ("verify_forced_serialization", VERIFY_FORCED_SERIALIZATION),
    ("verify_subqa_completeness", VERIFY_SUBQA_COMPLETENESS),
    ("check_tool_necessity", CHECK_TOOL_NECESSITY),
    ("tool_document_generation", TOOL_DOCUMENT_GENERATION),
    ("tool_document_complexity_scaling", TOOL_DOCUMENT_COMPLEXITY_SCALING),
    ("call_statement", CALL_STATEMENT),
    ("tool_deployment", TOOL_DEPLOYMENT),
    ("merge_intent_aggregation", MERGE_INTENT_AGGREGATION),
    ("merge_tools_code", MERGE_TOOLS_CODE),
    ("merge_tool_call_gen", MERGE_TOOL_CALL_GEN),
    ("tool_graph_detect", TOOL_GRAPH_DETECT),
    ("verify_graph", VERIFY_GRAPH),
    ("gen_query_from_chain", GEN_QUERY_FROM_CHAIN),
    ("gen_chain_from_query", GEN_CHAIN_FROM_QUERY),
    ("gen_query", GEN_QUERY),
    ("augment_diverse", AUGMENT_DIVERSE),
    ("augment_complicate", AUGMENT_COMPLICATE),
    ("augment_add_ug", AUGMENT_ADD_UG),
    ("query_score", QUERY_SCORE),
    ("tool_role_system", TOOL_ROLE_SYSTEM),
    ("tool_mock", TOOL_MOCK),
    ("tool_mock_with_query", TOOL_MOCK_WITH_QUERY),
    ("tool_mock_with_history", TOOL_MOCK_WITH_HISTORY),
    ("tool_mock_with_history_and_query", TOOL_MOCK_WITH_HISTORY_AND_QUERY),
    ("reward_concise", REWARD_CONCISE),
    ("reward_final_answer_correlation", REWARD_FINAL_ANSWER_CORRELATION),
    ("reward_final_answer_summary", REWARD_FINAL_ANSWER_SUMMARY),
    ("reward_url", REWARD_URL),
    ("tool_status", TOOL_STATUS),
    ("tool_content_plan", TOOL_CONTENT_PLAN),
    ("tool_content_understand", TOOL_CONTENT_UNDERSTAND),
    ("query_understand", QUERY_UNDERSTAND),
    ("query_plan", QUERY_PLAN),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_template_is_registered_and_nonempty() {
        let store = PromptStore::embedded();
        for (name, _) in DEFAULT_TEMPLATES {
            let text = store.get(name).unwrap();
            assert!(!text.trim().is_empty(), "{name} is empty");
        }
        assert!(store.get("no_such_template").is_err());
    }

    #[test]
    fn templates_carry_their_placeholders() {
        let store = PromptStore::embedded();
        let expectations: &[(&str, &[&str])] = &[
            ("verify_dependency", &["{dependency}", "{query}"]),
            ("check_tool_necessity", &["{main_question}", "{decomposition_trace}"]),
            ("tool_deployment", &["{document}", "{pairs}", "{call_statement}"]),
            ("merge_tools_code", &["{fn_hint}", "{qa_section}", "{base_code}"]),
            ("gen_query", &["{server_info}", "{tool_list}", "{sub_chain}"]),
            ("augment_add_ug", &["{persona_age}", "{persona_occupation}", "{variations_count}"]),
            ("tool_mock_with_history", &["{tool_defs}", "{tool_calls}", "{history}"]),
        ];
        for (name, placeholders) in expectations {
            let text = store.get(name).unwrap();
            for ph in *placeholders {
                assert!(text.contains(ph), "{name} lost {ph}");
            }
        }
    }

    #[test]
    fn render_substitutes_placeholders() {
        let store = PromptStore::embedded();
        let rendered = store
            .render("verify_dependency", &[("dependency", "step_1: pop"), ("query", "divide it")])
            .unwrap();
        assert!(rendered.contains("step_1: pop"));
        assert!(rendered.contains("divide it"));
        assert!(!rendered.contains("{dependency}"));
    }

    #[test]
    fn directory_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gen_query.md"), "override {sub_chain}").unwrap();
        let store = PromptStore::load(dir.path()).unwrap();
        assert_eq!(store.get("gen_query").unwrap(), "override {sub_chain}");
        // Untouched templates keep their defaults.
        assert_eq!(store.get("verify_graph").unwrap(), VERIFY_GRAPH);
    }
}

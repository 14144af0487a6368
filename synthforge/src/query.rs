//! Query generation, augmentation and quality scoring.
//!
//! A verified sub-chain becomes a user question: the generator renders a
//! prompt expecting an XML reply, the augmenter rewrites accepted questions
//! into diverse / complicated / persona-conditioned variants, and the
//! scorer rates four quality dimensions with word ratings mapped onto a
//! 1–5 scale.

use std::path::Path;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;
use crate::mcp::McpInfo;
use crate::parse::{Variation, extract_xml_field, parse_variations};
use crate::runtime::Runtime;

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// A parsed query-generation reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    /// The model's reading of the server and chain.
    pub server_analysis: String,
    /// Tools the question is meant to require.
    pub target_tools: Vec<String>,
    /// The user question.
    pub generated_question: String,
}

static XML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

/// Split a `target_tools` blob into names: strip any markup, then split on
/// commas, falling back to line splits.
#[must_use]
pub fn parse_target_tools(raw: &str) -> Vec<String> {
    let cleaned = XML_TAG.replace_all(raw.trim(), "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Vec::new();
    }
    let parts: Vec<String> = if cleaned.contains(',') {
        cleaned.split(',').map(|t| t.trim().to_owned()).collect()
    } else {
        cleaned.lines().map(|t| t.trim().to_owned()).collect()
    };
    parts.into_iter().filter(|t| !t.is_empty()).collect()
}

/// Parse the XML reply of the query generator. `None` when any required
/// field is missing.
#[must_use]
pub fn parse_generated_query(text: &str) -> Option<GeneratedQuery> {
    let scope = {
        let inner = extract_xml_field(text, "response");
        if inner.is_empty() { text.to_owned() } else { inner }
    };
    let server_analysis = extract_xml_field(&scope, "server_analysis").trim().to_owned();
    let mut tools_raw = extract_xml_field(&scope, "target_tools");
    if tools_raw.is_empty() {
        tools_raw = extract_xml_field(&scope, "target_tool");
    }
    let question = extract_xml_field(&scope, "question").trim().to_owned();

    if server_analysis.is_empty() || tools_raw.is_empty() || question.is_empty() {
        return None;
    }
    let target_tools = parse_target_tools(&tools_raw);
    if target_tools.is_empty() {
        return None;
    }
    Some(GeneratedQuery {
        server_analysis,
        target_tools,
        generated_question: question,
    })
}

/// Render the generation prompt for one `(server, sub_chain)` pair.
pub fn build_gen_prompt(
    runtime: &Runtime,
    mcp_info: &McpInfo,
    sub_chain: &[String],
) -> Result<String> {
    let tool_lines: String = mcp_info
        .base_info
        .tool_list
        .iter()
        .map(|t| format!("{}\n", serde_json::to_string(t).unwrap_or_default()))
        .collect();
    runtime.prompts.render(
        "gen_query",
        &[
            (
                "server_info",
                &serde_json::to_string(&mcp_info.base_info.group_info)?,
            ),
            ("tool_list", tool_lines.as_str()),
            ("sub_chain", &serde_json::to_string(sub_chain)?),
        ],
    )
}

/// Assemble the query record emitted after a successful generation.
#[must_use]
pub fn query_record(source: &Value, query: &GeneratedQuery) -> Value {
    json!({
        "query_info": {
            "generated_question": query.generated_question,
            "target_tools": query.target_tools,
            "server_analysis": query.server_analysis,
        },
        "mcp_info": source.get("mcp_info").cloned().unwrap_or(Value::Null),
        "graph": source.get("graph").cloned().unwrap_or(Value::Null),
        "chain_info": source.get("chain_info").cloned().unwrap_or(Value::Null),
    })
}

// ---------------------------------------------------------------------------
// Augmentation
// ---------------------------------------------------------------------------

/// Augmentation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AugmentMode {
    /// Vary phrasing and scenario.
    Diverse,
    /// Add constraints and multi-part goals.
    Complicate,
    /// Condition on a sampled persona.
    AddUg,
}

impl AugmentMode {
    /// The mode's wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Diverse => "diverse",
            Self::Complicate => "complicate",
            Self::AddUg => "add_ug",
        }
    }

    /// The template the mode renders with.
    #[must_use]
    pub const fn template(&self) -> &'static str {
        match self {
            Self::Diverse => "augment_diverse",
            Self::Complicate => "augment_complicate",
            Self::AddUg => "augment_add_ug",
        }
    }

    /// Parse a mode name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "diverse" => Some(Self::Diverse),
            "complicate" => Some(Self::Complicate),
            "add_ug" => Some(Self::AddUg),
            _ => None,
        }
    }
}

/// A persona used by `add_ug` augmentation. Ethnicity and region are
/// deliberately not part of this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Age in years.
    pub age: u32,
    /// Occupation, title-cased for display.
    pub occupation: String,
    /// Education level.
    pub education: String,
    /// Short professional background blurb.
    pub professional: String,
    /// Comma-joined skill list.
    pub skills: String,
    /// Comma-joined hobby list.
    pub hobbies: String,
}

/// A small built-in persona table for runs without an external file.
#[must_use]
pub fn builtin_personas() -> Vec<Persona> {
    vec![
        Persona {
            age: 34,
            occupation: "Logistics Coordinator".into(),
            education: "Bachelors Degree".into(),
            professional: "Coordinates inbound freight across three regional warehouses".into(),
            skills: "route planning, spreadsheets, vendor negotiation".into(),
            hobbies: "cycling, board games".into(),
        },
        Persona {
            age: 27,
            occupation: "Graduate Student".into(),
            education: "Masters In Progress".into(),
            professional: "Researches urban air quality with low-cost sensor networks".into(),
            skills: "python, statistics, field work".into(),
            hobbies: "climbing, photography".into(),
        },
        Persona {
            age: 45,
            occupation: "Restaurant Owner".into(),
            education: "High School".into(),
            professional: "Runs a family seafood restaurant and handles its supplier accounts".into(),
            skills: "inventory management, cooking, bookkeeping".into(),
            hobbies: "fishing, gardening".into(),
        },
        Persona {
            age: 52,
            occupation: "School Librarian".into(),
            education: "Masters Degree".into(),
            professional: "Manages a middle-school library and its digital catalog".into(),
            skills: "cataloging, research assistance, event planning".into(),
            hobbies: "reading, quilting".into(),
        },
    ]
}

/// Load personas from a JSONL file, one persona object per line.
pub fn load_personas(path: impl AsRef<Path>) -> Result<Vec<Persona>> {
    crate::jsonl::read_records(path)
}

/// Sample one persona.
#[must_use]
pub fn sample_persona(personas: &[Persona]) -> Option<&Persona> {
    if personas.is_empty() {
        None
    } else {
        personas.get(fastrand::usize(..personas.len()))
    }
}

/// Numbered tool descriptions for the augmentation prompts.
#[must_use]
pub fn tool_descriptions(mcp_info: &McpInfo, target_tools: &[String]) -> String {
    target_tools
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let description = mcp_info
                .base_info
                .tool_list
                .iter()
                .find(|t| &t.name == name)
                .map_or("(no description)", |t| t.description.as_str());
            format!("{}. {name}: {description}\n", i + 1)
        })
        .collect()
}

/// Render the augmentation prompt for one query.
pub fn build_augment_prompt(
    runtime: &Runtime,
    mode: AugmentMode,
    original_question: &str,
    target_tools: &[String],
    descriptions: &str,
    variations_count: usize,
    persona: Option<&Persona>,
) -> Result<String> {
    if mode == AugmentMode::AddUg && persona.is_none() {
        return Err(crate::error::Error::config(
            "add_ug augmentation requires a persona",
        ));
    }
    let tools_joined = target_tools.join(", ");
    let count = variations_count.to_string();
    let age = persona.map(|p| p.age.to_string()).unwrap_or_default();

    let mut vars: Vec<(&str, &str)> = vec![
        ("original_question", original_question),
        ("target_tools", &tools_joined),
        ("tool_descriptions", descriptions),
        ("variations_count", &count),
    ];
    if let Some(p) = persona {
        vars.extend_from_slice(&[
            ("persona_age", age.as_str()),
            ("persona_occupation", p.occupation.as_str()),
            ("persona_education", p.education.as_str()),
            ("persona_professional", p.professional.as_str()),
            ("persona_skills", p.skills.as_str()),
            ("persona_hobbies", p.hobbies.as_str()),
        ]);
    }
    runtime.prompts.render(mode.template(), &vars)
}

/// Emit the augmentation outputs for one source record: the original query
/// first (empty `augmented_query_info`), then one record per variation.
#[must_use]
pub fn augmentation_records(source: &Value, mode: AugmentMode, variations: &[Variation]) -> Vec<Value> {
    let base = |augmented: Value| -> Value {
        let mut query_info = source.get("query_info").cloned().unwrap_or_else(|| json!({}));
        if let Some(map) = query_info.as_object_mut() {
            map.insert("augmented_query_info".to_owned(), augmented);
        }
        json!({
            "query_info": query_info,
            "mcp_info": source.get("mcp_info").cloned().unwrap_or(Value::Null),
            "graph": source.get("graph").cloned().unwrap_or(Value::Null),
            "chain_info": source.get("chain_info").cloned().unwrap_or(Value::Null),
        })
    };

    let mut records = vec![base(json!({}))];
    for variation in variations {
        records.push(base(json!({
            "mode": mode.as_str(),
            "augmented_question": variation.question,
        })));
    }
    records
}

/// Parse an augmentation reply into its variations, tolerating fenced or
/// prefixed output. `None` when no variation carries a question.
#[must_use]
pub fn parse_augmentation_response(text: &str, mode: AugmentMode) -> Option<Vec<Variation>> {
    let mut body = text.trim();
    if body.starts_with("```") {
        body = crate::parse::strip_code_fences(body);
    }
    let body = match body.find('<') {
        Some(idx) if idx > 0 => &body[idx..],
        _ => body,
    };
    let scope = {
        let inner = extract_xml_field(body, "response");
        if inner.is_empty() { body.to_owned() } else { inner }
    };
    let variations = parse_variations(&scope, mode.as_str());
    if variations.is_empty() { None } else { Some(variations) }
}

// ---------------------------------------------------------------------------
// Quality scoring
// ---------------------------------------------------------------------------

/// The four scored dimensions, in reply order.
pub const QUALITY_DIMENSIONS: [&str; 4] = [
    "tool_selection_difficulty",
    "tool_selection_uniqueness",
    "question_quality",
    "scenario_realism",
];

/// Map a word rating onto 1–5 for one dimension; partial matches accepted.
#[must_use]
pub fn rating_to_score(dimension: &str, rating: &str) -> Option<u32> {
    let scale: &[&str] = match dimension {
        "tool_selection_difficulty" => &["very easy", "easy", "medium", "hard", "very hard"],
        "tool_selection_uniqueness" => &[
            "not unique",
            "somewhat unique",
            "moderately unique",
            "quite unique",
            "highly unique",
        ],
        "question_quality" => &["very poor", "poor", "average", "good", "excellent"],
        "scenario_realism" => &[
            "unrealistic",
            "somewhat unrealistic",
            "moderately realistic",
            "realistic",
            "highly realistic",
        ],
        _ => return None,
    };
    let rating = rating.trim().to_lowercase();
    if rating.is_empty() {
        return None;
    }
    // Exact match first, then containment either way. Scan from the
    // strongest rating down so "realistic" does not swallow "highly
    // realistic".
    if let Some(pos) = scale.iter().position(|w| **w == rating) {
        return Some(pos as u32 + 1);
    }
    for (pos, word) in scale.iter().enumerate().rev() {
        if rating.contains(word) || word.contains(rating.as_str()) {
            return Some(pos as u32 + 1);
        }
    }
    None
}

/// One dimension's parsed verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionScore {
    /// The judge's reasoning.
    pub reasoning: String,
    /// The raw word rating.
    pub rating_text: String,
    /// The mapped 1–5 score.
    pub score: u32,
}

static RESPONSE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"<response>(.*?)</response>")
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

/// Slice one dimension's block out of the reply, tolerating a missing
/// closing tag by cutting at the next dimension (or end of reply).
fn dimension_block<'t>(text: &'t str, dimension: &str) -> Option<&'t str> {
    let open = format!("<{dimension}>");
    let close = format!("</{dimension}>");
    let start = text.find(&open)? + open.len();
    if let Some(end) = text[start..].find(&close) {
        return Some(&text[start..start + end]);
    }
    let next = QUALITY_DIMENSIONS
        .iter()
        .skip_while(|d| **d != dimension)
        .nth(1)
        .map(|d| format!("<{d}>"));
    let end = next
        .and_then(|tag| text[start..].find(&tag))
        .or_else(|| text[start..].find("</response>"))
        .unwrap_or(text.len() - start);
    Some(&text[start..start + end])
}

/// Parse a quality-scoring reply into all four dimensions. `None` when any
/// dimension is missing or unmappable.
#[must_use]
pub fn parse_quality_response(text: &str) -> Option<Vec<(String, DimensionScore)>> {
    let scope = RESPONSE_BLOCK
        .captures(text)
        .map_or(text.trim(), |caps| caps.get(1).map_or("", |m| m.as_str()));

    let mut out = Vec::with_capacity(QUALITY_DIMENSIONS.len());
    for dimension in QUALITY_DIMENSIONS {
        let block = dimension_block(scope, dimension)?;
        let reasoning = extract_xml_field(block, "reasoning").trim().to_owned();
        let rating_text = extract_xml_field(block, "rating").trim().to_lowercase();
        let score = rating_to_score(dimension, &rating_text)?;
        if reasoning.is_empty() {
            return None;
        }
        out.push((
            dimension.to_owned(),
            DimensionScore {
                reasoning,
                rating_text,
                score,
            },
        ));
    }
    Some(out)
}

/// Fold parsed dimensions into the `query_score_info` payload.
#[must_use]
pub fn quality_score_info(dimensions: &[(String, DimensionScore)]) -> Value {
    let total: u32 = dimensions.iter().map(|(_, d)| d.score).sum();
    let average = f64::from(total) / dimensions.len().max(1) as f64;
    let mut scores = serde_json::Map::new();
    let mut reasoning = serde_json::Map::new();
    for (name, dim) in dimensions {
        scores.insert(name.clone(), json!(dim.score));
        reasoning.insert(name.clone(), json!(dim.reasoning));
    }
    scores.insert("total_score".to_owned(), json!(total));
    scores.insert("average_score".to_owned(), json!(average));
    json!({
        "quality_scores": scores,
        "quality_reasoning": reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_query_parses_with_fallbacks() {
        let reply = r"<response>
            <server_analysis>weather plus routing</server_analysis>
            <target_tool>get_weather, plan_route</target_tool>
            <question>Will it rain on my ride to Ghent tomorrow?</question>
        </response>";
        let parsed = parse_generated_query(reply).unwrap();
        assert_eq!(parsed.target_tools, vec!["get_weather", "plan_route"]);
        assert!(parsed.generated_question.starts_with("Will it rain"));

        assert!(parse_generated_query("<response><question>q</question></response>").is_none());
    }

    #[test]
    fn target_tools_split_on_commas_or_lines() {
        assert_eq!(parse_target_tools("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(parse_target_tools("a\nb\r\nc"), vec!["a", "b", "c"]);
        assert_eq!(parse_target_tools("<tools>a</tools>"), vec!["a"]);
        assert!(parse_target_tools("  ").is_empty());
    }

    #[test]
    fn augmentation_emits_original_plus_variations() {
        let source = json!({
            "query_info": {"generated_question": "orig", "target_tools": ["t"]},
            "mcp_info": {}, "graph": {}, "chain_info": {}
        });
        let variations = vec![
            Variation {
                index: 1,
                question: "v1".into(),
                context: String::new(),
                constraints: String::new(),
                mode: "diverse".into(),
            },
            Variation {
                index: 2,
                question: "v2".into(),
                context: String::new(),
                constraints: String::new(),
                mode: "diverse".into(),
            },
        ];
        let records = augmentation_records(&source, AugmentMode::Diverse, &variations);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["query_info"]["augmented_query_info"], json!({}));
        assert_eq!(
            records[1]["query_info"]["augmented_query_info"]["augmented_question"],
            "v1"
        );
        assert_eq!(records[2]["query_info"]["augmented_query_info"]["mode"], "diverse");
        // The original question survives on every record.
        assert_eq!(records[2]["query_info"]["generated_question"], "orig");
    }

    #[test]
    fn rating_words_map_to_scores() {
        assert_eq!(rating_to_score("question_quality", "excellent"), Some(5));
        assert_eq!(rating_to_score("question_quality", "very poor"), Some(1));
        assert_eq!(rating_to_score("scenario_realism", "highly realistic"), Some(5));
        assert_eq!(rating_to_score("scenario_realism", "realistic"), Some(4));
        assert_eq!(
            rating_to_score("tool_selection_difficulty", "rated: medium"),
            Some(3)
        );
        assert_eq!(rating_to_score("question_quality", "stellar"), None);
        assert_eq!(rating_to_score("unknown_dimension", "good"), None);
    }

    #[test]
    fn quality_reply_parses_all_dimensions() {
        let reply = r"<response>
          <tool_selection_difficulty><reasoning>clear hints</reasoning><rating>easy</rating></tool_selection_difficulty>
          <tool_selection_uniqueness><reasoning>only one path</reasoning><rating>quite unique</rating></tool_selection_uniqueness>
          <question_quality><reasoning>well formed</reasoning><rating>good</rating></question_quality>
          <scenario_realism><reasoning>plausible user</reasoning><rating>realistic</rating></scenario_realism>
        </response>";
        let dims = parse_quality_response(reply).unwrap();
        assert_eq!(dims.len(), 4);
        let info = quality_score_info(&dims);
        assert_eq!(info["quality_scores"]["tool_selection_difficulty"], 2);
        assert_eq!(info["quality_scores"]["total_score"], 2 + 4 + 4 + 4);
        assert_eq!(info["quality_scores"]["average_score"], 3.5);

        let truncated = reply.replace("</scenario_realism>", "");
        assert!(parse_quality_response(&truncated).is_some());

        assert!(parse_quality_response("<response></response>").is_none());
    }

    #[test]
    fn personas_never_carry_region_fields() {
        let personas = builtin_personas();
        assert!(!personas.is_empty());
        let as_json = serde_json::to_value(&personas[0]).unwrap();
        let mut keys: Vec<&str> = as_json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["age", "education", "hobbies", "occupation", "professional", "skills"]
        );
    }
}

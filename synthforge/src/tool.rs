//! Tool definitions.
//!
//! A [`ToolDefinition`] is the JSON-Schema-shaped document shared by every
//! consumer: MCP catalogs carry them, the synthesizer emits them, the agent
//! runner advertises them to the model, and the mock provider role-plays
//! them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool document: name, description and a JSON-Schema `parameters` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Function name, matching the callable in any synthesized code.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the parameters (`{type: "object", properties, required}`).
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

impl ToolDefinition {
    /// Create a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Render into the OpenAI `tools` array element shape.
    #[must_use]
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    /// Whether `parameters.required` only names declared properties.
    #[must_use]
    pub fn required_subset_of_properties(&self) -> bool {
        let properties = self.parameters.get("properties").and_then(Value::as_object);
        let required = self.parameters.get("required").and_then(Value::as_array);
        match (properties, required) {
            (Some(props), Some(required)) => required
                .iter()
                .filter_map(Value::as_str)
                .all(|name| props.contains_key(name)),
            (_, None) => true,
            (None, Some(required)) => required.is_empty(),
        }
    }

    /// Parameter names declared in the schema.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_tool() -> ToolDefinition {
        ToolDefinition::new(
            "get_weather",
            "Look up current weather",
            json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string"},
                    "unit": {"type": "string", "enum": ["c", "f"]}
                },
                "required": ["city"]
            }),
        )
    }

    #[test]
    fn openai_shape() {
        let rendered = weather_tool().to_openai();
        assert_eq!(rendered["type"], "function");
        assert_eq!(rendered["function"]["name"], "get_weather");
        assert!(rendered["function"]["parameters"]["properties"].is_object());
    }

    #[test]
    fn required_validation() {
        assert!(weather_tool().required_subset_of_properties());

        let mut bad = weather_tool();
        bad.parameters["required"] = json!(["city", "unknown"]);
        assert!(!bad.required_subset_of_properties());
    }

    #[test]
    fn missing_parameters_default() {
        let def: ToolDefinition = serde_json::from_str(r#"{"name": "t"}"#).unwrap();
        assert_eq!(def.parameters["type"], "object");
        assert!(def.parameter_names().is_empty());
    }
}

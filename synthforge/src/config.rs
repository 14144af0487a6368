//! Model and pipeline configuration.
//!
//! Every stage binary receives a `--model-name` that keys into an
//! [`ApiConfigs`] table loaded from a JSON file at startup. The table maps
//! model names to [`ModelConfig`] entries carrying the endpoint, sampling
//! parameters and tool-calling mode for that backend.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Fixed sleep between LLM retry attempts, in seconds.
pub const API_RETRY_SLEEP_SECS: u64 = 5;
/// Maximum LLM retry attempts before returning a null payload.
pub const API_MAX_RETRY_TIMES: u32 = 10;
/// Per-prompt-stage retries inside the tool synthesizer.
pub const ENV_SYNTHESIS_INNER_MAX_RETRY_TIMES: u32 = 5;
/// Outer test-until-answer-contained retries in the tool synthesizer.
pub const ENV_SYNTHESIS_OUTER_MAX_RETRY_TIMES: u32 = 15;
/// Per-cluster merge attempts in the cluster merge engine.
pub const MERGE_MAX_RETRY_TIMES: u32 = 20;
/// Default per-workload concurrency for named semaphores.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// How tool definitions are surfaced to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FncallPromptType {
    /// Native OpenAI `tools` field.
    #[default]
    Native,
    /// Nous/Hermes-style `<tool_call>` blocks rendered into the prompt.
    Nous,
    /// OSS vLLM variant of the prompt-based template.
    Oss,
}

/// Configuration for one chat-completions backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent in the request body.
    pub model: String,
    /// Base URL of the OpenAI-compatible endpoint (up to `/v1`).
    pub base_url: String,
    /// API key, sent as a bearer token.
    #[serde(default)]
    pub api_key: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Nucleus sampling parameter.
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Whether to stream the response.
    #[serde(default)]
    pub stream: bool,
    /// Backend family tag (`oai`, `oss_vllm`, `mistral_vllm`, `azure`,
    /// `qwen_dashscope`). Informational; the wire format is identical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    /// Tool-calling mode for the agent runner.
    #[serde(default)]
    pub fncall_prompt_type: FncallPromptType,
    /// Whether the agent may issue parallel tool calls.
    #[serde(default)]
    pub parallel_function_calls: bool,
    /// Extra request body fields forwarded verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<Value>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    0.95
}

fn default_max_tokens() -> u32 {
    30 * 1024
}

impl ModelConfig {
    /// Minimal config for the given model at the given endpoint.
    #[must_use]
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: String::new(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            stream: false,
            model_type: None,
            fncall_prompt_type: FncallPromptType::default(),
            parallel_function_calls: false,
            extra_body: None,
        }
    }

    /// Set the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Enable or disable streaming.
    #[must_use]
    pub const fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Build the chat completions URL.
    #[must_use]
    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// The model configuration table, keyed by model name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiConfigs {
    configs: HashMap<String, ModelConfig>,
}

impl ApiConfigs {
    /// Load the table from a JSON file of `{name: config}` entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "cannot read api configs {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let configs: HashMap<String, ModelConfig> = serde_json::from_str(&text)?;
        Ok(Self { configs })
    }

    /// Look up a model by name.
    pub fn get(&self, name: &str) -> Result<&ModelConfig> {
        self.configs.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.configs.keys().map(String::as_str).collect();
            known.sort_unstable();
            Error::config(format!(
                "model '{name}' not in api configs (known: {})",
                known.join(", ")
            ))
        })
    }

    /// Insert a config under the given name.
    pub fn insert(&mut self, name: impl Into<String>, config: ModelConfig) {
        self.configs.insert(name.into(), config);
    }

    /// Registered model names, unsorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }

    /// Number of registered models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Configuration for the code-execution sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Full URL of the `run_code` endpoint.
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

fn default_sandbox_timeout() -> u64 {
    60
}

impl SandboxConfig {
    /// Config pointing at the given endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_sandbox_timeout(),
        }
    }

    /// Read the endpoint from the `SANDBOX_URL` environment variable.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SANDBOX_URL")
            .map_err(|_| Error::config("SANDBOX_URL is not set"))?;
        Ok(Self::new(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_config_defaults() {
        let cfg: ModelConfig =
            serde_json::from_str(r#"{"model":"qwen3-32b","base_url":"http://localhost:8000/v1"}"#)
                .unwrap();
        assert_eq!(cfg.temperature, 1.0);
        assert_eq!(cfg.top_p, 0.95);
        assert_eq!(cfg.max_tokens, 30 * 1024);
        assert!(!cfg.stream);
        assert_eq!(cfg.fncall_prompt_type, FncallPromptType::Native);
        assert_eq!(cfg.chat_url(), "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn api_configs_lookup() {
        let mut configs = ApiConfigs::default();
        configs.insert("judge", ModelConfig::new("judge-v1", "http://j/v1"));

        assert!(configs.get("judge").is_ok());
        let err = configs.get("missing").unwrap_err().to_string();
        assert!(err.contains("missing"));
        assert!(err.contains("judge"));
    }

    #[test]
    fn fncall_prompt_type_parses() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{"model":"m","base_url":"u","fncall_prompt_type":"nous"}"#,
        )
        .unwrap();
        assert_eq!(cfg.fncall_prompt_type, FncallPromptType::Nous);
    }
}

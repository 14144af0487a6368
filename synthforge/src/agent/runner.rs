//! The per-task agent loop and the worker pool around it.

use serde_json::Value;
use tracing::{info, warn};

use crate::config::{FncallPromptType, ModelConfig};
use crate::error::{Error, Result};
use crate::llm::ChatClient;
use crate::mcp::{CallMode, McpInfo, McpSession, build_smithery_url};
use crate::message::{ChatMessage, ToolCall};
use crate::parse::strip_enclosing_tag;
use crate::runtime::Runtime;
use crate::stage::{Keyer, StageOptions, StageOutcome, StageReport, run_stage};
use crate::tool::ToolDefinition;

use super::fncall::{parse_prompted_tool_calls, render_tools_system};
use super::mock::{HistoryEntry, MockToolProvider};

/// Knobs for one interaction run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Parallel worker count.
    pub max_workers: usize,
    /// Per-task wall-clock timeout in seconds.
    pub timeout_secs: u64,
    /// Maximum assistant turns per task.
    pub max_steps: usize,
    /// Optional system prompt prepended to every task.
    pub system_prompt: Option<String>,
    /// Smithery API key for url-signed servers.
    pub smithery_api_key: String,
    /// Smithery profile for url-signed servers.
    pub smithery_profile: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            timeout_secs: 90,
            max_steps: 10,
            system_prompt: None,
            smithery_api_key: String::new(),
            smithery_profile: String::new(),
        }
    }
}

/// The query a task runs on: the augmented question when present,
/// otherwise the generated question, with any enclosing tag stripped.
#[must_use]
pub fn extract_query(query_info: &Value) -> String {
    let augmented = query_info
        .pointer("/augmented_query_info/augmented_question")
        .and_then(Value::as_str)
        .filter(|q| !q.trim().is_empty());
    let query = augmented.unwrap_or_else(|| {
        query_info
            .get("generated_question")
            .and_then(Value::as_str)
            .unwrap_or_default()
    });
    strip_enclosing_tag(query)
}

/// Resume key for interaction records: the extracted query.
#[must_use]
pub fn query_keyer() -> Keyer {
    std::sync::Arc::new(|record| {
        record
            .get("query_info")
            .map(extract_query)
            .filter(|q| !q.is_empty())
    })
}

enum ToolBackend<'a> {
    Mock(MockToolProvider<'a>),
    Mcp(McpSession),
}

/// Drives assistant/tool loops over query records.
#[derive(Debug, Clone)]
pub struct AgentRunner<'a> {
    runtime: &'a Runtime,
    client: &'a ChatClient,
    cfg: &'a ModelConfig,
    opts: RunnerOptions,
}

impl<'a> AgentRunner<'a> {
    /// Bind a runner to its runtime, client, agent model and options.
    #[must_use]
    pub const fn new(
        runtime: &'a Runtime,
        client: &'a ChatClient,
        cfg: &'a ModelConfig,
        opts: RunnerOptions,
    ) -> Self {
        Self {
            runtime,
            client,
            cfg,
            opts,
        }
    }

    /// Run every record of `inputs` through the agent loop, committing one
    /// record (with `trajectory`) per input. Already-processed queries are
    /// skipped on resume.
    pub async fn run_all(
        &self,
        inputs: Vec<Value>,
        out_path: impl AsRef<std::path::Path>,
    ) -> Result<StageReport> {
        let keyer = query_keyer();
        let opts = StageOptions {
            concurrency: self.opts.max_workers,
            append: true,
        };
        run_stage(inputs, &keyer, out_path, &opts, |record| async move {
            Ok(StageOutcome::Emit(self.run_record(record).await))
        })
        .await
    }

    /// Run one task. Never fails: timeouts and errors terminate the
    /// trajectory with an `"[ERROR: …]"` assistant message.
    pub async fn run_record(&self, mut record: Value) -> Value {
        let query = record
            .get("query_info")
            .map(extract_query)
            .unwrap_or_default();
        let mcp_info: McpInfo = record
            .get("mcp_info")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let timeout = std::time::Duration::from_secs(self.opts.timeout_secs);
        let trajectory =
            match crate::retry::with_timeout(timeout, self.interact(&query, &mcp_info)).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "task failed; committing error trajectory");
                    vec![ChatMessage::assistant(format!("[ERROR: {e}]"))]
                }
            };

        if let Some(map) = record.as_object_mut() {
            map.insert(
                "trajectory".to_owned(),
                serde_json::to_value(&trajectory).unwrap_or(Value::Null),
            );
        }
        record
    }

    /// The assistant loop: call the model, execute its tool calls, feed
    /// observations back, stop when a turn carries no calls.
    async fn interact(&self, query: &str, mcp_info: &McpInfo) -> Result<Vec<ChatMessage>> {
        if query.is_empty() {
            return Err(Error::record("record has no query"));
        }

        let (backend, tools) = self.bind_backend(mcp_info, query).await?;
        let prompted = self.cfg.fncall_prompt_type != FncallPromptType::Native;

        let mut messages: Vec<ChatMessage> = Vec::new();
        let mut system = self.opts.system_prompt.clone().unwrap_or_default();
        if prompted {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&render_tools_system(&tools));
        }
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(query));

        let mut history: Vec<HistoryEntry> = Vec::new();
        for step in 0..self.opts.max_steps {
            let outcome = if prompted {
                self.client.chat(&messages, self.cfg).await?
            } else {
                self.client.chat_with_tools(&messages, &tools, self.cfg).await?
            };
            if outcome.is_null() {
                return Err(Error::internal(
                    outcome.failure.unwrap_or_else(|| "model returned no payload".to_owned()),
                ));
            }

            let (content, calls) = if prompted {
                let (content, calls) = parse_prompted_tool_calls(outcome.text());
                ((!content.is_empty()).then_some(content), calls)
            } else {
                (outcome.content.clone(), outcome.tool_calls.clone())
            };

            let mut assistant = if calls.is_empty() {
                ChatMessage::assistant(content.clone().unwrap_or_default())
            } else {
                ChatMessage::assistant_tool_calls(content.clone(), calls.clone())
            };
            assistant.reasoning_content = outcome.reasoning.clone();
            messages.push(assistant);

            if calls.is_empty() {
                info!(step, "agent produced final answer");
                break;
            }

            let observations = self.execute_calls(&backend, &calls, &history).await;
            for (call, observation) in calls.iter().zip(&observations) {
                history.push(HistoryEntry {
                    function_call: format!("{}({})", call.name(), call.function.arguments),
                    observation: observation.clone(),
                });
                messages.push(ChatMessage::tool(call.id.clone(), observation.clone()));
            }
        }

        if let ToolBackend::Mcp(session) = &backend {
            session.shutdown();
        }
        Ok(messages)
    }

    /// Bind the tool backend named by `call_info` and resolve the tool
    /// catalog the agent will see.
    async fn bind_backend(
        &self,
        mcp_info: &McpInfo,
        query: &str,
    ) -> Result<(ToolBackend<'a>, Vec<ToolDefinition>)> {
        match mcp_info.call_mode()? {
            CallMode::MockTool => {
                let tools = mcp_info.base_info.tool_list.clone();
                let provider = MockToolProvider::new(
                    self.runtime,
                    self.client,
                    self.cfg,
                    tools.clone(),
                    mcp_info.base_info.group_info.server_description.clone(),
                    Some(query.to_owned()),
                );
                Ok((ToolBackend::Mock(provider), tools))
            }
            CallMode::Aistudio { url, headers } => {
                let session = McpSession::connect(&url, &headers).await?;
                let tools = if session.tools().is_empty() {
                    mcp_info.base_info.tool_list.clone()
                } else {
                    session.tools().to_vec()
                };
                Ok((ToolBackend::Mcp(session), tools))
            }
            CallMode::Smithery {
                python_sdk_url,
                python_sdk_config,
            } => {
                let url = build_smithery_url(
                    &python_sdk_url,
                    &python_sdk_config,
                    &self.opts.smithery_api_key,
                    &self.opts.smithery_profile,
                );
                let session = McpSession::connect(&url, &std::collections::HashMap::new()).await?;
                let tools = if session.tools().is_empty() {
                    mcp_info.base_info.tool_list.clone()
                } else {
                    session.tools().to_vec()
                };
                Ok((ToolBackend::Mcp(session), tools))
            }
        }
    }

    /// Execute one parallel batch of calls, yielding one observation per
    /// call in call order. Failures become error observations, never task
    /// failures.
    async fn execute_calls(
        &self,
        backend: &ToolBackend<'a>,
        calls: &[ToolCall],
        history: &[HistoryEntry],
    ) -> Vec<String> {
        match backend {
            ToolBackend::Mock(provider) => match provider.call(calls, history).await {
                Ok(observations) => observations,
                Err(e) => {
                    warn!(error = %e, "mock tool batch failed");
                    calls.iter().map(|_| format!("Error: {e}")).collect()
                }
            },
            ToolBackend::Mcp(session) => {
                let semaphore = self.runtime.semaphores.get("tool_call");
                let tasks = calls.iter().map(|call| {
                    let semaphore = semaphore.clone();
                    async move {
                        let _permit = semaphore.acquire_owned().await;
                        let arguments = call
                            .function
                            .parse_arguments()
                            .unwrap_or(Value::Object(serde_json::Map::new()));
                        session.call_tool(call.name(), arguments).await
                    }
                });
                futures::future::join_all(tasks)
                    .await
                    .into_iter()
                    .map(|result| result.unwrap_or_else(|e| format!("Error: {e}")))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_extraction_prefers_augmented() {
        let info = json!({
            "generated_question": "orig",
            "augmented_query_info": {"mode": "diverse", "augmented_question": "<question>aug</question>"}
        });
        assert_eq!(extract_query(&info), "aug");

        let info = json!({
            "generated_question": "orig",
            "augmented_query_info": {}
        });
        assert_eq!(extract_query(&info), "orig");

        let info = json!({
            "generated_question": "orig",
            "augmented_query_info": {"augmented_question": "  "}
        });
        assert_eq!(extract_query(&info), "orig");
    }

    #[test]
    fn keyer_skips_queryless_records() {
        let keyer = query_keyer();
        assert_eq!(
            keyer(&json!({"query_info": {"generated_question": "q"}})),
            Some("q".to_owned())
        );
        assert_eq!(keyer(&json!({"query_info": {}})), None);
        assert_eq!(keyer(&json!({})), None);
    }
}

//! MCP tool-server catalogs and transport.
//!
//! A catalog record (`mcp_info`) carries the server's identity and tool
//! list plus `call_info` describing how to reach it: mock-tool mode (the
//! LLM role-plays the tools), aistudio mode (streamable HTTP with auth
//! headers), or Smithery mode (a URL template signed by substituting the
//! base64 config, API key and profile).

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use rmcp::ServiceExt as _;
use rmcp::model::{CallToolRequestParam, ClientCapabilities, Implementation, InitializeRequestParams};
use rmcp::service::ServerSink;
use rmcp::transport::StreamableHttpClientTransport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::tool::ToolDefinition;

/// Server identity fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Server name.
    #[serde(default)]
    pub server_name: String,
    /// Display title.
    #[serde(default)]
    pub server_title: String,
    /// What the server does.
    #[serde(default)]
    pub server_description: String,
    /// Stable catalog id.
    #[serde(default)]
    pub group_id: String,
}

impl GroupInfo {
    /// Best display name available.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if !self.server_name.is_empty() {
            &self.server_name
        } else if !self.server_title.is_empty() {
            &self.server_title
        } else if !self.group_id.is_empty() {
            &self.group_id
        } else {
            "unknown"
        }
    }

    /// Server name lowered and dashed for config keys.
    #[must_use]
    pub fn safe_server_name(&self) -> String {
        self.display_name().replace(' ', "-").to_lowercase()
    }
}

/// The static half of a catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseInfo {
    /// Server identity.
    #[serde(default)]
    pub group_info: GroupInfo,
    /// The server's tools.
    #[serde(default)]
    pub tool_list: Vec<ToolDefinition>,
}

/// A full catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpInfo {
    /// Identity and tools.
    #[serde(default)]
    pub base_info: BaseInfo,
    /// Transport description.
    #[serde(default)]
    pub call_info: Value,
    /// Optional feature flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Value>,
}

/// How tool calls reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallMode {
    /// Simulate every tool with an LLM.
    MockTool,
    /// Streamable HTTP with auth headers.
    Aistudio {
        /// Endpoint URL.
        url: String,
        /// Auth headers.
        headers: HashMap<String, String>,
    },
    /// Smithery-hosted server reached through a signed URL template.
    Smithery {
        /// URL template with `{config_b64}` / `{smithery_api_key}` /
        /// `{smithery_profile}` slots.
        python_sdk_url: String,
        /// Server config, JSON object or JSON-encoded string.
        python_sdk_config: String,
    },
}

impl McpInfo {
    /// Classify `call_info`. Mock mode wins; aistudio is recognized by a
    /// `headers` field; anything else with a `python_sdk_url` is Smithery.
    pub fn call_mode(&self) -> Result<CallMode> {
        let info = &self.call_info;
        if info.get("mock_tool").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(CallMode::MockTool);
        }
        if let Some(headers) = info.get("headers") {
            let url = info
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let headers = headers
                .as_object()
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())))
                        .collect()
                })
                .unwrap_or_default();
            return Ok(CallMode::Aistudio { url, headers });
        }
        if let Some(url) = info.get("python_sdk_url").and_then(Value::as_str) {
            let config = match info.get("python_sdk_config") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            return Ok(CallMode::Smithery {
                python_sdk_url: url.to_owned(),
                python_sdk_config: config,
            });
        }
        Err(Error::mcp("call_info matches no known transport mode"))
    }
}

/// Fill a Smithery URL template: base64 the config into `{config_b64}`,
/// substitute the key and profile, and append `&profile=` when the
/// template lacks one.
#[must_use]
pub fn build_smithery_url(template: &str, config: &str, api_key: &str, profile: &str) -> String {
    let config_json: Value = serde_json::from_str(config).unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
    let config_b64 =
        base64::engine::general_purpose::STANDARD.encode(config_json.to_string().as_bytes());

    let mut url = template
        .replace("{config_b64}", &config_b64)
        .replace("{smithery_api_key}", api_key)
        .replace("{smithery_profile}", profile);
    if !profile.is_empty() && !url.contains("profile=") {
        url.push_str(&format!("&profile={profile}"));
    }
    url
}

/// A live streamable-HTTP MCP session.
///
/// The background task keeps the service alive; [`McpSession::shutdown`]
/// tears it down (also called on drop).
pub struct McpSession {
    sink: ServerSink,
    tools: Vec<ToolDefinition>,
    handle: Arc<JoinHandle<()>>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl McpSession {
    /// Connect to a streamable-HTTP server, optionally sending `headers`
    /// on every request.
    pub async fn connect(url: &str, headers: &HashMap<String, String>) -> Result<Self> {
        let client_info = InitializeRequestParams {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "synthforge".to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                ..Default::default()
            },
        };

        let service = if headers.is_empty() {
            let transport = StreamableHttpClientTransport::from_uri(url.to_owned());
            client_info
                .serve(transport)
                .await
                .map_err(|e| Error::mcp(format!("connect {url}: {e}")))?
        } else {
            let mut header_map = reqwest::header::HeaderMap::new();
            for (key, value) in headers {
                let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| Error::mcp(format!("bad header name {key}: {e}")))?;
                let value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| Error::mcp(format!("bad header value for {key}: {e}")))?;
                header_map.insert(name, value);
            }
            let http = reqwest::Client::builder()
                .default_headers(header_map)
                .build()
                .map_err(|e| Error::mcp(e.to_string()))?;
            let transport = StreamableHttpClientTransport::with_client(
                http,
                rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig::with_uri(
                    url.to_owned(),
                ),
            );
            client_info
                .serve(transport)
                .await
                .map_err(|e| Error::mcp(format!("connect {url}: {e}")))?
        };

        let sink = service.peer().clone();
        let listed = sink
            .list_tools(Default::default())
            .await
            .map_err(|e| Error::mcp(format!("list_tools: {e}")))?
            .tools;
        let tools = listed
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name.to_string(),
                description: t.description.as_deref().unwrap_or_default().to_owned(),
                parameters: Value::Object((*t.input_schema).clone()),
            })
            .collect();

        let handle = tokio::spawn(async move {
            let _ = service.waiting().await;
        });

        Ok(Self {
            sink,
            tools,
            handle: Arc::new(handle),
        })
    }

    /// The server's tools.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Invoke one tool and render its content as a string.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(Error::mcp(format!(
                    "tool arguments must be an object, got {other}"
                )));
            }
        };
        let result = self
            .sink
            .call_tool(CallToolRequestParam {
                meta: None,
                name: name.to_owned().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| Error::mcp(format!("call_tool {name}: {e}")))?;
        serde_json::to_string(&result.content).map_err(Error::from)
    }

    /// Tear the session down.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_mode_classification() {
        let mock: McpInfo = serde_json::from_value(json!({
            "base_info": {},
            "call_info": {"mock_tool": true}
        }))
        .unwrap();
        assert_eq!(mock.call_mode().unwrap(), CallMode::MockTool);

        let aistudio: McpInfo = serde_json::from_value(json!({
            "base_info": {},
            "call_info": {"url": "https://srv/mcp", "headers": {"Authorization": "Bearer t"}}
        }))
        .unwrap();
        match aistudio.call_mode().unwrap() {
            CallMode::Aistudio { url, headers } => {
                assert_eq!(url, "https://srv/mcp");
                assert_eq!(headers["Authorization"], "Bearer t");
            }
            other => panic!("wrong mode: {other:?}"),
        }

        let smithery: McpInfo = serde_json::from_value(json!({
            "base_info": {},
            "call_info": {"python_sdk_url": "https://s/{config_b64}", "python_sdk_config": "{}"}
        }))
        .unwrap();
        assert!(matches!(smithery.call_mode().unwrap(), CallMode::Smithery { .. }));

        let unknown: McpInfo = serde_json::from_value(json!({"base_info": {}, "call_info": {}})).unwrap();
        assert!(unknown.call_mode().is_err());
    }

    #[test]
    fn smithery_url_substitution() {
        let url = build_smithery_url(
            "https://server.smithery.ai/x/mcp?config={config_b64}&api_key={smithery_api_key}",
            r#"{"region": "eu"}"#,
            "key-123",
            "prof-9",
        );
        assert!(url.contains("api_key=key-123"));
        assert!(url.ends_with("&profile=prof-9"));
        let b64 = base64::engine::general_purpose::STANDARD.encode(br#"{"region":"eu"}"#);
        assert!(url.contains(&b64));
    }

    #[test]
    fn smithery_url_keeps_existing_profile() {
        let url = build_smithery_url(
            "https://s/mcp?profile={smithery_profile}",
            "",
            "",
            "p1",
        );
        assert_eq!(url, "https://s/mcp?profile=p1");
    }

    #[test]
    fn safe_server_name_is_dashed_lowercase() {
        let info = GroupInfo {
            server_name: "Weather Service EU".into(),
            ..GroupInfo::default()
        };
        assert_eq!(info.safe_server_name(), "weather-service-eu");
    }
}

//! Client for the remote code-execution sandbox.
//!
//! One endpoint: `POST {SANDBOX_URL}` with `{code, language}`, answering
//! `{status, run_result: {stdout, stderr?}}`. No retry at this layer — the
//! tool synthesizer owns the retry loop and counts a sandbox failure as one
//! failed synthesis attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::{Error, Result};

/// Request body for a sandbox run.
#[derive(Debug, Clone, Serialize)]
struct RunCodeRequest<'a> {
    code: &'a str,
    language: &'a str,
}

/// Execution output of a sandbox run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,
    /// Captured standard error, when the sandbox reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Response body of a sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCodeResponse {
    /// `"Success"` or `"Failed"`.
    pub status: String,
    /// Execution output; defaults to empty on failure responses that omit it.
    #[serde(default)]
    pub run_result: RunResult,
    /// Error description on failure, when the sandbox reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunCodeResponse {
    /// Whether the sandbox reported success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == "Success"
    }
}

/// Blocking-free HTTP client for the sandbox endpoint.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    config: SandboxConfig,
    http: reqwest::Client,
}

impl SandboxClient {
    /// Create a client for the configured endpoint.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Execute `code` as Python and return the sandbox verdict.
    pub async fn run_code(&self, code: &str) -> Result<RunCodeResponse> {
        let body = RunCodeRequest {
            code,
            language: "python",
        };
        let response = self
            .http
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::sandbox(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::sandbox(format!("HTTP {status}: {body}")));
        }

        response
            .json::<RunCodeResponse>()
            .await
            .map_err(|e| Error::sandbox(format!("malformed response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn run_code_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"language": "python"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "Success",
                "run_result": {"stdout": "84\n"}
            })))
            .mount(&server)
            .await;

        let client = SandboxClient::new(SandboxConfig::new(server.uri()));
        let out = client.run_code("print(12 * 7)").await.unwrap();
        assert!(out.is_success());
        assert_eq!(out.run_result.stdout, "84\n");
    }

    #[tokio::test]
    async fn failed_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "Failed",
                "error": "NameError: name 'x' is not defined"
            })))
            .mount(&server)
            .await;

        let client = SandboxClient::new(SandboxConfig::new(server.uri()));
        let out = client.run_code("print(x)").await.unwrap();
        assert!(!out.is_success());
        assert!(out.error.unwrap().contains("NameError"));
    }
}

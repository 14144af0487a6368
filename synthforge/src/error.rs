//! Error types for the synthforge pipelines.
//!
//! [`LlmError`] covers failure modes when talking to a chat-completions
//! backend and carries the transient/terminal split the client relies on:
//! transient errors are retried inside the client, terminal errors surface
//! as a null payload at the client boundary. [`Error`] is the crate-wide
//! hierarchy everything else folds into.

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for LLM backend operations.
///
/// Each variant represents a distinct failure mode, enabling callers to
/// pattern-match on specific cases (e.g., retrying transient errors).
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum LlmError {
    /// Authentication or authorization failure.
    #[error("[{model}] {message}")]
    Auth {
        /// Model name the request was issued against.
        model: String,
        /// Error description.
        message: String,
    },

    /// Rate limit exceeded.
    #[error("[{model}] rate limit exceeded")]
    RateLimited {
        /// Model name.
        model: String,
    },

    /// The request exceeded the model's context window.
    ///
    /// Terminal: the client returns a null payload immediately instead of
    /// retrying, and judges fall back to their safe default.
    #[error("context window exceeded: {message}")]
    ContextOverflow {
        /// Backend error description.
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("expected {expected}, got {got}")]
    ResponseFormat {
        /// Expected shape description.
        expected: String,
        /// Actual shape received.
        got: String,
    },

    /// Network or connection error.
    #[error("{0}")]
    Network(String),

    /// Streaming (SSE) error.
    #[error("{0}")]
    Stream(String),

    /// Non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// All retry attempts were exhausted.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last failure.
        last: String,
    },

    /// Internal client error.
    #[error("{0}")]
    Internal(String),
}

impl LlmError {
    /// Create an authentication error.
    #[must_use]
    pub fn auth(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Create a rate limit error.
    #[must_use]
    pub fn rate_limited(model: impl Into<String>) -> Self {
        Self::RateLimited {
            model: model.into(),
        }
    }

    /// Create a context overflow error.
    #[must_use]
    pub fn context_overflow(message: impl Into<String>) -> Self {
        Self::ContextOverflow {
            message: message.into(),
        }
    }

    /// Create a response format error.
    #[must_use]
    pub fn response_format(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ResponseFormat {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a streaming error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }

    /// Create an HTTP status error.
    #[must_use]
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the client should retry after this error.
    ///
    /// Context overflow is the one terminal case the upstream judges must
    /// see as a null payload rather than a retry storm.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::ContextOverflow { .. } | Self::Auth { .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::network("request timed out")
        } else if err.is_connect() {
            Self::network(format!("connection failed: {err}"))
        } else {
            Self::network(err.to_string())
        }
    }
}

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error from the LLM client.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Error from the code-execution sandbox.
    #[error("sandbox error: {message}")]
    Sandbox {
        /// Error description.
        message: String,
    },

    /// Error from an MCP server or transport.
    #[error("mcp error: {message}")]
    Mcp {
        /// Error description.
        message: String,
    },

    /// A record violated a stage invariant.
    #[error("invalid record: {message}")]
    Record {
        /// Description of the violated invariant.
        message: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration issue.
        message: String,
    },

    /// A per-task wall-clock timeout elapsed.
    #[error("task timed out after {secs}s")]
    Timeout {
        /// The configured timeout in seconds.
        secs: u64,
    },

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Create a sandbox error.
    #[must_use]
    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox {
            message: message.into(),
        }
    }

    /// Create an MCP error.
    #[must_use]
    pub fn mcp(message: impl Into<String>) -> Self {
        Self::Mcp {
            message: message.into(),
        }
    }

    /// Create a record error.
    #[must_use]
    pub fn record(message: impl Into<String>) -> Self {
        Self::Record {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_overflow_is_terminal() {
        assert!(!LlmError::context_overflow("too long").is_retryable());
        assert!(LlmError::network("reset").is_retryable());
        assert!(LlmError::rate_limited("m").is_retryable());
        assert!(!LlmError::auth("m", "bad key").is_retryable());
    }

    #[test]
    fn display_includes_context() {
        let err = LlmError::http_status(503, "upstream unavailable");
        assert_eq!(err.to_string(), "HTTP 503: upstream unavailable");

        let err = Error::Timeout { secs: 90 };
        assert_eq!(err.to_string(), "task timed out after 90s");
    }
}

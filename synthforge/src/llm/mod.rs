//! OpenAI-compatible chat-completions client.
//!
//! One operation: [`ChatClient::chat`] turns a message sequence plus a
//! [`ModelConfig`](crate::config::ModelConfig) into a single assistant turn,
//! reassembling streamed deltas (content, reasoning content, indexed tool
//! calls) when the config asks for streaming. Transient failures retry on a
//! fixed interval; context overflow and retry exhaustion come back as a
//! null [`ChatOutcome`] so judges can fall back to their safe defaults
//! instead of seeing raw HTTP errors.

mod client;
mod types;

pub use client::{ChatClient, ChatOutcome};
pub use types::{ChatCompletionResponse, StreamChunk};

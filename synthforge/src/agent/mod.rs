//! The agent runner: drive an assistant loop against real MCP tools or an
//! LLM-mocked tool server to produce interaction trajectories.
//!
//! Per task: read `(query, mcp_info)`, bind a tool backend from
//! `call_info`, run the assistant until a turn carries no tool calls,
//! append the full message sequence as `trajectory`, and always commit the
//! record — timeouts and errors terminate the trajectory with an
//! `"[ERROR: …]"` assistant message instead of losing the task.

mod fncall;
mod mock;
mod runner;

pub use fncall::{parse_prompted_tool_calls, render_tools_system};
pub use mock::{HistoryEntry, MockToolProvider};
pub use runner::{AgentRunner, RunnerOptions, extract_query};

//! Trajectory segmentation for the reward judges.
//!
//! A trajectory is a flat message list; the judges need structure back out
//! of it: which assistant turns are mid-run plan steps, which runs of tool
//! messages form one parallel batch, and what the final answer is.

use crate::message::{ChatMessage, Role};

/// A plan segment: an assistant message that (i) is not the first
/// assistant turn, (ii) follows a tool message, and (iii) carries tool
/// calls. The judge sees everything before it as context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSegment {
    /// Index of the assistant message in the trajectory.
    pub index: usize,
    /// Number of tool calls the segment issues.
    pub call_count: usize,
}

/// Locate every plan segment.
#[must_use]
pub fn plan_segments(trajectory: &[ChatMessage]) -> Vec<PlanSegment> {
    let mut first_assistant = None;
    for (idx, msg) in trajectory.iter().enumerate() {
        if msg.role == Role::Assistant {
            first_assistant = Some(idx);
            break;
        }
    }

    trajectory
        .iter()
        .enumerate()
        .filter(|(idx, msg)| {
            msg.role == Role::Assistant
                && Some(*idx) != first_assistant
                && *idx > 0
                && trajectory[idx - 1].role == Role::Tool
                && msg.has_tool_calls()
        })
        .map(|(index, msg)| PlanSegment {
            index,
            call_count: msg.tool_calls.as_ref().map_or(0, Vec::len),
        })
        .collect()
}

/// A maximal run of consecutive tool messages (one parallel-call batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolBatch {
    /// Index of the first tool message.
    pub start: usize,
    /// One past the last tool message.
    pub end: usize,
    /// Index of the assistant message following the batch, if any.
    pub following_assistant: Option<usize>,
}

/// Locate every parallel-call batch.
#[must_use]
pub fn tool_batches(trajectory: &[ChatMessage]) -> Vec<ToolBatch> {
    let mut batches = Vec::new();
    let mut idx = 0;
    while idx < trajectory.len() {
        if trajectory[idx].role != Role::Tool {
            idx += 1;
            continue;
        }
        let start = idx;
        while idx < trajectory.len() && trajectory[idx].role == Role::Tool {
            idx += 1;
        }
        let following_assistant =
            (idx < trajectory.len() && trajectory[idx].role == Role::Assistant).then_some(idx);
        batches.push(ToolBatch {
            start,
            end: idx,
            following_assistant,
        });
    }
    batches
}

/// The first assistant message, if any.
#[must_use]
pub fn first_assistant(trajectory: &[ChatMessage]) -> Option<&ChatMessage> {
    trajectory.iter().find(|m| m.role == Role::Assistant)
}

/// The final answer: the last assistant message's text.
#[must_use]
pub fn final_answer(trajectory: &[ChatMessage]) -> Option<&str> {
    trajectory
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(ChatMessage::text)
}

/// The user query: the first user message's text.
#[must_use]
pub fn user_query(trajectory: &[ChatMessage]) -> Option<&str> {
    trajectory
        .iter()
        .find(|m| m.role == Role::User)
        .map(ChatMessage::text)
}

/// Total tool calls issued across the trajectory.
#[must_use]
pub fn tool_call_count(trajectory: &[ChatMessage]) -> usize {
    trajectory
        .iter()
        .filter_map(|m| m.tool_calls.as_ref())
        .map(Vec::len)
        .sum()
}

/// Validate the tool-call-id invariant: every tool message references some
/// earlier assistant call.
#[must_use]
pub fn tool_ids_resolve(trajectory: &[ChatMessage]) -> bool {
    let mut seen = std::collections::HashSet::new();
    for msg in trajectory {
        if msg.role == Role::Assistant
            && let Some(calls) = &msg.tool_calls
        {
            for call in calls {
                seen.insert(call.id.as_str());
            }
        }
        if msg.role == Role::Tool {
            match msg.tool_call_id.as_deref() {
                Some(id) if seen.contains(id) => {}
                _ => return false,
            }
        }
    }
    true
}

/// Render a message slice for a judge prompt.
#[must_use]
pub fn render_messages(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!("[{}] ", msg.role.as_str()));
        out.push_str(msg.text());
        if let Some(calls) = &msg.tool_calls {
            for call in calls {
                out.push_str(&format!(
                    "\n  <call id={}> {}({})",
                    call.id,
                    call.name(),
                    call.function.arguments
                ));
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    /// system, user, assistant(2 calls), tool, tool, assistant(1 call),
    /// tool, assistant(final)
    fn sample() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("s"),
            ChatMessage::user("q"),
            ChatMessage::assistant_tool_calls(
                Some("looking up both".into()),
                vec![
                    ToolCall::new("call_0", "get_weather", "{}"),
                    ToolCall::new("call_1", "plan_route", "{}"),
                ],
            ),
            ChatMessage::tool("call_0", "sunny"),
            ChatMessage::tool("call_1", "N9 via bridge"),
            ChatMessage::assistant_tool_calls(None, vec![ToolCall::new("call_2", "book", "{}")]),
            ChatMessage::tool("call_2", "booked"),
            ChatMessage::assistant("All done: sunny, via N9, booked."),
        ]
    }

    #[test]
    fn plan_segments_skip_first_assistant() {
        let segments = plan_segments(&sample());
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, 5);
        assert_eq!(segments[0].call_count, 1);
    }

    #[test]
    fn parallel_calls_form_one_batch() {
        let batches = tool_batches(&sample());
        assert_eq!(batches.len(), 2);
        assert_eq!((batches[0].start, batches[0].end), (3, 5));
        assert_eq!(batches[0].following_assistant, Some(5));
        assert_eq!((batches[1].start, batches[1].end), (6, 7));
        assert_eq!(batches[1].following_assistant, Some(7));
    }

    #[test]
    fn answer_and_query_extraction() {
        let t = sample();
        assert_eq!(user_query(&t), Some("q"));
        assert!(final_answer(&t).unwrap().starts_with("All done"));
        assert_eq!(tool_call_count(&t), 3);
    }

    #[test]
    fn tool_id_invariant_detects_orphans() {
        let mut t = sample();
        assert!(tool_ids_resolve(&t));
        t.push(ChatMessage::tool("call_99", "orphan"));
        assert!(!tool_ids_resolve(&t));
    }
}

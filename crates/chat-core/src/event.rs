//! Stream Events
//!
//! Progress of a streaming turn, encoded one event per `data: <JSON>` line.
//! Each JSON object carries exactly one key naming the event:
//!
//! ```text
//! data: {"conversation_id":"9f2c..."}
//! data: {"tool_call":{"id":"call_1","name":"get_current_time","arguments":"{}","arguments_preview":"{}"}}
//! data: {"tool_result":{"id":"call_1","name":"get_current_time","result_summary":"...","result_full":"..."}}
//! data: {"content":"It's 10am"}
//! ```

use serde::{Deserialize, Serialize};

use crate::message::{ARGUMENTS_PREVIEW_CHARS, RESULT_FULL_CHARS, RESULT_SUMMARY_CHARS, truncate_text};
use crate::tool::ToolCall;

/// One step of progress emitted by the round driver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEvent {
    /// Content delta of the answer
    Content(String),

    ToolCall {
        id: String,
        name: String,
        arguments: String,
        arguments_preview: String,
    },

    ToolResult {
        id: String,
        name: String,
        result_summary: String,
        result_full: String,
    },

    /// Sent once, first, when the turn created a new conversation
    ConversationId(String),

    /// Terminal failure; always the last event
    Error(String),
}

impl StreamEvent {
    pub fn tool_call(call: &ToolCall) -> Self {
        Self::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            arguments_preview: truncate_text(&call.arguments, ARGUMENTS_PREVIEW_CHARS),
        }
    }

    pub fn tool_result(call: &ToolCall, result: &str) -> Self {
        Self::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            result_summary: truncate_text(result, RESULT_SUMMARY_CHARS),
            result_full: truncate_text(result, RESULT_FULL_CHARS),
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Server-sent-events framing: `data: <JSON>` followed by a blank line
    pub fn to_sse(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"error": format!("failed to encode event: {e}")}).to_string()
        });
        format!("data: {json}\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(StreamEvent::Content("hi".into()).to_sse(), "data: {\"content\":\"hi\"}\n\n");
        assert_eq!(
            StreamEvent::ConversationId("abc".into()).to_sse(),
            "data: {\"conversation_id\":\"abc\"}\n\n"
        );
        assert_eq!(StreamEvent::Error("boom".into()).to_sse(), "data: {\"error\":\"boom\"}\n\n");
    }

    #[test]
    fn test_tool_events_share_the_call_id() {
        let call = ToolCall::new("call_7", "run_shell", r#"{"command":"ls"}"#);
        let started: serde_json::Value = serde_json::to_value(StreamEvent::tool_call(&call)).unwrap();
        let finished: serde_json::Value =
            serde_json::to_value(StreamEvent::tool_result(&call, r#"{"success":true}"#)).unwrap();

        assert_eq!(started["tool_call"]["id"], "call_7");
        assert_eq!(started["tool_call"]["arguments_preview"], r#"{"command":"ls"}"#);
        assert_eq!(finished["tool_result"]["id"], "call_7");
        assert_eq!(finished["tool_result"]["result_full"], r#"{"success":true}"#);
    }

    #[test]
    fn test_long_results_are_truncated() {
        let call = ToolCall::new("c", "read_file", "{}");
        let StreamEvent::ToolResult { result_summary, result_full, .. } =
            StreamEvent::tool_result(&call, &"x".repeat(RESULT_FULL_CHARS * 2))
        else {
            unreachable!()
        };
        assert_eq!(result_summary.chars().count(), RESULT_SUMMARY_CHARS);
        assert_eq!(result_full.chars().count(), RESULT_FULL_CHARS);
    }
}

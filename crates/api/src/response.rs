//! Response types shared by streaming deltas and final responses.

use crate::error::Error;
use serde::Serialize;

/// Object kinds carried in `ChatResponse.object`.
pub const OBJECT_CHAT: &str = "chat";
pub const OBJECT_VISION: &str = "vision";
pub const OBJECT_EMBED: &str = "embed";

/// Every delta and final response speaks as the assistant.
pub const ROLE_ASSISTANT: &str = "assistant";

/// The terminal response carries exactly one of these; deltas carry "".
pub const FINISH_REASON_STOP: &str = "stop";
pub const FINISH_REASON_ERROR: &str = "error";

/// Status codes attached to parsed tool calls.
pub mod tool_status {
    pub const OK: u8 = 0;
    pub const MISSING: u8 = 1;
    pub const MALFORMED: u8 = 2;
    pub const UNKNOWN_TOOL: u8 = 3;
}

/// A structured tool call parsed out of the model's output. `raw` holds the
/// literal JSON the model emitted; `arguments` the parsed form.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
    pub raw: String,
    pub status: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The delta half of a choice. Tool calls appear only on the final response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: String,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: usize,
    pub delta: ResponseMessage,
    pub finish_reason: &'static str,
}

/// Token accounting for a request. `output_tokens` is always
/// `reasoning_tokens + completion_tokens`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub reasoning_tokens: usize,
    pub completion_tokens: usize,
    pub output_tokens: usize,
    pub tokens_per_second: f64,
}

/// One element of the response stream. The same shape serves incremental
/// deltas and the final aggregated response.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl ChatResponse {
    /// Build an incremental delta. Reasoning content and completion content
    /// are mutually exclusive per delta.
    pub fn delta(
        id: &str,
        object: &'static str,
        model: &str,
        index: usize,
        content: &str,
        reasoning: bool,
        usage: Usage,
    ) -> Self {
        let (content, reason) = if reasoning {
            (String::new(), content.to_string())
        } else {
            (content.to_string(), String::new())
        };

        Self {
            id: id.to_string(),
            object,
            created: chrono::Utc::now().timestamp_millis(),
            model: model.to_string(),
            choices: vec![Choice {
                index,
                delta: ResponseMessage {
                    role: ROLE_ASSISTANT,
                    content,
                    reasoning: reason,
                    tool_calls: Vec::new(),
                },
                finish_reason: "",
            }],
            usage,
        }
    }

    /// Build the terminal response carrying the full aggregated content.
    pub fn complete(
        id: &str,
        object: &'static str,
        model: &str,
        index: usize,
        content: String,
        reasoning: String,
        tool_calls: Vec<ToolCall>,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.to_string(),
            object,
            created: chrono::Utc::now().timestamp_millis(),
            model: model.to_string(),
            choices: vec![Choice {
                index,
                delta: ResponseMessage {
                    role: ROLE_ASSISTANT,
                    content,
                    reasoning,
                    tool_calls,
                },
                finish_reason: FINISH_REASON_STOP,
            }],
            usage,
        }
    }

    /// Build a terminal error response. The error text travels in the
    /// delta content so single-response error streams stay self-describing.
    pub fn error(
        id: &str,
        object: &'static str,
        model: &str,
        index: usize,
        err: &Error,
        usage: Usage,
    ) -> Self {
        Self {
            id: id.to_string(),
            object,
            created: chrono::Utc::now().timestamp_millis(),
            model: model.to_string(),
            choices: vec![Choice {
                index,
                delta: ResponseMessage {
                    role: ROLE_ASSISTANT,
                    content: err.to_string(),
                    reasoning: String::new(),
                    tool_calls: Vec::new(),
                },
                finish_reason: FINISH_REASON_ERROR,
            }],
            usage,
        }
    }

    /// The finish reason of the single choice, "" for deltas.
    pub fn finish_reason(&self) -> &'static str {
        self.choices.first().map(|c| c.finish_reason).unwrap_or("")
    }

    /// Whether this is the terminal response of a stream.
    pub fn is_terminal(&self) -> bool {
        !self.finish_reason().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_splits_reasoning_from_content() {
        let usage = Usage::default();

        let d = ChatResponse::delta("id", OBJECT_CHAT, "m", 1, "hello", false, usage);
        assert_eq!(d.choices[0].delta.content, "hello");
        assert_eq!(d.choices[0].delta.reasoning, "");
        assert_eq!(d.choices[0].delta.role, ROLE_ASSISTANT);
        assert_eq!(d.finish_reason(), "");

        let r = ChatResponse::delta("id", OBJECT_CHAT, "m", 2, "hmm", true, usage);
        assert_eq!(r.choices[0].delta.content, "");
        assert_eq!(r.choices[0].delta.reasoning, "hmm");
    }

    #[test]
    fn terminal_responses_carry_a_finish_reason() {
        let done = ChatResponse::complete(
            "id",
            OBJECT_CHAT,
            "m",
            3,
            "out".to_string(),
            String::new(),
            Vec::new(),
            Usage::default(),
        );
        assert!(done.is_terminal());
        assert_eq!(done.finish_reason(), FINISH_REASON_STOP);

        let failed = ChatResponse::error(
            "id",
            OBJECT_CHAT,
            "m",
            1,
            &Error::Internal("boom".to_string()),
            Usage::default(),
        );
        assert_eq!(failed.finish_reason(), FINISH_REASON_ERROR);
        assert!(failed.choices[0].delta.content.contains("boom"));
    }

    #[test]
    fn tool_calls_serialize_only_on_the_final_response() {
        let d = ChatResponse::delta("id", OBJECT_CHAT, "m", 1, "x", false, Usage::default());
        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("tool_calls"));
    }
}

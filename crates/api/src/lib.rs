//! kronk_api - Shared data model for the kronk inference server
//!
//! This crate defines the request/response types exchanged between the
//! engine, the daemon and the CLI, plus the domain error kinds and the
//! cancellation token threaded through every long-running call.

mod cancel;
mod chat;
mod error;
mod response;

pub use cancel::CancelToken;
pub use chat::{
    ChatMessage, ChatRequest, EmbedRequest, SamplingParams, ToolDef, ToolFunction, ToolParameter,
    VisionRequest,
};
pub use error::{Error, Result};
pub use response::{
    tool_status, ChatResponse, Choice, ResponseMessage, ToolCall, Usage, FINISH_REASON_ERROR,
    FINISH_REASON_STOP, OBJECT_CHAT, OBJECT_EMBED, OBJECT_VISION, ROLE_ASSISTANT,
};

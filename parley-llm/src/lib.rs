//! Completion client for OpenAI-compatible chat endpoints.
//!
//! Non-streaming: one request, one assistant reply. The endpoint base and the
//! credential come from an explicit [`CompletionConfig`]; nothing here reads
//! process environment.

mod client;
mod error;
mod openai;
mod types;

pub use client::{
    ChatCompletion, CompletionClient, CompletionConfig, DEFAULT_BASE_URL, DEFAULT_MODEL,
    validate_tool_name,
};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Completion, Role, ToolCall, ToolDefinition, Usage};

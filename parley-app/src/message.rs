//! Conversation message model.

use chrono::{DateTime, Utc};
use parley_llm::ChatMessage;
pub use parley_llm::Role;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    /// Set on `tool` messages; names the invocation whose result this is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            tool_invocations: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, result: &serde_json::Value) -> Self {
        let mut msg = Self::new(Role::Tool, result.to_string());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_invocations(mut self, invocations: Vec<ToolInvocation>) -> Self {
        self.tool_invocations = invocations;
        self
    }

    /// Provider view of this message: role and content only.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }

    pub fn has_pending_invocations(&self) -> bool {
        self.tool_invocations.iter().any(ToolInvocation::is_pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Local identity. Provider tool call ids may repeat across turns.
    #[serde(default = "new_message_id")]
    pub id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    #[serde(flatten)]
    pub state: InvocationState,
}

impl ToolInvocation {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        state: InvocationState,
    ) -> Self {
        Self {
            id: new_message_id(),
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            state,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, InvocationState::PendingConfirmation)
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.state {
            InvocationState::Executed { result } | InvocationState::Rejected { result } => {
                Some(result)
            }
            InvocationState::PendingConfirmation | InvocationState::Approved => None,
        }
    }
}

/// Lifecycle of one tool invocation. Terminal states carry their result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InvocationState {
    PendingConfirmation,
    Approved,
    Rejected { result: serde_json::Value },
    Executed { result: serde_json::Value },
}

/// Flatten history into provider messages, system prompt first.
pub fn to_prompt(system_prompt: &str, history: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len() + 1);
    out.push(ChatMessage::system(system_prompt));
    out.extend(history.iter().map(Message::to_chat_message));
    out
}

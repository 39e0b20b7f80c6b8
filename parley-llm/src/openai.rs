//! Wire format for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Prompt messages go out as plain `{role, content}` pairs. Assistant turns
//! carry no `tool_calls` and `tool` messages carry no `tool_call_id`, so a
//! strict backend that cross-checks tool results against earlier calls may
//! reject a history containing tool messages with a 400. OpenRouter accepts it.

use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Completion, ToolCall, ToolDefinition, Usage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
}

impl OpenAiChatRequest {
    pub(crate) fn new(model: &str, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        let mut out = Self {
            model: model.to_string(),
            messages: messages.iter().map(to_openai_message).collect(),
            tools: tools.iter().map(to_openai_tool).collect(),
            tool_choice: None,
        };
        if !out.tools.is_empty() {
            out.tool_choice = Some("auto".to_string());
        }
        out
    }
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

fn to_openai_message(m: &ChatMessage) -> OpenAiMessage {
    OpenAiMessage {
        role: m.role.as_str(),
        content: m.content.clone(),
    }
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: &'static str,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_openai_tool(t: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        r#type: "function",
        function: OpenAiToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiChoiceToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceToolCall {
    id: String,
    #[serde(default)]
    function: OpenAiChoiceToolCallFunction,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiChoiceToolCallFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl TryFrom<OpenAiChatResponse> for Completion {
    type Error = LlmError;

    fn try_from(v: OpenAiChatResponse) -> Result<Self> {
        let choice = v.choices.into_iter().next().ok_or_else(|| {
            LlmError::MalformedResponse("response missing choices[0]".to_string())
        })?;
        let message = choice.message.ok_or_else(|| {
            LlmError::MalformedResponse("response missing choices[0].message".to_string())
        })?;

        let tool_calls: Vec<ToolCall> = message
            .tool_calls
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        // A null content is only usable when the model asked for tools instead.
        let content = match message.content {
            Some(content) => content,
            None if !tool_calls.is_empty() => String::new(),
            None => {
                return Err(LlmError::MalformedResponse(
                    "response missing choices[0].message.content".to_string(),
                ));
            }
        };

        let usage = v
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(Completion {
            content,
            tool_calls,
            usage,
            finish_reason: choice
                .finish_reason
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    fn parse(body: serde_json::Value) -> Result<Completion> {
        let parsed: OpenAiChatResponse = serde_json::from_value(body)?;
        parsed.try_into()
    }

    #[test]
    fn request_carries_only_role_and_content() {
        let req = OpenAiChatRequest::new(
            "qwen/qwen3-235b-a22b:free",
            &[ChatMessage::system("sys"), ChatMessage::new(Role::Tool, "{}")],
            &[],
        );
        let v = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(
            v,
            json!({
                "model": "qwen/qwen3-235b-a22b:free",
                "messages": [
                    { "role": "system", "content": "sys" },
                    { "role": "tool", "content": "{}" }
                ]
            })
        );
    }

    #[test]
    fn request_includes_tools_with_auto_choice() {
        let tools = vec![ToolDefinition {
            name: "current_time".to_string(),
            description: "now".to_string(),
            parameters: json!({ "type": "object" }),
        }];
        let req = OpenAiChatRequest::new("m", &[ChatMessage::user("hi")], &tools);
        let v = serde_json::to_value(&req).expect("serialize request");
        assert_eq!(v["tool_choice"], "auto");
        assert_eq!(v["tools"][0]["type"], "function");
        assert_eq!(v["tools"][0]["function"]["name"], "current_time");
    }

    #[test]
    fn parses_content_and_usage() {
        let c = parse(json!({
            "choices": [{ "message": { "role": "assistant", "content": "4" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 1 }
        }))
        .expect("valid response");
        assert_eq!(c.content, "4");
        assert_eq!(c.finish_reason, "stop");
        assert_eq!(c.usage.prompt_tokens, 12);
        assert!(c.tool_calls.is_empty());
    }

    #[test]
    fn null_content_with_tool_calls_is_usable() {
        let c = parse(json!({
            "choices": [{ "message": {
                "content": null,
                "tool_calls": [{ "id": "call_1", "type": "function",
                    "function": { "name": "current_time", "arguments": "{}" } }]
            } }]
        }))
        .expect("tool call response");
        assert_eq!(c.content, "");
        assert_eq!(c.tool_calls[0].name, "current_time");
    }

    #[test]
    fn missing_choices_is_malformed() {
        let err = parse(json!({ "choices": [] })).expect_err("empty choices");
        assert!(err.is_malformed());
    }

    #[test]
    fn missing_content_is_malformed() {
        let err = parse(json!({ "choices": [{ "message": { "role": "assistant" } }] }))
            .expect_err("no content");
        assert!(err.is_malformed());
    }
}

use crate::error::{LlmError, Result};
use crate::openai::{OpenAiChatRequest, OpenAiChatResponse};
use crate::types::{ChatMessage, Completion, ToolDefinition};
use async_trait::async_trait;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "qwen/qwen3-235b-a22b:free";

const MAX_TOOL_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl CompletionConfig {
    pub fn has_credential(&self) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
    }
}

/// Seam between the turn pipeline and the remote provider.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Model identifier sent with every request.
    fn model(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<Completion>;
}

#[derive(Clone)]
pub struct CompletionClient {
    config: CompletionConfig,
    http: reqwest::Client,
}

impl CompletionClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(config: CompletionConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self { config, http }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatCompletion for CompletionClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(model = %model, message_count = messages.len(), tool_count = tools.len())
    )]
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        model: &str,
    ) -> Result<Completion> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "completion requires at least one message".to_string(),
            ));
        }
        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.trim().is_empty())
        else {
            return Err(LlmError::MissingCredential);
        };

        let req = OpenAiChatRequest::new(model, messages, tools);
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), body_len = body.len(), "provider rejected request");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OpenAiChatResponse = serde_json::from_str(&body)?;
        let completion: Completion = parsed.try_into()?;
        tracing::debug!(
            content_len = completion.content.len(),
            tool_calls = completion.tool_calls.len(),
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            "provider reply parsed"
        );
        Ok(completion)
    }
}

/// Tool names must match `^[a-zA-Z0-9_-]{1,64}$` for OpenAI-compatible providers.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LlmError::InvalidInput("tool name must not be empty".to_string()));
    }
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} exceeds {MAX_TOOL_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(LlmError::InvalidInput(format!(
            "tool name {name:?} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

use crate::error::{Result, ToolError};
use crate::traits::{Tool, ToolSpec, require_string};
use async_trait::async_trait;
use std::time::Duration;

const MAX_RESPONSE_CHARS: usize = 4000;

/// POST a JSON payload to an allow-listed URL. Side-effecting, so it always
/// waits for confirmation.
#[derive(Clone)]
pub struct HttpPostTool {
    http: reqwest::Client,
    allowed_prefixes: Vec<String>,
}

impl HttpPostTool {
    pub fn new(allowed_prefixes: Vec<String>, timeout: Duration) -> Result<Self> {
        let allowed_prefixes: Vec<String> = allowed_prefixes
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if allowed_prefixes.is_empty() {
            return Err(ToolError::InvalidArguments(
                "http_post requires at least one allowed url prefix".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(Self {
            http,
            allowed_prefixes,
        })
    }

    fn is_allowed(&self, url: &str) -> bool {
        self.allowed_prefixes.iter().any(|p| url.starts_with(p))
    }
}

#[async_trait]
impl Tool for HttpPostTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "http_post".to_string(),
            description: "Send a JSON payload to an allow-listed webhook URL.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "url": { "type": "string" },
                    "payload": { "type": "object" }
                },
                "required": ["url", "payload"]
            }),
            requires_confirmation: true,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let url = require_string(&arguments, "url")?;
        if !self.is_allowed(&url) {
            return Err(ToolError::Unauthorized(format!(
                "url is not in the allow list: {url}"
            )));
        }
        let payload = arguments
            .get("payload")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| ToolError::InvalidArguments("payload must be an object".to_string()))?;

        let response = self.http.post(&url).json(&payload).send().await?;
        let status = response.status();
        let body = response.text().await?;
        let truncated: String = body.chars().take(MAX_RESPONSE_CHARS).collect();
        tracing::info!(status = status.as_u16(), body_len = body.len(), "http_post completed");
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed(format!(
                "http_post status={status} body={truncated}"
            )));
        }
        Ok(serde_json::json!({ "status": status.as_u16(), "body": truncated }))
    }
}

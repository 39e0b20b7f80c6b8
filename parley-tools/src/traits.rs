use crate::error::{Result, ToolError};
use async_trait::async_trait;

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    /// Hold invocations for an explicit user decision before executing.
    pub requires_confirmation: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value>;
}

pub fn to_llm_tool_def(tool: &dyn Tool) -> parley_llm::ToolDefinition {
    let spec = tool.spec();
    parley_llm::ToolDefinition {
        name: spec.name,
        description: spec.description,
        parameters: spec.parameters_schema,
    }
}

pub fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn require_string_rejects_missing_and_non_string() {
        let args = json!({ "a": "x", "b": 3 });
        assert_eq!(require_string(&args, "a").expect("string key"), "x");
        assert!(require_string(&args, "b").is_err());
        assert!(require_string(&args, "c").is_err());
    }

    #[test]
    fn optional_string_treats_null_as_absent() {
        let args = json!({ "a": null });
        assert_eq!(optional_string(&args, "a").expect("null ok"), None);
        assert_eq!(optional_string(&args, "z").expect("missing ok"), None);
    }
}

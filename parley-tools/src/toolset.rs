use crate::traits::{Tool, to_llm_tool_def};
use parley_llm::{ToolDefinition, validate_tool_name};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// A named provider of tools. Sources are merged into a [`ToolSet`] per turn.
pub trait ToolSource: Send + Sync {
    fn source_name(&self) -> &str;
    fn tools_for(&self, conversation_id: &str) -> Vec<Arc<dyn Tool>>;
}

/// Tools that do not depend on the conversation.
pub struct StaticToolSource {
    name: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticToolSource {
    pub fn new(name: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: name.into(),
            tools,
        }
    }
}

impl ToolSource for StaticToolSource {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn tools_for(&self, _conversation_id: &str) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

/// Immutable name -> tool mapping assembled once per turn.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Arc<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolSet {
    /// Merge named sources in order. On a duplicate name the later source wins.
    pub fn merge<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<Arc<dyn Tool>>)>,
        S: AsRef<str>,
    {
        let mut tools: BTreeMap<String, Arc<dyn Tool>> = BTreeMap::new();
        let mut origin: BTreeMap<String, String> = BTreeMap::new();
        for (source, source_tools) in sources {
            let source = source.as_ref();
            for tool in source_tools {
                let name = tool.spec().name;
                if let Err(e) = validate_tool_name(&name) {
                    tracing::error!(tool_name = %name, source, error = %e, "skipping tool with invalid name");
                    continue;
                }
                if let Some(previous) = origin.insert(name.clone(), source.to_string()) {
                    tracing::warn!(
                        tool_name = %name,
                        previous_source = %previous,
                        source,
                        "duplicate tool name; later source wins"
                    );
                }
                tools.insert(name, tool);
            }
        }
        Self {
            tools: Arc::new(tools),
        }
    }

    pub fn from_sources(sources: &[Arc<dyn ToolSource>], conversation_id: &str) -> Self {
        Self::merge(
            sources
                .iter()
                .map(|s| (s.source_name().to_string(), s.tools_for(conversation_id))),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| to_llm_tool_def(t.as_ref())).collect()
    }

    /// Configured names plus every tool whose spec asks for confirmation.
    pub fn confirmation_required(&self, configured: &[String]) -> HashSet<String> {
        let mut out: HashSet<String> = configured
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for (name, tool) in self.tools.iter() {
            if tool.spec().requires_confirmation {
                out.insert(name.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::traits::ToolSpec;
    use async_trait::async_trait;
    use serde_json::json;

    struct Named {
        name: &'static str,
        tag: &'static str,
        confirm: bool,
    }

    #[async_trait]
    impl Tool for Named {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.to_string(),
                description: self.tag.to_string(),
                parameters_schema: json!({ "type": "object" }),
                requires_confirmation: self.confirm,
            }
        }

        async fn execute(&self, _arguments: serde_json::Value) -> Result<serde_json::Value> {
            Ok(json!({ "tag": self.tag }))
        }
    }

    fn tool(name: &'static str, tag: &'static str, confirm: bool) -> Arc<dyn Tool> {
        Arc::new(Named { name, tag, confirm })
    }

    #[tokio::test]
    async fn later_source_wins_on_duplicate_name() {
        let set = ToolSet::merge([
            ("builtin", vec![tool("lookup", "builtin", false)]),
            ("remote", vec![tool("lookup", "remote", false)]),
        ]);
        assert_eq!(set.len(), 1);
        let out = set
            .get("lookup")
            .expect("merged tool")
            .execute(json!({}))
            .await
            .expect("execute");
        assert_eq!(out["tag"], "remote");
    }

    #[test]
    fn from_sources_respects_source_order() {
        let sources: Vec<Arc<dyn ToolSource>> = vec![
            Arc::new(StaticToolSource::new("a", vec![tool("lookup", "a", false)])),
            Arc::new(StaticToolSource::new("b", vec![tool("lookup", "b", true)])),
        ];
        let set = ToolSet::from_sources(&sources, "conv-1");
        let required = set.confirmation_required(&[]);
        assert!(required.contains("lookup"));
    }

    #[test]
    fn invalid_names_are_skipped() {
        let set = ToolSet::merge([("builtin", vec![tool("bad.name", "x", false)])]);
        assert!(set.is_empty());
    }

    #[test]
    fn confirmation_set_unions_config_and_specs() {
        let set = ToolSet::merge([(
            "builtin",
            vec![tool("send_email", "x", true), tool("current_time", "y", false)],
        )]);
        let required = set.confirmation_required(&["deploy".to_string(), " ".to_string()]);
        assert!(required.contains("send_email"));
        assert!(required.contains("deploy"));
        assert!(!required.contains("current_time"));
        assert_eq!(required.len(), 2);
    }
}

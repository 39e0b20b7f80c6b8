//! Parley configuration loader.
//!
//! Values come from the TOML file, then `.env`/process environment overrides.
//! Nothing reads the environment after [`ParleyConfig::load`] returns.

use crate::prompt::DEFAULT_SYSTEM_PROMPT;
use parley_llm::{CompletionConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub general: GeneralConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub tools: ToolsConfig,
    pub context: ContextConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub system_prompt: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            http_timeout_seconds: 300,
            http_max_in_flight: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: default_data_dir().join("parley.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool names that always wait for user confirmation.
    pub confirmation_required: Vec<String>,
    /// URL prefixes `http_post` may call. Empty disables the tool.
    pub http_post_allowed_urls: Vec<String>,
    pub http_post_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tool_rounds: usize,
    pub mailbox_capacity: usize,
    /// Idle conversation actors stop after this long; the next message restarts them.
    pub actor_idle_seconds: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 4,
            mailbox_capacity: 32,
            actor_idle_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_millis: 1000,
        }
    }
}

impl ParleyConfig {
    /// Read the config file (defaults when it does not exist), apply
    /// environment overrides and validate.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("OPENROUTER_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("OPENROUTER_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("PARLEY_MODEL") {
            self.llm.model = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(anyhow::anyhow!("llm.model is required"));
        }
        let base = self.llm.base_url.trim();
        let host = base
            .strip_prefix("https://")
            .or_else(|| base.strip_prefix("http://"))
            .ok_or_else(|| anyhow::anyhow!("llm.base_url must start with http:// or https://"))?;
        if host.trim_matches('/').is_empty() {
            return Err(anyhow::anyhow!("llm.base_url is missing a host"));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.timeout_seconds must be > 0"));
        }
        if self.server.bind_addr.trim().is_empty() {
            return Err(anyhow::anyhow!("server.bind_addr is required"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.context.max_tool_rounds == 0 {
            return Err(anyhow::anyhow!("context.max_tool_rounds must be > 0"));
        }
        if self.context.mailbox_capacity == 0 {
            return Err(anyhow::anyhow!("context.mailbox_capacity must be > 0"));
        }
        if self.context.actor_idle_seconds == 0 {
            return Err(anyhow::anyhow!("context.actor_idle_seconds must be > 0"));
        }
        if self.scheduler.enabled && self.scheduler.tick_millis == 0 {
            return Err(anyhow::anyhow!("scheduler.tick_millis must be > 0"));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("store.path is required for the sqlite backend"));
        }
        Ok(())
    }

    pub fn completion_config(&self) -> CompletionConfig {
        CompletionConfig {
            base_url: self.llm.base_url.trim().to_string(),
            api_key: self.llm.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: self.llm.model.trim().to_string(),
            timeout: Duration::from_secs(self.llm.timeout_seconds),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.completion_config().has_credential()
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".parley").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".parley").join("data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_documented_defaults() {
        let cfg = ParleyConfig::from_toml("").expect("parse empty");
        assert_eq!(cfg.llm.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(cfg.llm.model, "qwen/qwen3-235b-a22b:free");
        assert_eq!(cfg.llm.timeout_seconds, 60);
        assert_eq!(cfg.context.max_tool_rounds, 4);
        assert_eq!(cfg.context.actor_idle_seconds, 900);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert!(!cfg.has_credential());
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = ParleyConfig::from_toml(
            r#"
[llm]
model = "openai/gpt-4o-mini"
api_key = "sk-file"

[store]
backend = "memory"

[tools]
confirmation_required = ["http_post", "deploy"]
"#,
        )
        .expect("parse");
        assert_eq!(cfg.llm.model, "openai/gpt-4o-mini");
        assert_eq!(cfg.llm.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.tools.confirmation_required.len(), 2);
        assert!(cfg.has_credential());
    }

    #[test]
    fn env_overrides_win_over_file_and_ignore_blanks() {
        let mut cfg = ParleyConfig::from_toml("[llm]\napi_key = \"sk-file\"").expect("parse");
        let env = HashMap::from([
            ("OPENROUTER_API_KEY", "sk-env"),
            ("OPENROUTER_BASE_URL", "  "),
            ("PARLEY_MODEL", "meta/llama"),
        ]);
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.llm.api_key.as_deref(), Some("sk-env"));
        assert_eq!(cfg.llm.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.completion_config().model, "meta/llama");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ParleyConfig::default();
        cfg.llm.base_url = "openrouter.ai".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = ParleyConfig::default();
        cfg.llm.model = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = ParleyConfig::default();
        cfg.server.http_max_in_flight = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ParleyConfig::default();
        cfg.context.max_tool_rounds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ParleyConfig::default();
        cfg.context.actor_idle_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = ParleyConfig::load(Some(dir.path().join("absent.toml")))
            .await
            .expect("defaults");
        assert_eq!(cfg.server.bind_addr, "127.0.0.1:8787");
    }

    #[tokio::test]
    async fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm\nmodel = ").expect("write");
        assert!(ParleyConfig::load(Some(path)).await.is_err());
    }
}

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings, read from `research.toml`. Provider credentials
/// live separately in the provider config store.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Overrides `~/.research-terminal/config.json`.
    #[serde(default)]
    pub provider_config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    /// Retry on the default provider after an auth or quota failure.
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allow_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolsConfig {
    /// Root for the file tools. Defaults to the working directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            timeout_secs: default_tool_timeout_secs(),
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

impl ToolsConfig {
    /// `None` when the timeout is disabled (0).
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// Defaults
fn default_true() -> bool {
    true
}
fn default_max_turns() -> u32 {
    10
}
fn default_system_prompt() -> String {
    "You are a research assistant working in a terminal. Investigate questions by \
     reading local files and fetching web sources, then answer concisely and cite \
     the files or URLs you relied on."
        .into()
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_batch_concurrency() -> usize {
    3
}
fn default_cache_capacity() -> usize {
    128
}
fn default_cache_ttl_secs() -> u64 {
    300
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_turns == 0 {
            return Err(Error::config("agent.max_turns must be at least 1"));
        }
        if self.tools.batch_concurrency == 0 {
            return Err(Error::config("tools.batch_concurrency must be at least 1"));
        }
        if self.cache.capacity == 0 {
            return Err(Error::config("cache.capacity must be at least 1"));
        }
        if let Some(ws) = &self.tools.workspace
            && !ws.is_dir()
        {
            return Err(Error::config(format!(
                "tools.workspace {} is not a directory",
                ws.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let toml = r#"
provider_config_path = "/tmp/providers.json"

[router]
allow_fallback = false

[agent]
max_turns = 4
system_prompt = "Be brief."

[tools]
timeout_secs = 0
batch_concurrency = 5

[cache]
capacity = 16
ttl_secs = 60
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.router.allow_fallback);
        assert_eq!(config.agent.max_turns, 4);
        assert_eq!(config.agent.system_prompt, "Be brief.");
        assert!(config.tools.timeout().is_none());
        assert_eq!(config.tools.batch_concurrency, 5);
        assert_eq!(config.cache.ttl(), Duration::from_secs(60));
        assert_eq!(
            config.provider_config_path.as_deref(),
            Some(Path::new("/tmp/providers.json"))
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.router.allow_fallback);
        assert_eq!(config.agent.max_turns, 10);
        assert_eq!(config.tools.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.tools.batch_concurrency, 3);
        assert_eq!(config.cache.capacity, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[agent]\nmax_turns = 2\n").unwrap();
        assert_eq!(config.agent.max_turns, 2);
        assert!(config.agent.system_prompt.contains("research assistant"));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.agent.max_turns = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tools.batch_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.agent.max_turns, 10);
    }
}

//! Per-provider credentials and defaults, merged from layered sources.
//!
//! Precedence, highest first: explicit call-time override, persisted JSON
//! file, environment variable, built-in default. The file is read lazily on
//! first access and written only by [`ProviderConfigStore::save`]; it is not
//! safe against concurrent external writers.

use crate::error::{Error, Result};
use crate::llm::{ProviderId, SamplingParams};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Immutable snapshot handed to an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider: ProviderId,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
    pub sampling: SamplingParams,
    pub extras: Map<String, Value>,
}

impl ProviderConfig {
    /// Built-in defaults only, no credential.
    pub fn builtin(provider: ProviderId) -> Self {
        Self {
            provider,
            api_key: None,
            base_url: provider.default_base_url().into(),
            model: provider.default_model().into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            sampling: SamplingParams::default(),
            extras: Map::new(),
        }
    }
}

/// Call-time values that beat every other source.
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// One provider's entry in the persisted file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "is_default_sampling")]
    pub sampling: SamplingParams,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

fn is_default_sampling(s: &SamplingParams) -> bool {
    *s == SamplingParams::default()
}

/// The persisted JSON document. Keys are kept as raw strings so entries for
/// providers this build does not know survive a load/save cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct ProviderConfigStore {
    path: Option<PathBuf>,
    persisted: OnceLock<PersistedConfig>,
    env: EnvLookup,
}

/// `~/.research-terminal/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".research-terminal").join("config.json"))
}

impl ProviderConfigStore {
    /// Store backed by a file. Nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            persisted: OnceLock::new(),
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Store with no backing file; `save` is a config error.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            persisted: OnceLock::new(),
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the environment lookup. Tests use this instead of touching
    /// the process environment.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read_file(&self) -> Result<PersistedConfig> {
        let Some(path) = &self.path else {
            return Ok(PersistedConfig::default());
        };
        match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(PersistedConfig::default()),
            Ok(content) => {
                debug!(path = %path.display(), "loaded provider configuration");
                serde_json::from_str(&content).map_err(|e| {
                    Error::config(format!("Failed to parse {}: {e}", path.display()))
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no provider configuration file, using empty");
                Ok(PersistedConfig::default())
            }
            Err(e) => Err(Error::config(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn doc(&self) -> Result<&PersistedConfig> {
        if let Some(doc) = self.persisted.get() {
            return Ok(doc);
        }
        let doc = self.read_file()?;
        Ok(self.persisted.get_or_init(|| doc))
    }

    fn doc_mut(&mut self) -> Result<&mut PersistedConfig> {
        if self.persisted.get().is_none() {
            let doc = self.read_file()?;
            self.persisted = OnceLock::from(doc);
        }
        self.persisted
            .get_mut()
            .ok_or_else(|| Error::config("provider configuration not loaded"))
    }

    fn entry(&self, provider: ProviderId) -> Result<Option<&ProviderEntry>> {
        Ok(self.doc()?.providers.get(provider.as_str()))
    }

    /// The provider's key as seen through this store's environment lookup.
    pub fn env_api_key(&self, provider: ProviderId) -> Option<String> {
        (self.env)(provider.api_key_env()).filter(|v| !v.trim().is_empty())
    }

    /// Resolve a provider's configuration. Every field is merged
    /// independently, so a file entry that only sets a model still picks
    /// up its key from the environment.
    pub fn get_provider_config(
        &self,
        provider: ProviderId,
        overrides: &ProviderOverrides,
    ) -> Result<ProviderConfig> {
        let builtin = ProviderConfig::builtin(provider);
        let entry = self.entry(provider)?.cloned().unwrap_or_default();

        let api_key = overrides
            .api_key
            .clone()
            .or(entry.api_key.filter(|k| !k.is_empty()))
            .or_else(|| self.env_api_key(provider));

        Ok(ProviderConfig {
            provider,
            api_key,
            base_url: overrides
                .base_url
                .clone()
                .or(entry.base_url)
                .unwrap_or(builtin.base_url),
            model: overrides
                .model
                .clone()
                .or(entry.model)
                .unwrap_or(builtin.model),
            timeout_ms: overrides
                .timeout_ms
                .or(entry.timeout_ms)
                .unwrap_or(builtin.timeout_ms),
            sampling: entry.sampling,
            extras: entry.extras,
        })
    }

    /// Providers present in the file or with a credential in the
    /// environment, de-duplicated, in `ProviderId::ALL` order.
    pub fn list_configured_providers(&self) -> Result<Vec<ProviderId>> {
        let doc = self.doc()?;
        for key in doc.providers.keys() {
            if key.parse::<ProviderId>().is_err() {
                warn!(provider = %key, "ignoring unknown provider in configuration file");
            }
        }
        Ok(ProviderId::ALL
            .into_iter()
            .filter(|p| doc.providers.contains_key(p.as_str()) || self.env_api_key(*p).is_some())
            .collect())
    }

    /// Explicit default, else the first configured provider, else none.
    pub fn resolve_default_provider(&self) -> Result<Option<ProviderId>> {
        if let Some(raw) = &self.doc()?.default_provider {
            match raw.parse::<ProviderId>() {
                Ok(p) => return Ok(Some(p)),
                Err(_) => warn!(provider = %raw, "configured default provider is unknown"),
            }
        }
        Ok(self.list_configured_providers()?.into_iter().next())
    }

    /// Stored entry for a provider, if any.
    pub fn provider_entry(&self, provider: ProviderId) -> Result<Option<ProviderEntry>> {
        Ok(self.entry(provider)?.cloned())
    }

    pub fn set_provider_config(
        &mut self,
        provider: ProviderId,
        entry: ProviderEntry,
    ) -> Result<()> {
        self.doc_mut()?
            .providers
            .insert(provider.as_str().to_string(), entry);
        Ok(())
    }

    pub fn set_api_key(&mut self, provider: ProviderId, api_key: impl Into<String>) -> Result<()> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::validation(format!("API key for {provider} is empty")));
        }
        self.doc_mut()?
            .providers
            .entry(provider.as_str().to_string())
            .or_default()
            .api_key = Some(api_key);
        Ok(())
    }

    pub fn set_model(&mut self, provider: ProviderId, model: impl Into<String>) -> Result<()> {
        self.doc_mut()?
            .providers
            .entry(provider.as_str().to_string())
            .or_default()
            .model = Some(model.into());
        Ok(())
    }

    /// Drop a provider's whole entry. Returns whether one existed.
    pub fn remove_provider_config(&mut self, provider: ProviderId) -> Result<bool> {
        let doc = self.doc_mut()?;
        let removed = doc.providers.remove(provider.as_str()).is_some();
        if doc.default_provider.as_deref() == Some(provider.as_str()) {
            doc.default_provider = None;
        }
        Ok(removed)
    }

    /// Clear only the stored key, keeping other overrides.
    pub fn remove_api_key(&mut self, provider: ProviderId) -> Result<bool> {
        let doc = self.doc_mut()?;
        let Some(entry) = doc.providers.get_mut(provider.as_str()) else {
            return Ok(false);
        };
        let had_key = entry.api_key.take().is_some();
        if *entry == ProviderEntry::default() {
            doc.providers.remove(provider.as_str());
        }
        Ok(had_key)
    }

    pub fn set_default_provider(&mut self, provider: Option<ProviderId>) -> Result<()> {
        self.doc_mut()?.default_provider = provider.map(|p| p.as_str().to_string());
        Ok(())
    }

    /// Write the in-memory state to the backing file.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::config("provider configuration has no backing file"))?;
        let doc = self.doc()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| Error::parse(format!("serialize configuration: {e}")))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "saved provider configuration");
        Ok(())
    }
}

/// Mask a credential for display: `sk-a...wxyz`.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_file_is_empty_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderConfigStore::new(dir.path().join("nope.json")).with_env(env(&[]));
        assert!(store.list_configured_providers().unwrap().is_empty());
        assert_eq!(store.resolve_default_provider().unwrap(), None);
    }

    #[test]
    fn builtin_defaults_fill_gaps() {
        let store = ProviderConfigStore::in_memory().with_env(env(&[]));
        let cfg = store
            .get_provider_config(ProviderId::Anthropic, &ProviderOverrides::default())
            .unwrap();
        assert_eq!(cfg.model, "claude-sonnet-4-5");
        assert_eq!(cfg.base_url, "https://api.anthropic.com/v1");
        assert_eq!(cfg.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(cfg.api_key.is_none());
    }

    #[test]
    fn env_credentials_make_provider_configured() {
        let store = ProviderConfigStore::in_memory()
            .with_env(env(&[("DEEPSEEK_API_KEY", "ds"), ("GEMINI_API_KEY", "")]));
        assert_eq!(
            store.list_configured_providers().unwrap(),
            vec![ProviderId::DeepSeek]
        );
    }

    #[test]
    fn env_key_goes_through_the_injected_lookup() {
        let store = ProviderConfigStore::in_memory()
            .with_env(env(&[("OPENAI_API_KEY", "sk-env"), ("GEMINI_API_KEY", "  ")]));
        assert_eq!(store.env_api_key(ProviderId::OpenAi).as_deref(), Some("sk-env"));
        assert_eq!(store.env_api_key(ProviderId::Gemini), None);
        assert_eq!(store.env_api_key(ProviderId::Anthropic), None);
    }

    #[test]
    fn configured_providers_are_deduplicated() {
        let mut store = ProviderConfigStore::in_memory().with_env(env(&[("OPENAI_API_KEY", "k")]));
        store.set_api_key(ProviderId::OpenAi, "file").unwrap();
        store.set_api_key(ProviderId::Anthropic, "a").unwrap();
        assert_eq!(
            store.list_configured_providers().unwrap(),
            vec![ProviderId::OpenAi, ProviderId::Anthropic]
        );
    }

    #[test]
    fn explicit_default_wins_over_first_configured() {
        let mut store = ProviderConfigStore::in_memory().with_env(env(&[("OPENAI_API_KEY", "k")]));
        assert_eq!(
            store.resolve_default_provider().unwrap(),
            Some(ProviderId::OpenAi)
        );
        store.set_default_provider(Some(ProviderId::Ollama)).unwrap();
        assert_eq!(
            store.resolve_default_provider().unwrap(),
            Some(ProviderId::Ollama)
        );
    }

    #[test]
    fn unknown_file_keys_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"providers":{"mistral":{"apiKey":"m"},"openai":{"apiKey":"o","timeoutMs":5000}}}"#,
        )
        .unwrap();

        let mut store = ProviderConfigStore::new(&path).with_env(env(&[]));
        assert_eq!(
            store.list_configured_providers().unwrap(),
            vec![ProviderId::OpenAi]
        );
        let cfg = store
            .get_provider_config(ProviderId::OpenAi, &ProviderOverrides::default())
            .unwrap();
        assert_eq!(cfg.timeout_ms, 5000);

        store.set_model(ProviderId::OpenAi, "gpt-4o-mini").unwrap();
        store.save().unwrap();

        let saved: PersistedConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved.providers.contains_key("mistral"));
        assert_eq!(
            saved.providers["openai"].model.as_deref(),
            Some("gpt-4o-mini")
        );
    }

    #[test]
    fn mutations_are_not_persisted_until_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut store = ProviderConfigStore::new(&path).with_env(env(&[]));
        store.set_api_key(ProviderId::Gemini, "g-key").unwrap();
        assert!(!path.exists());
        store.save().unwrap();
        assert!(path.exists());

        let reloaded = ProviderConfigStore::new(&path).with_env(env(&[]));
        let cfg = reloaded
            .get_provider_config(ProviderId::Gemini, &ProviderOverrides::default())
            .unwrap();
        assert_eq!(cfg.api_key.as_deref(), Some("g-key"));
    }

    #[test]
    fn remove_api_key_keeps_other_overrides() {
        let mut store = ProviderConfigStore::in_memory().with_env(env(&[]));
        store.set_api_key(ProviderId::OpenAi, "k").unwrap();
        store.set_model(ProviderId::OpenAi, "gpt-4.1").unwrap();
        assert!(store.remove_api_key(ProviderId::OpenAi).unwrap());
        let entry = store.provider_entry(ProviderId::OpenAi).unwrap().unwrap();
        assert!(entry.api_key.is_none());
        assert_eq!(entry.model.as_deref(), Some("gpt-4.1"));
    }

    #[test]
    fn removing_default_provider_clears_default() {
        let mut store = ProviderConfigStore::in_memory().with_env(env(&[]));
        store.set_api_key(ProviderId::Anthropic, "a").unwrap();
        store
            .set_default_provider(Some(ProviderId::Anthropic))
            .unwrap();
        assert!(store.remove_provider_config(ProviderId::Anthropic).unwrap());
        assert_eq!(store.resolve_default_provider().unwrap(), None);
    }

    #[test]
    fn empty_api_key_rejected() {
        let mut store = ProviderConfigStore::in_memory().with_env(env(&[]));
        assert!(matches!(
            store.set_api_key(ProviderId::OpenAi, "  "),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn save_without_backing_file_fails() {
        let store = ProviderConfigStore::in_memory().with_env(env(&[]));
        assert!(matches!(store.save(), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = ProviderConfigStore::new(&path).with_env(env(&[]));
        assert!(matches!(
            store.list_configured_providers(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn masks_keys() {
        assert_eq!(mask_key("sk-abcdefghijwxyz"), "sk-a...wxyz");
        assert_eq!(mask_key("short"), "*****");
    }
}

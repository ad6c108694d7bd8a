//! Routes each call to the adapter for the active selection, with a single
//! fallback hop to the default adapter on credential or quota failures.

use super::selector::ActiveSelection;
use super::types::*;
use super::{ContentGenerator, ProviderId, build_adapter};
use crate::error::{Error, Result};
use crate::provider_config::{ProviderConfigStore, ProviderOverrides};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A routed result: which provider served it, and whether that was a fallback hop.
#[derive(Debug)]
pub struct Routed<T> {
    pub value: T,
    pub provider: ProviderId,
    pub fallback: bool,
}

impl<T> Routed<T> {
    fn primary(value: T, provider: ProviderId) -> Self {
        Self {
            value,
            provider,
            fallback: false,
        }
    }

    fn fallback(value: T, provider: ProviderId) -> Self {
        Self {
            value,
            provider,
            fallback: true,
        }
    }
}

pub struct ContentRouter {
    default: ProviderId,
    adapters: BTreeMap<ProviderId, Arc<dyn ContentGenerator>>,
    allow_fallback: bool,
    fallback_events: AtomicU64,
}

impl ContentRouter {
    /// Router whose default (and only) adapter is `default`.
    pub fn new(default: Arc<dyn ContentGenerator>) -> Self {
        let id = default.provider();
        let mut adapters = BTreeMap::new();
        adapters.insert(id, default);
        Self {
            default: id,
            adapters,
            allow_fallback: false,
            fallback_events: AtomicU64::new(0),
        }
    }

    /// Add (or replace) a named adapter. The default adapter cannot be replaced.
    pub fn with_adapter(mut self, adapter: Arc<dyn ContentGenerator>) -> Self {
        let id = adapter.provider();
        if id == self.default {
            warn!(provider = %id, "ignoring adapter that would replace the default");
            return self;
        }
        self.adapters.insert(id, adapter);
        self
    }

    pub fn with_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    /// One adapter per configured provider. Providers whose adapter cannot be
    /// built (usually a missing key) are skipped with a warning.
    pub fn from_store(store: &ProviderConfigStore, allow_fallback: bool) -> Result<Self> {
        let mut built: BTreeMap<ProviderId, Arc<dyn ContentGenerator>> = BTreeMap::new();
        for provider in store.list_configured_providers()? {
            let config = store.get_provider_config(provider, &ProviderOverrides::default())?;
            match build_adapter(config) {
                Ok(adapter) => {
                    debug!(%provider, "adapter ready");
                    built.insert(provider, adapter);
                }
                Err(e) => warn!(%provider, error = %e, "skipping provider"),
            }
        }

        let default = match store.resolve_default_provider()? {
            Some(p) if built.contains_key(&p) => p,
            Some(p) => {
                let first = built.keys().next().copied().ok_or_else(no_providers)?;
                warn!(configured = %p, using = %first, "default provider unavailable");
                first
            }
            None => built.keys().next().copied().ok_or_else(no_providers)?,
        };

        info!(default = %default, providers = built.len(), allow_fallback, "content router ready");
        Ok(Self {
            default,
            adapters: built,
            allow_fallback,
            fallback_events: AtomicU64::new(0),
        })
    }

    pub fn default_provider(&self) -> ProviderId {
        self.default
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        self.adapters.keys().copied().collect()
    }

    pub fn has_provider(&self, provider: ProviderId) -> bool {
        self.adapters.contains_key(&provider)
    }

    pub fn adapter(&self, provider: ProviderId) -> Option<&Arc<dyn ContentGenerator>> {
        self.adapters.get(&provider)
    }

    pub fn allows_fallback(&self) -> bool {
        self.allow_fallback
    }

    /// Number of calls served by a fallback hop since construction.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_events.load(Ordering::Relaxed)
    }

    fn resolve(
        &self,
        selection: Option<&ActiveSelection>,
    ) -> Result<(ProviderId, &Arc<dyn ContentGenerator>)> {
        let provider = selection.map_or(self.default, |s| s.provider);
        let adapter = self
            .adapters
            .get(&provider)
            .ok_or_else(|| Error::UnknownProvider(provider.to_string()))?;
        Ok((provider, adapter))
    }

    fn default_adapter(&self) -> Result<&Arc<dyn ContentGenerator>> {
        self.adapters
            .get(&self.default)
            .ok_or_else(|| Error::UnknownProvider(self.default.to_string()))
    }

    /// Decide whether a primary failure earns the single hop to the default.
    fn fallback_target(
        &self,
        primary: ProviderId,
        err: &Error,
    ) -> Option<&Arc<dyn ContentGenerator>> {
        if !self.allow_fallback || primary == self.default {
            return None;
        }
        if !err.provider_kind().is_some_and(|k| k.is_fallback_eligible()) {
            return None;
        }
        let adapter = self.default_adapter().ok()?;
        self.fallback_events.fetch_add(1, Ordering::Relaxed);
        warn!(
            from = %primary,
            to = %self.default,
            error = %err,
            "falling back to default provider"
        );
        Some(adapter)
    }

    fn apply_selection(
        request: &GenerateRequest,
        selection: Option<&ActiveSelection>,
    ) -> GenerateRequest {
        let mut request = request.clone();
        if request.model.is_none() {
            request.model = selection.map(|s| s.model.clone());
        }
        request
    }

    /// The fallback adapter has its own model namespace.
    fn for_fallback(request: &GenerateRequest) -> GenerateRequest {
        GenerateRequest {
            model: None,
            ..request.clone()
        }
    }

    pub async fn generate(
        &self,
        selection: Option<&ActiveSelection>,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Routed<GenerateResponse>> {
        let (provider, adapter) = self.resolve(selection)?;
        let request = Self::apply_selection(request, selection);
        debug!(%provider, model = ?request.model, "routing generate");

        let err = match adapter.generate(&request, cancel).await {
            Ok(resp) => return Ok(Routed::primary(resp, provider)),
            Err(e) => e,
        };
        let Some(fallback) = self.fallback_target(provider, &err) else {
            return Err(err);
        };
        match fallback.generate(&Self::for_fallback(&request), cancel).await {
            Ok(resp) => Ok(Routed::fallback(resp, self.default)),
            Err(fe) => Err(err.with_fallback_failure(&fe)),
        }
    }

    /// Open a stream. Fallback applies to opening only; errors mid-stream
    /// surface through the stream itself.
    pub async fn generate_stream(
        &self,
        selection: Option<&ActiveSelection>,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Routed<ChunkStream>> {
        let (provider, adapter) = self.resolve(selection)?;
        let request = Self::apply_selection(request, selection);
        debug!(%provider, model = ?request.model, "routing stream");

        let err = match adapter.generate_stream(&request, cancel).await {
            Ok(stream) => return Ok(Routed::primary(stream, provider)),
            Err(e) => e,
        };
        let Some(fallback) = self.fallback_target(provider, &err) else {
            return Err(err);
        };
        match fallback
            .generate_stream(&Self::for_fallback(&request), cancel)
            .await
        {
            Ok(stream) => Ok(Routed::fallback(stream, self.default)),
            Err(fe) => Err(err.with_fallback_failure(&fe)),
        }
    }

    pub async fn count_tokens(
        &self,
        selection: Option<&ActiveSelection>,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Routed<TokenCount>> {
        let (provider, adapter) = self.resolve(selection)?;
        let request = Self::apply_selection(request, selection);

        let err = match adapter.count_tokens(&request, cancel).await {
            Ok(count) => return Ok(Routed::primary(count, provider)),
            Err(e) => e,
        };
        let Some(fallback) = self.fallback_target(provider, &err) else {
            return Err(err);
        };
        match fallback
            .count_tokens(&Self::for_fallback(&request), cancel)
            .await
        {
            Ok(count) => Ok(Routed::fallback(count, self.default)),
            Err(fe) => Err(err.with_fallback_failure(&fe)),
        }
    }

    pub async fn embed(
        &self,
        selection: Option<&ActiveSelection>,
        request: &EmbedRequest,
        cancel: &CancellationToken,
    ) -> Result<Routed<Embedding>> {
        let (provider, adapter) = self.resolve(selection)?;

        let err = match adapter.embed(request, cancel).await {
            Ok(embedding) => return Ok(Routed::primary(embedding, provider)),
            Err(e) => e,
        };
        let Some(fallback) = self.fallback_target(provider, &err) else {
            return Err(err);
        };
        let request = EmbedRequest {
            model: None,
            ..request.clone()
        };
        match fallback.embed(&request, cancel).await {
            Ok(embedding) => Ok(Routed::fallback(embedding, self.default)),
            Err(fe) => Err(err.with_fallback_failure(&fe)),
        }
    }

    /// Enumerate one provider's models. Never falls back: the answer is
    /// only meaningful for the provider asked about.
    pub async fn list_models(
        &self,
        provider: ProviderId,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelInfo>> {
        let adapter = self
            .adapters
            .get(&provider)
            .ok_or_else(|| Error::UnknownProvider(provider.to_string()))?;
        adapter.list_models(cancel).await
    }
}

fn no_providers() -> Error {
    Error::config(
        "no providers configured. Export a key such as OPENAI_API_KEY or run `research key set <provider> <key>`",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider_config::ProviderConfigStore;

    #[test]
    fn from_store_without_providers_is_config_error() {
        let store = ProviderConfigStore::in_memory().with_env(|_| None);
        let err = ContentRouter::from_store(&store, true).err().unwrap();
        assert!(matches!(err, Error::Config(ref m) if m.contains("no providers")));
    }

    #[test]
    fn from_store_builds_configured_adapters() {
        let store = ProviderConfigStore::in_memory().with_env(|name| match name {
            "OPENAI_API_KEY" | "ANTHROPIC_API_KEY" => Some("k".into()),
            _ => None,
        });
        let router = ContentRouter::from_store(&store, false).unwrap();
        assert_eq!(router.default_provider(), ProviderId::OpenAi);
        assert_eq!(
            router.providers(),
            vec![ProviderId::OpenAi, ProviderId::Anthropic]
        );
        assert!(!router.allows_fallback());
    }

    #[test]
    fn providers_without_keys_are_skipped() {
        let mut store = ProviderConfigStore::in_memory().with_env(|name| {
            (name == "GEMINI_API_KEY").then(|| "g".to_string())
        });
        store.set_model(ProviderId::OpenAi, "gpt-4o-mini").unwrap();
        store.set_default_provider(Some(ProviderId::OpenAi)).unwrap();
        let router = ContentRouter::from_store(&store, true).unwrap();
        assert_eq!(router.default_provider(), ProviderId::Gemini);
        assert!(!router.has_provider(ProviderId::OpenAi));
    }
}

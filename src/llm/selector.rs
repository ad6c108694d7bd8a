use super::router::ContentRouter;
use super::{ModelInfo, ProviderId};
use crate::error::{Error, Result};
use crate::provider_config::{ProviderConfigStore, ProviderOverrides};
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The (provider, model) pair currently in effect for generation calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSelection {
    pub provider: ProviderId,
    pub model: String,
}

impl fmt::Display for ActiveSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Owns the session's single active selection. Switching is all-or-nothing:
/// a failed switch leaves the previous selection (or none) in place.
#[derive(Debug, Default)]
pub struct ModelSelector {
    active: Option<ActiveSelection>,
}

impl ModelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_model(&self) -> Option<&ActiveSelection> {
        self.active.as_ref()
    }

    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Validate `provider` against the router and `model` against that
    /// provider's enumerated models, then commit.
    pub async fn select_model(
        &mut self,
        router: &ContentRouter,
        provider: ProviderId,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<&ActiveSelection> {
        if !router.has_provider(provider) {
            return Err(Error::UnknownProvider(provider.to_string()));
        }

        let models = router.list_models(provider, cancel).await?;
        let wanted = model.trim();
        if !models.iter().any(|m| m.id == wanted) {
            return Err(Error::UnknownModel {
                provider: provider.to_string(),
                model: wanted.to_string(),
            });
        }

        let selection = ActiveSelection {
            provider,
            model: wanted.to_string(),
        };
        info!(selection = %selection, "model selected");
        Ok(self.active.insert(selection))
    }

    /// Select the store's default provider with its configured model.
    pub async fn select_default(
        &mut self,
        router: &ContentRouter,
        store: &ProviderConfigStore,
        cancel: &CancellationToken,
    ) -> Result<&ActiveSelection> {
        let provider = store
            .resolve_default_provider()?
            .filter(|p| router.has_provider(*p))
            .unwrap_or_else(|| router.default_provider());
        let config = store.get_provider_config(provider, &ProviderOverrides::default())?;
        self.select_model(router, provider, &config.model, cancel)
            .await
    }

    /// Models for one provider, or for every routed provider. In the
    /// all-providers case a failing provider is logged and skipped.
    pub async fn list_models(
        &self,
        router: &ContentRouter,
        provider: Option<ProviderId>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelInfo>> {
        if let Some(p) = provider {
            return router.list_models(p, cancel).await;
        }
        let mut all = Vec::new();
        for p in router.providers() {
            match router.list_models(p, cancel).await {
                Ok(models) => all.extend(models),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(provider = %p, error = %e, "could not list models"),
            }
        }
        Ok(all)
    }
}

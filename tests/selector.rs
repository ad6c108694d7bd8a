mod common;

use common::MockAdapter;
use research_agent::error::Error;
use research_agent::llm::{ContentRouter, ModelSelector, ProviderId};
use research_agent::provider_config::ProviderConfigStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn router() -> ContentRouter {
    let a = Arc::new(MockAdapter::new(ProviderId::OpenAi).with_models(&["gpt-4o", "gpt-4o-mini"]));
    let b = Arc::new(
        MockAdapter::new(ProviderId::Anthropic)
            .with_models(&["claude-sonnet-4-5", "claude-haiku-4-5"]),
    );
    ContentRouter::new(a).with_adapter(b)
}

#[tokio::test]
async fn selects_known_provider_and_model() {
    let router = router();
    let mut selector = ModelSelector::new();
    let cancel = CancellationToken::new();

    let sel = selector
        .select_model(&router, ProviderId::Anthropic, "claude-haiku-4-5", &cancel)
        .await
        .unwrap();
    assert_eq!(sel.to_string(), "anthropic/claude-haiku-4-5");
    assert_eq!(
        selector.current_model().map(|s| s.provider),
        Some(ProviderId::Anthropic)
    );
}

#[tokio::test]
async fn unconfigured_provider_leaves_selection_unchanged() {
    let router = router();
    let mut selector = ModelSelector::new();
    let cancel = CancellationToken::new();
    selector
        .select_model(&router, ProviderId::OpenAi, "gpt-4o", &cancel)
        .await
        .unwrap();

    let err = selector
        .select_model(&router, ProviderId::Gemini, "gemini-2.0-flash", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownProvider(_)));
    let current = selector.current_model().unwrap();
    assert_eq!(current.provider, ProviderId::OpenAi);
    assert_eq!(current.model, "gpt-4o");
}

#[tokio::test]
async fn unknown_model_leaves_selection_unchanged() {
    let router = router();
    let mut selector = ModelSelector::new();
    let cancel = CancellationToken::new();

    let err = selector
        .select_model(&router, ProviderId::OpenAi, "gpt-99", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownModel { ref model, .. } if model == "gpt-99"));
    assert!(selector.current_model().is_none());
}

#[tokio::test]
async fn clear_drops_selection() {
    let router = router();
    let mut selector = ModelSelector::new();
    selector
        .select_model(&router, ProviderId::OpenAi, "gpt-4o-mini", &CancellationToken::new())
        .await
        .unwrap();
    selector.clear();
    assert!(selector.current_model().is_none());
}

#[tokio::test]
async fn select_default_uses_store_default_and_model() {
    let router = router();
    let mut store = ProviderConfigStore::in_memory().with_env(|_| None);
    store.set_model(ProviderId::Anthropic, "claude-haiku-4-5").unwrap();
    store.set_default_provider(Some(ProviderId::Anthropic)).unwrap();

    let mut selector = ModelSelector::new();
    let sel = selector
        .select_default(&router, &store, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sel.provider, ProviderId::Anthropic);
    assert_eq!(sel.model, "claude-haiku-4-5");
}

#[tokio::test]
async fn list_models_across_providers() {
    let router = router();
    let selector = ModelSelector::new();
    let cancel = CancellationToken::new();

    let all = selector.list_models(&router, None, &cancel).await.unwrap();
    assert_eq!(all.len(), 4);

    let one = selector
        .list_models(&router, Some(ProviderId::Anthropic), &cancel)
        .await
        .unwrap();
    assert!(one.iter().all(|m| m.provider == ProviderId::Anthropic));

    let err = selector
        .list_models(&router, Some(ProviderId::Ollama), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownProvider(_)));
}

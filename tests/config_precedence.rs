use research_agent::llm::ProviderId;
use research_agent::provider_config::{ProviderConfigStore, ProviderOverrides};
use std::path::Path;

fn write_config(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

fn store_at(path: &Path) -> ProviderConfigStore {
    ProviderConfigStore::new(path).with_env(|name| {
        (name == "OPENROUTER_API_KEY").then(|| "env-key".to_string())
    })
}

#[test]
fn call_then_file_then_env_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    write_config(
        &path,
        r#"{"providers": {"openrouter": {"apiKey": "file-key", "model": "meta/llama"}}}"#,
    );

    let call = ProviderOverrides {
        api_key: Some("call-key".into()),
        ..Default::default()
    };
    let store = store_at(&path);
    let cfg = store.get_provider_config(ProviderId::OpenRouter, &call).unwrap();
    assert_eq!(cfg.api_key.as_deref(), Some("call-key"));

    // Without the call-time override the file wins.
    let cfg = store
        .get_provider_config(ProviderId::OpenRouter, &ProviderOverrides::default())
        .unwrap();
    assert_eq!(cfg.api_key.as_deref(), Some("file-key"));
    assert_eq!(cfg.model, "meta/llama");

    // Without the file key the environment shows through.
    let mut store = store_at(&path);
    assert!(store.remove_api_key(ProviderId::OpenRouter).unwrap());
    store.save().unwrap();
    let reloaded = store_at(&path);
    let cfg = reloaded
        .get_provider_config(ProviderId::OpenRouter, &ProviderOverrides::default())
        .unwrap();
    assert_eq!(cfg.api_key.as_deref(), Some("env-key"));
    // Fields merge independently: the file's model survives.
    assert_eq!(cfg.model, "meta/llama");
}

#[test]
fn builtin_defaults_are_the_last_layer() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProviderConfigStore::new(dir.path().join("absent.json")).with_env(|_| None);
    let cfg = store
        .get_provider_config(ProviderId::Anthropic, &ProviderOverrides::default())
        .unwrap();
    assert!(cfg.api_key.is_none());
    assert_eq!(cfg.model, ProviderId::Anthropic.default_model());
    assert_eq!(cfg.base_url, ProviderId::Anthropic.default_base_url());
}

#[test]
fn saved_mutations_persist_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.json");

    let mut store = ProviderConfigStore::new(&path).with_env(|_| None);
    store.set_api_key(ProviderId::Gemini, "g-key-123456").unwrap();
    store.set_default_provider(Some(ProviderId::Gemini)).unwrap();
    store.save().unwrap();

    let reopened = ProviderConfigStore::new(&path).with_env(|_| None);
    assert_eq!(
        reopened.list_configured_providers().unwrap(),
        vec![ProviderId::Gemini]
    );
    assert_eq!(
        reopened.resolve_default_provider().unwrap(),
        Some(ProviderId::Gemini)
    );
}

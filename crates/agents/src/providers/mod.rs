pub mod echo;
pub mod openai_compat;

use std::sync::Arc;

use {
    chatrelay_config::{ProviderConfig, ProviderKind},
    secrecy::{ExposeSecret, Secret},
    tracing::info,
};

use crate::model::LlmProvider;

/// Environment variable that overrides `provider.api_key`.
pub const API_KEY_ENV: &str = "CHATRELAY_API_KEY";

/// Build the configured provider.
///
/// The API key is read from `CHATRELAY_API_KEY` first, then from the config
/// file. An OpenAI-compatible provider without a key is a startup error.
pub fn build_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.kind {
        ProviderKind::Echo => Arc::new(echo::EchoProvider::new()),
        ProviderKind::Openai => {
            let api_key = resolve_api_key(config).ok_or_else(|| {
                anyhow::anyhow!(
                    "no API key for provider {:?}: set {API_KEY_ENV} or provider.api_key",
                    config.base_url
                )
            })?;
            let mut provider = openai_compat::OpenAiCompatProvider::new(
                config.model.clone(),
                config.base_url.clone(),
                api_key,
            );
            if let Some(t) = config.temperature {
                provider = provider.with_temperature(t);
            }
            Arc::new(provider)
        },
    };
    info!(provider = provider.name(), model = provider.id(), "llm provider ready");
    Ok(provider)
}

fn resolve_api_key(config: &ProviderConfig) -> Option<Secret<String>> {
    std::env::var(API_KEY_ENV)
        .ok()
        .filter(|k| !k.is_empty())
        .map(Secret::new)
        .or_else(|| {
            config
                .api_key
                .as_ref()
                .filter(|k| !k.expose_secret().is_empty())
                .cloned()
        })
}

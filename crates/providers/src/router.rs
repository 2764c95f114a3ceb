//! Provider selection: builds the configured LLM backend.

use kestrel_core::error::ProviderError;
use kestrel_core::provider::Provider;
use std::sync::Arc;
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;

/// Build the provider named by `config.provider`.
///
/// An explicit `api_url` always wins over the well-known endpoint. Every
/// backend except `ollama` needs an API key.
pub fn build_from_config(
    config: &kestrel_config::AppConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.provider.as_str();
    let base_url = match &config.api_url {
        Some(url) => url.clone(),
        None => default_base_url(name).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "unknown provider '{name}'; set api_url to use a custom endpoint"
            ))
        })?,
    };

    let api_key = match (&config.api_key, name) {
        (Some(key), _) => key.clone(),
        (None, "ollama") => "ollama".to_string(),
        (None, _) => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{name}'"
            )));
        }
    };

    debug!(provider = name, base_url = %base_url, "Building provider");
    Ok(Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)?))
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> Option<String> {
    let url = match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1",
        "openai" => "https://api.openai.com/v1",
        "ollama" => "http://localhost:11434/v1",
        "deepseek" => "https://api.deepseek.com/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "together" => "https://api.together.xyz/v1",
        "vllm" => "http://localhost:8000/v1",
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1",
        _ => return None,
    };
    Some(url.to_string())
}

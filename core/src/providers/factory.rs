use crate::config::Config;
use crate::providers::{MockProvider, OllamaProvider, OpenAiProvider};
use crate::traits::Provider;
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;

pub fn create_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let provider_name = config.provider.as_deref().unwrap_or("openai");
    let timeout = Duration::from_secs(config.limits.model_round_trip_timeout_secs);

    match provider_name.to_lowercase().as_str() {
        "openai" => {
            let api_key = resolve_api_key_with_fallback(
                &["OPENAI_API_KEY", "CORVID_OPENAI_API_KEY"],
                &config.api_key,
            )?;
            let mut provider = OpenAiProvider::new(api_key)
                .with_model(config.model.clone())
                .with_max_tokens(config.max_tokens)
                .with_temperature(config.temperature)
                .with_timeout(timeout);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Ok(Arc::new(provider))
        }
        "ollama" => {
            let mut provider = OllamaProvider::new()
                .with_model(config.model.clone())
                .with_temperature(config.temperature)
                .with_timeout(timeout);
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url.clone());
            }
            Ok(Arc::new(provider))
        }
        "mock" => Ok(Arc::new(MockProvider::text(
            "This is a canned reply from the mock provider.",
        ))),
        _ => Err(anyhow!(
            "Unknown provider: {}. Available: openai, ollama, mock",
            provider_name
        )),
    }
}

fn resolve_api_key_with_fallback(env_vars: &[&str], config_key: &str) -> Result<String> {
    for var_name in env_vars {
        if let Ok(key) = std::env::var(var_name)
            && !key.is_empty()
        {
            return Ok(key);
        }
    }
    if !config_key.is_empty() {
        Ok(config_key.to_string())
    } else {
        Err(anyhow!("No API key found"))
    }
}

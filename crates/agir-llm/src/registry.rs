use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use agir_core::config::{AppConfig, RetryConfig};
use agir_core::error::{AgirError, Result};
use agir_core::traits::{LlmProvider, ProviderFactory};

use crate::providers::presets::{self, chat_endpoint, get_preset};
use crate::providers::{AnthropicClient, DummyProvider, OpenAiClient};
use crate::retry::RetryingProvider;

/// Backend family serving a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    /// OpenAI-compatible preset such as "ollama" or "groq".
    Preset(String),
    Dummy,
}

impl ProviderKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Preset(name) => name,
            ProviderKind::Dummy => "dummy",
        }
    }

    /// Infer the provider from a model identifier.
    ///
    /// An explicit `kind:model` prefix wins; otherwise the model family decides.
    pub fn detect(model: &str) -> Result<(ProviderKind, String)> {
        if let Some((prefix, rest)) = model.split_once(':') {
            if let Ok(kind) = prefix.parse::<ProviderKind>() {
                return Ok((kind, rest.to_string()));
            }
        }

        let lower = model.to_ascii_lowercase();
        let kind = if lower.starts_with("gpt-")
            || lower.starts_with("chatgpt")
            || lower.starts_with("o1")
            || lower.starts_with("o3")
            || lower.starts_with("o4")
        {
            ProviderKind::OpenAi
        } else if lower.starts_with("claude") {
            ProviderKind::Anthropic
        } else if ["llama", "phi", "mixtral", "mistral", "qwen", "gemma"]
            .iter()
            .any(|family| lower.starts_with(family))
        {
            ProviderKind::Preset("ollama".to_string())
        } else {
            return Err(AgirError::UnsupportedProvider(format!(
                "cannot infer a provider for model '{}'",
                model
            )));
        };
        Ok((kind, model.to_string()))
    }
}

impl FromStr for ProviderKind {
    type Err = AgirError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "dummy" => Ok(ProviderKind::Dummy),
            other if get_preset(other).is_some() => Ok(ProviderKind::Preset(other.to_string())),
            other => Err(AgirError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model-keyed provider cache. One client is built per model id and reused for the run.
pub struct ProviderRegistry {
    config: AppConfig,
    forced: Option<ProviderKind>,
    cache: Mutex<HashMap<String, Arc<dyn LlmProvider>>>,
}

impl ProviderRegistry {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            config: config.clone(),
            forced: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Route every model to one provider kind (e.g. `dummy` for dry runs).
    pub fn with_forced(mut self, kind: Option<ProviderKind>) -> Self {
        self.forced = kind;
        self
    }

    /// Provider kind and bare model id for `model`.
    pub fn resolve_kind(&self, model: &str) -> Result<(ProviderKind, String)> {
        match &self.forced {
            Some(kind) => {
                let bare = match ProviderKind::detect(model) {
                    Ok((_, bare)) => bare,
                    Err(_) => model.to_string(),
                };
                Ok((kind.clone(), bare))
            }
            None => ProviderKind::detect(model),
        }
    }

    /// Number of distinct models with a built client.
    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn build(&self, kind: &ProviderKind, model: &str) -> Result<Arc<dyn LlmProvider>> {
        let provider: Arc<dyn LlmProvider> = match kind {
            ProviderKind::Dummy => return Ok(Arc::new(DummyProvider::new())),
            ProviderKind::OpenAi => {
                let cfg = self.config.provider("openai");
                if cfg.api_key.is_none() {
                    return Err(AgirError::Config(
                        "OpenAI API key not set (OPENAI_API_KEY or [providers.openai])".into(),
                    ));
                }
                let mut client = OpenAiClient::new(model).with_api_key(cfg.api_key);
                if let Some(base) = cfg.base_url {
                    client = client.with_endpoint(chat_endpoint(&base));
                }
                Arc::new(client)
            }
            ProviderKind::Anthropic => {
                let cfg = self.config.provider("anthropic");
                if cfg.api_key.is_none() {
                    return Err(AgirError::Config(
                        "Anthropic API key not set (ANTHROPIC_API_KEY or [providers.anthropic])"
                            .into(),
                    ));
                }
                let mut client = AnthropicClient::new(model).with_api_key(cfg.api_key);
                if let Some(base) = cfg.base_url {
                    client = client.with_endpoint(base);
                }
                Arc::new(client)
            }
            ProviderKind::Preset(name) => {
                let preset = get_preset(name)
                    .ok_or_else(|| AgirError::UnsupportedProvider(name.clone()))?;
                let cfg = self.config.provider(name);
                let api_key = cfg
                    .api_key
                    .or_else(|| preset.api_key_env.and_then(|v| std::env::var(v).ok()));
                if preset.needs_api_key && api_key.is_none() {
                    return Err(AgirError::Config(format!("{} API key not set", name)));
                }
                let endpoint = cfg
                    .base_url
                    .map(|b| chat_endpoint(&b))
                    .unwrap_or_else(|| preset.default_base_url.to_string());
                Arc::new(
                    OpenAiClient::new(model)
                        .with_name(name.clone())
                        .with_endpoint(endpoint)
                        .with_api_key(api_key)
                        .with_headers(presets::preset_headers(&preset)),
                )
            }
        };

        Ok(wrap_retry(provider, &self.config.retry))
    }
}

fn wrap_retry(provider: Arc<dyn LlmProvider>, retry: &RetryConfig) -> Arc<dyn LlmProvider> {
    if retry.max_retries == 0 && retry.timeout_secs.is_none() {
        provider
    } else {
        Arc::new(RetryingProvider::new(provider, retry.clone()))
    }
}

impl ProviderFactory for ProviderRegistry {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn LlmProvider>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|e| AgirError::Config(format!("provider cache poisoned: {}", e)))?;

        if let Some(provider) = cache.get(model) {
            debug!(model, "Reusing cached provider");
            return Ok(provider.clone());
        }

        let (kind, bare) = self.resolve_kind(model)?;
        let provider = self.build(&kind, &bare)?;
        info!(model, provider = %kind, "Initialized LLM provider");
        cache.insert(model.to_string(), provider.clone());
        Ok(provider)
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgirError, Result};
use crate::types::{GenerationParams, User};

/// Top-level AGIR configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Provider credentials keyed by provider kind ("openai", "anthropic", "ollama", ...).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Users seeded into the directory before a run.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Maximum number of node executions per run before aborting.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Generate a learner reflection when the process declares `evolution`.
    #[serde(default = "default_reflect")]
    pub reflect: bool,
    #[serde(default = "default_reflection_max_tokens")]
    pub reflection_max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_steps: default_max_steps(),
            reflect: default_reflect(),
            reflection_max_tokens: default_reflection_max_tokens(),
        }
    }
}

impl EngineConfig {
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 1000 }
fn default_max_steps() -> usize { 100 }
fn default_reflect() -> bool { true }
fn default_reflection_max_tokens() -> u32 { 2000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String { "~/.agir/agir.db".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Retry configuration for LLM requests. `max_retries = 0` disables retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Per-attempt deadline in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            timeout_secs: None,
        }
    }
}

fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool { true }

impl UserConfig {
    pub fn to_user(&self) -> User {
        let mut user = User::new(&self.username);
        if let Some(model) = &self.model {
            user = user.with_model(model);
        }
        user.first_name = self.first_name.clone();
        user.last_name = self.last_name.clone();
        user.email = self.email.clone();
        user.is_active = self.is_active;
        user
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| AgirError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| AgirError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.database.path)
    }

    /// Provider settings with environment fallbacks applied.
    pub fn provider(&self, kind: &str) -> ProviderConfig {
        let mut cfg = self.providers.get(kind).cloned().unwrap_or_default();
        if cfg.api_key.is_none() {
            let var = match kind {
                "openai" => Some("OPENAI_API_KEY"),
                "anthropic" => Some("ANTHROPIC_API_KEY"),
                _ => None,
            };
            cfg.api_key = var.and_then(|v| std::env::var(v).ok());
        }
        if cfg.base_url.is_none() && kind == "ollama" {
            cfg.base_url = std::env::var("OLLAMA_URL").ok();
        }
        cfg
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_AGIR_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_AGIR_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_AGIR_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_AGIR_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_AGIR_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.temperature, 0.7);
        assert_eq!(config.engine.max_tokens, 1000);
        assert_eq!(config.engine.max_steps, 100);
        assert!(config.engine.reflect);
        assert_eq!(config.engine.reflection_max_tokens, 2000);
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.retry.timeout_secs.is_none());
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_users_and_providers() {
        let toml_str = r#"
[engine]
max_steps = 5

[providers.ollama]
base_url = "http://gpu-box:11434"

[[users]]
username = "dr_house"
model = "claude-3-5-sonnet-latest"

[[users]]
username = "intern"
model = ""
is_active = false
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_steps, 5);
        assert_eq!(
            config.provider("ollama").base_url.as_deref(),
            Some("http://gpu-box:11434")
        );
        let users: Vec<User> = config.users.iter().map(UserConfig::to_user).collect();
        assert_eq!(users[0].configured_model(), Some("claude-3-5-sonnet-latest"));
        assert!(users[1].configured_model().is_none());
        assert!(!users[1].is_active);
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/x.db"), PathBuf::from(home).join("x.db"));
        }
        assert_eq!(expand_home("/abs/x.db"), PathBuf::from("/abs/x.db"));
    }
}

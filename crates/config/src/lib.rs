//! Configuration loading, validation, and management for Kestrel.
//!
//! Loads configuration from `~/.kestrel/config.toml` with environment
//! variable overrides. Validates all settings at startup. Per-project
//! settings live in a `.kestrel.toml` at the workspace root.

use kestrel_core::tool::ToolFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the per-project configuration file.
pub const PROJECT_CONFIG_FILE: &str = ".kestrel.toml";

/// The root configuration structure.
///
/// Maps directly to `~/.kestrel/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// LLM provider ("openrouter", "openai", "ollama", or "custom")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model identifier passed to the provider
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL for the "custom" provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Stream responses as they are generated
    #[serde(default = "default_true")]
    pub stream: bool,

    /// How tool invocations are exchanged with the model
    #[serde(default)]
    pub tool_format: ToolFormat,

    /// Tools the model may run; empty = all
    #[serde(default)]
    pub tool_allowlist: Vec<String>,

    /// Store attachment paths and re-read their contents at send time
    #[serde(default)]
    pub fresh_context: bool,

    /// Log token usage and estimated cost after each model call
    #[serde(default)]
    pub show_costs: bool,

    /// Token budget for the outgoing conversation
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,

    /// Run pre-commit checks after file-modifying tools
    #[serde(default = "default_true")]
    pub precommit: bool,

    /// Custom model pricing overrides (model name → pricing)
    #[serde(default)]
    pub pricing: HashMap<String, PricingOverrideConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_context_budget() -> usize {
    100_000
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_url", &self.api_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("stream", &self.stream)
            .field("tool_format", &self.tool_format)
            .field("tool_allowlist", &self.tool_allowlist)
            .field("fresh_context", &self.fresh_context)
            .field("show_costs", &self.show_costs)
            .field("context_budget_tokens", &self.context_budget_tokens)
            .field("precommit", &self.precommit)
            .field("pricing", &self.pricing)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
}

/// Interpret an environment switch: `1` and `true` enable it.
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true")
}

impl AppConfig {
    /// Load configuration from the default path (~/.kestrel/config.toml).
    ///
    /// Environment variables take precedence over the file, see
    /// [`AppConfig::apply_env_overrides`].
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    ///
    /// Every variable that is set wins over the file.
    ///
    /// - `KESTREL_API_KEY`, then `OPENROUTER_API_KEY`, then `OPENAI_API_KEY`
    /// - `KESTREL_PROVIDER`, `KESTREL_MODEL`, `KESTREL_TOOL_FORMAT`
    /// - `KESTREL_FRESH_CONTEXT`, `KESTREL_COSTS` (boolean switches)
    pub fn apply_env_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(key) = env("KESTREL_API_KEY")
            .or_else(|| env("OPENROUTER_API_KEY"))
            .or_else(|| env("OPENAI_API_KEY"))
        {
            self.api_key = Some(key);
        }

        if let Some(provider) = env("KESTREL_PROVIDER") {
            self.provider = provider;
        }

        if let Some(model) = env("KESTREL_MODEL") {
            self.model = model;
        }

        if let Some(format) = env("KESTREL_TOOL_FORMAT") {
            self.tool_format = format.parse().map_err(ConfigError::ValidationError)?;
        }

        if let Some(flag) = env("KESTREL_FRESH_CONTEXT") {
            self.fresh_context = is_truthy(&flag);
        }

        if let Some(flag) = env("KESTREL_COSTS") {
            self.show_costs = is_truthy(&flag);
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".kestrel")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.temperature < 0.0 || self.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: default_provider(),
            model: default_model(),
            api_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: true,
            tool_format: ToolFormat::default(),
            tool_allowlist: vec![],
            fresh_context: false,
            show_costs: false,
            context_budget_tokens: default_context_budget(),
            precommit: true,
            pricing: HashMap::new(),
        }
    }
}

/// Per-project settings from `<workspace>/.kestrel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Files whose contents are given to the model as workspace context
    #[serde(default)]
    pub files: Vec<String>,

    /// Extra instructions appended to the workspace context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl ProjectConfig {
    /// Load the project file from a workspace; `Ok(None)` when absent.
    pub fn load(workspace: &Path) -> Result<Option<Self>, ConfigError> {
        let path = workspace.join(PROJECT_CONFIG_FILE);
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content)
            .map(Some)
            .map_err(|e| ConfigError::ParseError {
                path,
                reason: e.to_string(),
            })
    }
}

/// Get the user's home directory.
pub fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

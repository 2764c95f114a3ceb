//! Built-in pricing table for common LLM models.
//!
//! Prices are in USD per 1 million tokens. Each model has an input and
//! output price. The `[pricing]` table in config overrides or extends them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    /// Create a new pricing entry.
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Pricing table with built-in defaults and per-model overrides from config.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
}

/// Built-in prices, keyed the way OpenRouter names models.
const DEFAULT_PRICES: &[(&str, f64, f64)] = &[
    ("anthropic/claude-sonnet-4", 3.0, 15.0),
    ("anthropic/claude-opus-4", 15.0, 75.0),
    ("anthropic/claude-3.5-sonnet", 3.0, 15.0),
    ("anthropic/claude-3.5-haiku", 0.8, 4.0),
    ("openai/gpt-4o", 2.5, 10.0),
    ("openai/gpt-4o-mini", 0.15, 0.6),
    ("openai/gpt-4-turbo", 10.0, 30.0),
    ("openai/o1", 15.0, 60.0),
    ("openai/o1-mini", 3.0, 12.0),
    ("openai/o3-mini", 1.1, 4.4),
    ("google/gemini-2.0-flash", 0.1, 0.4),
    ("google/gemini-1.5-pro", 1.25, 5.0),
    ("meta-llama/llama-3.1-70b", 0.52, 0.75),
    ("mistral/mistral-large", 2.0, 6.0),
    ("mistral/codestral", 0.3, 0.9),
    ("deepseek/deepseek-v3", 0.27, 1.1),
    ("deepseek/deepseek-r1", 0.55, 2.19),
];

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let prices = DEFAULT_PRICES
            .iter()
            .map(|&(model, input, output)| (model.to_string(), ModelPricing::new(input, output)))
            .collect();
        Self { prices }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add or replace the pricing for a model.
    pub fn with_override(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.prices.insert(model.into(), pricing);
        self
    }

    /// Look up pricing for a model.
    ///
    /// Tries an exact match first, then the bare model name against the bare
    /// keys (`gpt-4o` matches `openai/gpt-4o`), then the longest key that is a
    /// prefix of the model (`gpt-4o-mini-2024-07-18` matches `gpt-4o-mini`).
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(p) = self.prices.get(model) {
            return Some(p);
        }

        let bare = |name: &str| name.rsplit('/').next().unwrap_or(name).to_lowercase();
        let bare_model = bare(model);

        self.prices
            .iter()
            .filter(|(key, _)| bare_model.starts_with(&bare(key)))
            .max_by_key(|(key, _)| bare(key).len())
            .map(|(_, p)| p)
    }

    /// Cost of a call in USD, or `None` if the model is unknown.
    pub fn compute_cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> Option<f64> {
        self.get(model).map(|p| p.cost(input_tokens, output_tokens))
    }

    /// Number of models in the pricing table.
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

//! Per-model token pricing and cost computation.
//!
//! Prices are USD per million tokens. Lookups check the caller's override
//! table first, then the built-in defaults, then fall back to the first model
//! (in sorted order) whose name starts with the requested one.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::agent::TokenUsage;
use crate::errors::CacheError;

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Pricing for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelCosts {
    pub cost_per_million_input_tokens: f64,
    pub cost_per_million_output_tokens: f64,
    #[serde(default)]
    pub cost_per_million_cache_write_tokens: f64,
    #[serde(default)]
    pub cost_per_million_cache_read_tokens: f64,
}

impl ModelCosts {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            cost_per_million_input_tokens: input,
            cost_per_million_output_tokens: output,
            cost_per_million_cache_write_tokens: cache_write,
            cost_per_million_cache_read_tokens: cache_read,
        }
    }

    /// Rejects negative or non-finite prices.
    pub fn validate(&self, model_name: &str) -> Result<(), CacheError> {
        let prices = [
            ("input", self.cost_per_million_input_tokens),
            ("output", self.cost_per_million_output_tokens),
            ("cache write", self.cost_per_million_cache_write_tokens),
            ("cache read", self.cost_per_million_cache_read_tokens),
        ];
        for (label, price) in prices {
            if !price.is_finite() || price < 0.0 {
                return Err(CacheError::configuration(format!(
                    "invalid {label} price {price} for model '{model_name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Token counts split by billing category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    /// All prompt tokens, cached ones included
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Prompt tokens served from the provider's cache. Never above `input_tokens`.
    pub cached_input_tokens: u64,
    pub cached_output_tokens: u64,
    /// Prompt tokens written into the provider's cache
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenCounts {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Splits agent-reported usage into billing categories.
    pub fn from_usage(usage: &TokenUsage) -> Self {
        let cached_input = usage.cache_read_tokens.unwrap_or(0);
        if cached_input > usage.input_tokens {
            tracing::warn!(
                input_tokens = usage.input_tokens,
                cached_input_tokens = cached_input,
                "Agent reported more cached than total input tokens, clamping"
            );
        }
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_input_tokens: cached_input.min(usage.input_tokens),
            cached_output_tokens: usage.cached_output_tokens.unwrap_or(0),
            cache_write_tokens: usage.cache_creation_tokens.unwrap_or(0),
        }
    }

    /// Input tokens billed at the full rate
    pub fn uncached_input_tokens(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cached_input_tokens)
    }
}

fn per_million(tokens: u64, price: f64) -> f64 {
    tokens as f64 * price / TOKENS_PER_MILLION
}

impl ModelCosts {
    /// Monetary cost of one invocation under this pricing.
    pub fn cost_of(&self, tokens: &TokenCounts) -> f64 {
        per_million(tokens.uncached_input_tokens(), self.cost_per_million_input_tokens)
            + per_million(tokens.output_tokens, self.cost_per_million_output_tokens)
            + per_million(
                tokens.cached_input_tokens.min(tokens.input_tokens),
                self.cost_per_million_cache_read_tokens,
            )
            + per_million(tokens.cache_write_tokens, self.cost_per_million_cache_write_tokens)
    }
}

lazy_static! {
    /// Built-in pricing table.
    pub static ref DEFAULT_COSTS: HashMap<&'static str, ModelCosts> = {
        let mut m = HashMap::new();
        // Anthropic
        m.insert("claude-3-7-sonnet-latest", ModelCosts::new(3.0, 15.0, 3.75, 0.3));
        m.insert("claude-3-5-haiku-latest", ModelCosts::new(0.8, 4.0, 1.0, 0.08));
        // OpenAI
        m.insert("gpt-4o-mini", ModelCosts::new(0.15, 0.6, 0.0, 0.075));
        m.insert("o3-mini-2025-01-31", ModelCosts::new(1.1, 4.4, 0.0, 0.55));
        // Google
        m.insert("gemini-1.5-flash", ModelCosts::new(0.075, 0.30, 0.01875, 0.0));
        m.insert("gemini-2.0-flash-lite", ModelCosts::new(0.075, 0.30, 0.0, 0.0));
        m.insert("gemini-2.0-flash", ModelCosts::new(0.10, 0.40, 0.025, 0.0));
        m
    };
}

/// Looks up pricing for `model_name`.
pub fn lookup(
    model_name: &str,
    overrides: Option<&HashMap<String, ModelCosts>>,
) -> Result<ModelCosts, CacheError> {
    if let Some(costs) = overrides.and_then(|table| table.get(model_name)) {
        costs.validate(model_name)?;
        return Ok(*costs);
    }
    if let Some(costs) = DEFAULT_COSTS.get(model_name) {
        return Ok(*costs);
    }

    // Prefix fallback: "gpt-4o" resolves to a dated "gpt-4o-2024-08-06" entry
    let merged = effective_table(overrides);
    if let Some((name, costs)) = merged.iter().find(|(name, _)| name.starts_with(model_name)) {
        tracing::warn!(
            model = model_name,
            matched = %name,
            "Exact cost entry not found, using prefix match"
        );
        costs.validate(name)?;
        return Ok(*costs);
    }

    Err(CacheError::configuration(format!(
        "model '{model_name}' not found in cost tables; supply a cost override for it"
    )))
}

/// Cost of one invocation of `model_name` with the given token counts.
pub fn compute_cost(
    model_name: &str,
    tokens: &TokenCounts,
    overrides: Option<&HashMap<String, ModelCosts>>,
) -> Result<f64, CacheError> {
    Ok(lookup(model_name, overrides)?.cost_of(tokens))
}

/// Defaults merged with overrides, sorted by model name.
pub fn effective_table(
    overrides: Option<&HashMap<String, ModelCosts>>,
) -> BTreeMap<String, ModelCosts> {
    let mut table: BTreeMap<String, ModelCosts> = DEFAULT_COSTS
        .iter()
        .map(|(name, costs)| (name.to_string(), *costs))
        .collect();
    if let Some(overrides) = overrides {
        table.extend(overrides.iter().map(|(name, costs)| (name.clone(), *costs)));
    }
    table
}

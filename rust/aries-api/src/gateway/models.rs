//! Model alias resolution and pricing lookup.

use crate::config::{ModelPricing, PricingConfig};
use crate::llm::TokenUsage;

/// Fixed alias table mapping short names to qualified model ids.
///
/// A qualified id carries a provider prefix (`anthropic/...`). Unknown
/// aliases pass through unchanged.
const ALIASES: &[(&str, &str)] = &[
    ("opus", "anthropic/claude-opus-4-1"),
    ("sonnet", "anthropic/claude-sonnet-4-5"),
    ("haiku", "anthropic/claude-haiku-3-5"),
    ("claude", "anthropic/claude-sonnet-4-5"),
];

/// Built-in pricing rows (USD per million tokens).
const BUILTIN_PRICING: &[(&str, ModelPricing)] = &[
    (
        "anthropic/claude-opus-4-1",
        ModelPricing {
            input: 15.0,
            output: 75.0,
            cache_read: 1.5,
            cache_write: 18.75,
        },
    ),
    (
        "anthropic/claude-sonnet-4-5",
        ModelPricing {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        },
    ),
    (
        "anthropic/claude-haiku-3-5",
        ModelPricing {
            input: 0.8,
            output: 4.0,
            cache_read: 0.08,
            cache_write: 1.0,
        },
    ),
];

/// Resolve a model alias to its fully qualified id.
pub fn resolve_alias(model: &str) -> String {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map_or_else(|| model.to_string(), |(_, id)| (*id).to_string())
}

/// List every known alias with its qualified id.
pub fn alias_table() -> Vec<(&'static str, &'static str)> {
    ALIASES.to_vec()
}

/// Look up pricing for a model: config override, then built-in row, then
/// the configured default.
pub fn pricing_for(config: &PricingConfig, model: &str) -> ModelPricing {
    if let Some(row) = config.models.get(model) {
        return *row;
    }
    BUILTIN_PRICING
        .iter()
        .find(|(id, _)| *id == model)
        .map_or(config.default, |(_, row)| *row)
}

/// Compute the cost of one call in USD.
pub fn cost_for(config: &PricingConfig, model: &str, usage: &TokenUsage) -> f64 {
    let price = pricing_for(config, model);
    (usage.input_tokens as f64 * price.input
        + usage.output_tokens as f64 * price.output
        + usage.cache_read_input_tokens as f64 * price.cache_read
        + usage.cache_creation_input_tokens as f64 * price.cache_write)
        / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        assert_eq!(resolve_alias("opus"), "anthropic/claude-opus-4-1");
        assert_eq!(resolve_alias("sonnet"), "anthropic/claude-sonnet-4-5");
        // Unknown aliases pass through unchanged.
        assert_eq!(resolve_alias("anthropic/claude-opus-4-1"), "anthropic/claude-opus-4-1");
        assert_eq!(resolve_alias("mystery-model"), "mystery-model");
    }

    #[test]
    fn test_cost_arithmetic() {
        let config = PricingConfig::default();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
        };
        let cost = cost_for(&config, "anthropic/claude-sonnet-4-5", &usage);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default_pricing() {
        let config = PricingConfig::default();
        let price = pricing_for(&config, "some/unknown-model");
        assert!((price.input - config.default.input).abs() < f64::EPSILON);
    }
}

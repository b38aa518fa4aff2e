//! Model aliases and token pricing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Usage;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelPrice {
    pub const fn flat(per_mtok: f64) -> Self {
        Self {
            input_per_mtok: per_mtok,
            output_per_mtok: per_mtok,
        }
    }
}

/// Injected price list. Unknown models are charged at `fallback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub models: BTreeMap<String, ModelPrice>,
    /// Short names (`sonnet`) to full identifiers.
    pub aliases: BTreeMap<String, String>,
    pub fallback: ModelPrice,
}

impl Default for PriceTable {
    fn default() -> Self {
        let aliases = [
            ("sonnet", "claude-sonnet-4-5-20250929"),
            ("opus", "claude-opus-4-20250514"),
            ("haiku", "claude-3-5-haiku-20241022"),
        ];
        let models = [
            ("claude-sonnet-4-5-20250929", ModelPrice::flat(3.0)),
            ("claude-opus-4-20250514", ModelPrice::flat(15.0)),
            ("claude-3-5-haiku-20241022", ModelPrice::flat(1.0)),
        ];
        Self {
            models: models
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            aliases: aliases
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fallback: ModelPrice::flat(3.0),
        }
    }
}

impl PriceTable {
    /// Full identifier for an alias; anything else passes through.
    pub fn resolve_model(&self, name: &str) -> String {
        self.aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        let resolved = self.resolve_model(model);
        self.models.get(&resolved).copied().unwrap_or(self.fallback)
    }

    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        let price = self.price_for(model);
        (usage.input_tokens as f64 * price.input_per_mtok
            + usage.output_tokens as f64 * price.output_per_mtok)
            / 1_000_000.0
    }
}

//! Model pricing
//!
//! Maps a (provider kind, model) pair to a price in rubles per 1000 tokens
//! and computes the monetary cost of a request. Local backends are free.

use std::collections::HashMap;
use tracing::warn;

/// Table key for a provider kind's default price
const DEFAULT_MODEL_KEY: &str = "default";

/// Pricing table: provider kind to per-model prices (RUB per 1K tokens).
///
/// Each kind carries a `default` entry used for models without an exact
/// match. Kind lookup is case-insensitive and tolerates instance-name
/// suffixes, so `gigachat-dev` and `mock-2` resolve to their base kinds.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: HashMap<String, HashMap<String, f64>>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut entries: HashMap<String, HashMap<String, f64>> = HashMap::new();

        entries.insert(
            "gigachat".to_string(),
            HashMap::from([
                ("GigaChat".to_string(), 1.00),
                ("GigaChat-Plus".to_string(), 1.50),
                ("GigaChat-Pro".to_string(), 2.00),
                (DEFAULT_MODEL_KEY.to_string(), 1.50),
            ]),
        );
        entries.insert(
            "yandexgpt".to_string(),
            HashMap::from([
                ("yandexgpt/latest".to_string(), 1.50),
                ("yandexgpt-lite/latest".to_string(), 0.75),
                (DEFAULT_MODEL_KEY.to_string(), 1.50),
            ]),
        );
        // Local inference and simulation cost nothing.
        entries.insert(
            "ollama".to_string(),
            HashMap::from([(DEFAULT_MODEL_KEY.to_string(), 0.0)]),
        );
        entries.insert(
            "mock".to_string(),
            HashMap::from([(DEFAULT_MODEL_KEY.to_string(), 0.0)]),
        );

        Self { entries }
    }
}

impl PricingTable {
    /// Create the built-in table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the price for a model, or the kind default when `model`
    /// is `None`. Unknown kinds are inserted.
    #[must_use]
    pub fn with_price(mut self, kind: &str, model: Option<&str>, price_per_1k: f64) -> Self {
        let models = self.entries.entry(kind.to_lowercase()).or_default();
        models.insert(
            model.unwrap_or(DEFAULT_MODEL_KEY).to_string(),
            price_per_1k,
        );
        self
    }

    /// Price in rubles per 1000 tokens for the given kind and model.
    ///
    /// Lookup order: exact model match, then the kind's default, then 0.0
    /// with a warning for unknown kinds.
    #[must_use]
    pub fn price_per_1k(&self, kind: &str, model: Option<&str>) -> f64 {
        let Some(models) = self.kind_entry(kind) else {
            warn!(kind, "no pricing for provider kind, assuming free");
            return 0.0;
        };

        if let Some(price) = model.and_then(|m| models.get(m)) {
            return *price;
        }
        models.get(DEFAULT_MODEL_KEY).copied().unwrap_or(0.0)
    }

    /// Cost in rubles of `total_tokens` tokens at this table's prices.
    #[must_use]
    pub fn cost(&self, kind: &str, model: Option<&str>, total_tokens: u64) -> f64 {
        (total_tokens as f64 / 1000.0) * self.price_per_1k(kind, model)
    }

    /// Resolve a kind entry, accepting `base-suffix` instance names.
    fn kind_entry(&self, kind: &str) -> Option<&HashMap<String, f64>> {
        let kind = kind.to_lowercase();
        if let Some(models) = self.entries.get(&kind) {
            return Some(models);
        }
        self.entries
            .iter()
            .find(|(base, _)| kind.starts_with(&format!("{base}-")))
            .map(|(_, models)| models)
    }
}

/// Compute a cost using the built-in pricing table.
#[must_use]
pub fn calculate_cost(kind: &str, model: Option<&str>, total_tokens: u64) -> f64 {
    PricingTable::default().cost(kind, model, total_tokens)
}

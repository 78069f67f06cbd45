//! Usage accounting and cost estimation

use crate::result::Usage;
use serde::Serialize;

/// Per-million-token pricing for a model family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    /// USD per million input tokens
    pub input_per_mtok: f64,
    /// USD per million output tokens
    pub output_per_mtok: f64,
    /// USD per million cache-read tokens
    pub cache_read_per_mtok: f64,
    /// USD per million cache-write tokens
    pub cache_write_per_mtok: f64,
}

/// Pricing by longest-prefix match over the model id. Unknown models
/// (including anything on the local runtime) cost nothing.
#[must_use]
pub fn pricing_for(model: &str) -> ModelPricing {
    let model = model.strip_prefix("anthropic/").unwrap_or(model);
    if model.starts_with("claude-opus") {
        ModelPricing {
            input_per_mtok: 15.0,
            output_per_mtok: 75.0,
            cache_read_per_mtok: 1.5,
            cache_write_per_mtok: 18.75,
        }
    } else if model.starts_with("claude-sonnet") || model.starts_with("claude-3-7-sonnet") {
        ModelPricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_read_per_mtok: 0.3,
            cache_write_per_mtok: 3.75,
        }
    } else if model.contains("haiku") {
        ModelPricing {
            input_per_mtok: 0.8,
            output_per_mtok: 4.0,
            cache_read_per_mtok: 0.08,
            cache_write_per_mtok: 1.0,
        }
    } else {
        ModelPricing {
            input_per_mtok: 0.0,
            output_per_mtok: 0.0,
            cache_read_per_mtok: 0.0,
            cache_write_per_mtok: 0.0,
        }
    }
}

/// Running token and cost totals across backend calls.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct UsageTotals {
    /// Input tokens billed at the full rate
    pub input_tokens: u64,
    /// Output tokens
    pub output_tokens: u64,
    /// Tokens served from the prompt cache
    pub cache_read_tokens: u64,
    /// Tokens written to the prompt cache
    pub cache_write_tokens: u64,
    /// Estimated spend in USD
    pub cost_usd: f64,
}

impl UsageTotals {
    /// Fold one call's usage into the totals, priced by its model.
    pub fn add(&mut self, usage: &Usage, model: &str) {
        let pricing = pricing_for(model);
        self.input_tokens += u64::from(usage.input_tokens);
        self.output_tokens += u64::from(usage.output_tokens);
        let cache_read = u64::from(usage.cache_read_tokens.unwrap_or(0));
        let cache_write = u64::from(usage.cache_write_tokens.unwrap_or(0));
        self.cache_read_tokens += cache_read;
        self.cache_write_tokens += cache_write;

        self.cost_usd += f64::from(usage.input_tokens) / 1_000_000.0 * pricing.input_per_mtok
            + f64::from(usage.output_tokens) / 1_000_000.0 * pricing.output_per_mtok
            + cache_read as f64 / 1_000_000.0 * pricing.cache_read_per_mtok
            + cache_write as f64 / 1_000_000.0 * pricing.cache_write_per_mtok;
    }

    /// Merge another set of totals into this one.
    pub fn merge(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cost_usd += other.cost_usd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sonnet_pricing_applies_with_and_without_prefix() {
        assert_eq!(
            pricing_for("claude-sonnet-4-20250514"),
            pricing_for("anthropic/claude-sonnet-4")
        );
    }

    #[test]
    fn local_models_are_free() {
        let pricing = pricing_for("qwen3:8b");
        assert_eq!(pricing.input_per_mtok, 0.0);
        assert_eq!(pricing.output_per_mtok, 0.0);
    }

    #[test]
    fn totals_accumulate_cost() {
        let mut totals = UsageTotals::default();
        totals.add(
            &Usage {
                input_tokens: 1_000_000,
                output_tokens: 1_000_000,
                cache_read_tokens: None,
                cache_write_tokens: None,
            },
            "claude-sonnet-4-20250514",
        );
        assert_eq!(totals.input_tokens, 1_000_000);
        assert!((totals.cost_usd - 18.0).abs() < 1e-9);
    }

    #[test]
    fn cache_tokens_are_billed_at_cache_rates() {
        let mut totals = UsageTotals::default();
        totals.add(
            &Usage {
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: Some(1_000_000),
                cache_write_tokens: None,
            },
            "claude-sonnet-4-20250514",
        );
        assert!((totals.cost_usd - 0.3).abs() < 1e-9);
    }

    #[test]
    fn merge_sums_everything() {
        let mut a = UsageTotals {
            input_tokens: 10,
            output_tokens: 20,
            cache_read_tokens: 5,
            cache_write_tokens: 1,
            cost_usd: 0.5,
        };
        let b = a;
        a.merge(&b);
        assert_eq!(a.input_tokens, 20);
        assert_eq!(a.output_tokens, 40);
        assert!((a.cost_usd - 1.0).abs() < 1e-9);
    }
}

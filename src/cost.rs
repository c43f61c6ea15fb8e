//! Token cost calculator. Pure table lookup: no IO, no clock, no state.

use std::collections::HashMap;

use crate::config::PricingConfig;

#[derive(Debug, Clone, Copy)]
pub struct TokenRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<(String, String), TokenRate>,
}

impl PricingTable {
    pub fn new(entries: &[PricingConfig]) -> Self {
        let rates = entries
            .iter()
            .map(|entry| {
                (
                    (entry.provider.clone(), entry.model.clone()),
                    TokenRate {
                        input_per_1k: entry.input_per_1k,
                        output_per_1k: entry.output_per_1k,
                    },
                )
            })
            .collect();
        Self { rates }
    }

    /// Cost in USD for a completed call, rounded to 6 decimal places.
    /// Unpriced (provider, model) pairs cost zero and log a warning once per
    /// call site.
    pub fn calculate(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> f64 {
        let Some(rate) = self
            .rates
            .get(&(provider.to_string(), model.to_string()))
        else {
            tracing::warn!(provider, model, "no pricing entry, recording zero cost");
            return 0.0;
        };
        let input = prompt_tokens as f64 / 1000.0 * rate.input_per_1k;
        let output = completion_tokens as f64 / 1000.0 * rate.output_per_1k;
        round6(input + output)
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable::new(&[PricingConfig {
            provider: "oai".to_string(),
            model: "gpt-4o".to_string(),
            input_per_1k: 0.005,
            output_per_1k: 0.015,
        }])
    }

    #[test]
    fn priced_pair() {
        // 1000 input at 0.005 + 2000 output at 0.015
        let cost = table().calculate("oai", "gpt-4o", 1000, 2000);
        assert_eq!(cost, 0.035);
    }

    #[test]
    fn rounds_to_six_decimals() {
        let cost = table().calculate("oai", "gpt-4o", 1, 1);
        assert_eq!(cost, 0.00002);
    }

    #[test]
    fn unknown_pair_is_zero() {
        assert_eq!(table().calculate("oai", "gpt-5", 1000, 1000), 0.0);
        assert_eq!(table().calculate("other", "gpt-4o", 1000, 1000), 0.0);
    }

    #[test]
    fn zero_tokens_zero_cost() {
        assert_eq!(table().calculate("oai", "gpt-4o", 0, 0), 0.0);
    }
}

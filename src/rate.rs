//! Rate estimator: maps `(model, prompt_tokens, completion_tokens)` to a
//! dollar cost. The built-in table merges with an optional override
//! source the same way the source's model registry merges a loaded
//! override file over its built-in defaults.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    /// USD per 1,000 prompt tokens.
    pub input: f64,
    /// USD per 1,000 completion tokens.
    pub output: f64,
}

const DEFAULT_RATE: ModelRate = ModelRate { input: 0.2, output: 0.8 };

fn builtin_table() -> HashMap<&'static str, ModelRate> {
    HashMap::from([
        ("gpt-4o", ModelRate { input: 2.5, output: 10.0 }),
        ("gpt-4o-mini", ModelRate { input: 0.15, output: 0.6 }),
        ("gpt-3.5-turbo", ModelRate { input: 0.5, output: 1.5 }),
    ])
}

pub struct RateEstimator {
    overrides: HashMap<String, ModelRate>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self { overrides: HashMap::new() }
    }

    pub fn with_overrides(overrides: HashMap<String, ModelRate>) -> Self {
        Self { overrides }
    }

    fn rate_for(&self, model: &str) -> ModelRate {
        self.overrides
            .get(model)
            .copied()
            .or_else(|| builtin_table().get(model).copied())
            .unwrap_or(DEFAULT_RATE)
    }

    pub fn estimate_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let rate = self.rate_for(model);
        (prompt_tokens as f64 * rate.input + completion_tokens as f64 * rate.output) / 1000.0
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_uses_builtin_rate() {
        let est = RateEstimator::new();
        let cost = est.estimate_cost("gpt-4o-mini", 1000, 1000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_falls_back_to_default_rate() {
        let est = RateEstimator::new();
        let cost = est.estimate_cost("some-unlisted-model", 1000, 1000);
        assert!((cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn override_wins_over_builtin() {
        let est = RateEstimator::with_overrides(HashMap::from([("gpt-4o-mini".to_string(), ModelRate { input: 1.0, output: 1.0 })]));
        let cost = est.estimate_cost("gpt-4o-mini", 1000, 1000);
        assert!((cost - 2.0).abs() < 1e-9);
    }
}

// src/llm/registry.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Config;
use crate::models::routing::ModelTier;

/// Capabilities and published pricing for one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierCapabilities {
    pub model_id: String,
    pub context_window_tokens: u32,
    pub max_output_tokens: u32,
    /// USD per 1k input tokens. Zero for the local tier.
    pub input_rate_per_1k: f64,
    /// USD per 1k output tokens. Zero for the local tier.
    pub output_rate_per_1k: f64,
    pub is_local: bool,
}

/// Registry of all four backends, built once from config so the rate table
/// stays injectable policy data.
pub struct ModelRegistry {
    tiers: HashMap<ModelTier, TierCapabilities>,
}

impl ModelRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            ModelTier::Local,
            TierCapabilities {
                model_id: config.local_model_id.clone(),
                context_window_tokens: 4_096,
                max_output_tokens: 512,
                input_rate_per_1k: 0.0,
                output_rate_per_1k: 0.0,
                is_local: true,
            },
        );
        tiers.insert(
            ModelTier::CloudLite,
            TierCapabilities {
                model_id: config.cloud_lite_model.clone(),
                context_window_tokens: 128_000,
                max_output_tokens: 1_024,
                input_rate_per_1k: config.cloud_lite_input_rate,
                output_rate_per_1k: config.cloud_lite_output_rate,
                is_local: false,
            },
        );
        tiers.insert(
            ModelTier::CloudStandard,
            TierCapabilities {
                model_id: config.cloud_standard_model.clone(),
                context_window_tokens: 128_000,
                max_output_tokens: 2_048,
                input_rate_per_1k: config.cloud_standard_input_rate,
                output_rate_per_1k: config.cloud_standard_output_rate,
                is_local: false,
            },
        );
        tiers.insert(
            ModelTier::CloudPro,
            TierCapabilities {
                model_id: config.cloud_pro_model.clone(),
                context_window_tokens: 200_000,
                max_output_tokens: 4_096,
                input_rate_per_1k: config.cloud_pro_input_rate,
                output_rate_per_1k: config.cloud_pro_output_rate,
                is_local: false,
            },
        );
        Self { tiers }
    }

    pub fn capabilities(&self, tier: ModelTier) -> &TierCapabilities {
        // All four tiers are registered in from_config.
        self.tiers.get(&tier).expect("tier registered")
    }

    pub fn model_id(&self, tier: ModelTier) -> &str {
        &self.capabilities(tier).model_id
    }

    /// Cost at published rates, before the internal markup the ledger applies.
    pub fn raw_cost_usd(&self, tier: ModelTier, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let caps = self.capabilities(tier);
        if caps.is_local {
            return 0.0;
        }
        (f64::from(prompt_tokens) / 1_000.0) * caps.input_rate_per_1k
            + (f64::from(completion_tokens) / 1_000.0) * caps.output_rate_per_1k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_tier_is_always_free() {
        let registry = ModelRegistry::from_config(&Config::default());
        assert_eq!(registry.raw_cost_usd(ModelTier::Local, 100_000, 100_000), 0.0);
        assert!(registry.capabilities(ModelTier::Local).is_local);
    }

    #[test]
    fn cloud_cost_scales_with_tokens_and_tier() {
        let registry = ModelRegistry::from_config(&Config::default());
        let lite = registry.raw_cost_usd(ModelTier::CloudLite, 1_000, 1_000);
        let pro = registry.raw_cost_usd(ModelTier::CloudPro, 1_000, 1_000);
        assert!(lite > 0.0);
        assert!(pro > lite);

        let double = registry.raw_cost_usd(ModelTier::CloudLite, 2_000, 2_000);
        assert!((double - lite * 2.0).abs() < 1e-12);
    }
}

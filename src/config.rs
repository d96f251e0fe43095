// src/config.rs

use secrecy::SecretString;
use serde::Deserialize;

/// Application configuration, loaded from environment variables.
///
/// Pricing, cap, and family-allocation values are policy data that change
/// independently of the routing logic, so they live here rather than in code.
#[derive(Deserialize, Clone)]
pub struct Config {
    // Cloud API
    pub cloud_api_key: Option<SecretString>,
    #[serde(default = "default_cloud_api_base_url")]
    pub cloud_api_base_url: String,
    #[serde(default = "default_cloud_timeout_secs")]
    pub cloud_timeout_secs: u64,

    // Model ids per cloud tier
    #[serde(default = "default_cloud_lite_model")]
    pub cloud_lite_model: String,
    #[serde(default = "default_cloud_standard_model")]
    pub cloud_standard_model: String,
    #[serde(default = "default_cloud_pro_model")]
    pub cloud_pro_model: String,

    // Per-tier published rates, USD per 1k tokens
    #[serde(default = "default_cloud_lite_input_rate")]
    pub cloud_lite_input_rate: f64,
    #[serde(default = "default_cloud_lite_output_rate")]
    pub cloud_lite_output_rate: f64,
    #[serde(default = "default_cloud_standard_input_rate")]
    pub cloud_standard_input_rate: f64,
    #[serde(default = "default_cloud_standard_output_rate")]
    pub cloud_standard_output_rate: f64,
    #[serde(default = "default_cloud_pro_input_rate")]
    pub cloud_pro_input_rate: f64,
    #[serde(default = "default_cloud_pro_output_rate")]
    pub cloud_pro_output_rate: f64,
    /// Internal markup applied on top of published rates before accrual.
    #[serde(default = "default_cost_markup")]
    pub cost_markup: f64,

    // Monthly dollar caps per paid plan
    #[serde(default = "default_plus_soft_cap_usd")]
    pub plus_soft_cap_usd: f64,
    #[serde(default = "default_plus_hard_cap_usd")]
    pub plus_hard_cap_usd: f64,
    #[serde(default = "default_premium_soft_cap_usd")]
    pub premium_soft_cap_usd: f64,
    #[serde(default = "default_premium_hard_cap_usd")]
    pub premium_hard_cap_usd: f64,

    // Daily cloud-message ceilings per paid plan
    #[serde(default = "default_plus_daily_message_limit")]
    pub plus_daily_message_limit: u32,
    #[serde(default = "default_premium_daily_message_limit")]
    pub premium_daily_message_limit: u32,

    /// Legacy monthly token ceiling, kept as a secondary guard.
    #[serde(default = "default_monthly_token_budget")]
    pub monthly_token_budget: u64,

    // Family shared budget
    #[serde(default = "default_family_pool_usd")]
    pub family_pool_usd: f64,
    #[serde(default = "default_family_owner_share_pct")]
    pub family_owner_share_pct: f64,
    #[serde(default = "default_family_member_share_pct")]
    pub family_member_share_pct: f64,

    // On-device model file
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_model_filename")]
    pub model_filename: String,
    #[serde(default = "default_model_expected_bytes")]
    pub model_expected_bytes: u64,
    #[serde(default = "default_model_min_valid_bytes")]
    pub model_min_valid_bytes: u64,
    #[serde(default = "default_storage_safety_margin_bytes")]
    pub storage_safety_margin_bytes: u64,
    /// Candidate directories that may hold a pre-delivered copy of the model,
    /// searched in order (most specific first). Comma-separated in the env.
    #[serde(default)]
    pub bundled_asset_dirs: Vec<String>,

    // Model download
    #[serde(default = "default_model_primary_url")]
    pub model_primary_url: String,
    #[serde(default = "default_model_secondary_url")]
    pub model_secondary_url: String,
    #[serde(default = "default_download_max_attempts")]
    pub download_max_attempts: u32,
    #[serde(default = "default_download_stall_window_secs")]
    pub download_stall_window_secs: u64,
    #[serde(default = "default_download_progress_interval_ms")]
    pub download_progress_interval_ms: u64,
    #[serde(default = "default_auto_start_download")]
    pub auto_start_download: bool,

    // Local inference server
    #[serde(default = "default_local_server_host")]
    pub local_server_host: String,
    #[serde(default = "default_local_server_port")]
    pub local_server_port: u16,
    #[serde(default = "default_local_timeout_secs")]
    pub local_timeout_secs: u64,
    #[serde(default = "default_local_model_id")]
    pub local_model_id: String,

    // Circuit breakers (per cloud tier)
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    // Coaching context assembly
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    #[serde(default = "default_history_messages_in_context")]
    pub history_messages_in_context: usize,
}

fn default_cloud_api_base_url() -> String {
    "https://api.dailywell.app/ai/v1".to_string()
}
fn default_cloud_timeout_secs() -> u64 {
    30
}
fn default_cloud_lite_model() -> String {
    "wellcoach-lite".to_string()
}
fn default_cloud_standard_model() -> String {
    "wellcoach-standard".to_string()
}
fn default_cloud_pro_model() -> String {
    "wellcoach-pro".to_string()
}
fn default_cloud_lite_input_rate() -> f64 {
    0.000_1
}
fn default_cloud_lite_output_rate() -> f64 {
    0.000_4
}
fn default_cloud_standard_input_rate() -> f64 {
    0.000_3
}
fn default_cloud_standard_output_rate() -> f64 {
    0.002_5
}
fn default_cloud_pro_input_rate() -> f64 {
    0.001_25
}
fn default_cloud_pro_output_rate() -> f64 {
    0.01
}
fn default_cost_markup() -> f64 {
    1.2
}
fn default_plus_soft_cap_usd() -> f64 {
    2.0
}
fn default_plus_hard_cap_usd() -> f64 {
    2.5
}
fn default_premium_soft_cap_usd() -> f64 {
    5.0
}
fn default_premium_hard_cap_usd() -> f64 {
    5.5
}
fn default_plus_daily_message_limit() -> u32 {
    40
}
fn default_premium_daily_message_limit() -> u32 {
    150
}
fn default_monthly_token_budget() -> u64 {
    2_000_000
}
fn default_family_pool_usd() -> f64 {
    12.0
}
fn default_family_owner_share_pct() -> f64 {
    40.0
}
fn default_family_member_share_pct() -> f64 {
    20.0
}
fn default_models_dir() -> String {
    "models".to_string()
}
fn default_model_filename() -> String {
    "wellcoach-1b-q4.gguf".to_string()
}
fn default_model_expected_bytes() -> u64 {
    380 * 1024 * 1024
}
fn default_model_min_valid_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_storage_safety_margin_bytes() -> u64 {
    500 * 1024 * 1024
}
fn default_model_primary_url() -> String {
    "https://models.dailywell.app/wellcoach-1b-q4.gguf".to_string()
}
fn default_model_secondary_url() -> String {
    "https://models-mirror.dailywell.app/wellcoach-1b-q4.gguf".to_string()
}
fn default_download_max_attempts() -> u32 {
    5
}
fn default_download_stall_window_secs() -> u64 {
    30
}
fn default_download_progress_interval_ms() -> u64 {
    2_000
}
fn default_auto_start_download() -> bool {
    true
}
fn default_local_server_host() -> String {
    "127.0.0.1".to_string()
}
fn default_local_server_port() -> u16 {
    11435
}
fn default_local_timeout_secs() -> u64 {
    60
}
fn default_local_model_id() -> String {
    "wellcoach-1b-q4".to_string()
}
fn default_breaker_failure_threshold() -> u32 {
    3
}
fn default_breaker_cooldown_secs() -> u64 {
    60
}
fn default_context_max_chars() -> usize {
    4_000
}
fn default_history_messages_in_context() -> usize {
    12
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `anyhow::Error` if environment variable parsing fails, such as
    /// when a variable has an invalid format.
    pub fn load() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        envy::from_env::<Self>().map_err(anyhow::Error::from)
    }
}

impl Default for Config {
    fn default() -> Self {
        // Deserializing an empty map applies every `#[serde(default)]`.
        envy::from_iter::<_, Self>(std::iter::empty::<(String, String)>())
            .expect("default config must deserialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_internally_consistent() {
        let config = Config::default();
        assert!(config.plus_soft_cap_usd <= config.plus_hard_cap_usd);
        assert!(config.premium_soft_cap_usd <= config.premium_hard_cap_usd);
        assert!(config.model_min_valid_bytes <= config.model_expected_bytes);
        assert!(config.cost_markup >= 1.0);
    }

    #[test]
    fn pro_tier_is_most_expensive() {
        let config = Config::default();
        assert!(config.cloud_pro_output_rate > config.cloud_standard_output_rate);
        assert!(config.cloud_standard_output_rate > config.cloud_lite_output_rate);
    }
}

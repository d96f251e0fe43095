// src/llm/mod.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub mod cloud;
pub mod fallback;
pub mod local;
pub mod registry;

pub use cloud::CloudLlmClient;
pub use registry::{ModelRegistry, TierCapabilities};

/// A single completion request, identical for cloud and on-device backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// A completed generation with the token counts the ledger needs for cost
/// accrual. Backends that don't report usage fall back to an estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Trait defining the interface for AI backend operations.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Executes a completion against a specific model.
    ///
    /// # Errors
    ///
    /// Returns an `AppError` on transport failure, non-success status, or a
    /// backend that cannot serve (e.g. local model not yet acquired).
    async fn complete(
        &self,
        model_id: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AppError>;
}

/// Rough token estimate for text without a reported usage block.
pub(crate) fn approx_tokens(text: &str) -> u32 {
    ((text.chars().count() + 3) / 4).max(1) as u32
}

// src/llm/local/client.rs
// On-device inference adapter. Thin by design: resolve the model file via
// the acquisition machine, hand the prompt to the local inference server,
// report success or failure.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::acquisition::ModelAcquisition;
use super::LocalLlmError;
use crate::config::Config;
use crate::errors::AppError;
use crate::llm::{approx_tokens, AiClient, CompletionRequest, CompletionResponse};

/// Client for the local inference server (OpenAI-compatible endpoint).
pub struct LocalLlmClient {
    http_client: HttpClient,
    base_url: String,
    acquisition: Arc<ModelAcquisition>,
}

#[derive(Debug, Serialize)]
struct LocalChatRequest {
    model: String,
    messages: Vec<LocalChatMessage>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct LocalChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct LocalChatResponse {
    choices: Vec<LocalChatChoice>,
    usage: Option<LocalChatUsage>,
}

#[derive(Debug, Deserialize)]
struct LocalChatChoice {
    message: Option<LocalChatMessage>,
}

#[derive(Debug, Deserialize)]
struct LocalChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl LocalLlmClient {
    pub fn from_config(
        config: &Config,
        acquisition: Arc<ModelAcquisition>,
    ) -> Result<Self, LocalLlmError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.local_timeout_secs))
            .build()
            .map_err(|e| LocalLlmError::ServerUnavailable(format!("HTTP client error: {e}")))?;
        Ok(Self {
            http_client,
            base_url: format!(
                "http://{}:{}",
                config.local_server_host, config.local_server_port
            ),
            acquisition,
        })
    }
}

#[async_trait]
impl AiClient for LocalLlmClient {
    #[instrument(skip(self, request))]
    async fn complete(
        &self,
        model_id: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AppError> {
        // The acquisition machine is the only coupling to the model file; no
        // valid file means the local tier cannot serve yet.
        let model_path = self.acquisition.model_path().await?;
        debug!(model = %model_path.display(), "running local inference");

        let body = LocalChatRequest {
            model: model_id.to_string(),
            messages: vec![
                LocalChatMessage {
                    role: "system".to_string(),
                    content: request.system_prompt.clone(),
                },
                LocalChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            max_tokens: request.max_output_tokens,
            stream: false,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LocalLlmError::ServerUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                LocalLlmError::InferenceFailed(format!("status {status} from local server")).into(),
            );
        }

        let parsed: LocalChatResponse = response
            .json()
            .await
            .map_err(|e| LocalLlmError::InferenceFailed(format!("malformed response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(LocalLlmError::InferenceFailed("empty completion".to_string()).into());
        }

        let (prompt_tokens, completion_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                approx_tokens(&request.prompt) + approx_tokens(&request.system_prompt),
                approx_tokens(&text),
            ),
        };

        Ok(CompletionResponse {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

// src/llm/cloud.rs
// Cloud chat-completion client. The remote API is an external collaborator;
// the only contract in scope is this wire shape.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{approx_tokens, AiClient, CompletionRequest, CompletionResponse};
use crate::config::Config;
use crate::errors::AppError;

/// Client for the hosted chat-completion API, parameterized per call by the
/// tier's model id.
pub struct CloudLlmClient {
    http_client: HttpClient,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Option<ChatCompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl CloudLlmClient {
    /// Builds the client from config.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be constructed.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.cloud_timeout_secs))
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client error: {e}")))?;

        Ok(Self {
            http_client,
            base_url: config.cloud_api_base_url.clone(),
            api_key: config.cloud_api_key.clone(),
        })
    }
}

#[async_trait]
impl AiClient for CloudLlmClient {
    #[instrument(skip(self, request), fields(model = %model_id))]
    async fn complete(
        &self,
        model_id: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: model_id.to_string(),
            messages: vec![
                ChatCompletionMessage {
                    role: "system".to_string(),
                    content: request.system_prompt.clone(),
                },
                ChatCompletionMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let mut http_request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key.expose_secret());
        }

        let response = http_request
            .send()
            .await
            .map_err(|e| AppError::CloudApi(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(%status, "cloud completion returned non-success status");
            return Err(AppError::CloudApi(format!("status {status}: {detail}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::CloudApi(format!("malformed response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .unwrap_or_default();

        let (prompt_tokens, completion_tokens) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (
                approx_tokens(&request.prompt) + approx_tokens(&request.system_prompt),
                approx_tokens(&text),
            ),
        };

        debug!(prompt_tokens, completion_tokens, "cloud completion succeeded");
        Ok(CompletionResponse {
            text,
            prompt_tokens,
            completion_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_system_and_user_roles() {
        let body = ChatCompletionRequest {
            model: "wellcoach-pro".to_string(),
            messages: vec![
                ChatCompletionMessage {
                    role: "system".to_string(),
                    content: "you are a coach".to_string(),
                },
                ChatCompletionMessage {
                    role: "user".to_string(),
                    content: "hello".to_string(),
                },
            ],
            max_tokens: 512,
            temperature: 0.7,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "wellcoach-pro");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn response_parses_without_usage_block() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.usage.is_none());
        assert_eq!(
            parsed.choices[0].message.as_ref().unwrap().content,
            "hi"
        );
    }
}

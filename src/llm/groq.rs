//! Groq chat-completions client
//!
//! Speaks the OpenAI-compatible `/chat/completions` API.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::CompletionConfig;
use crate::error::ChatbotError;
use crate::llm::{ChatTurn, CompletionProvider};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Reusable Groq client (connection-pooled)
pub struct GroqClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GroqClient {
    pub fn new(config: &CompletionConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone().unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait::async_trait]
impl CompletionProvider for GroqClient {
    async fn complete(&self, messages: &[ChatTurn], max_tokens: u32) -> crate::Result<String> {
        if self.api_key.is_empty() {
            return Err(ChatbotError::ProviderAuth("GROQ_API_KEY not configured".to_string()));
        }

        let request = CompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens,
            temperature: 0.7,
        };

        debug!(model = %self.model, messages = messages.len(), "Calling completion API");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Completion request failed: {}", e);
                ChatbotError::ProviderUnavailable(format!("completion request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Completion API error response ({}): {}", status, error_text);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ChatbotError::ProviderAuth(format!("{}: {}", status, error_text))
                }
                _ => ChatbotError::ProviderUnavailable(format!("{}: {}", status, error_text)),
            });
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            error!("Failed to parse completion response: {}", e);
            ChatbotError::ProviderUnavailable(format!("completion parse error: {}", e))
        })?;

        let answer = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                ChatbotError::ProviderUnavailable("empty response from completion API".to_string())
            })?;

        if let Some(usage) = completion.usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Completion received"
            );
        }

        Ok(answer)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

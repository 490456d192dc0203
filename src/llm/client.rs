//! LLM client trait and the Groq implementation.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::types::{GenerationConfig, LlmResponse, TokenUsage};

/// Text generation client.
///
/// One provider, one trait; the pipeline never routes between providers.
/// Implementations must be `Send + Sync` for use across request handlers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt.
    async fn generate(&self, prompt: &str, config: GenerationConfig) -> Result<LlmResponse>;

    /// Stream a completion as text chunks in token order. The receiver is
    /// closed when generation finishes; an error mid-stream closes it early.
    async fn generate_stream(
        &self,
        prompt: &str,
        config: GenerationConfig,
    ) -> Result<mpsc::Receiver<Result<String>>>;

    /// Model identifier used for responses.
    fn model_name(&self) -> &str;

    /// Provider label for logs and response metadata.
    fn provider(&self) -> &str;
}

/// Groq client (OpenAI-compatible chat completions API).
pub struct GroqClient {
    api_key: String,
    model: String,
    base_url: String,
    http: Client,
}

impl GroqClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.groq.com/openai";
    const DEFAULT_MODEL: &'static str = "openai/gpt-oss-20b";
    const REQUEST_TIMEOUT_SECS: u64 = 60;

    pub fn new(api_key: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            api_key: api_key.into(),
            model: Self::DEFAULT_MODEL.to_string(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            http,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn classify_http_error(status: reqwest::StatusCode, body: &str) -> Error {
        let message = match serde_json::from_str::<GroqError>(body) {
            Ok(parsed) => format!("Groq API error ({status}): {}", parsed.error.message),
            Err(_) => format!("Groq API error ({status}): {body}"),
        };
        let transient = status.as_u16() == 429
            || status.is_server_error()
            || status.as_u16() == 408;
        Error::Llm { message, transient }
    }
}

// Groq API types (OpenAI-compatible)
#[derive(Debug, Serialize)]
struct GroqRequest {
    model: String,
    messages: Vec<GroqMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroqMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GroqResponse {
    model: String,
    choices: Vec<GroqChoice>,
    usage: Option<GroqUsage>,
}

#[derive(Debug, Deserialize)]
struct GroqChoice {
    message: GroqMessage,
}

#[derive(Debug, Deserialize)]
struct GroqUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct GroqError {
    error: GroqErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GroqErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GroqStreamEvent {
    choices: Vec<GroqStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct GroqStreamChoice {
    delta: GroqStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct GroqStreamDelta {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for GroqClient {
    async fn generate(&self, prompt: &str, config: GenerationConfig) -> Result<LlmResponse> {
        let request = GroqRequest {
            model: self.model.clone(),
            messages: vec![GroqMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream: false,
        };

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                // Connection and timeout failures are worth retrying
                Error::llm_transient(format!("HTTP request failed: {e}"))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_transient(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_http_error(status, &body));
        }

        let parsed: GroqResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_permanent(format!("Failed to parse response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_permanent("No choices in response"))?;

        if choice.message.content.trim().is_empty() {
            return Err(Error::llm_transient("Empty content in response"));
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        debug!(
            model = %parsed.model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "[llm] completion finished"
        );

        Ok(LlmResponse {
            text: choice.message.content,
            model: parsed.model,
            usage,
        })
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        config: GenerationConfig,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let request = GroqRequest {
            model: self.model.clone(),
            messages: vec![GroqMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stream: true,
        };

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::llm_transient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_http_error(status, &body));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::llm_transient(format!("Stream error: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE frames are newline-delimited "data: {...}" lines
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<GroqStreamEvent>(payload) {
                        Ok(event) => {
                            let text = event
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.clone())
                                .unwrap_or_default();
                            if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                                // Consumer dropped; abort the stream
                                return;
                            }
                        }
                        Err(e) => warn!("[llm] skipping malformed stream event: {e}"),
                    }
                }
            }
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> &str {
        "groq"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let client = GroqClient::new("key")
            .with_model("openai/gpt-oss-120b")
            .with_base_url("http://localhost:9999");
        assert_eq!(client.model_name(), "openai/gpt-oss-120b");
        assert_eq!(client.provider(), "groq");
        assert_eq!(
            client.completions_url(),
            "http://localhost:9999/v1/chat/completions"
        );
    }

    #[test]
    fn test_http_error_classification() {
        let too_many = reqwest::StatusCode::TOO_MANY_REQUESTS;
        assert!(GroqClient::classify_http_error(too_many, "{}").is_transient());

        let unavailable = reqwest::StatusCode::SERVICE_UNAVAILABLE;
        assert!(GroqClient::classify_http_error(unavailable, "{}").is_transient());

        let unauthorized = reqwest::StatusCode::UNAUTHORIZED;
        assert!(!GroqClient::classify_http_error(unauthorized, "{}").is_transient());
    }

    #[test]
    fn test_error_body_message_extracted() {
        let body = r#"{"error": {"message": "quota exceeded"}}"#;
        let err = GroqClient::classify_http_error(reqwest::StatusCode::FORBIDDEN, body);
        assert!(err.to_string().contains("quota exceeded"));
    }
}

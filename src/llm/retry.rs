//! Retry with exponential backoff for transient LLM failures.

use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::client::LlmClient;
use super::types::{GenerationConfig, LlmInfo, LlmResponse};

/// Backoff policy for transient upstream errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Keywords that mark an error message as retriable even when the error
/// kind itself did not carry a transient flag.
const TRANSIENT_MARKERS: [&str; 7] = [
    "rate limit",
    "429",
    "timeout",
    "503",
    "connection",
    "overloaded",
    "temporarily unavailable",
];

fn is_retriable(error: &Error) -> bool {
    if error.is_transient() {
        return true;
    }
    let message = error.to_string().to_lowercase();
    TRANSIENT_MARKERS.iter().any(|kw| message.contains(kw))
}

/// Generate with retry on transient errors.
///
/// Sleeps with `tokio::time::sleep`, so cancellation of the surrounding
/// task aborts both the in-flight request and any pending backoff.
pub async fn generate_with_retry(
    client: &dyn LlmClient,
    prompt: &str,
    config: GenerationConfig,
    policy: RetryPolicy,
) -> Result<(LlmResponse, LlmInfo)> {
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        info!(
            provider = client.provider(),
            attempt = attempt + 1,
            max = policy.max_attempts,
            "[llm] generation attempt"
        );

        match client.generate(prompt, config).await {
            Ok(response) => {
                let info = LlmInfo {
                    provider: client.provider().to_string(),
                    model: response.model.clone(),
                    usage: response.usage,
                    attempts: attempt + 1,
                };
                return Ok((response, info));
            }
            Err(e) => {
                warn!(
                    provider = client.provider(),
                    attempt = attempt + 1,
                    error = %e,
                    "[llm] generation failed"
                );
                let retriable = is_retriable(&e);
                last_error = Some(e);
                if !retriable || attempt + 1 == policy.max_attempts {
                    break;
                }
                let delay = policy.delay_for_attempt(attempt);
                info!(delay_ms = delay.as_millis() as u64, "[llm] backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Internal("retry loop without attempts".into())))
}

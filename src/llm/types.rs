//! LLM request and response types.

use serde::{Deserialize, Serialize};

/// Generation parameters carried on every call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 3000,
        }
    }
}

impl GenerationConfig {
    pub fn new(temperature: f64, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Provider summary attached to pipeline responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmInfo {
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Attempts actually made, including the successful one
    pub attempts: u32,
}

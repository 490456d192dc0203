//! LLM collaborator: client trait, Groq implementation and retry policy.

mod client;
mod retry;
mod types;

pub use client::{GroqClient, LlmClient};
pub use retry::{generate_with_retry, RetryPolicy};
pub use types::{GenerationConfig, LlmInfo, LlmResponse, TokenUsage};

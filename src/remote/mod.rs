//! Outbound language-model calls

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};
use crate::error::RemoteError;

pub use client::{OpenAiClient, RemoteSettings};

/// Sampling parameters forwarded unchanged to the remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: DEFAULT_TOP_P,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// A single prompt-in, text-out call against a language model
///
/// Implementations must be safe to share between concurrently running chains.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str, params: &ModelParams) -> Result<String, RemoteError>;
}

//! HTTP client for OpenAI-compatible chat completion endpoints.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CompletionClient, ModelParams};
use crate::config::{CONNECT_TIMEOUT, DEFAULT_BASE_URL, REMOTE_CALL_TIMEOUT};
use crate::error::RemoteError;

/// Endpoint and credentials for [`OpenAiClient`]
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: String,
}

impl RemoteSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }
}

/// Thin wrapper around a configured `reqwest::Client`
///
/// Authorization is installed as a default header, so every request built from
/// this client carries the bearer token.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    completions_url: Url,
    http: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(settings: &RemoteSettings) -> Result<Self> {
        let completions_url = completions_url(&settings.base_url)?;

        let mut default_headers = header::HeaderMap::new();
        let authorization = format!("Bearer {}", settings.api_key);
        default_headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&authorization)
                .context("API key contains characters not allowed in a header")?,
        );

        let http = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REMOTE_CALL_TIMEOUT)
            .user_agent(concat!("llm-chain-executor/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;

        Ok(Self {
            completions_url,
            http,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, prompt: &str, params: &ModelParams) -> Result<String, RemoteError> {
        let body = build_request(prompt, params);
        debug!(url = %self.completions_url, model = %params.model, "sending completion request");

        let response = self
            .http
            .post(self.completions_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        extract_content(&text)
    }
}

fn completions_url(base_url: &str) -> Result<Url> {
    let trimmed = base_url.trim_end_matches('/');
    let url = Url::parse(&format!("{trimmed}/chat/completions"))
        .with_context(|| format!("Invalid base URL '{base_url}'"))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if matches!(url.host_str(), Some("localhost" | "127.0.0.1")) => Ok(url),
        other => Err(anyhow!(
            "Base URL must use https (got '{other}' for host {:?})",
            url.host_str()
        )),
    }
}

fn build_request<'a>(prompt: &'a str, params: &'a ModelParams) -> ChatRequest<'a> {
    ChatRequest {
        model: &params.model,
        messages: [ChatMessage {
            role: "user",
            content: prompt,
        }],
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        top_p: params.top_p,
        frequency_penalty: params.frequency_penalty,
        presence_penalty: params.presence_penalty,
    }
}

fn classify_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_builder() {
        RemoteError::Fatal(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

/// Map a non-success HTTP status to the retry taxonomy
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), snippet);
    match status.as_u16() {
        408 | 409 | 429 => RemoteError::Transient(message),
        code if code >= 500 => RemoteError::Transient(message),
        _ => RemoteError::Fatal(message),
    }
}

fn extract_content(body: &str) -> Result<String, RemoteError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::Fatal(format!("unexpected response body: {e}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| RemoteError::Fatal("response contained no message content".to_string()))
}

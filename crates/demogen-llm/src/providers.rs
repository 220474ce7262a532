//! HTTP Completion Providers
//!
//! Concrete clients for OpenAI, Anthropic, and local OpenAI-compatible
//! servers (vLLM, Ollama in OpenAI mode). The model comes from each call;
//! `*_MODEL` environment variables pin every call to one model instead.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use crate::{CompletionError, CompletionService};

const SYSTEM_PROMPT: &str = "You write realistic synthetic business documents for an analytics \
                             demo. Follow the requested title, language, length and format exactly.";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub api_key: String,
    pub base_url: Option<String>,
    /// Replaces the per-source model name on every call when set.
    pub model_override: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: usize,
    pub temperature: f32,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Anthropic,
    Local,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderConfigError {
    #[error("No completion provider configured. Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or LOCAL_LLM_URL, or run with --offline")]
    NoProviderConfigured,
    #[error("Invalid provider configuration: {0}")]
    Invalid(String),
}

impl ProviderConfig {
    /// Load from environment variables
    pub fn from_env() -> Result<Self, ProviderConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProviderConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            let mut config = Self::openai(&key);
            config.base_url = lookup("OPENAI_BASE_URL");
            config.model_override = lookup("OPENAI_MODEL");
            return Ok(config);
        }

        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            let mut config = Self::anthropic(&key);
            config.model_override = lookup("ANTHROPIC_MODEL");
            return Ok(config);
        }

        if let Some(url) = lookup("LOCAL_LLM_URL") {
            let mut config = Self::local(&url);
            config.model_override = lookup("LOCAL_LLM_MODEL");
            return Ok(config);
        }

        Err(ProviderConfigError::NoProviderConfigured)
    }

    pub fn openai(api_key: &str) -> Self {
        Self {
            provider: Provider::OpenAI,
            api_key: api_key.to_string(),
            base_url: None,
            model_override: None,
            timeout_secs: 120,
            max_tokens: 2048,
            temperature: 0.7,
            max_concurrency: 8,
        }
    }

    pub fn anthropic(api_key: &str) -> Self {
        Self {
            provider: Provider::Anthropic,
            ..Self::openai(api_key)
        }
    }

    pub fn local(url: &str) -> Self {
        Self {
            provider: Provider::Local,
            api_key: String::new(),
            base_url: Some(url.trim_end_matches('/').to_string()),
            timeout_secs: 300,
            max_concurrency: 2,
            ..Self::openai("")
        }
    }

    fn model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_override.as_deref().unwrap_or(requested)
    }
}

fn http_client(config: &ProviderConfig) -> Result<Client, ProviderConfigError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| ProviderConfigError::Invalid(format!("failed to create HTTP client: {e}")))
}

/// Map non-success statuses; 429 carries the server's retry hint.
async fn check_status(response: Response, default_retry_secs: u64) -> Result<Response, CompletionError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default_retry_secs);
        return Err(CompletionError::RateLimited {
            retry_after_ms: retry_after * 1000,
        });
    }
    if status.is_server_error() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(CompletionError::Unavailable(format!("{status}: {error_text}")));
    }
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(CompletionError::Api(format!("{status}: {error_text}")));
    }
    Ok(response)
}

fn network_err(e: reqwest::Error) -> CompletionError {
    if e.is_timeout() {
        CompletionError::Network(format!("request timed out: {e}"))
    } else {
        CompletionError::Network(e.to_string())
    }
}

fn non_empty(content: Option<&str>) -> Result<String, CompletionError> {
    match content {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(CompletionError::Empty),
    }
}

// ============================================================================
// OpenAI Provider
// ============================================================================

pub struct OpenAIClient {
    client: Client,
    config: ProviderConfig,
}

impl OpenAIClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderConfigError> {
        let client = http_client(&config)?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        match self.config.provider {
            Provider::Local => format!(
                "{}/v1/chat/completions",
                self.config.base_url.as_deref().unwrap_or("http://localhost:8000")
            ),
            _ => format!(
                "{}/chat/completions",
                self.config
                    .base_url
                    .as_deref()
                    .unwrap_or("https://api.openai.com/v1")
            ),
        }
    }
}

#[async_trait]
impl CompletionService for OpenAIClient {
    fn name(&self) -> &str {
        match self.config.provider {
            Provider::Local => "local",
            _ => "openai",
        }
    }

    fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String, CompletionError> {
        let body = serde_json::json!({
            "model": self.config.model(model),
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = request.send().await.map_err(network_err)?;
        let response = check_status(response, 60).await?;
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        non_empty(data["choices"][0]["message"]["content"].as_str())
    }
}

// ============================================================================
// Anthropic Provider
// ============================================================================

pub struct AnthropicClient {
    client: Client,
    config: ProviderConfig,
}

impl AnthropicClient {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderConfigError> {
        let client = http_client(&config)?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CompletionService for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<String, CompletionError> {
        let body = serde_json::json!({
            "model": self.config.model(model),
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(network_err)?;
        let response = check_status(response, 60).await?;
        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        non_empty(data["content"][0]["text"].as_str())
    }
}

// ============================================================================
// Provider Selection
// ============================================================================

/// Build the client matching `config.provider`.
pub fn from_config(config: ProviderConfig) -> Result<Box<dyn CompletionService>, ProviderConfigError> {
    Ok(match config.provider {
        Provider::OpenAI | Provider::Local => Box::new(OpenAIClient::new(config)?),
        Provider::Anthropic => Box::new(AnthropicClient::new(config)?),
    })
}

pub fn from_env() -> Result<Box<dyn CompletionService>, ProviderConfigError> {
    from_config(ProviderConfig::from_env()?)
}

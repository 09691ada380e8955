//! Provider client trait and HTTP implementations.
//!
//! Each provider exposes the same narrow capability set — `analyze`,
//! `embed`, `health_check` — so the gateway can route across them with
//! tagged variants instead of inheritance. Errors are mapped to typed
//! [`ProviderError`]s at this boundary; the gateway classifies them.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{ProviderError, ProviderErrorKind, Result};

use super::types::{AnalyzeRequest, CallUsage, Provider, ProviderResponse, ResponseFormat};

/// Capability set every LLM provider implements.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Run a completion against this provider.
    async fn analyze(&self, request: AnalyzeRequest) -> Result<ProviderResponse>;

    /// Produce an embedding vector for a text.
    async fn embed(&self, text: &str, task_type: &str) -> Result<Vec<f32>>;

    /// Produce embeddings for several texts. Providers with a batch
    /// endpoint override this; the default loops.
    async fn embed_batch(&self, texts: &[String], task_type: &str) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text, task_type).await?);
        }
        Ok(vectors)
    }

    /// Probe the provider with a trivial request.
    async fn health_check(&self) -> Result<bool>;

    /// Tag for this provider.
    fn provider(&self) -> Provider;
}

/// Configuration shared by the HTTP provider clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Model or deployment identifier
    pub model: String,
    /// Max output tokens per call
    pub max_output_tokens: u32,
    /// Per-request HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            max_output_tokens: 8192,
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Map an HTTP status to a provider error kind.
fn kind_for_status(status: reqwest::StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 => ProviderErrorKind::Authentication,
        403 => ProviderErrorKind::PermissionDenied,
        404 => ProviderErrorKind::ModelNotFound,
        400 | 422 => ProviderErrorKind::BadRequest,
        408 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::RateLimited,
        503 => ProviderErrorKind::ServiceUnavailable,
        504 => ProviderErrorKind::DeadlineExceeded,
        s if s >= 500 => ProviderErrorKind::ServerError,
        _ => ProviderErrorKind::BadRequest,
    }
}

/// Map a reqwest transport failure to a provider error.
fn transport_error(provider: Provider, e: reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else if e.is_connect() {
        ProviderErrorKind::ConnectionFailed
    } else {
        ProviderErrorKind::ConnectionFailed
    };
    ProviderError::new(provider, kind, format!("HTTP request failed: {}", e)).with_source(e)
}

/// Strip markdown code fences from a model response before JSON parsing.
///
/// Gemini in particular wraps JSON output in ```json fences.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(inner) = rest.rsplit_once("```") {
            return inner.0.trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(inner) = rest.rsplit_once("```") {
            return inner.0.trim();
        }
    }
    trimmed
}

/// Parse provider text into the response payload for the requested format.
///
/// A JSON parse failure is a permanent error — the provider produced
/// unusable output and retrying the same provider will not help.
pub fn payload_for_format(
    provider: Provider,
    text: &str,
    format: ResponseFormat,
) -> Result<Value> {
    match format {
        ResponseFormat::Text => Ok(serde_json::json!({ "response": text })),
        ResponseFormat::Json => {
            let cleaned = strip_code_fences(text);
            serde_json::from_str(cleaned).map_err(|e| {
                ProviderError::new(
                    provider,
                    ProviderErrorKind::MalformedResponse,
                    format!("response is not valid JSON: {}", e),
                )
                .into()
            })
        }
    }
}

// ---------------------------------------------------------------------
// Claude
// ---------------------------------------------------------------------

/// Anthropic Claude client — the clinical-reasoning workhorse.
pub struct ClaudeClient {
    config: ClientConfig,
    http: Client,
}

impl ClaudeClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    messages: Vec<ClaudeMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    model: String,
    content: Vec<ClaudeContent>,
    usage: ClaudeUsage,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ClaudeErrorBody {
    error: ClaudeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ClaudeErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl ProviderClient for ClaudeClient {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<ProviderResponse> {
        let api_request = ClaudeRequest {
            model: self.config.model.clone(),
            messages: vec![ClaudeMessage {
                role: "user".to_string(),
                content: request.prompt,
            }],
            max_tokens: self.config.max_output_tokens,
            system: request.system_prompt,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Claude, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Claude, e))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ClaudeErrorBody>(&body) {
                Ok(err) => format!("{}: {}", err.error.error_type, err.error.message),
                Err(_) => body,
            };
            return Err(
                ProviderError::new(Provider::Claude, kind_for_status(status), message).into(),
            );
        }

        let api_response: ClaudeResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                Provider::Claude,
                ProviderErrorKind::MalformedResponse,
                format!("failed to parse response envelope: {}", e),
            )
        })?;

        let text = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let payload = payload_for_format(Provider::Claude, &text, request.response_format)?;

        Ok(ProviderResponse {
            payload,
            usage: CallUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
                model: api_response.model,
            },
        })
    }

    async fn embed(&self, _text: &str, _task_type: &str) -> Result<Vec<f32>> {
        Err(ProviderError::new(
            Provider::Claude,
            ProviderErrorKind::InvalidArgument,
            "Claude does not provide an embedding API; embeddings route through Gemini",
        )
        .into())
    }

    async fn health_check(&self) -> Result<bool> {
        let probe = AnalyzeRequest::new("Reply with OK.")
            .with_temperature(0.0)
            .with_response_format(ResponseFormat::Text);
        Ok(self.analyze(probe).await.is_ok())
    }

    fn provider(&self) -> Provider {
        Provider::Claude
    }
}

// ---------------------------------------------------------------------
// Gemini
// ---------------------------------------------------------------------

/// Google Gemini client — general text tasks and embeddings.
pub struct GeminiClient {
    config: ClientConfig,
    http: Client,
    embed_dim: usize,
}

impl GeminiClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";
    const EMBED_MODEL: &'static str = "text-embedding-004";

    pub fn new(config: ClientConfig, embed_dim: usize) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self {
            config,
            http,
            embed_dim,
        }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    async fn embed_inner(&self, texts: &[String], task_type: &str) -> Result<Vec<Vec<f32>>> {
        let requests: Vec<Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": format!("models/{}", Self::EMBED_MODEL),
                    "content": { "parts": [{ "text": t }] },
                    "taskType": task_type,
                    "outputDimensionality": self.embed_dim,
                })
            })
            .collect();

        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents?key={}",
            self.base_url(),
            Self::EMBED_MODEL,
            self.config.api_key
        );

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| transport_error(Provider::Gemini, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Gemini, e))?;

        if !status.is_success() {
            return Err(
                ProviderError::new(Provider::Gemini, kind_for_status(status), body).into(),
            );
        }

        let parsed: GeminiEmbedResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                Provider::Gemini,
                ProviderErrorKind::MalformedResponse,
                format!("failed to parse embedding response: {}", e),
            )
        })?;

        Ok(parsed.embeddings.into_iter().map(|e| e.values).collect())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: u64,
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedResponse {
    embeddings: Vec<GeminiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct GeminiEmbedding {
    values: Vec<f32>,
}

#[async_trait]
impl ProviderClient for GeminiClient {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<ProviderResponse> {
        let system_instruction = request.system_prompt.map(|s| GeminiContent {
            role: "user".to_string(),
            parts: vec![GeminiPart { text: s }],
        });

        let api_request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.prompt,
                }],
            }],
            system_instruction,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.config.max_output_tokens,
                temperature: request.temperature,
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url(),
            self.config.model,
            self.config.api_key
        );
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Gemini, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Gemini, e))?;

        if !status.is_success() {
            return Err(
                ProviderError::new(Provider::Gemini, kind_for_status(status), body).into(),
            );
        }

        let api_response: GeminiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                Provider::Gemini,
                ProviderErrorKind::MalformedResponse,
                format!("failed to parse response envelope: {}", e),
            )
        })?;

        let candidate = api_response.candidates.first().ok_or_else(|| {
            ProviderError::new(
                Provider::Gemini,
                ProviderErrorKind::MalformedResponse,
                "no candidates in response",
            )
        })?;

        let text = candidate
            .content
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let payload = payload_for_format(Provider::Gemini, &text, request.response_format)?;

        let usage_metadata = api_response.usage_metadata;
        Ok(ProviderResponse {
            payload,
            usage: CallUsage {
                input_tokens: usage_metadata
                    .as_ref()
                    .map(|u| u.prompt_token_count)
                    .unwrap_or(0),
                output_tokens: usage_metadata
                    .and_then(|u| u.candidates_token_count)
                    .unwrap_or(0),
                latency_ms: started.elapsed().as_millis() as u64,
                model: self.config.model.clone(),
            },
        })
    }

    async fn embed(&self, text: &str, task_type: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_inner(&[text.to_string()], task_type).await?;
        vectors.pop().ok_or_else(|| {
            ProviderError::new(
                Provider::Gemini,
                ProviderErrorKind::MalformedResponse,
                "empty embedding batch",
            )
            .into()
        })
    }

    /// One API call for the whole batch.
    async fn embed_batch(&self, texts: &[String], task_type: &str) -> Result<Vec<Vec<f32>>> {
        self.embed_inner(texts, task_type).await
    }

    async fn health_check(&self) -> Result<bool> {
        let probe = AnalyzeRequest::new("Reply with OK.")
            .with_temperature(0.0)
            .with_response_format(ResponseFormat::Text);
        Ok(self.analyze(probe).await.is_ok())
    }

    fn provider(&self) -> Provider {
        Provider::Gemini
    }
}

// ---------------------------------------------------------------------
// Azure OpenAI
// ---------------------------------------------------------------------

/// Azure OpenAI client — fallback for both clinical and general tasks.
pub struct AzureOpenAiClient {
    config: ClientConfig,
    http: Client,
    api_version: String,
}

impl AzureOpenAiClient {
    const DEFAULT_API_VERSION: &'static str = "2024-06-01";

    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self {
            config,
            http,
            api_version: Self::DEFAULT_API_VERSION.to_string(),
        }
    }

    fn endpoint(&self) -> Result<&str> {
        self.config.base_url.as_deref().ok_or_else(|| {
            ProviderError::new(
                Provider::AzureOpenAi,
                ProviderErrorKind::InvalidArgument,
                "Azure OpenAI requires an endpoint base URL",
            )
            .into()
        })
    }
}

#[derive(Debug, Serialize)]
struct AzureRequest {
    messages: Vec<AzureMessage>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AzureMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AzureResponse {
    model: Option<String>,
    choices: Vec<AzureChoice>,
    usage: AzureUsage,
}

#[derive(Debug, Deserialize)]
struct AzureChoice {
    message: AzureMessage,
}

#[derive(Debug, Deserialize)]
struct AzureUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl ProviderClient for AzureOpenAiClient {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<ProviderResponse> {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt {
            messages.push(AzureMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(AzureMessage {
            role: "user".to_string(),
            content: request.prompt,
        });

        let api_request = AzureRequest {
            messages,
            max_tokens: self.config.max_output_tokens,
            temperature: request.temperature,
        };

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint()?,
            self.config.model,
            self.api_version
        );
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .header("api-key", &self.config.api_key)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| transport_error(Provider::AzureOpenAi, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::AzureOpenAi, e))?;

        if !status.is_success() {
            return Err(
                ProviderError::new(Provider::AzureOpenAi, kind_for_status(status), body).into(),
            );
        }

        let api_response: AzureResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                Provider::AzureOpenAi,
                ProviderErrorKind::MalformedResponse,
                format!("failed to parse response envelope: {}", e),
            )
        })?;

        let choice = api_response.choices.first().ok_or_else(|| {
            ProviderError::new(
                Provider::AzureOpenAi,
                ProviderErrorKind::MalformedResponse,
                "no choices in response",
            )
        })?;

        let payload =
            payload_for_format(Provider::AzureOpenAi, &choice.message.content, request.response_format)?;

        Ok(ProviderResponse {
            payload,
            usage: CallUsage {
                input_tokens: api_response.usage.prompt_tokens,
                output_tokens: api_response.usage.completion_tokens,
                latency_ms: started.elapsed().as_millis() as u64,
                model: api_response
                    .model
                    .unwrap_or_else(|| self.config.model.clone()),
            },
        })
    }

    async fn embed(&self, _text: &str, _task_type: &str) -> Result<Vec<f32>> {
        Err(ProviderError::new(
            Provider::AzureOpenAi,
            ProviderErrorKind::InvalidArgument,
            "embeddings route through the Gemini channel",
        )
        .into())
    }

    async fn health_check(&self) -> Result<bool> {
        let probe = AnalyzeRequest::new("Reply with OK.")
            .with_temperature(0.0)
            .with_response_format(ResponseFormat::Text);
        Ok(self.analyze(probe).await.is_ok())
    }

    fn provider(&self) -> Provider {
        Provider::AzureOpenAi
    }
}

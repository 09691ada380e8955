//! Types for LLM requests, responses, routing, and usage accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// LLM provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Gemini,
    AzureOpenAi,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Gemini => write!(f, "gemini"),
            Self::AzureOpenAi => write!(f, "azure_openai"),
        }
    }
}

/// Task category used as the gateway routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    PolicyReasoning,
    AppealStrategy,
    AppealDrafting,
    SummaryGeneration,
    DataExtraction,
    Notification,
    PolicyQa,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PolicyReasoning => "policy_reasoning",
            Self::AppealStrategy => "appeal_strategy",
            Self::AppealDrafting => "appeal_drafting",
            Self::SummaryGeneration => "summary_generation",
            Self::DataExtraction => "data_extraction",
            Self::Notification => "notification",
            Self::PolicyQa => "policy_qa",
        };
        write!(f, "{}", s)
    }
}

/// Expected response format from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Json,
    Text,
}

/// Correlation id propagated from the caller's request context into
/// usage records so all LLM calls for one case/request can be joined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single provider invocation.
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub response_format: ResponseFormat,
}

impl AnalyzeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: 0.3,
            response_format: ResponseFormat::Text,
        }
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }
}

/// Token usage and latency for one provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub model: String,
}

/// Raw result of one provider call, before gateway post-processing.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Parsed JSON object (json mode) or `{"response": "..."}` (text mode)
    pub payload: Value,
    pub usage: CallUsage,
}

/// Gateway-level response: the provider payload plus routing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub payload: Value,
    pub provider: Provider,
    pub task_category: TaskCategory,
    pub usage: CallUsage,
}

impl GatewayResponse {
    /// The `response` string for text-mode results (empty if absent).
    pub fn text(&self) -> &str {
        self.payload
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// One row of LLM usage accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub case_id: Option<String>,
    pub correlation_id: String,
    pub provider: Provider,
    pub model: String,
    pub task_category: TaskCategory,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Per-provider token pricing (USD per million tokens).
#[derive(Debug, Clone, Copy)]
pub struct TokenPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl TokenPricing {
    /// Cost of a call at this pricing.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_m
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_m
    }

    /// Pricing for a provider's configured default model.
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Claude => Self {
                input_per_m: 3.0,
                output_per_m: 15.0,
            },
            Provider::Gemini => Self {
                input_per_m: 0.10,
                output_per_m: 0.40,
            },
            Provider::AzureOpenAi => Self {
                input_per_m: 2.5,
                output_per_m: 10.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_display_matches_serde() {
        assert_eq!(Provider::Claude.to_string(), "claude");
        assert_eq!(Provider::AzureOpenAi.to_string(), "azure_openai");
        assert_eq!(
            serde_json::to_string(&Provider::AzureOpenAi).unwrap(),
            "\"azure_openai\""
        );
    }

    #[test]
    fn test_task_category_display() {
        assert_eq!(TaskCategory::PolicyReasoning.to_string(), "policy_reasoning");
        assert_eq!(TaskCategory::PolicyQa.to_string(), "policy_qa");
        assert_eq!(TaskCategory::DataExtraction.to_string(), "data_extraction");
    }

    #[test]
    fn test_cost_calculation() {
        let pricing = TokenPricing {
            input_per_m: 3.0,
            output_per_m: 15.0,
        };
        let cost = pricing.cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);

        let cost = pricing.cost(10_000, 2_000);
        assert!((cost - (0.03 + 0.03)).abs() < 1e-9);
    }

    #[test]
    fn test_gateway_response_text() {
        let resp = GatewayResponse {
            payload: serde_json::json!({"response": "hello"}),
            provider: Provider::Gemini,
            task_category: TaskCategory::SummaryGeneration,
            usage: CallUsage::default(),
        };
        assert_eq!(resp.text(), "hello");

        let resp = GatewayResponse {
            payload: serde_json::json!({"coverage_status": "covered"}),
            provider: Provider::Claude,
            task_category: TaskCategory::PolicyReasoning,
            usage: CallUsage::default(),
        };
        assert_eq!(resp.text(), "");
    }
}

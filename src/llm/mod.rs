//! LLM gateway: task-based provider routing, circuit breakers, and
//! usage accounting.

pub mod client;
pub mod gateway;
pub mod types;

pub use client::{
    AzureOpenAiClient, ClaudeClient, ClientConfig, GeminiClient, ProviderClient,
};
pub use gateway::{CircuitBreaker, GenerateOptions, LlmGateway, RoutingTable, UsageSink};
pub use types::{
    AnalyzeRequest, CallUsage, CorrelationId, GatewayResponse, Provider, ProviderResponse,
    ResponseFormat, TaskCategory, TokenPricing, UsageRecord,
};

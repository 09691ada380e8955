//! Central gateway for LLM requests with task-based provider routing.
//!
//! Routes each task category to an ordered provider preference list:
//! clinical reasoning tasks prefer Claude, general text tasks prefer
//! Gemini, Azure OpenAI backs both. A per-provider circuit breaker skips
//! providers after repeated consecutive failures, and every error chain
//! is classified transient-vs-permanent before deciding whether to retry
//! the same provider or fall through to the next one.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{is_transient_error, Error, Result};

use super::client::ProviderClient;
use super::types::{
    AnalyzeRequest, CorrelationId, GatewayResponse, Provider, ResponseFormat, TaskCategory,
    TokenPricing, UsageRecord,
};

/// Ordered provider preference lists per task category.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<TaskCategory, Vec<Provider>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        use Provider::*;
        use TaskCategory::*;
        let mut routes = HashMap::new();
        routes.insert(PolicyReasoning, vec![Claude, AzureOpenAi]);
        routes.insert(AppealStrategy, vec![Claude, AzureOpenAi]);
        routes.insert(AppealDrafting, vec![Gemini, AzureOpenAi]);
        routes.insert(SummaryGeneration, vec![Gemini, AzureOpenAi]);
        routes.insert(DataExtraction, vec![Gemini, AzureOpenAi]);
        routes.insert(Notification, vec![Gemini, AzureOpenAi]);
        routes.insert(PolicyQa, vec![Claude]);
        Self { routes }
    }
}

impl RoutingTable {
    /// Providers for a task, in preference order. Unknown categories fall
    /// back to the general-text route.
    pub fn providers_for(&self, task: TaskCategory) -> Vec<Provider> {
        self.routes
            .get(&task)
            .cloned()
            .unwrap_or_else(|| vec![Provider::Gemini, Provider::AzureOpenAi])
    }

    /// Replace the route for one task category.
    pub fn set_route(&mut self, task: TaskCategory, providers: Vec<Provider>) {
        self.routes.insert(task, providers);
    }
}

/// Per-provider consecutive-failure state.
#[derive(Debug, Clone, Copy)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Instant,
}

/// Process-wide circuit breaker over the provider set.
///
/// A breaker opens after `threshold` consecutive failures and stays open
/// for `cooldown`; cooldown expiry resets the state and lets one probe
/// request through. Any success closes the breaker immediately.
pub struct CircuitBreaker {
    states: Mutex<HashMap<Provider, BreakerState>>,
    threshold: u32,
    cooldown: std::time::Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: std::time::Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            threshold,
            cooldown,
        }
    }

    /// Whether the provider should currently be skipped.
    pub fn is_open(&self, provider: Provider) -> bool {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        let Some(state) = states.get(&provider).copied() else {
            return false;
        };
        if state.consecutive_failures < self.threshold {
            return false;
        }
        let elapsed = state.last_failure.elapsed();
        if elapsed >= self.cooldown {
            info!(
                provider = %provider,
                elapsed_s = elapsed.as_secs(),
                "circuit breaker cooldown expired, resetting for probe"
            );
            states.remove(&provider);
            return false;
        }
        warn!(
            provider = %provider,
            consecutive_failures = state.consecutive_failures,
            remaining_cooldown_s = (self.cooldown - elapsed).as_secs(),
            "circuit breaker OPEN, skipping provider"
        );
        true
    }

    pub fn record_failure(&self, provider: Provider) {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        let state = states.entry(provider).or_insert(BreakerState {
            consecutive_failures: 0,
            last_failure: Instant::now(),
        });
        state.consecutive_failures += 1;
        state.last_failure = Instant::now();
        info!(
            provider = %provider,
            consecutive_failures = state.consecutive_failures,
            circuit_will_open = state.consecutive_failures >= self.threshold,
            "provider failure recorded"
        );
    }

    pub fn record_success(&self, provider: Provider) {
        let mut states = self.states.lock().expect("breaker lock poisoned");
        if states.remove(&provider).is_some() {
            debug!(provider = %provider, "provider failure counter reset");
        }
    }

    /// Drop all breaker state (test hook).
    pub fn reset(&self) {
        self.states.lock().expect("breaker lock poisoned").clear();
    }
}

/// Sink for best-effort usage accounting rows.
pub trait UsageSink: Send + Sync {
    fn record_usage(&self, record: &UsageRecord) -> Result<()>;
}

/// Request-scoped metadata attached to usage rows.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub correlation_id: Option<CorrelationId>,
    pub case_id: Option<String>,
}

impl GenerateOptions {
    pub fn for_case(case_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(CorrelationId::new()),
            case_id: Some(case_id.into()),
        }
    }
}

/// The LLM gateway.
pub struct LlmGateway {
    providers: HashMap<Provider, Arc<dyn ProviderClient>>,
    routing: RoutingTable,
    breaker: CircuitBreaker,
    usage_sink: Option<Arc<dyn UsageSink>>,
    settings: Settings,
}

impl LlmGateway {
    pub fn new(settings: Settings) -> Self {
        let breaker = CircuitBreaker::new(
            settings.circuit_breaker_threshold,
            settings.circuit_breaker_cooldown(),
        );
        Self {
            providers: HashMap::new(),
            routing: RoutingTable::default(),
            breaker,
            usage_sink: None,
            settings,
        }
    }

    /// Register a provider implementation.
    pub fn with_provider(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.providers.insert(client.provider(), client);
        self
    }

    /// Override the routing table.
    pub fn with_routing_table(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    /// Attach a usage accounting sink.
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    /// The circuit breaker (exposed for tests and health endpoints).
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Generate content using the appropriate provider for the task.
    ///
    /// The whole call — including the single same-provider retry — runs
    /// under one wall-clock timeout; retries never extend the deadline.
    pub async fn generate(
        &self,
        task_category: TaskCategory,
        prompt: impl Into<String>,
        system_prompt: Option<String>,
        temperature: f64,
        response_format: ResponseFormat,
    ) -> Result<GatewayResponse> {
        self.generate_with_options(
            task_category,
            prompt,
            system_prompt,
            temperature,
            response_format,
            GenerateOptions::default(),
        )
        .await
    }

    /// [`generate`](Self::generate) with correlation/case metadata.
    pub async fn generate_with_options(
        &self,
        task_category: TaskCategory,
        prompt: impl Into<String>,
        system_prompt: Option<String>,
        temperature: f64,
        response_format: ResponseFormat,
        options: GenerateOptions,
    ) -> Result<GatewayResponse> {
        let timeout = self.settings.llm_gateway_timeout();
        let prompt = prompt.into();
        match tokio::time::timeout(
            timeout,
            self.generate_inner(
                task_category,
                prompt,
                system_prompt,
                temperature,
                response_format,
                options,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    task_category = %task_category,
                    timeout_s = timeout.as_secs(),
                    "gateway call timed out"
                );
                Err(Error::timeout(timeout.as_secs()))
            }
        }
    }

    async fn generate_inner(
        &self,
        task_category: TaskCategory,
        prompt: String,
        system_prompt: Option<String>,
        temperature: f64,
        response_format: ResponseFormat,
        options: GenerateOptions,
    ) -> Result<GatewayResponse> {
        let providers = self.routing.providers_for(task_category);
        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_default();

        info!(
            correlation_id = %correlation_id,
            task_category = %task_category,
            providers = ?providers.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "routing LLM request"
        );

        let mut last_error: Option<Error> = None;

        for provider in providers {
            if self.breaker.is_open(provider) {
                continue;
            }
            let Some(client) = self.providers.get(&provider) else {
                warn!(provider = %provider, "provider routed but not registered");
                continue;
            };

            let request = AnalyzeRequest {
                prompt: prompt.clone(),
                system_prompt: system_prompt.clone(),
                temperature,
                response_format,
            };

            match client.analyze(request).await {
                Ok(response) => {
                    self.breaker.record_success(provider);
                    self.record_usage(provider, task_category, &response.usage, &options);
                    info!(
                        correlation_id = %correlation_id,
                        provider = %provider,
                        task_category = %task_category,
                        "provider succeeded"
                    );
                    return Ok(GatewayResponse {
                        payload: response.payload,
                        provider,
                        task_category,
                        usage: response.usage,
                    });
                }
                Err(e) => {
                    let transient = is_transient_error(&e);
                    warn!(
                        correlation_id = %correlation_id,
                        provider = %provider,
                        task_category = %task_category,
                        classification = if transient { "transient" } else { "permanent" },
                        error = %e,
                        "provider failed"
                    );

                    if !transient {
                        last_error = Some(e);
                        self.breaker.record_failure(provider);
                        continue;
                    }

                    // Transient: retry the SAME provider once after a
                    // short fixed backoff, still under the outer deadline.
                    tokio::time::sleep(self.settings.transient_retry_delay()).await;
                    let retry_request = AnalyzeRequest {
                        prompt: prompt.clone(),
                        system_prompt: system_prompt.clone(),
                        temperature,
                        response_format,
                    };
                    match client.analyze(retry_request).await {
                        Ok(response) => {
                            self.breaker.record_success(provider);
                            self.record_usage(provider, task_category, &response.usage, &options);
                            return Ok(GatewayResponse {
                                payload: response.payload,
                                provider,
                                task_category,
                                usage: response.usage,
                            });
                        }
                        Err(retry_err) => {
                            warn!(
                                correlation_id = %correlation_id,
                                provider = %provider,
                                error = %retry_err,
                                "transient retry also failed, moving to next provider"
                            );
                            last_error = Some(retry_err);
                            self.breaker.record_failure(provider);
                            continue;
                        }
                    }
                }
            }
        }

        Err(Error::gateway_exhausted(
            task_category.to_string(),
            last_error.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        ))
    }

    fn record_usage(
        &self,
        provider: Provider,
        task_category: TaskCategory,
        usage: &super::types::CallUsage,
        options: &GenerateOptions,
    ) {
        let Some(sink) = &self.usage_sink else {
            return;
        };
        let pricing = TokenPricing::for_provider(provider);
        let record = UsageRecord {
            id: Uuid::new_v4().to_string(),
            case_id: options.case_id.clone(),
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_default()
                .to_string(),
            provider,
            model: usage.model.clone(),
            task_category,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: pricing.cost(usage.input_tokens, usage.output_tokens),
            latency_ms: usage.latency_ms,
            created_at: Utc::now(),
        };
        // Accounting must never fail the call it describes.
        if let Err(e) = sink.record_usage(&record) {
            warn!(error = %e, "usage recording failed");
        }
    }

    /// Analyze policy with Claude-first routing and deterministic settings.
    pub async fn analyze_policy(
        &self,
        prompt: impl Into<String>,
        system_prompt: Option<String>,
        options: GenerateOptions,
    ) -> Result<GatewayResponse> {
        self.generate_with_options(
            TaskCategory::PolicyReasoning,
            prompt,
            system_prompt,
            0.0,
            ResponseFormat::Json,
            options,
        )
        .await
    }

    /// Summarize text through the general-text route.
    pub async fn summarize(&self, prompt: impl Into<String>) -> Result<String> {
        let response = self
            .generate(
                TaskCategory::SummaryGeneration,
                prompt,
                None,
                0.2,
                ResponseFormat::Text,
            )
            .await?;
        Ok(response.text().to_string())
    }

    /// Produce an embedding via the Gemini channel.
    pub async fn embed(&self, text: &str, task_type: &str) -> Result<Vec<f32>> {
        let client = self.providers.get(&Provider::Gemini).ok_or_else(|| {
            Error::Config("embedding requires a registered Gemini provider".to_string())
        })?;
        client.embed(text, task_type).await
    }

    /// Produce embeddings for several texts in one provider call.
    pub async fn embed_batch(&self, texts: &[String], task_type: &str) -> Result<Vec<Vec<f32>>> {
        let client = self.providers.get(&Provider::Gemini).ok_or_else(|| {
            Error::Config("embedding requires a registered Gemini provider".to_string())
        })?;
        client.embed_batch(texts, task_type).await
    }

    /// Cosine similarity between two vectors.
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
        let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    /// Probe every registered provider; never errors.
    pub async fn health_check(&self) -> HashMap<Provider, bool> {
        let mut results = HashMap::new();
        for (provider, client) in &self.providers {
            let healthy = client.health_check().await.unwrap_or(false);
            results.insert(*provider, healthy);
        }
        results
    }

    /// Summarize total spend from a usage row set (analytics helper).
    pub fn total_cost(records: &[UsageRecord]) -> serde_json::Value {
        let total: f64 = records.iter().map(|r| r.cost_usd).sum();
        let input: u64 = records.iter().map(|r| r.input_tokens).sum();
        let output: u64 = records.iter().map(|r| r.output_tokens).sum();
        json!({
            "total_cost_usd": total,
            "input_tokens": input,
            "output_tokens": output,
            "calls": records.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scriptable mock provider for gateway and reasoner tests.

    use super::*;
    use crate::error::{ProviderError, ProviderErrorKind};
    use crate::llm::types::{CallUsage, ProviderResponse};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One scripted outcome for a mock call.
    pub enum MockOutcome {
        Ok(Value),
        Err(ProviderErrorKind),
    }

    /// A provider that replays scripted outcomes in order, repeating the
    /// last one when the script runs out.
    pub struct MockProvider {
        provider: Provider,
        script: Vec<MockOutcome>,
        pub calls: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(provider: Provider, script: Vec<MockOutcome>) -> Self {
            Self {
                provider,
                script,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always_ok(provider: Provider, payload: Value) -> Self {
            Self::new(provider, vec![MockOutcome::Ok(payload)])
        }

        pub fn always_err(provider: Provider, kind: ProviderErrorKind) -> Self {
            Self::new(provider, vec![MockOutcome::Err(kind)])
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        async fn analyze(&self, _request: AnalyzeRequest) -> Result<ProviderResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .script
                .get(n)
                .or_else(|| self.script.last())
                .expect("mock script must not be empty");
            match outcome {
                MockOutcome::Ok(payload) => Ok(ProviderResponse {
                    payload: payload.clone(),
                    usage: CallUsage {
                        input_tokens: 100,
                        output_tokens: 50,
                        latency_ms: 5,
                        model: "mock".to_string(),
                    },
                }),
                MockOutcome::Err(kind) => {
                    Err(ProviderError::new(self.provider, *kind, "scripted failure").into())
                }
            }
        }

        async fn embed(&self, _text: &str, _task_type: &str) -> Result<Vec<f32>> {
            Ok(vec![0.0; 768])
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn provider(&self) -> Provider {
            self.provider
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{MockOutcome, MockProvider};
    use super::*;
    use crate::error::ProviderErrorKind;
    use serde_json::json;

    fn fast_settings() -> Settings {
        Settings::default()
            .with_gateway_timeout_secs(5)
            .with_transient_retry_delay_secs(0)
    }

    #[tokio::test]
    async fn test_generate_routes_to_first_provider() {
        let gateway = LlmGateway::new(fast_settings())
            .with_provider(Arc::new(MockProvider::always_ok(
                Provider::Claude,
                json!({"coverage_status": "covered"}),
            )))
            .with_provider(Arc::new(MockProvider::always_ok(
                Provider::AzureOpenAi,
                json!({"coverage_status": "unknown"}),
            )));

        let response = gateway
            .generate(
                TaskCategory::PolicyReasoning,
                "assess",
                None,
                0.0,
                ResponseFormat::Json,
            )
            .await
            .unwrap();

        assert_eq!(response.provider, Provider::Claude);
        assert_eq!(response.payload["coverage_status"], "covered");
        assert_eq!(response.task_category, TaskCategory::PolicyReasoning);
    }

    #[tokio::test]
    async fn test_permanent_error_falls_through_without_retry() {
        let claude = Arc::new(MockProvider::always_err(
            Provider::Claude,
            ProviderErrorKind::Authentication,
        ));
        let azure = Arc::new(MockProvider::always_ok(
            Provider::AzureOpenAi,
            json!({"ok": true}),
        ));
        let gateway = LlmGateway::new(fast_settings())
            .with_provider(claude.clone())
            .with_provider(azure.clone());

        let response = gateway
            .generate(
                TaskCategory::PolicyReasoning,
                "assess",
                None,
                0.0,
                ResponseFormat::Json,
            )
            .await
            .unwrap();

        assert_eq!(response.provider, Provider::AzureOpenAi);
        // Permanent error: exactly one attempt on Claude, no same-provider retry
        assert_eq!(claude.call_count(), 1);
        assert_eq!(azure.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_provider_once() {
        let claude = Arc::new(MockProvider::new(
            Provider::Claude,
            vec![
                MockOutcome::Err(ProviderErrorKind::RateLimited),
                MockOutcome::Ok(json!({"ok": true})),
            ],
        ));
        let gateway = LlmGateway::new(fast_settings()).with_provider(claude.clone());

        let response = gateway
            .generate(
                TaskCategory::PolicyQa,
                "q",
                None,
                0.0,
                ResponseFormat::Json,
            )
            .await
            .unwrap();

        assert_eq!(response.provider, Provider::Claude);
        assert_eq!(claude.call_count(), 2);
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let gateway = LlmGateway::new(fast_settings())
            .with_provider(Arc::new(MockProvider::always_err(
                Provider::Claude,
                ProviderErrorKind::Authentication,
            )))
            .with_provider(Arc::new(MockProvider::always_err(
                Provider::AzureOpenAi,
                ProviderErrorKind::BadRequest,
            )));

        let err = gateway
            .generate(
                TaskCategory::PolicyReasoning,
                "assess",
                None,
                0.0,
                ResponseFormat::Json,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::GatewayExhausted { .. }));
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips_after_threshold() {
        let claude = Arc::new(MockProvider::always_err(
            Provider::Claude,
            ProviderErrorKind::Authentication,
        ));
        let azure = Arc::new(MockProvider::always_ok(Provider::AzureOpenAi, json!({})));
        let gateway = LlmGateway::new(fast_settings())
            .with_provider(claude.clone())
            .with_provider(azure.clone());

        // Three permanent failures trip the breaker.
        for _ in 0..3 {
            let _ = gateway
                .generate(
                    TaskCategory::PolicyReasoning,
                    "assess",
                    None,
                    0.0,
                    ResponseFormat::Json,
                )
                .await;
        }
        assert_eq!(claude.call_count(), 3);
        assert!(gateway.breaker().is_open(Provider::Claude));

        // The next call skips Claude entirely and routes to Azure.
        let response = gateway
            .generate(
                TaskCategory::PolicyReasoning,
                "assess",
                None,
                0.0,
                ResponseFormat::Json,
            )
            .await
            .unwrap();
        assert_eq!(response.provider, Provider::AzureOpenAi);
        assert_eq!(claude.call_count(), 3);
    }

    #[tokio::test]
    async fn test_circuit_breaker_cooldown_allows_probe() {
        let breaker = CircuitBreaker::new(3, std::time::Duration::from_millis(30));
        for _ in 0..3 {
            breaker.record_failure(Provider::Gemini);
        }
        assert!(breaker.is_open(Provider::Gemini));

        std::thread::sleep(std::time::Duration::from_millis(40));
        // Cooldown expired: breaker resets and a probe is allowed.
        assert!(!breaker.is_open(Provider::Gemini));
        assert!(!breaker.is_open(Provider::Gemini));
    }

    #[tokio::test]
    async fn test_breaker_success_resets_counter() {
        let breaker = CircuitBreaker::new(3, std::time::Duration::from_secs(60));
        breaker.record_failure(Provider::Claude);
        breaker.record_failure(Provider::Claude);
        breaker.record_success(Provider::Claude);
        breaker.record_failure(Provider::Claude);
        assert!(!breaker.is_open(Provider::Claude));
    }

    #[tokio::test]
    async fn test_gateway_timeout() {
        struct SlowProvider;
        #[async_trait::async_trait]
        impl ProviderClient for SlowProvider {
            async fn analyze(
                &self,
                _request: AnalyzeRequest,
            ) -> Result<crate::llm::types::ProviderResponse> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                unreachable!()
            }
            async fn embed(&self, _t: &str, _tt: &str) -> Result<Vec<f32>> {
                Ok(vec![])
            }
            async fn health_check(&self) -> Result<bool> {
                Ok(true)
            }
            fn provider(&self) -> Provider {
                Provider::Gemini
            }
        }

        tokio::time::pause();
        let settings = Settings::default().with_gateway_timeout_secs(1);
        let gateway = LlmGateway::new(settings).with_provider(Arc::new(SlowProvider));

        let call = gateway.generate(
            TaskCategory::SummaryGeneration,
            "summarize",
            None,
            0.2,
            ResponseFormat::Text,
        );
        let err = call.await.unwrap_err();
        assert!(matches!(err, Error::Timeout { duration_secs: 1 }));
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0_f32, 0.0, 0.0];
        let b = vec![1.0_f32, 0.0, 0.0];
        assert!((LlmGateway::cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);

        let c = vec![0.0_f32, 1.0, 0.0];
        assert!(LlmGateway::cosine_similarity(&a, &c).abs() < 1e-9);

        let zero = vec![0.0_f32; 3];
        assert_eq!(LlmGateway::cosine_similarity(&a, &zero), 0.0);
    }

    #[test]
    fn test_default_routing_prefers_claude_for_clinical_tasks() {
        let table = RoutingTable::default();
        assert_eq!(
            table.providers_for(TaskCategory::PolicyReasoning)[0],
            Provider::Claude
        );
        assert_eq!(
            table.providers_for(TaskCategory::AppealStrategy)[0],
            Provider::Claude
        );
        assert_eq!(
            table.providers_for(TaskCategory::PolicyQa),
            vec![Provider::Claude]
        );
        assert_eq!(
            table.providers_for(TaskCategory::SummaryGeneration)[0],
            Provider::Gemini
        );
    }
}

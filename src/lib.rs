//! # pa-core
//!
//! A prior-authorization case orchestration library: a versioned,
//! auditable, human-gated workflow engine that drives each PA case
//! through intake, policy analysis, AI recommendation, human decision,
//! strategy selection, action coordination, and monitoring — while
//! coordinating multiple LLM providers, a policy-criteria evaluator, a
//! deterministic strategy scorer, and an immutable audit chain.
//!
//! ## Core Components
//!
//! - **LLM Gateway**: task-based provider routing with circuit breakers
//!   and transient/permanent error classification
//! - **Policy Reasoner**: criterion-level coverage assessment under a
//!   conservative decision model — the AI never issues a denial
//! - **Strategy Scorer**: deterministic weighted scoring of candidate
//!   strategies (no LLM)
//! - **Strategic Intelligence**: similarity-matched historical analysis
//!   with compensating-factor discovery and DB-backed caching
//! - **Audit Chain**: hash-chained decision events per case
//! - **Case Store**: versioned persistence with snapshots and
//!   optimistic locking
//!
//! ## Example
//!
//! ```rust,ignore
//! use pa_core::{CaseOrchestrator, HumanDecision, HumanDecisionAction};
//!
//! let case = orchestrator.create_case(&patient_json, &medication_json)?;
//! let outcome = orchestrator.run_case(&case.case_id).await?;
//! if outcome.awaiting_human_decision {
//!     let decision = HumanDecision::new(HumanDecisionAction::Approve, "rev-42");
//!     orchestrator.resume_after_human_decision(&case.case_id, decision).await?;
//! }
//! ```

pub mod audit;
pub mod case;
pub mod config;
pub mod error;
pub mod events;
pub mod intelligence;
pub mod llm;
pub mod orchestrator;
pub mod policy;
pub mod prompt;
pub mod store;
pub mod strategy;
pub mod waypoint;

// Re-exports for convenience
pub use audit::{AuditLogger, AuditTrail, DecisionEvent, EventType};
pub use case::{
    CaseStage, CaseState, HumanDecision, HumanDecisionAction, IntakeAgent, MedicationRequest,
    PatientInfo, PayerState, PayerStatus,
};
pub use config::{ScoringWeights, Settings};
pub use error::{is_transient_error, Error, ProviderError, ProviderErrorKind, Result};
pub use events::{CaseEvent, CaseSubscription, EventHub};
pub use intelligence::{
    CaseOutcome, DiseaseSeverity, HistoricalCase, HistoricalCorpus, SimilarCase,
    StrategicInsights, StrategicIntelligenceAgent,
};
pub use llm::{
    AnalyzeRequest, AzureOpenAiClient, CallUsage, CircuitBreaker, ClaudeClient, ClientConfig,
    CorrelationId, GatewayResponse, GeminiClient, GenerateOptions, LlmGateway, Provider,
    ProviderClient, ResponseFormat, RoutingTable, TaskCategory, UsageRecord, UsageSink,
};
pub use orchestrator::{
    CaseOrchestrator, MockPayerGateway, PayerGateway, PayerResponse, ProgressStream, RunOutcome,
    StageDelta,
};
pub use policy::{
    CoverageAssessment, CoverageStatus, Criterion, CriterionAssessment, DigitizedPolicy,
    DocumentationGap, GapPriority, IterativeRefiner, PolicyAnalyzer, PolicyReasoner,
    PolicyRepository, RubricLoader,
};
pub use prompt::{PromptResult, PromptSource, PromptStore, RemotePromptSource};
pub use store::{CaseSnapshot, CaseStore, Database, PredictionOutcome};
pub use strategy::{Strategy, StrategyScore, StrategyScorer, StrategyStep, StrategyType};
pub use waypoint::WaypointWriter;

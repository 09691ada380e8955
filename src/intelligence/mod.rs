//! Strategic intelligence: similarity-based historical matching,
//! pattern analytics, compensating-factor discovery, and cached
//! insight synthesis.

pub mod agent;
pub mod patterns;
pub mod similarity;
pub mod types;

pub use agent::StrategicIntelligenceAgent;
pub use patterns::{analyze_patterns, compensating_factors, documentation_patterns, timing_patterns};
pub use similarity::{
    find_similar_cases, severity_similarity, treatment_similarity, MatchProfile,
    DEFAULT_MAX_RESULTS, DEFAULT_MIN_SIMILARITY,
};
pub use types::{
    default_factor_relationships, CaseOutcome, DiseaseSeverity, FactorRelationship,
    HistoricalCase, HistoricalCorpus, SimilarCase, StrategicInsights,
};

//! Access strategies: generation from templates and deterministic
//! weighted scoring.

pub mod scorer;
pub mod types;

pub use scorer::StrategyScorer;
pub use types::{
    ScoringWeights, Strategy, StrategyScore, StrategyStep, StrategyTemplate, StrategyType,
    STRATEGY_TEMPLATES,
};

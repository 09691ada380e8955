//! Access strategy types and the built-in templates.
//!
//! PA submissions must always follow primary-first order: parallel
//! submission breaks coordination of benefits and secondary-first
//! violates insurance sequencing rules, so the sequential primary-first
//! template is the only one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub use crate::config::ScoringWeights;

/// Types of access strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// The only valid approach
    SequentialPrimaryFirst,
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SequentialPrimaryFirst => write!(f, "sequential_primary_first"),
        }
    }
}

/// One step within a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyStep {
    pub step_number: u32,
    pub action_type: String,
    pub target_payer: String,
    pub description: String,
    /// Step numbers this step depends on
    #[serde(default)]
    pub dependencies: Vec<u32>,
    pub estimated_duration_hours: u32,
    pub success_criteria: String,
}

/// A candidate access strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub strategy_id: String,
    pub strategy_type: StrategyType,
    pub name: String,
    pub description: String,
    pub payer_sequence: Vec<String>,
    /// Always false; parallel submission is forbidden
    pub parallel_submission: bool,
    pub base_speed_score: f64,
    pub base_approval_score: f64,
    pub base_rework_risk: f64,
    pub base_patient_burden: f64,
    pub rationale: String,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub mitigation_strategies: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StrategyStep>,
}

/// Deterministic score for a strategy, with the adjustment ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyScore {
    pub strategy_id: String,
    pub case_id: String,
    pub speed_score: f64,
    pub approval_score: f64,
    pub rework_score: f64,
    pub patient_score: f64,
    /// Machine-readable adjustment deltas by name
    pub adjustments: BTreeMap<String, f64>,
    /// Human-readable adjustment reasons, in application order
    pub adjustment_reasoning: Vec<String>,
    pub total_score: f64,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub is_recommended: bool,
    #[serde(default)]
    pub recommendation_reasoning: Option<String>,
    pub weights_used: ScoringWeights,
}

/// A strategy template: base scores and narrative, with placeholder
/// payer slots expanded at generation time.
pub struct StrategyTemplate {
    pub strategy_type: StrategyType,
    pub name: &'static str,
    pub description: &'static str,
    pub payer_sequence: &'static [&'static str],
    pub base_speed_score: f64,
    pub base_approval_score: f64,
    pub base_rework_risk: f64,
    pub base_patient_burden: f64,
    pub rationale: &'static str,
    pub risk_factors: &'static [&'static str],
    pub mitigation_strategies: &'static [&'static str],
}

/// The built-in templates.
pub const STRATEGY_TEMPLATES: &[StrategyTemplate] = &[StrategyTemplate {
    strategy_type: StrategyType::SequentialPrimaryFirst,
    name: "Sequential (Primary First)",
    description: "Submit PA to primary insurance first, then coordinate with secondary \
                  after the primary determination",
    payer_sequence: &["PRIMARY", "SECONDARY"],
    base_speed_score: 6.0,
    base_approval_score: 7.0,
    base_rework_risk: 2.0,
    base_patient_burden: 3.0,
    rationale: "Standard sequencing keeps coordination of benefits clean and avoids \
                duplicate submissions",
    risk_factors: &[
        "Primary denial delays secondary submission",
        "Sequential timeline extends total decision time",
    ],
    mitigation_strategies: &[
        "Prepare secondary submission package while primary is pending",
        "Monitor primary status daily and appeal promptly on denial",
    ],
}];

impl Strategy {
    /// Instantiate a template over concrete payer names.
    pub fn from_template(
        template: &StrategyTemplate,
        primary_payer: Option<&str>,
        secondary_payer: Option<&str>,
    ) -> Self {
        let mut payer_sequence = Vec::new();
        for placeholder in template.payer_sequence {
            match (*placeholder, primary_payer, secondary_payer) {
                ("PRIMARY", Some(primary), _) => payer_sequence.push(primary.to_string()),
                ("SECONDARY", _, Some(secondary)) => payer_sequence.push(secondary.to_string()),
                _ => {}
            }
        }

        let name = match payer_sequence.first() {
            Some(first) => format!("Sequential ({} First)", first),
            None => template.name.to_string(),
        };
        let description = match payer_sequence.first() {
            Some(first) => template.description.replace("primary insurance", first),
            None => template.description.to_string(),
        };

        Self {
            strategy_id: Uuid::new_v4().to_string(),
            strategy_type: template.strategy_type,
            name,
            description,
            payer_sequence,
            parallel_submission: false,
            base_speed_score: template.base_speed_score,
            base_approval_score: template.base_approval_score,
            base_rework_risk: template.base_rework_risk,
            base_patient_burden: template.base_patient_burden,
            rationale: template.rationale.to_string(),
            risk_factors: template.risk_factors.iter().map(|s| s.to_string()).collect(),
            mitigation_strategies: template
                .mitigation_strategies
                .iter()
                .map(|s| s.to_string())
                .collect(),
            steps: Vec::new(),
        }
    }
}

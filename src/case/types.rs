//! Case state entities: the root aggregate and its embedded records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Stages in the case processing workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStage {
    Intake,
    PolicyAnalysis,
    CohortAnalysis,
    AiRecommendation,
    /// Human gate after policy analysis
    AwaitingHumanDecision,
    StrategyGeneration,
    StrategySelection,
    ActionCoordination,
    Monitoring,
    Recovery,
    Completed,
    Failed,
}

impl CaseStage {
    /// Whether the case has reached a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for CaseStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Intake => "intake",
            Self::PolicyAnalysis => "policy_analysis",
            Self::CohortAnalysis => "cohort_analysis",
            Self::AiRecommendation => "ai_recommendation",
            Self::AwaitingHumanDecision => "awaiting_human_decision",
            Self::StrategyGeneration => "strategy_generation",
            Self::StrategySelection => "strategy_selection",
            Self::ActionCoordination => "action_coordination",
            Self::Monitoring => "monitoring",
            Self::Recovery => "recovery",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Status of a prior authorization request with a payer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayerStatus {
    NotSubmitted,
    Submitted,
    PendingInfo,
    UnderReview,
    Approved,
    Denied,
    AppealSubmitted,
    AppealApproved,
    AppealDenied,
}

impl PayerStatus {
    /// Whether this status warrants another monitoring poll.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::PendingInfo | Self::UnderReview | Self::AppealSubmitted
        )
    }
}

/// Actions a human can take at a decision gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecisionAction {
    /// Approve the AI recommendation
    Approve,
    /// Reject the AI recommendation
    Reject,
    /// Override with a different decision
    Override,
    /// Escalate to a senior reviewer
    Escalate,
    /// Proceed with submission to the payer
    SubmitToPayer,
    /// Follow the AI recommendation as-is
    FollowRecommendation,
    /// Return to the provider for more documentation
    ReturnToProvider,
}

/// Record of a human decision at a gate checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanDecision {
    pub decision_id: String,
    pub stage: String,
    pub action: HumanDecisionAction,
    pub reviewer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl HumanDecision {
    pub fn new(action: HumanDecisionAction, reviewer_id: impl Into<String>) -> Self {
        Self {
            decision_id: Uuid::new_v4().to_string(),
            stage: String::new(),
            action,
            reviewer_id: reviewer_id.into(),
            reviewer_name: None,
            timestamp: Utc::now(),
            original_recommendation: None,
            override_reason: None,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_override_reason(mut self, reason: impl Into<String>) -> Self {
        self.override_reason = Some(reason.into());
        self
    }
}

/// Patient demographic and insurance information.
///
/// Immutable after intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientInfo {
    pub patient_id: String,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub primary_payer: String,
    pub primary_member_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_member_id: Option<String>,
    #[serde(default)]
    pub diagnosis_codes: Vec<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
    #[serde(default)]
    pub contraindications: Vec<String>,
}

/// Medication being requested for prior authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationRequest {
    pub medication_name: String,
    #[serde(default)]
    pub generic_name: String,
    #[serde(default)]
    pub ndc_code: String,
    pub dose: String,
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub duration: String,
    pub diagnosis: String,
    pub icd10_code: String,
    pub prescriber_npi: String,
    #[serde(default)]
    pub prescriber_name: String,
    #[serde(default)]
    pub clinical_rationale: String,
    #[serde(default)]
    pub prior_treatments: Vec<Value>,
    #[serde(default)]
    pub supporting_labs: Vec<Value>,
}

/// State of authorization with a specific payer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayerState {
    pub payer_name: String,
    pub status: PayerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_details: Option<Value>,
    #[serde(default)]
    pub required_documents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appeal_deadline: Option<DateTime<Utc>>,
}

impl PayerState {
    pub fn new(payer_name: impl Into<String>) -> Self {
        Self {
            payer_name: payer_name.into(),
            status: PayerStatus::NotSubmitted,
            reference_number: None,
            submitted_at: None,
            last_updated: None,
            response_details: None,
            required_documents: Vec::new(),
            denial_reason: None,
            appeal_deadline: None,
        }
    }
}

/// Versioned case state. Each mutation creates a new version with a
/// full snapshot; version numbers are strictly monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseState {
    pub case_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub stage: CaseStage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<PatientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medication: Option<MedicationRequest>,

    #[serde(default)]
    pub payer_states: HashMap<String, PayerState>,

    /// Analysis results keyed by payer, stored as serialized assessments
    #[serde(default)]
    pub coverage_assessments: HashMap<String, Value>,
    #[serde(default)]
    pub documentation_gaps: Vec<Value>,

    #[serde(default)]
    pub available_strategies: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_rationale: Option<String>,

    #[serde(default)]
    pub human_decisions: Vec<HumanDecision>,
    #[serde(default)]
    pub requires_human_decision: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_decision_reason: Option<String>,

    #[serde(default)]
    pub pending_actions: Vec<Value>,
    #[serde(default)]
    pub completed_actions: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CaseState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            case_id: format!("CASE-{}", Uuid::new_v4()),
            version: 1,
            created_at: now,
            updated_at: now,
            stage: CaseStage::Intake,
            patient: None,
            medication: None,
            payer_states: HashMap::new(),
            coverage_assessments: HashMap::new(),
            documentation_gaps: Vec::new(),
            available_strategies: Vec::new(),
            selected_strategy_id: None,
            strategy_rationale: None,
            human_decisions: Vec::new(),
            requires_human_decision: false,
            human_decision_reason: None,
            pending_actions: Vec::new(),
            completed_actions: Vec::new(),
            error_message: None,
            metadata: HashMap::new(),
        }
    }

    /// Ordered payer names, primary first.
    pub fn payer_order(&self) -> Vec<String> {
        let mut order = Vec::new();
        if let Some(patient) = &self.patient {
            if self.payer_states.contains_key(&patient.primary_payer) {
                order.push(patient.primary_payer.clone());
            }
            if let Some(secondary) = &patient.secondary_payer {
                if self.payer_states.contains_key(secondary) {
                    order.push(secondary.clone());
                }
            }
        }
        // Any remaining payers in stable name order.
        let mut rest: Vec<String> = self
            .payer_states
            .keys()
            .filter(|k| !order.contains(k))
            .cloned()
            .collect();
        rest.sort();
        order.extend(rest);
        order
    }

    /// The primary payer's name, if any.
    pub fn primary_payer(&self) -> Option<&str> {
        self.patient.as_ref().map(|p| p.primary_payer.as_str())
    }

    pub fn get_primary_payer_state(&self) -> Option<&PayerState> {
        self.primary_payer().and_then(|p| self.payer_states.get(p))
    }
}

impl Default for CaseState {
    fn default() -> Self {
        Self::new()
    }
}

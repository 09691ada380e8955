//! Historical-case corpus and strategic-insight types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Outcome of a historical PA case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Approved,
    Denied,
    InfoRequest,
}

/// Disease severity metrics attached to a case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiseaseSeverity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdai_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hbi_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub albumin: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fistula_present: Option<bool>,
}

impl DiseaseSeverity {
    pub fn is_empty(&self) -> bool {
        self.severity_classification.is_none()
            && self.cdai_score.is_none()
            && self.hbi_score.is_none()
            && self.crp.is_none()
            && self.esr.is_none()
            && self.albumin.is_none()
            && self.fistula_present.is_none()
    }
}

/// One record in the historical PA corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalCase {
    pub case_id: String,
    #[serde(default)]
    pub medication: MedicationRef,
    #[serde(default)]
    pub diagnosis: DiagnosisRef,
    #[serde(default)]
    pub payer: PayerRef,
    #[serde(default)]
    pub disease_severity: DiseaseSeverity,
    #[serde(default)]
    pub prior_treatments: Vec<TreatmentRef>,
    pub outcome: CaseOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_to_decision: Option<f64>,
    #[serde(default)]
    pub documentation_present: Vec<String>,
    #[serde(default)]
    pub documentation_missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    #[serde(default)]
    pub appeal_filed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appeal_outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_day_of_week: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicationRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosisRef {
    #[serde(default)]
    pub icd10_family: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayerRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreatmentRef {
    #[serde(default)]
    pub medication: String,
}

/// The historical corpus file: cases plus embedded pattern metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalCorpus {
    #[serde(default)]
    pub cases: Vec<HistoricalCase>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A historical case annotated with its similarity to the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarCase {
    pub case_id: String,
    pub similarity_score: f64,
    pub case_data: HistoricalCase,
    /// Per-component similarity scores
    pub similarity_breakdown: HashMap<String, f64>,
}

/// A configured compensating-factor relationship to test against the
/// corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorRelationship {
    pub missing_doc: String,
    pub compensating_factors: Vec<String>,
    pub description: String,
    pub clinical_rationale: String,
}

/// The default relationships, learned from PA specialist practice.
pub fn default_factor_relationships() -> Vec<FactorRelationship> {
    vec![
        FactorRelationship {
            missing_doc: "tb_screening".to_string(),
            compensating_factors: vec![
                "severe".to_string(),
                "high_crp".to_string(),
                "fistula".to_string(),
            ],
            description: "Disease severity can compensate for pending TB screening".to_string(),
            clinical_rationale: "Severe/urgent disease may warrant treatment initiation while \
                                 TB screening is obtained"
                .to_string(),
        },
        FactorRelationship {
            missing_doc: "fecal_calprotectin".to_string(),
            compensating_factors: vec![
                "endoscopy_within_180_days".to_string(),
                "colonoscopy_report".to_string(),
            ],
            description: "Recent endoscopy can substitute for fecal calprotectin".to_string(),
            clinical_rationale: "Direct visualization of mucosal disease is more definitive \
                                 than biomarkers"
                .to_string(),
        },
        FactorRelationship {
            missing_doc: "step_therapy".to_string(),
            compensating_factors: vec![
                "physician_attestation".to_string(),
                "urgency_documentation".to_string(),
                "step_therapy_exception_request".to_string(),
            ],
            description: "Physician attestation with urgency can bypass step therapy \
                          requirements"
                .to_string(),
            clinical_rationale: "Medical necessity exceptions exist for patients who cannot \
                                 safely wait for standard sequencing"
                .to_string(),
        },
    ]
}

/// Aggregated strategic insights for a case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategicInsights {
    pub similar_cases_count: usize,
    pub approval_rate_for_similar: f64,
    pub denial_rate_for_similar: f64,
    pub info_request_rate_for_similar: f64,
    pub avg_days_to_decision: f64,
    #[serde(default)]
    pub documentation_insights: Vec<Value>,
    #[serde(default)]
    pub payer_insights: Value,
    #[serde(default)]
    pub timing_recommendations: Value,
    #[serde(default)]
    pub risk_factors: Vec<Value>,
    #[serde(default)]
    pub recommended_actions: Vec<Value>,
    #[serde(default)]
    pub counterfactual_scenarios: Vec<Value>,
    #[serde(default)]
    pub reasoning_chain: Vec<Value>,
    pub confidence_score: f64,
    #[serde(default)]
    pub confidence_reasoning: String,
    #[serde(default)]
    pub compensating_factors: Vec<Value>,
    #[serde(default)]
    pub agentic_insights: Vec<Value>,
    #[serde(default)]
    pub evidence_summary: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corpus_deserialization_with_defaults() {
        let json = r#"{
            "cases": [
                {
                    "case_id": "H-001",
                    "medication": {"name": "infliximab"},
                    "diagnosis": {"icd10_family": "K50"},
                    "payer": {"name": "cigna"},
                    "outcome": "approved",
                    "days_to_decision": 5,
                    "documentation_present": ["tb_screening"]
                }
            ],
            "metadata": {"embedded_patterns": {"k": 1}}
        }"#;
        let corpus: HistoricalCorpus = serde_json::from_str(json).unwrap();
        assert_eq!(corpus.cases.len(), 1);
        let case = &corpus.cases[0];
        assert_eq!(case.outcome, CaseOutcome::Approved);
        assert!(case.documentation_missing.is_empty());
        assert!(case.disease_severity.is_empty());
        assert!(corpus.metadata.contains_key("embedded_patterns"));
    }

    #[test]
    fn test_default_relationships_cover_known_gaps() {
        let relationships = default_factor_relationships();
        assert_eq!(relationships.len(), 3);
        let docs: Vec<&str> = relationships.iter().map(|r| r.missing_doc.as_str()).collect();
        assert!(docs.contains(&"tb_screening"));
        assert!(docs.contains(&"fecal_calprotectin"));
        assert!(docs.contains(&"step_therapy"));
    }
}

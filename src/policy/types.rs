//! Digitized policy and coverage assessment types.
//!
//! The criterion-group tree is arena-style: groups and criteria live in
//! id-keyed maps and reference each other by id, never by pointer, so
//! arbitrarily nested (or buggy, cyclic) policies stay traversable.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Coverage assessment status.
///
/// Under the conservative decision model the AI never emits a final
/// denial: `NotCovered` is rewritten to `RequiresHumanReview` before an
/// assessment leaves the reasoner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    /// All criteria met, proceed with approval
    Covered,
    /// High confidence, may need PA
    LikelyCovered,
    /// Coverage available with prior auth
    RequiresPa,
    /// Coverage with specific conditions
    Conditional,
    /// Needs additional documentation (not denial)
    Pend,
    /// Policy doesn't cover — requires human review
    NotCovered,
    /// AI cannot determine — human must decide
    RequiresHumanReview,
    /// Insufficient information
    Unknown,
}

impl CoverageStatus {
    /// Parse the status string an LLM returned; `None` for unrecognized.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.trim().to_lowercase())).ok()
    }
}

impl std::fmt::Display for CoverageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Covered => "covered",
            Self::LikelyCovered => "likely_covered",
            Self::RequiresPa => "requires_pa",
            Self::Conditional => "conditional",
            Self::Pend => "pend",
            Self::NotCovered => "not_covered",
            Self::RequiresHumanReview => "requires_human_review",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A clinical code reference (ICD-10, CPT, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicalCode {
    pub system: String,
    pub code: String,
}

/// Numeric comparison for threshold criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub operator: String,
    pub value: f64,
    /// Upper bound for range comparisons
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_value: Option<f64>,
    #[serde(default)]
    pub unit: String,
}

/// A single leaf-level policy requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub criterion_type: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub policy_text: String,
    #[serde(default)]
    pub clinical_codes: Vec<ClinicalCode>,
    #[serde(default)]
    pub drug_names: Vec<String>,
    #[serde(default)]
    pub drug_classes: Vec<String>,
    #[serde(default)]
    pub allowed_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Threshold>,
    /// Minimum trial duration in days (step-therapy criteria)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_duration_days: Option<u32>,
    #[serde(default)]
    pub evidence_types: Vec<String>,
    #[serde(default = "default_true")]
    pub is_required: bool,
    /// Extraction confidence from policy digitization ("high"/"low"/...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_confidence: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Logical operator for a criterion group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperator {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// A named AND/OR node over atomic criteria and subgroups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionGroup {
    pub name: String,
    pub operator: GroupOperator,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub subgroups: Vec<String>,
}

/// A disqualifying condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionCriterion {
    pub exclusion_id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub policy_text: String,
    #[serde(default)]
    pub trigger_criteria: Vec<String>,
}

/// A step-therapy requirement for an indication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTherapyRequirement {
    pub requirement_id: String,
    pub indication: String,
    #[serde(default)]
    pub required_drugs: Vec<String>,
    #[serde(default)]
    pub required_drug_classes: Vec<String>,
    pub minimum_trials: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_duration_days: Option<u32>,
    #[serde(default = "default_true")]
    pub failure_required: bool,
    #[serde(default)]
    pub intolerance_acceptable: bool,
    #[serde(default)]
    pub contraindication_acceptable: bool,
}

/// A covered indication with its approval criteria entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indication {
    pub indication_name: String,
    #[serde(default)]
    pub indication_codes: Vec<ClinicalCode>,
    /// Root criterion group for initial approval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_approval_criteria: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age_years: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_years: Option<u32>,
}

/// A digitized payer policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigitizedPolicy {
    #[serde(default)]
    pub atomic_criteria: HashMap<String, Criterion>,
    #[serde(default)]
    pub criterion_groups: HashMap<String, CriterionGroup>,
    #[serde(default)]
    pub exclusions: Vec<ExclusionCriterion>,
    #[serde(default)]
    pub step_therapy_requirements: Vec<StepTherapyRequirement>,
    #[serde(default)]
    pub indications: Vec<Indication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DigitizedPolicy {
    /// Map criterion id → the OR-group ids it belongs to.
    pub fn or_group_memberships(&self) -> HashMap<String, Vec<String>> {
        let mut memberships: HashMap<String, Vec<String>> = HashMap::new();
        for (gid, group) in &self.criterion_groups {
            if group.operator == GroupOperator::Or {
                for cid in &group.criteria {
                    memberships.entry(cid.clone()).or_default().push(gid.clone());
                }
            }
        }
        for groups in memberships.values_mut() {
            groups.sort();
        }
        memberships
    }

    /// Recursively collect every criterion id reachable from a group.
    ///
    /// Guards a visited set so cyclic group references in buggy policies
    /// terminate instead of recursing forever.
    pub fn collect_group(&self, group_id: &str) -> std::collections::HashSet<String> {
        let mut collected = std::collections::HashSet::new();
        let mut visited = std::collections::HashSet::new();
        self.collect_group_inner(group_id, &mut visited, &mut collected);
        collected
    }

    fn collect_group_inner(
        &self,
        group_id: &str,
        visited: &mut std::collections::HashSet<String>,
        collected: &mut std::collections::HashSet<String>,
    ) {
        if !visited.insert(group_id.to_string()) {
            return;
        }
        let Some(group) = self.criterion_groups.get(group_id) else {
            return;
        };
        for cid in &group.criteria {
            collected.insert(cid.clone());
        }
        for sub in &group.subgroups {
            self.collect_group_inner(sub, visited, collected);
        }
    }
}

/// Assessment of one atomic criterion against the patient record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionAssessment {
    pub criterion_id: String,
    pub criterion_name: String,
    #[serde(default)]
    pub criterion_description: String,
    pub is_met: bool,
    pub confidence: f64,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Priority of a documentation gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPriority {
    High,
    Medium,
    Low,
}

impl Default for GapPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// A missing or incomplete piece of documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentationGap {
    pub gap_id: String,
    pub gap_type: String,
    pub description: String,
    #[serde(default)]
    pub required_for: Vec<String>,
    #[serde(default)]
    pub priority: GapPriority,
    #[serde(default)]
    pub suggested_action: String,
    #[serde(default)]
    pub estimated_resolution_complexity: String,
}

/// Complete per-payer coverage analysis result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageAssessment {
    pub assessment_id: String,
    pub payer_name: String,
    pub policy_name: String,
    pub medication_name: String,
    pub coverage_status: CoverageStatus,
    pub approval_likelihood: f64,
    #[serde(default)]
    pub approval_likelihood_reasoning: String,
    pub criteria_assessments: Vec<CriterionAssessment>,
    pub criteria_met_count: usize,
    pub criteria_total_count: usize,
    #[serde(default)]
    pub documentation_gaps: Vec<DocumentationGap>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub step_therapy_required: bool,
    #[serde(default)]
    pub step_therapy_options: Vec<String>,
    #[serde(default)]
    pub step_therapy_satisfied: bool,
    /// Raw policy text excerpt used for the analysis
    #[serde(default)]
    pub raw_policy_text: String,
    /// Raw LLM payload retained for replay/debugging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_raw_response: Option<Value>,
}

impl CoverageAssessment {
    pub fn new(payer_name: impl Into<String>, medication_name: impl Into<String>) -> Self {
        let payer_name = payer_name.into();
        Self {
            assessment_id: Uuid::new_v4().to_string(),
            policy_name: format!("{} Policy", payer_name),
            payer_name,
            medication_name: medication_name.into(),
            coverage_status: CoverageStatus::Unknown,
            approval_likelihood: 0.5,
            approval_likelihood_reasoning: String::new(),
            criteria_assessments: Vec::new(),
            criteria_met_count: 0,
            criteria_total_count: 0,
            documentation_gaps: Vec::new(),
            recommendations: Vec::new(),
            step_therapy_required: false,
            step_therapy_options: Vec::new(),
            step_therapy_satisfied: false,
            raw_policy_text: String::new(),
            llm_raw_response: None,
        }
    }

    /// Recompute the met/total counts from the criteria list.
    pub fn recount_criteria(&mut self) {
        self.criteria_met_count = self
            .criteria_assessments
            .iter()
            .filter(|c| c.is_met)
            .count();
        self.criteria_total_count = self.criteria_assessments.len();
    }

    /// Gaps that block approval.
    pub fn critical_gaps(&self) -> Vec<&DocumentationGap> {
        self.documentation_gaps
            .iter()
            .filter(|g| g.priority == GapPriority::High)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_status_parse() {
        assert_eq!(CoverageStatus::parse("covered"), Some(CoverageStatus::Covered));
        assert_eq!(
            CoverageStatus::parse("NOT_COVERED"),
            Some(CoverageStatus::NotCovered)
        );
        assert_eq!(
            CoverageStatus::parse("  requires_pa "),
            Some(CoverageStatus::RequiresPa)
        );
        assert_eq!(CoverageStatus::parse("definitely maybe"), None);
    }

    #[test]
    fn test_or_group_memberships() {
        let mut policy = DigitizedPolicy::default();
        policy.criterion_groups.insert(
            "G1".to_string(),
            CriterionGroup {
                name: "either lab".to_string(),
                operator: GroupOperator::Or,
                criteria: vec!["C1".to_string(), "C2".to_string()],
                subgroups: vec![],
            },
        );
        policy.criterion_groups.insert(
            "G2".to_string(),
            CriterionGroup {
                name: "all of".to_string(),
                operator: GroupOperator::And,
                criteria: vec!["C3".to_string()],
                subgroups: vec![],
            },
        );

        let memberships = policy.or_group_memberships();
        assert_eq!(memberships.get("C1").unwrap(), &vec!["G1".to_string()]);
        assert_eq!(memberships.get("C2").unwrap(), &vec!["G1".to_string()]);
        assert!(!memberships.contains_key("C3"));
    }

    #[test]
    fn test_collect_group_walks_subgroups() {
        let mut policy = DigitizedPolicy::default();
        policy.criterion_groups.insert(
            "ROOT".to_string(),
            CriterionGroup {
                name: "root".to_string(),
                operator: GroupOperator::And,
                criteria: vec!["C1".to_string()],
                subgroups: vec!["CHILD".to_string()],
            },
        );
        policy.criterion_groups.insert(
            "CHILD".to_string(),
            CriterionGroup {
                name: "child".to_string(),
                operator: GroupOperator::Or,
                criteria: vec!["C2".to_string(), "C3".to_string()],
                subgroups: vec![],
            },
        );

        let collected = policy.collect_group("ROOT");
        assert_eq!(collected.len(), 3);
        assert!(collected.contains("C2"));
    }

    #[test]
    fn test_collect_group_tolerates_cycles() {
        let mut policy = DigitizedPolicy::default();
        policy.criterion_groups.insert(
            "A".to_string(),
            CriterionGroup {
                name: "a".to_string(),
                operator: GroupOperator::And,
                criteria: vec!["C1".to_string()],
                subgroups: vec!["B".to_string()],
            },
        );
        // Buggy input: B points back at A.
        policy.criterion_groups.insert(
            "B".to_string(),
            CriterionGroup {
                name: "b".to_string(),
                operator: GroupOperator::And,
                criteria: vec!["C2".to_string()],
                subgroups: vec!["A".to_string()],
            },
        );

        let collected = policy.collect_group("A");
        assert_eq!(collected.len(), 2);
    }

    #[test]
    fn test_recount_criteria() {
        let mut assessment = CoverageAssessment::new("cigna", "adalimumab");
        assessment.criteria_assessments = vec![
            CriterionAssessment {
                criterion_id: "C1".to_string(),
                criterion_name: "dx".to_string(),
                criterion_description: String::new(),
                is_met: true,
                confidence: 0.9,
                supporting_evidence: vec![],
                gaps: vec![],
                reasoning: String::new(),
            },
            CriterionAssessment {
                criterion_id: "C2".to_string(),
                criterion_name: "labs".to_string(),
                criterion_description: String::new(),
                is_met: false,
                confidence: 0.4,
                supporting_evidence: vec![],
                gaps: vec![],
                reasoning: String::new(),
            },
        ];
        assessment.recount_criteria();
        assert_eq!(assessment.criteria_met_count, 1);
        assert_eq!(assessment.criteria_total_count, 2);
    }

    #[test]
    fn test_critical_gaps_filters_high_priority() {
        let mut assessment = CoverageAssessment::new("uhc", "infliximab");
        assessment.documentation_gaps = vec![
            DocumentationGap {
                gap_id: "g1".to_string(),
                gap_type: "lab".to_string(),
                description: "missing TB screening".to_string(),
                required_for: vec![],
                priority: GapPriority::High,
                suggested_action: String::new(),
                estimated_resolution_complexity: String::new(),
            },
            DocumentationGap {
                gap_id: "g2".to_string(),
                gap_type: "note".to_string(),
                description: "older clinical note".to_string(),
                required_for: vec![],
                priority: GapPriority::Low,
                suggested_action: String::new(),
                estimated_resolution_complexity: String::new(),
            },
        ];
        assert_eq!(assessment.critical_gaps().len(), 1);
    }
}

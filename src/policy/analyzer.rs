//! Policy analyzer: per-payer coverage assessment with evidence-gap
//! pre-scan and iterative refinement.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::case::types::CaseState;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::llm::{GenerateOptions, LlmGateway, ResponseFormat, TaskCategory};
use crate::prompt::PromptStore;

use super::reasoner::PolicyReasoner;
use super::refiner::IterativeRefiner;
use super::types::CoverageAssessment;

/// Keys copied from a raw patient record into the analysis context when
/// present. The richer clinical context lets the model spot screening
/// and documentation gaps.
const RAW_PATIENT_ENRICHMENT_KEYS: &[&str] = &[
    "pre_biologic_screening",
    "disease_activity",
    "clinical_history",
    "laboratory_results",
    "procedures",
    "documentation_gaps",
    "diagnoses",
    "prior_treatments",
];

/// Result of analyzing one payer, with the reasoning chain accumulated
/// along the way.
#[derive(Debug, Clone)]
pub struct PayerAnalysis {
    pub assessment: CoverageAssessment,
    pub reasoning_chain: Vec<String>,
    pub evidence_warnings: Vec<String>,
}

/// Drives assessment and refinement for each payer on a case.
pub struct PolicyAnalyzer {
    reasoner: Arc<PolicyReasoner>,
    prompt_store: Arc<PromptStore>,
    gateway: Arc<LlmGateway>,
    settings: Settings,
}

impl PolicyAnalyzer {
    pub fn new(
        reasoner: Arc<PolicyReasoner>,
        prompt_store: Arc<PromptStore>,
        gateway: Arc<LlmGateway>,
        settings: Settings,
    ) -> Self {
        Self {
            reasoner,
            prompt_store,
            gateway,
            settings,
        }
    }

    /// Build the patient analysis context from a case, enriched with any
    /// raw patient record carried in case metadata.
    pub fn build_patient_info(case: &CaseState) -> Result<Value> {
        let patient = case
            .patient
            .as_ref()
            .ok_or_else(|| Error::Validation("patient data required for analysis".to_string()))?;
        let medication = case
            .medication
            .as_ref()
            .ok_or_else(|| Error::Validation("medication data required for analysis".to_string()))?;

        let mut info = Map::new();
        info.insert("patient_id".to_string(), json!(patient.patient_id));
        info.insert(
            "name".to_string(),
            json!(format!("{} {}", patient.first_name, patient.last_name)),
        );
        info.insert("date_of_birth".to_string(), json!(patient.date_of_birth));
        info.insert("diagnosis_codes".to_string(), json!(patient.diagnosis_codes));
        info.insert("allergies".to_string(), json!(patient.allergies));
        info.insert(
            "contraindications".to_string(),
            json!(patient.contraindications),
        );
        info.insert("prior_treatments".to_string(), json!(medication.prior_treatments));
        info.insert("lab_results".to_string(), json!(medication.supporting_labs));

        // Soft fallback: missing raw patient data narrows the context
        // but never blocks analysis.
        if let Some(raw_patient) = case.metadata.get("raw_patient").and_then(Value::as_object) {
            for key in RAW_PATIENT_ENRICHMENT_KEYS {
                if let Some(value) = raw_patient.get(*key) {
                    info.entry(key.to_string()).or_insert_with(|| value.clone());
                }
            }
        }

        Ok(Value::Object(info))
    }

    /// Build the medication analysis context from a case.
    pub fn build_medication_info(case: &CaseState) -> Result<Value> {
        let medication = case
            .medication
            .as_ref()
            .ok_or_else(|| Error::Validation("medication data required for analysis".to_string()))?;
        Ok(json!({
            "medication_name": medication.medication_name,
            "generic_name": medication.generic_name,
            "ndc_code": medication.ndc_code,
            "dose": medication.dose,
            "frequency": medication.frequency,
            "route": medication.route,
            "duration": medication.duration,
            "diagnosis": medication.diagnosis,
            "icd10_code": medication.icd10_code,
            "prescriber_npi": medication.prescriber_npi,
            "prescriber_name": medication.prescriber_name,
            "clinical_rationale": medication.clinical_rationale,
        }))
    }

    /// Scan the patient record for documentation gaps before analysis.
    ///
    /// Best-effort: failures degrade to an empty warning list.
    pub async fn detect_evidence_gaps(
        &self,
        patient_info: &Value,
        options: GenerateOptions,
    ) -> Vec<String> {
        let mut variables: HashMap<String, Value> = HashMap::new();
        variables.insert("patient_info".to_string(), patient_info.clone());

        let prompt = match self
            .prompt_store
            .load("policy_analysis/evidence_gap_detection.txt", &variables)
        {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "evidence gap prompt unavailable, skipping pre-scan");
                return Vec::new();
            }
        };

        match self
            .gateway
            .generate_with_options(
                TaskCategory::DataExtraction,
                prompt,
                None,
                0.0,
                ResponseFormat::Json,
                options,
            )
            .await
        {
            Ok(response) => {
                let warnings: Vec<String> = response
                    .payload
                    .get("evidence_warnings")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                info!(
                    warning_count = warnings.len(),
                    readiness = response
                        .payload
                        .get("overall_readiness")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("unknown"),
                    "evidence gap detection complete"
                );
                warnings
            }
            Err(e) => {
                warn!(error = %e, "evidence gap detection failed, continuing without warnings");
                Vec::new()
            }
        }
    }

    /// Analyze a single payer: initial assessment plus refinement.
    pub async fn analyze_payer(
        &self,
        patient_info: &Value,
        medication_info: &Value,
        payer_name: &str,
        evidence_warnings: &[String],
        options: GenerateOptions,
    ) -> Result<PayerAnalysis> {
        let mut reasoning_chain = Vec::new();
        reasoning_chain.push(format!(
            "[PolicyAnalyzer] Running initial coverage assessment for {}",
            payer_name
        ));

        let assessment = self
            .reasoner
            .assess_coverage(
                patient_info,
                medication_info,
                payer_name,
                None,
                None,
                options.clone(),
            )
            .await?;

        reasoning_chain.push(format!(
            "[PolicyAnalyzer] {} initial result: status={}, likelihood={:.0}%, criteria={}/{}",
            payer_name,
            assessment.coverage_status,
            assessment.approval_likelihood * 100.0,
            assessment.criteria_met_count,
            assessment.criteria_total_count
        ));

        let refiner = IterativeRefiner::new(
            self.reasoner.as_ref(),
            self.settings.low_confidence_threshold,
            self.settings.max_refinement_iterations,
        );
        let assessment = refiner
            .refine(
                assessment,
                patient_info,
                medication_info,
                payer_name,
                evidence_warnings,
                &mut reasoning_chain,
                options,
            )
            .await?;

        info!(
            payer = payer_name,
            status = %assessment.coverage_status,
            likelihood = assessment.approval_likelihood,
            "payer analysis complete (post-refinement)"
        );

        Ok(PayerAnalysis {
            assessment,
            reasoning_chain,
            evidence_warnings: evidence_warnings.to_vec(),
        })
    }

    /// Aggregate unique documentation gaps across payer assessments,
    /// sorted by priority, annotated with the payers they affect.
    pub fn aggregate_documentation_gaps(
        assessments: &HashMap<String, CoverageAssessment>,
    ) -> Vec<Value> {
        let mut all_gaps: Vec<Value> = Vec::new();
        let mut payer_names: Vec<&String> = assessments.keys().collect();
        payer_names.sort();

        for payer_name in payer_names {
            let assessment = &assessments[payer_name];
            for gap in &assessment.documentation_gaps {
                if let Some(existing) = all_gaps
                    .iter_mut()
                    .find(|g| g.get("gap_id").and_then(Value::as_str) == Some(gap.gap_id.as_str()))
                {
                    if let Some(affected) = existing
                        .get_mut("payers_affected")
                        .and_then(Value::as_array_mut)
                    {
                        affected.push(json!(payer_name));
                    }
                    continue;
                }
                all_gaps.push(json!({
                    "gap_id": gap.gap_id,
                    "gap_type": gap.gap_type,
                    "description": gap.description,
                    "priority": gap.priority,
                    "required_for": gap.required_for,
                    "suggested_action": gap.suggested_action,
                    "payers_affected": [payer_name],
                }));
            }
        }

        let priority_rank = |g: &Value| match g.get("priority").and_then(Value::as_str) {
            Some("high") => 0,
            Some("medium") => 1,
            Some("low") => 2,
            _ => 99,
        };
        all_gaps.sort_by_key(priority_rank);
        all_gaps
    }

    /// Compare assessments across payers.
    pub fn compare_assessments(assessments: &HashMap<String, CoverageAssessment>) -> Value {
        if assessments.is_empty() {
            return json!({"error": "No assessments to compare"});
        }

        let mut per_payer = Map::new();
        let mut best_likelihood = -1.0f64;
        let mut best_payer: Option<&str> = None;
        let mut total_gaps = 0usize;

        for (payer_name, assessment) in assessments {
            per_payer.insert(
                payer_name.clone(),
                json!({
                    "status": assessment.coverage_status,
                    "likelihood": assessment.approval_likelihood,
                    "criteria_met": format!(
                        "{}/{}",
                        assessment.criteria_met_count, assessment.criteria_total_count
                    ),
                    "gaps_count": assessment.documentation_gaps.len(),
                    "step_therapy_required": assessment.step_therapy_required,
                    "step_therapy_satisfied": assessment.step_therapy_satisfied,
                }),
            );
            total_gaps += assessment.documentation_gaps.len();
            if assessment.approval_likelihood > best_likelihood {
                best_likelihood = assessment.approval_likelihood;
                best_payer = Some(payer_name);
            }
        }

        json!({
            "payer_count": assessments.len(),
            "assessments": per_payer,
            "best_likelihood": best_likelihood,
            "best_payer": best_payer,
            "total_gaps": total_gaps,
        })
    }
}

//! Policy reasoner: evaluates a patient/medication against a digitized
//! payer policy using the LLM gateway.
//!
//! The reasoner owns the parts that cannot be trusted to the model:
//! criterion-ID validation and remapping, backfill of criteria the
//! model skipped, the conservative status mapping (the AI never issues
//! a denial), and cross-checking the claimed approval likelihood
//! against the actual criterion outcomes.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::llm::{GenerateOptions, LlmGateway, ResponseFormat, TaskCategory};
use crate::prompt::PromptStore;

use super::repository::PolicyRepository;
use super::rubric::RubricLoader;
use super::types::{
    CoverageAssessment, CoverageStatus, CriterionAssessment, DigitizedPolicy, DocumentationGap,
    GapPriority,
};

/// Below this confidence, unmatched criterion entries are discarded.
const UNMATCHED_CONFIDENCE_FLOOR: f64 = 0.7;

/// Met-with-confidence level at which an exclusion counts as triggered.
const EXCLUSION_TRIGGER_CONFIDENCE: f64 = 0.7;

/// Analyzes payer policies to assess coverage eligibility.
pub struct PolicyReasoner {
    repository: PolicyRepository,
    prompt_store: Arc<PromptStore>,
    gateway: Arc<LlmGateway>,
    rubric_loader: RubricLoader,
}

impl PolicyReasoner {
    pub fn new(
        repository: PolicyRepository,
        prompt_store: Arc<PromptStore>,
        gateway: Arc<LlmGateway>,
        rubric_loader: RubricLoader,
    ) -> Self {
        Self {
            repository,
            prompt_store,
            gateway,
            rubric_loader,
        }
    }

    /// Assess coverage for a patient/medication/payer combination.
    ///
    /// `digitized_policy` overrides the repository lookup (used for
    /// version-specific impact analysis); `historical_context` carries
    /// targeted refinement context from the iterative refiner.
    pub async fn assess_coverage(
        &self,
        patient_info: &Value,
        medication_info: &Value,
        payer_name: &str,
        digitized_policy: Option<DigitizedPolicy>,
        historical_context: Option<&str>,
        options: GenerateOptions,
    ) -> Result<CoverageAssessment> {
        let medication_name = medication_info
            .get("medication_name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        info!(payer = payer_name, medication = %medication_name, "assessing coverage");

        // Load policy context; both forms may be individually missing
        // but not simultaneously.
        let (digitized_policy, policy_text) = match digitized_policy {
            Some(policy) => {
                let text = self
                    .repository
                    .load_raw_text(payer_name, &medication_name)?
                    .unwrap_or_default();
                (Some(policy), text)
            }
            None => self
                .repository
                .load_policy_context(payer_name, &medication_name)?,
        };

        let criteria_context = match &digitized_policy {
            Some(policy) => format_policy_criteria(policy),
            None => "[No structured policy criteria available. Evaluate coverage based on \
                     the raw policy document above. Generate criterion_id values for each \
                     requirement you identify.]"
                .to_string(),
        };

        let rubric = self.rubric_loader.load(payer_name);

        let mut variables: HashMap<String, Value> = HashMap::new();
        variables.insert("patient_info".to_string(), patient_info.clone());
        variables.insert("medication_info".to_string(), medication_info.clone());
        variables.insert("policy_document".to_string(), json!(policy_text));
        variables.insert("decision_rubric".to_string(), json!(rubric.to_prompt_context()));
        variables.insert("policy_criteria".to_string(), json!(criteria_context));
        variables.insert(
            "historical_context".to_string(),
            json!(historical_context.unwrap_or("")),
        );

        let prompt = self
            .prompt_store
            .load("policy_analysis/coverage_assessment.txt", &variables)?;
        let system_prompt = self
            .prompt_store
            .load("system/clinical_reasoning_base.txt", &HashMap::new())?;

        // Policy reasoning is critical: gateway exhaustion propagates,
        // there is no silent fallback.
        let response = self
            .gateway
            .generate_with_options(
                TaskCategory::PolicyReasoning,
                prompt,
                Some(system_prompt),
                0.0,
                ResponseFormat::Json,
                options.clone(),
            )
            .await?;

        let assessment = self
            .parse_assessment(
                response.payload,
                payer_name,
                &policy_text,
                &medication_name,
                digitized_policy.as_ref(),
                options,
            )
            .await?;

        info!(
            payer = payer_name,
            status = %assessment.coverage_status,
            likelihood = assessment.approval_likelihood,
            "coverage assessment complete"
        );

        Ok(assessment)
    }

    /// Parse and validate an LLM response into a [`CoverageAssessment`].
    async fn parse_assessment(
        &self,
        result: Value,
        payer_name: &str,
        policy_text: &str,
        medication_name: &str,
        digitized_policy: Option<&DigitizedPolicy>,
        options: GenerateOptions,
    ) -> Result<CoverageAssessment> {
        let has_criteria = result
            .get("criteria_assessments")
            .map(|v| !v.is_null())
            .unwrap_or(false);
        let has_status = result
            .get("coverage_status")
            .and_then(Value::as_str)
            .is_some();
        if !has_criteria && !has_status {
            return Err(Error::malformed_assessment(
                payer_name,
                "response missing both criteria_assessments and coverage_status",
            ));
        }

        // Known-ID lookup structures from the digitized policy.
        let mut known_names: HashMap<String, String> = HashMap::new();
        let mut name_to_id: HashMap<String, String> = HashMap::new();
        if let Some(policy) = digitized_policy {
            for (cid, criterion) in &policy.atomic_criteria {
                known_names.insert(cid.clone(), criterion.name.clone());
                name_to_id.insert(criterion.name.trim().to_lowercase(), cid.clone());
            }
        }
        let known_ids: HashSet<String> = known_names.keys().cloned().collect();

        let mut raw_criteria: Vec<Value> = result
            .get("criteria_assessments")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Pass 1: exact ID match, then exact (lowercased) name match.
        let mut matched_ids: HashSet<String> = HashSet::new();
        let mut unmatched_indices: Vec<usize> = Vec::new();
        for (idx, entry) in raw_criteria.iter_mut().enumerate() {
            let cid = entry
                .get("criterion_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if known_ids.is_empty() || cid.is_empty() {
                continue;
            }
            if known_ids.contains(&cid) {
                matched_ids.insert(cid);
                continue;
            }
            let llm_name = entry
                .get("criterion_name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_lowercase();
            match name_to_id.get(&llm_name) {
                Some(by_name) if !matched_ids.contains(by_name) => {
                    info!(
                        llm_id = %cid,
                        policy_id = %by_name,
                        payer = payer_name,
                        "normalized criterion_id via exact name match"
                    );
                    entry["criterion_id"] = json!(by_name);
                    matched_ids.insert(by_name.clone());
                }
                _ => unmatched_indices.push(idx),
            }
        }

        // Pass 2: one LLM remap call for whatever is still unmatched.
        if !unmatched_indices.is_empty() && !known_names.is_empty() {
            let available: HashMap<String, String> = known_names
                .iter()
                .filter(|(kid, _)| !matched_ids.contains(*kid))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            if !available.is_empty() {
                let unmatched_entries: Vec<(String, String, String)> = unmatched_indices
                    .iter()
                    .map(|&idx| {
                        let e = &raw_criteria[idx];
                        (
                            e.get("criterion_id")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                            e.get("criterion_name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                            e.get("criterion_description")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                        )
                    })
                    .collect();

                let mapping = self
                    .remap_criterion_ids(&unmatched_entries, &available, payer_name, options)
                    .await;

                for &idx in &unmatched_indices {
                    let llm_id = raw_criteria[idx]
                        .get("criterion_id")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    match mapping.get(&llm_id) {
                        Some(remapped) if !matched_ids.contains(remapped) => {
                            raw_criteria[idx]["criterion_id"] = json!(remapped);
                            matched_ids.insert(remapped.clone());
                        }
                        _ => {
                            let confidence = raw_criteria[idx]
                                .get("confidence")
                                .and_then(Value::as_f64)
                                .unwrap_or(0.5);
                            if confidence < UNMATCHED_CONFIDENCE_FLOOR {
                                warn!(
                                    criterion_id = %llm_id,
                                    payer = payer_name,
                                    confidence,
                                    "filtering low-confidence unmatched criterion"
                                );
                                raw_criteria[idx]["_skip"] = json!(true);
                            } else {
                                warn!(
                                    criterion_id = %llm_id,
                                    payer = payer_name,
                                    "criterion could not be remapped to policy"
                                );
                            }
                        }
                    }
                }
            }
        }

        // Materialize criterion assessments.
        let mut criteria: Vec<CriterionAssessment> = Vec::new();
        for entry in &raw_criteria {
            if entry.get("_skip").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let mut cid = entry
                .get("criterion_id")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            if cid.is_empty() {
                cid = Uuid::new_v4().to_string();
                warn!(
                    payer = payer_name,
                    criterion_name = entry
                        .get("criterion_name")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("Unknown"),
                    "LLM returned criterion without criterion_id, generated fallback"
                );
            }
            criteria.push(CriterionAssessment {
                criterion_id: cid,
                criterion_name: entry
                    .get("criterion_name")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string(),
                criterion_description: entry
                    .get("criterion_description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                is_met: entry.get("is_met").and_then(Value::as_bool).unwrap_or(false),
                confidence: entry
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5),
                supporting_evidence: string_list(entry.get("supporting_evidence")),
                gaps: string_list(entry.get("gaps")),
                reasoning: entry
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            });
        }

        // Backfill indication-relevant criteria the LLM skipped.
        if let Some(policy) = digitized_policy {
            backfill_missing_criteria(policy, &matched_ids, &mut criteria, payer_name);
        }

        // Documentation gaps pass through; missing gap ids get a UUID.
        let gaps: Vec<DocumentationGap> = result
            .get("documentation_gaps")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(|g| DocumentationGap {
                        gap_id: g
                            .get("gap_id")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| Uuid::new_v4().to_string()),
                        gap_type: g
                            .get("gap_type")
                            .and_then(Value::as_str)
                            .unwrap_or("other")
                            .to_string(),
                        description: g
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        required_for: string_list(g.get("required_for")),
                        priority: g
                            .get("priority")
                            .cloned()
                            .and_then(|p| serde_json::from_value(p).ok())
                            .unwrap_or(GapPriority::Medium),
                        suggested_action: g
                            .get("suggested_action")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        estimated_resolution_complexity: g
                            .get("estimated_resolution_complexity")
                            .and_then(Value::as_str)
                            .unwrap_or("medium")
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let raw_likelihood = result
            .get("approval_likelihood")
            .and_then(Value::as_f64)
            .unwrap_or(0.5);
        let status_str = result
            .get("coverage_status")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let coverage_status =
            apply_conservative_status_mapping(status_str, raw_likelihood, payer_name);

        log_triggered_exclusions(digitized_policy, &criteria, payer_name, raw_likelihood);

        let approval_likelihood =
            validate_approval_likelihood(raw_likelihood, &criteria, digitized_policy, payer_name);

        let mut assessment = CoverageAssessment {
            assessment_id: Uuid::new_v4().to_string(),
            payer_name: payer_name.to_string(),
            policy_name: format!("{} Policy", payer_name),
            medication_name: medication_name.to_string(),
            coverage_status,
            approval_likelihood,
            approval_likelihood_reasoning: result
                .get("approval_likelihood_reasoning")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            criteria_assessments: criteria,
            criteria_met_count: 0,
            criteria_total_count: 0,
            documentation_gaps: gaps,
            recommendations: string_list(result.get("recommendations")),
            step_therapy_required: result
                .get("step_therapy_required")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            step_therapy_options: string_list(result.get("step_therapy_options")),
            step_therapy_satisfied: result
                .get("step_therapy_satisfied")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            raw_policy_text: policy_text.to_string(),
            llm_raw_response: Some(result),
        };
        assessment.recount_criteria();

        Ok(assessment)
    }

    /// Ask the DATA_EXTRACTION route to map unmatched criterion IDs to
    /// known policy IDs. Failures degrade to an empty mapping.
    async fn remap_criterion_ids(
        &self,
        unmatched: &[(String, String, String)],
        known: &HashMap<String, String>,
        payer_name: &str,
        options: GenerateOptions,
    ) -> HashMap<String, String> {
        if unmatched.is_empty() || known.is_empty() {
            return HashMap::new();
        }

        let mut known_sorted: Vec<_> = known.iter().collect();
        known_sorted.sort();
        let known_list = known_sorted
            .iter()
            .map(|(kid, kname)| format!("- {}: {}", kid, kname))
            .collect::<Vec<_>>()
            .join("\n");
        let unmatched_list = unmatched
            .iter()
            .map(|(id, name, description)| {
                format!("- {}: name=\"{}\", description=\"{}\"", id, name, description)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You are a clinical policy criterion matching assistant.\n\n\
             ## Known Policy Criterion IDs\n\
             These are the ONLY valid criterion IDs in the digitized policy:\n{}\n\n\
             ## Unmatched Criteria\n\
             The following criteria were returned by an AI analysis but their IDs do not \
             match any known policy criterion. Map each to the best matching known \
             criterion ID based on semantic similarity of names and descriptions.\n{}\n\n\
             ## Rules\n\
             1. Each unmatched criterion should map to exactly ONE known criterion ID, \
             or \"NONE\" if there is genuinely no match.\n\
             2. Focus on semantic meaning, not string similarity.\n\
             3. Return ONLY a JSON object mapping unmatched IDs to known IDs.\n\n\
             ## Output Format\n\
             Return ONLY valid JSON:\n\
             {{\"ID_1\": \"KNOWN_ID_1\", \"ID_2\": \"NONE\"}}\n",
            known_list, unmatched_list
        );

        let response = match self
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
            Ok(response) => response,
            Err(e) => {
                warn!(payer = payer_name, error = %e, "LLM criterion remapping failed, proceeding without");
                return HashMap::new();
            }
        };

        let mut mapping = HashMap::new();
        if let Some(object) = response.payload.as_object() {
            for (llm_id, policy_id) in object {
                let Some(policy_id) = policy_id.as_str() else {
                    continue;
                };
                if known.contains_key(policy_id) {
                    info!(
                        llm_id = %llm_id,
                        policy_id = %policy_id,
                        payer = payer_name,
                        "LLM remapped criterion_id"
                    );
                    mapping.insert(llm_id.clone(), policy_id.to_string());
                } else if policy_id == "NONE" {
                    info!(llm_id = %llm_id, payer = payer_name, "LLM confirmed no match for criterion");
                }
            }
        }
        mapping
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Format the digitized policy as structured prompt context.
///
/// The model must echo the exact criterion IDs, so every atomic
/// criterion is listed with its id, required/optional tag, OR-group
/// membership, thresholds, durations, and acceptable evidence.
pub fn format_policy_criteria(policy: &DigitizedPolicy) -> String {
    let mut lines: Vec<String> = Vec::new();
    let or_memberships = policy.or_group_memberships();

    if !policy.indications.is_empty() {
        lines.push("### Covered Indications".to_string());
        for indication in &policy.indications {
            let codes = if indication.indication_codes.is_empty() {
                String::new()
            } else {
                format!(
                    " ({})",
                    indication
                        .indication_codes
                        .iter()
                        .map(|c| format!("{}:{}", c.system, c.code))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            lines.push(format!("- **{}**{}", indication.indication_name, codes));
            if let Some(group) = &indication.initial_approval_criteria {
                lines.push(format!("  Initial approval criteria group: {}", group));
            }
            match (indication.min_age_years, indication.max_age_years) {
                (Some(min), Some(max)) => {
                    lines.push(format!("  Age restriction: >= {} and <= {} years", min, max))
                }
                (Some(min), None) => lines.push(format!("  Age restriction: >= {} years", min)),
                (None, Some(max)) => lines.push(format!("  Age restriction: <= {} years", max)),
                (None, None) => {}
            }
        }
    }

    if !policy.criterion_groups.is_empty() {
        lines.push("\n### Criterion Groups (Logical Structure)".to_string());
        let mut group_ids: Vec<_> = policy.criterion_groups.keys().collect();
        group_ids.sort();
        for gid in group_ids {
            let group = &policy.criterion_groups[gid];
            let operator = match group.operator {
                super::types::GroupOperator::And => "AND",
                super::types::GroupOperator::Or => "OR",
            };
            let mut line = format!(
                "- **{}** ({}): operator={}, criteria=[{}]",
                gid,
                group.name,
                operator,
                group.criteria.join(", ")
            );
            if !group.subgroups.is_empty() {
                line.push_str(&format!(", subgroups=[{}]", group.subgroups.join(", ")));
            }
            lines.push(line);
        }
    }

    if !policy.atomic_criteria.is_empty() {
        lines.push("\n### Atomic Criteria to Evaluate".to_string());
        lines.push("Evaluate EACH of the following criteria against the patient data.".to_string());
        lines.push(
            "You MUST use the exact criterion_id shown for each criterion in your response."
                .to_string(),
        );
        let mut criterion_ids: Vec<_> = policy.atomic_criteria.keys().collect();
        criterion_ids.sort();
        for cid in criterion_ids {
            let criterion = &policy.atomic_criteria[cid];
            let required_tag = if criterion.is_required {
                " [REQUIRED]"
            } else {
                " [OPTIONAL]"
            };
            let confidence_tag = match criterion.extraction_confidence.as_deref() {
                Some(level @ ("low" | "unconfident")) => format!(" [EXTRACTION: {}]", level),
                _ => String::new(),
            };

            lines.push(format!("\n**criterion_id: {}**{}{}", cid, required_tag, confidence_tag));
            if let Some(groups) = or_memberships.get(cid) {
                lines.push(format!(
                    "  OR-Group: {} (only ONE criterion in this group needs to be met)",
                    groups.join(", ")
                ));
            }
            lines.push(format!("  Name: {}", criterion.name));
            lines.push(format!("  Type: {}", criterion.criterion_type));
            lines.push(format!("  Category: {}", criterion.category));
            lines.push(format!("  Description: {}", criterion.description));
            if !criterion.policy_text.is_empty() {
                lines.push(format!("  Policy Text: \"{}\"", criterion.policy_text));
            }
            if !criterion.clinical_codes.is_empty() {
                lines.push(format!(
                    "  Clinical Codes: {}",
                    criterion
                        .clinical_codes
                        .iter()
                        .map(|c| format!("{}:{}", c.system, c.code))
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
            if !criterion.drug_names.is_empty() {
                lines.push(format!("  Drug Names: {}", criterion.drug_names.join(", ")));
            }
            if !criterion.drug_classes.is_empty() {
                lines.push(format!("  Drug Classes: {}", criterion.drug_classes.join(", ")));
            }
            if !criterion.allowed_values.is_empty() {
                lines.push(format!("  Allowed Values: {}", criterion.allowed_values.join(", ")));
            }
            if let Some(threshold) = &criterion.threshold {
                match threshold.upper_value {
                    Some(upper) => lines.push(
                        format!("  Threshold: {} to {} {}", threshold.value, upper, threshold.unit)
                            .trim_end()
                            .to_string(),
                    ),
                    None => lines.push(
                        format!(
                            "  Threshold: {} {} {}",
                            threshold.operator, threshold.value, threshold.unit
                        )
                        .trim_end()
                        .to_string(),
                    ),
                }
            }
            if let Some(days) = criterion.minimum_duration_days {
                lines.push(format!("  Minimum Duration: {} days", days));
            }
            if !criterion.evidence_types.is_empty() {
                lines.push(format!(
                    "  Acceptable Evidence: {}",
                    criterion.evidence_types.join(", ")
                ));
            }
        }
    }

    if !policy.exclusions.is_empty() {
        lines.push("\n### Exclusion Criteria (Disqualifying Conditions)".to_string());
        lines.push("If ANY of the following exclusions apply, flag them in your assessment:".to_string());
        for exclusion in &policy.exclusions {
            lines.push(format!("\n**exclusion_id: {}**", exclusion.exclusion_id));
            lines.push(format!("  Name: {}", exclusion.name));
            lines.push(format!("  Description: {}", exclusion.description));
            if !exclusion.policy_text.is_empty() {
                lines.push(format!("  Policy Text: \"{}\"", exclusion.policy_text));
            }
            if !exclusion.trigger_criteria.is_empty() {
                lines.push(format!(
                    "  Triggered by criteria: {}",
                    exclusion.trigger_criteria.join(", ")
                ));
            }
        }
    }

    if !policy.step_therapy_requirements.is_empty() {
        lines.push("\n### Step Therapy Requirements".to_string());
        for st in &policy.step_therapy_requirements {
            lines.push(format!("\n**{}** (Indication: {})", st.requirement_id, st.indication));
            if !st.required_drugs.is_empty() {
                lines.push(format!("  Required drugs: {}", st.required_drugs.join(", ")));
            }
            if !st.required_drug_classes.is_empty() {
                lines.push(format!(
                    "  Required drug classes: {}",
                    st.required_drug_classes.join(", ")
                ));
            }
            lines.push(format!("  Minimum trials: {}", st.minimum_trials));
            if let Some(days) = st.minimum_duration_days {
                lines.push(format!("  Minimum trial duration: {} days", days));
            }
            lines.push(format!(
                "  Failure required: {}, Intolerance acceptable: {}, Contraindication exempts: {}",
                st.failure_required, st.intolerance_acceptable, st.contraindication_acceptable
            ));
        }
    }

    lines.join("\n")
}

/// Infer the patient's indication from the criteria the model actually
/// evaluated, then collect that indication's criterion sub-tree.
///
/// This keeps backfill from dragging in criteria for unrelated
/// indications (RA criteria for a Crohn's patient).
fn indication_relevant_criteria(
    policy: &DigitizedPolicy,
    matched_ids: &HashSet<String>,
) -> HashSet<String> {
    if policy.indications.is_empty() || matched_ids.is_empty() {
        return HashSet::new();
    }

    let mut best: Option<(&str, HashSet<String>, usize)> = None;
    for indication in &policy.indications {
        let Some(group) = &indication.initial_approval_criteria else {
            continue;
        };
        let criteria = policy.collect_group(group);
        let overlap = criteria.intersection(matched_ids).count();
        let replace = match &best {
            Some((_, _, best_overlap)) => overlap > *best_overlap,
            None => overlap > 0,
        };
        if replace {
            best = Some((indication.indication_name.as_str(), criteria, overlap));
        }
    }

    match best {
        Some((name, criteria, overlap)) => {
            info!(
                indication = name,
                overlap,
                indication_criteria_count = criteria.len(),
                total_policy_criteria = policy.atomic_criteria.len(),
                "identified patient indication from evaluated criteria"
            );
            criteria
        }
        None => HashSet::new(),
    }
}

/// Append synthesized not-evaluated assessments for criteria the model
/// skipped, restricted to the patient's indication when inferable.
fn backfill_missing_criteria(
    policy: &DigitizedPolicy,
    matched_ids: &HashSet<String>,
    criteria: &mut Vec<CriterionAssessment>,
    payer_name: &str,
) {
    if policy.atomic_criteria.is_empty() {
        return;
    }

    let relevant = indication_relevant_criteria(policy, matched_ids);
    let candidates: HashSet<String> = if relevant.is_empty() {
        policy.atomic_criteria.keys().cloned().collect()
    } else {
        relevant
    };

    let mut missing: Vec<String> = candidates.difference(matched_ids).cloned().collect();
    missing.sort();
    if missing.is_empty() {
        return;
    }

    warn!(
        payer = payer_name,
        missing_criterion_ids = ?missing,
        evaluated_count = matched_ids.len(),
        "backfilling missing indication-relevant criteria"
    );

    let or_memberships = policy.or_group_memberships();
    for mid in missing {
        let Some(criterion) = policy.atomic_criteria.get(&mid) else {
            continue;
        };
        let tag = if criterion.is_required {
            "[REQUIRED]"
        } else {
            "[OPTIONAL/OR-GROUP]"
        };
        let or_note = or_memberships
            .get(&mid)
            .map(|groups| format!(" Member of OR-group(s): {}.", groups.join(", ")))
            .unwrap_or_default();
        criteria.push(CriterionAssessment {
            criterion_id: mid,
            criterion_name: criterion.name.clone(),
            criterion_description: format!("[NOT EVALUATED BY AI] {}", criterion.description),
            is_met: false,
            confidence: 0.0,
            supporting_evidence: vec![],
            gaps: vec![
                "Criterion was not evaluated by AI — requires manual review".to_string(),
            ],
            reasoning: format!(
                "This {} criterion was not included in the AI assessment response.{} \
                 Marked as not met pending human review.",
                tag, or_note
            ),
        });
    }
}

/// Apply the conservative decision model to the LLM's status string.
///
/// The AI never recommends denial: NOT_COVERED, low-confidence results,
/// and unrecognized statuses all route to human review.
pub fn apply_conservative_status_mapping(
    status_str: &str,
    approval_likelihood: f64,
    payer_name: &str,
) -> CoverageStatus {
    let Some(status) = CoverageStatus::parse(status_str) else {
        warn!(
            payer = payer_name,
            status = status_str,
            "unknown coverage status from LLM, mapping to requires_human_review"
        );
        return CoverageStatus::RequiresHumanReview;
    };

    if status == CoverageStatus::NotCovered {
        info!(
            payer = payer_name,
            original_status = status_str,
            "conservative mapping: NOT_COVERED -> REQUIRES_HUMAN_REVIEW"
        );
        return CoverageStatus::RequiresHumanReview;
    }

    if approval_likelihood < 0.3 {
        info!(
            payer = payer_name,
            original_status = status_str,
            likelihood = approval_likelihood,
            "conservative mapping: low likelihood -> REQUIRES_HUMAN_REVIEW"
        );
        return CoverageStatus::RequiresHumanReview;
    }

    if status == CoverageStatus::Unknown && approval_likelihood < 0.5 {
        info!(
            payer = payer_name,
            likelihood = approval_likelihood,
            "conservative mapping: UNKNOWN with low likelihood -> REQUIRES_HUMAN_REVIEW"
        );
        return CoverageStatus::RequiresHumanReview;
    }

    debug!(payer = payer_name, status = %status, "coverage status preserved");
    status
}

/// Log exclusions the model marked as confidently met. They are flagged
/// for human review; the conservative mapping already routes uncertain
/// cases there, so no likelihood cap is applied.
fn log_triggered_exclusions(
    policy: Option<&DigitizedPolicy>,
    criteria: &[CriterionAssessment],
    payer_name: &str,
    raw_likelihood: f64,
) {
    let Some(policy) = policy else {
        return;
    };
    if policy.exclusions.is_empty() {
        return;
    }
    let mut exclusion_ids: HashSet<&str> = policy
        .exclusions
        .iter()
        .map(|e| e.exclusion_id.as_str())
        .collect();
    for exclusion in &policy.exclusions {
        for trigger in &exclusion.trigger_criteria {
            exclusion_ids.insert(trigger.as_str());
        }
    }

    let triggered: Vec<&str> = criteria
        .iter()
        .filter(|c| {
            exclusion_ids.contains(c.criterion_id.as_str())
                && c.is_met
                && c.confidence >= EXCLUSION_TRIGGER_CONFIDENCE
        })
        .map(|c| c.criterion_id.as_str())
        .collect();

    if !triggered.is_empty() {
        warn!(
            payer = payer_name,
            raw_likelihood,
            triggered_exclusions = ?triggered,
            "exclusion criterion triggered, flagged for human review"
        );
    }
}

/// Cross-check the LLM's approval likelihood against criterion outcomes
/// using an OR-group-aware met ratio, clamping contradictory claims.
pub fn validate_approval_likelihood(
    raw_likelihood: f64,
    criteria: &[CriterionAssessment],
    policy: Option<&DigitizedPolicy>,
    payer_name: &str,
) -> f64 {
    let likelihood = raw_likelihood.clamp(0.0, 1.0);

    if criteria.is_empty() {
        return likelihood;
    }

    // An OR-group counts as one logical unit, satisfied if any member is
    // met; standalone criteria count individually.
    let criterion_to_or_group: HashMap<String, String> = policy
        .map(|p| {
            p.or_group_memberships()
                .into_iter()
                .filter_map(|(cid, groups)| groups.first().map(|g| (cid, g.clone())))
                .collect()
        })
        .unwrap_or_default();

    let mut or_group_met: HashMap<&str, bool> = HashMap::new();
    let mut standalone_met = 0usize;
    let mut standalone_total = 0usize;

    for criterion in criteria {
        match criterion_to_or_group.get(&criterion.criterion_id) {
            Some(gid) => {
                let entry = or_group_met.entry(gid.as_str()).or_insert(false);
                if criterion.is_met {
                    *entry = true;
                }
            }
            None => {
                standalone_total += 1;
                if criterion.is_met {
                    standalone_met += 1;
                }
            }
        }
    }

    let effective_met = standalone_met + or_group_met.values().filter(|met| **met).count();
    let effective_total = standalone_total + or_group_met.len();
    let met_ratio = if effective_total > 0 {
        effective_met as f64 / effective_total as f64
    } else {
        0.0
    };

    info!(
        payer = payer_name,
        raw_likelihood,
        effective_met,
        effective_total,
        met_ratio = format!("{:.3}", met_ratio),
        or_groups = or_group_met.len(),
        "OR-group-aware met ratio calculated"
    );

    if likelihood > 0.85 && met_ratio < 0.5 {
        let capped = (met_ratio + 0.1).min(likelihood);
        warn!(
            payer = payer_name,
            raw_likelihood,
            capped_likelihood = capped,
            effective_met,
            effective_total,
            "approval likelihood capped: high confidence contradicts criterion outcomes"
        );
        return capped;
    }

    if likelihood < 0.2 && met_ratio > 0.8 {
        let floored = likelihood.max(0.5);
        warn!(
            payer = payer_name,
            raw_likelihood,
            adjusted_likelihood = floored,
            effective_met,
            effective_total,
            "approval likelihood raised: low confidence contradicts criterion outcomes"
        );
        return floored;
    }

    likelihood
}

//! Similarity scoring for historical case matching.
//!
//! Weighted components over medication, diagnosis family, payer,
//! disease severity, and prior treatments. Weights sum to 1.0.

use std::collections::{HashMap, HashSet};

use super::types::{DiseaseSeverity, HistoricalCase, SimilarCase, TreatmentRef};

/// Component weights for case matching.
pub const MEDICATION_WEIGHT: f64 = 0.30;
pub const DIAGNOSIS_FAMILY_WEIGHT: f64 = 0.25;
pub const PAYER_WEIGHT: f64 = 0.20;
pub const DISEASE_SEVERITY_WEIGHT: f64 = 0.15;
pub const PRIOR_TREATMENTS_WEIGHT: f64 = 0.10;

/// Percent-difference tolerance for numeric severity scores.
pub const SEVERITY_TOLERANCE: f64 = 0.20;

/// Default minimum similarity for a case to count as a match.
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.5;

/// Default cap on returned matches.
pub const DEFAULT_MAX_RESULTS: usize = 20;

/// The current case's matching profile.
#[derive(Debug, Clone, Default)]
pub struct MatchProfile {
    pub medication_name: String,
    pub icd10_code: String,
    pub payer_name: String,
    pub disease_severity: Option<DiseaseSeverity>,
    pub prior_treatments: Option<Vec<TreatmentRef>>,
}

/// Find clinically similar cases, sorted by similarity descending.
pub fn find_similar_cases(
    corpus: &[HistoricalCase],
    profile: &MatchProfile,
    min_similarity: f64,
    max_results: usize,
) -> Vec<SimilarCase> {
    let icd10_family: String = profile.icd10_code.chars().take(3).collect();

    let mut similar: Vec<SimilarCase> = corpus
        .iter()
        .filter_map(|case| {
            let breakdown = similarity_breakdown(case, profile, &icd10_family);
            let total: f64 = breakdown
                .iter()
                .map(|(component, score)| score * weight_for(component))
                .sum();
            if total >= min_similarity {
                Some(SimilarCase {
                    case_id: case.case_id.clone(),
                    similarity_score: total,
                    case_data: case.clone(),
                    similarity_breakdown: breakdown,
                })
            } else {
                None
            }
        })
        .collect();

    similar.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    similar.truncate(max_results);
    similar
}

fn weight_for(component: &str) -> f64 {
    match component {
        "medication" => MEDICATION_WEIGHT,
        "diagnosis_family" => DIAGNOSIS_FAMILY_WEIGHT,
        "payer" => PAYER_WEIGHT,
        "disease_severity" => DISEASE_SEVERITY_WEIGHT,
        "prior_treatments" => PRIOR_TREATMENTS_WEIGHT,
        _ => 0.0,
    }
}

/// Per-component similarity scores (each in [0, 1]).
pub fn similarity_breakdown(
    case: &HistoricalCase,
    profile: &MatchProfile,
    icd10_family: &str,
) -> HashMap<String, f64> {
    let mut scores = HashMap::new();

    // Medication: substring match either direction
    let case_med = case.medication.name.to_lowercase();
    let target_med = profile.medication_name.to_lowercase();
    let med_score = if !case_med.is_empty()
        && !target_med.is_empty()
        && (target_med.contains(&case_med) || case_med.contains(&target_med))
    {
        1.0
    } else {
        0.0
    };
    scores.insert("medication".to_string(), med_score);

    // Diagnosis family: exact first-3 match, 0.7 for same chapter
    let case_family = case.diagnosis.icd10_family.as_str();
    let dx_score = if !icd10_family.is_empty() && case_family == icd10_family {
        1.0
    } else if !icd10_family.is_empty()
        && case_family.len() >= 2
        && icd10_family.len() >= 2
        && case_family[..2] == icd10_family[..2]
    {
        0.7
    } else {
        0.0
    };
    scores.insert("diagnosis_family".to_string(), dx_score);

    // Payer: substring match either direction
    let case_payer = case.payer.name.to_lowercase();
    let target_payer = profile.payer_name.to_lowercase();
    let payer_score = if !case_payer.is_empty()
        && !target_payer.is_empty()
        && (target_payer.contains(&case_payer) || case_payer.contains(&target_payer))
    {
        1.0
    } else {
        0.0
    };
    scores.insert("payer".to_string(), payer_score);

    scores.insert(
        "disease_severity".to_string(),
        severity_similarity(&case.disease_severity, profile.disease_severity.as_ref()),
    );
    scores.insert(
        "prior_treatments".to_string(),
        treatment_similarity(&case.prior_treatments, profile.prior_treatments.as_deref()),
    );

    scores
}

/// Similarity between disease severity profiles.
///
/// Classification match wins; adjacent buckets score 0.7, two apart
/// 0.4; otherwise the available numeric scores (CDAI, HBI) are
/// compared by percent difference and averaged.
pub fn severity_similarity(
    case_severity: &DiseaseSeverity,
    target_severity: Option<&DiseaseSeverity>,
) -> f64 {
    // Neutral when the current case carries no severity data
    let Some(target) = target_severity else {
        return 0.5;
    };
    if target.is_empty() {
        return 0.5;
    }

    let case_class = case_severity
        .severity_classification
        .as_deref()
        .unwrap_or("")
        .to_lowercase();
    let target_class = target
        .severity_classification
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if !case_class.is_empty() && case_class == target_class {
        return 1.0;
    }

    const SEVERITY_ORDER: [&str; 4] = ["mild", "moderate", "moderate_to_severe", "severe"];
    let case_idx = SEVERITY_ORDER.iter().position(|s| *s == case_class);
    let target_idx = SEVERITY_ORDER.iter().position(|s| *s == target_class);
    if let (Some(case_idx), Some(target_idx)) = (case_idx, target_idx) {
        match case_idx.abs_diff(target_idx) {
            1 => return 0.7,
            2 => return 0.4,
            _ => {}
        }
    }

    let mut numeric_scores: Vec<f64> = Vec::new();
    for (case_value, target_value) in [
        (case_severity.cdai_score, target.cdai_score),
        (case_severity.hbi_score, target.hbi_score),
    ] {
        if let (Some(case_value), Some(target_value)) = (case_value, target_value) {
            let denom = case_value.max(target_value).max(1.0);
            let diff_pct = (case_value - target_value).abs() / denom;
            if diff_pct <= SEVERITY_TOLERANCE {
                numeric_scores.push(1.0 - diff_pct);
            } else {
                numeric_scores.push((1.0 - diff_pct * 2.0).max(0.0));
            }
        }
    }

    if !numeric_scores.is_empty() {
        return numeric_scores.iter().sum::<f64>() / numeric_scores.len() as f64;
    }

    // Nothing matched at all
    0.3
}

/// Jaccard similarity over prior medication names (lowercased).
pub fn treatment_similarity(
    case_treatments: &[TreatmentRef],
    target_treatments: Option<&[TreatmentRef]>,
) -> f64 {
    let Some(target_treatments) = target_treatments else {
        return 0.5;
    };
    if case_treatments.is_empty() || target_treatments.is_empty() {
        return 0.5;
    }

    let case_meds: HashSet<String> = case_treatments
        .iter()
        .map(|t| t.medication.to_lowercase())
        .filter(|m| !m.is_empty())
        .collect();
    let target_meds: HashSet<String> = target_treatments
        .iter()
        .map(|t| t.medication.to_lowercase())
        .filter(|m| !m.is_empty())
        .collect();
    if case_meds.is_empty() || target_meds.is_empty() {
        return 0.5;
    }

    let intersection = case_meds.intersection(&target_meds).count();
    let union = case_meds.union(&target_meds).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

//! Deterministic strategy scoring. No LLM involvement, pure calculation:
//!
//! ```text
//! total = weights.speed         * speed_score
//!       + weights.approval      * adjusted_approval
//!       + weights.low_rework    * (10 - rework_risk)
//!       + weights.patient_burden * (10 - patient_burden)
//! ```

use std::collections::{BTreeMap, HashMap};
use tracing::info;

use crate::config::ScoringWeights;
use crate::error::{Error, Result};
use crate::policy::types::CoverageAssessment;

use super::types::{Strategy, StrategyScore, StrategyStep, STRATEGY_TEMPLATES};

/// Deterministic strategy generation and scoring.
pub struct StrategyScorer {
    weights: ScoringWeights,
}

impl StrategyScorer {
    pub fn new(weights: ScoringWeights) -> Result<Self> {
        if !weights.validate() {
            return Err(Error::Config("scoring weights must sum to 1.0".to_string()));
        }
        Ok(Self { weights })
    }

    pub fn with_default_weights() -> Self {
        Self {
            weights: ScoringWeights::default(),
        }
    }

    /// Generate candidate strategies for the case's payers.
    ///
    /// Only sequential primary-first strategies are produced; when the
    /// payer arguments are absent, the assessment map's first payer (by
    /// name order) stands in as primary.
    pub fn generate_strategies(
        &self,
        coverage_assessments: &HashMap<String, CoverageAssessment>,
        primary_payer: Option<&str>,
        secondary_payer: Option<&str>,
    ) -> Vec<Strategy> {
        let mut payer_names: Vec<&String> = coverage_assessments.keys().collect();
        payer_names.sort();

        let primary = primary_payer.or_else(|| payer_names.first().map(|s| s.as_str()));
        let secondary = secondary_payer.or_else(|| {
            payer_names
                .iter()
                .map(|s| s.as_str())
                .find(|name| Some(*name) != primary)
        });

        let mut strategies = Vec::new();
        for template in STRATEGY_TEMPLATES {
            let mut strategy = Strategy::from_template(template, primary, secondary);
            strategy.steps = generate_steps(&strategy.payer_sequence);
            strategies.push(strategy);
        }

        info!(
            count = strategies.len(),
            primary_payer = primary.unwrap_or("none"),
            "generated strategies"
        );
        strategies
    }

    /// Score one strategy against the coverage assessments.
    pub fn score_strategy(
        &self,
        strategy: &Strategy,
        case_id: &str,
        coverage_assessments: &HashMap<String, CoverageAssessment>,
    ) -> StrategyScore {
        let mut adjustments: BTreeMap<String, f64> = BTreeMap::new();
        let mut adjustment_reasoning: Vec<String> = Vec::new();

        let speed_score = strategy.base_speed_score;
        let mut approval_score = strategy.base_approval_score;
        let rework_risk = strategy.base_rework_risk;
        let patient_burden = strategy.base_patient_burden;

        let first_payer = strategy.payer_sequence.first();
        if let Some(assessment) = first_payer.and_then(|p| coverage_assessments.get(p)) {
            let first_payer = first_payer.expect("checked above");

            // First-payer likelihood shifts the approval score around
            // the 0.5 midpoint.
            let likelihood_adjustment = (assessment.approval_likelihood - 0.5) * 4.0;
            approval_score = (approval_score + likelihood_adjustment).clamp(0.0, 10.0);
            adjustments.insert("first_payer_likelihood".to_string(), likelihood_adjustment);
            adjustment_reasoning.push(format!(
                "Adjusted for {} approval likelihood: {:.2}",
                first_payer, assessment.approval_likelihood
            ));

            // Hard ceiling: a base score of 7.0 must not stay high when
            // the likelihood is 0.15.
            let likelihood_ceiling = assessment.approval_likelihood * 10.0;
            if approval_score > likelihood_ceiling + 1.0 {
                let old_score = approval_score;
                approval_score = likelihood_ceiling + 1.0;
                adjustments.insert("likelihood_ceiling".to_string(), approval_score - old_score);
                adjustment_reasoning.push(format!(
                    "Approval score capped to {:.1} — cannot exceed likelihood ceiling ({:.2})",
                    approval_score, assessment.approval_likelihood
                ));
            }

            let critical_gaps = assessment.critical_gaps().len();
            if critical_gaps > 0 {
                let gap_penalty = critical_gaps as f64 * 0.5;
                approval_score = (approval_score - gap_penalty).max(0.0);
                adjustments.insert("documentation_gaps".to_string(), -gap_penalty);
                adjustment_reasoning.push(format!(
                    "Penalty for {} critical documentation gap(s)",
                    critical_gaps
                ));
            }

            if assessment.step_therapy_required && !assessment.step_therapy_satisfied {
                approval_score = (approval_score - 2.0).max(0.0);
                adjustments.insert("step_therapy".to_string(), -2.0);
                adjustment_reasoning
                    .push("Penalty for unsatisfied step therapy requirement".to_string());
            }
        }

        // Invert risk and burden so higher is better everywhere.
        let rework_score = 10.0 - rework_risk;
        let patient_score = 10.0 - patient_burden;

        let total_score = self.weights.speed * speed_score
            + self.weights.approval * approval_score
            + self.weights.low_rework * rework_score
            + self.weights.patient_burden * patient_score;

        StrategyScore {
            strategy_id: strategy.strategy_id.clone(),
            case_id: case_id.to_string(),
            speed_score,
            approval_score,
            rework_score,
            patient_score,
            adjustments,
            adjustment_reasoning,
            total_score: (total_score * 100.0).round() / 100.0,
            rank: 0,
            is_recommended: false,
            recommendation_reasoning: None,
            weights_used: self.weights,
        }
    }

    /// Score all strategies and rank them, best first.
    pub fn score_all_strategies(
        &self,
        strategies: &[Strategy],
        case_id: &str,
        coverage_assessments: &HashMap<String, CoverageAssessment>,
    ) -> Vec<StrategyScore> {
        let mut scores: Vec<StrategyScore> = strategies
            .iter()
            .map(|s| self.score_strategy(s, case_id, coverage_assessments))
            .collect();

        scores.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for (i, score) in scores.iter_mut().enumerate() {
            score.rank = (i + 1) as u32;
            score.is_recommended = i == 0;
            if score.is_recommended {
                score.recommendation_reasoning = Some(format!(
                    "Highest total score ({:.2}) based on approval likelihood ({:.1}), \
                     speed ({:.1}), and risk factors.",
                    score.total_score, score.approval_score, score.speed_score
                ));
            }
        }

        info!(
            case_id,
            top_strategy = scores.first().map(|s| s.strategy_id.as_str()).unwrap_or("none"),
            top_score = scores.first().map(|s| s.total_score).unwrap_or(0.0),
            "strategies scored"
        );
        scores
    }

    /// Select the best strategy for a case.
    pub fn select_best_strategy<'a>(
        &self,
        strategies: &'a [Strategy],
        case_id: &str,
        coverage_assessments: &HashMap<String, CoverageAssessment>,
    ) -> Result<(&'a Strategy, Vec<StrategyScore>)> {
        let scores = self.score_all_strategies(strategies, case_id, coverage_assessments);
        let best_score = scores
            .first()
            .ok_or_else(|| Error::Internal("no strategies to score".to_string()))?;
        let best_strategy = strategies
            .iter()
            .find(|s| s.strategy_id == best_score.strategy_id)
            .ok_or_else(|| Error::Internal("best score references unknown strategy".to_string()))?;
        Ok((best_strategy, scores))
    }
}

/// Generate ordered sequential steps for a payer sequence.
///
/// Primary gets submit and monitor; a secondary additionally gets a
/// coordination-of-benefits step. Dependencies are step numbers.
fn generate_steps(payer_sequence: &[String]) -> Vec<StrategyStep> {
    let mut steps = Vec::new();
    let mut step_number = 1u32;
    let mut previous_step: Option<u32> = None;

    for (i, payer) in payer_sequence.iter().enumerate() {
        let is_primary = i == 0;

        steps.push(StrategyStep {
            step_number,
            action_type: "submit_pa".to_string(),
            target_payer: payer.clone(),
            description: format!(
                "Submit PA to {} ({})",
                payer,
                if is_primary { "primary" } else { "secondary" }
            ),
            dependencies: previous_step.into_iter().collect(),
            estimated_duration_hours: 24,
            success_criteria: format!("{} acknowledges submission", payer),
        });
        previous_step = Some(step_number);
        step_number += 1;

        steps.push(StrategyStep {
            step_number,
            action_type: "check_status".to_string(),
            target_payer: payer.clone(),
            description: format!("Monitor {} response and await decision", payer),
            dependencies: vec![previous_step.expect("submit step precedes")],
            // Primary determinations typically take longer
            estimated_duration_hours: if is_primary { 72 } else { 48 },
            success_criteria: format!("{} decision received (approval/denial)", payer),
        });
        previous_step = Some(step_number);
        step_number += 1;

        if !is_primary {
            steps.push(StrategyStep {
                step_number,
                action_type: "coordinate_benefits".to_string(),
                target_payer: payer.clone(),
                description: format!("Coordinate benefits between primary and {}", payer),
                dependencies: vec![previous_step.expect("monitor step precedes")],
                estimated_duration_hours: 24,
                success_criteria: "Coordination of Benefits (COB) completed".to_string(),
            });
            previous_step = Some(step_number);
            step_number += 1;
        }
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::{DocumentationGap, GapPriority};
    use pretty_assertions::assert_eq;

    fn assessment(payer: &str, likelihood: f64) -> CoverageAssessment {
        let mut a = CoverageAssessment::new(payer, "adalimumab");
        a.approval_likelihood = likelihood;
        a
    }

    fn assessments_for(payer: &str, likelihood: f64) -> HashMap<String, CoverageAssessment> {
        let mut map = HashMap::new();
        map.insert(payer.to_string(), assessment(payer, likelihood));
        map
    }

    #[test]
    fn test_generation_is_primary_first_sequential_only() {
        let scorer = StrategyScorer::with_default_weights();
        let mut assessments = assessments_for("Cigna", 0.9);
        assessments.insert("Aetna".to_string(), assessment("Aetna", 0.6));

        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), Some("Aetna"));
        assert_eq!(strategies.len(), 1);
        let strategy = &strategies[0];
        assert!(!strategy.parallel_submission);
        assert_eq!(strategy.payer_sequence[0], "Cigna");
        assert_eq!(strategy.payer_sequence[1], "Aetna");
    }

    #[test]
    fn test_step_generation_with_secondary() {
        let scorer = StrategyScorer::with_default_weights();
        let assessments = assessments_for("Cigna", 0.9);
        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), Some("Aetna"));
        let steps = &strategies[0].steps;

        // Primary: submit + monitor; secondary: submit + monitor + COB.
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0].action_type, "submit_pa");
        assert!(steps[0].dependencies.is_empty());
        assert_eq!(steps[1].action_type, "check_status");
        assert_eq!(steps[1].dependencies, vec![1]);
        assert_eq!(steps[1].estimated_duration_hours, 72);
        assert_eq!(steps[2].action_type, "submit_pa");
        assert_eq!(steps[2].dependencies, vec![2]);
        assert_eq!(steps[3].estimated_duration_hours, 48);
        assert_eq!(steps[4].action_type, "coordinate_benefits");
        assert_eq!(steps[4].dependencies, vec![4]);
    }

    #[test]
    fn test_likelihood_adjustment_boosts_approval() {
        let scorer = StrategyScorer::with_default_weights();
        let assessments = assessments_for("Cigna", 0.9);
        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), None);
        let score = scorer.score_strategy(&strategies[0], "CASE-1", &assessments);

        // base 7.0 + (0.9 - 0.5) * 4 = 8.6
        assert!((score.approval_score - 8.6).abs() < 1e-9);
        assert!((score.adjustments["first_payer_likelihood"] - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_likelihood_ceiling_caps_low_likelihood() {
        let scorer = StrategyScorer::with_default_weights();
        let assessments = assessments_for("Cigna", 0.15);
        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), None);
        let score = scorer.score_strategy(&strategies[0], "CASE-1", &assessments);

        // base 7.0 + (0.15-0.5)*4 = 5.6, ceiling = 0.15*10 + 1 = 2.5
        assert!((score.approval_score - 2.5).abs() < 1e-9);
        assert!(score.adjustments.contains_key("likelihood_ceiling"));
        assert!(score
            .adjustment_reasoning
            .iter()
            .any(|r| r.contains("likelihood ceiling")));
    }

    #[test]
    fn test_gap_and_step_therapy_penalties() {
        let scorer = StrategyScorer::with_default_weights();
        let mut a = assessment("Cigna", 0.7);
        a.documentation_gaps = vec![
            DocumentationGap {
                gap_id: "g1".to_string(),
                gap_type: "lab".to_string(),
                description: String::new(),
                required_for: vec![],
                priority: GapPriority::High,
                suggested_action: String::new(),
                estimated_resolution_complexity: String::new(),
            },
            DocumentationGap {
                gap_id: "g2".to_string(),
                gap_type: "lab".to_string(),
                description: String::new(),
                required_for: vec![],
                priority: GapPriority::High,
                suggested_action: String::new(),
                estimated_resolution_complexity: String::new(),
            },
        ];
        a.step_therapy_required = true;
        a.step_therapy_satisfied = false;
        let mut assessments = HashMap::new();
        assessments.insert("Cigna".to_string(), a);

        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), None);
        let score = scorer.score_strategy(&strategies[0], "CASE-1", &assessments);

        // base 7.0 + 0.8 = 7.8; gaps -1.0 = 6.8; step therapy -2.0 = 4.8
        assert!((score.approval_score - 4.8).abs() < 1e-9);
        assert_eq!(score.adjustments["documentation_gaps"], -1.0);
        assert_eq!(score.adjustments["step_therapy"], -2.0);
    }

    #[test]
    fn test_weighted_total_and_inverted_components() {
        let scorer = StrategyScorer::with_default_weights();
        let assessments = assessments_for("Cigna", 0.5);
        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), None);
        let score = scorer.score_strategy(&strategies[0], "CASE-1", &assessments);

        // likelihood 0.5 -> zero adjustment, approval stays 7.0
        assert!((score.approval_score - 7.0).abs() < 1e-9);
        assert!((score.rework_score - 8.0).abs() < 1e-9);
        assert!((score.patient_score - 7.0).abs() < 1e-9);
        // 0.3*6 + 0.4*7 + 0.2*8 + 0.1*7 = 1.8 + 2.8 + 1.6 + 0.7 = 6.9
        assert!((score.total_score - 6.9).abs() < 1e-9);
    }

    #[test]
    fn test_ranking_marks_single_recommendation() {
        let scorer = StrategyScorer::with_default_weights();
        let assessments = assessments_for("Cigna", 0.8);
        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), None);
        let scores = scorer.score_all_strategies(&strategies, "CASE-1", &assessments);

        assert_eq!(scores[0].rank, 1);
        assert!(scores[0].is_recommended);
        assert!(scores[0].recommendation_reasoning.is_some());
        assert_eq!(scores.iter().filter(|s| s.is_recommended).count(), 1);
    }

    #[test]
    fn test_select_best_errors_on_empty() {
        let scorer = StrategyScorer::with_default_weights();
        let result = scorer.select_best_strategy(&[], "CASE-1", &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let weights = ScoringWeights {
            speed: 0.9,
            approval: 0.9,
            low_rework: 0.1,
            patient_burden: 0.1,
        };
        assert!(StrategyScorer::new(weights).is_err());
    }

    #[test]
    fn test_weights_recorded_sum_to_one() {
        let scorer = StrategyScorer::with_default_weights();
        let assessments = assessments_for("Cigna", 0.6);
        let strategies = scorer.generate_strategies(&assessments, Some("Cigna"), None);
        let score = scorer.score_strategy(&strategies[0], "CASE-1", &assessments);
        let w = score.weights_used;
        assert!((w.speed + w.approval + w.low_rework + w.patient_burden - 1.0).abs() < 1e-9);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn approval_score_stays_in_range(likelihood in 0.0f64..=1.0) {
                let scorer = StrategyScorer::with_default_weights();
                let assessments = assessments_for("Cigna", likelihood);
                let strategies =
                    scorer.generate_strategies(&assessments, Some("Cigna"), None);
                let score = scorer.score_strategy(&strategies[0], "CASE-1", &assessments);
                prop_assert!((0.0..=10.0).contains(&score.approval_score));
                prop_assert!(score.total_score >= 0.0);
            }
        }
    }
}

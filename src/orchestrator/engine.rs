//! The case stage machine.
//!
//! Drives a case from intake to a terminal state, pausing at the
//! mandatory human-decision gate. Each stage handler produces a
//! [`StageDelta`]; the engine merges it into the case, persists one
//! version bump per stage, and logs audit events. Cancelling the
//! driving future between stages leaves the case at its last persisted
//! version — deltas are never partially applied.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::audit::{AuditLogger, EventType};
use crate::case::types::{
    CaseStage, CaseState, HumanDecision, HumanDecisionAction, PayerStatus,
};
use crate::case::IntakeAgent;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::events::{CaseEvent, EventHub};
use crate::intelligence::StrategicIntelligenceAgent;
use crate::llm::GenerateOptions;
use crate::policy::types::{CoverageAssessment, CoverageStatus};
use crate::policy::PolicyAnalyzer;
use crate::store::CaseStore;
use crate::strategy::{Strategy, StrategyScorer};
use crate::waypoint::WaypointWriter;

use super::payer::PayerGateway;
use super::state::{
    check_payer_responses, needs_recovery, PayerResponseSummary, PayerUpdate, StageDelta,
};

fn action_str(action: HumanDecisionAction) -> &'static str {
    match action {
        HumanDecisionAction::Approve => "approve",
        HumanDecisionAction::Reject => "reject",
        HumanDecisionAction::Override => "override",
        HumanDecisionAction::Escalate => "escalate",
        HumanDecisionAction::SubmitToPayer => "submit_to_payer",
        HumanDecisionAction::FollowRecommendation => "follow_recommendation",
        HumanDecisionAction::ReturnToProvider => "return_to_provider",
    }
}

/// Outcome of a full or resumed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub case: CaseState,
    /// True when the run paused at the human-decision gate
    pub awaiting_human_decision: bool,
}

/// Orchestrates the PA case workflow.
pub struct CaseOrchestrator {
    store: CaseStore,
    audit: AuditLogger,
    analyzer: Arc<PolicyAnalyzer>,
    scorer: StrategyScorer,
    intelligence: Arc<StrategicIntelligenceAgent>,
    payer_gateway: Arc<dyn PayerGateway>,
    waypoints: WaypointWriter,
    events: EventHub,
    settings: Settings,
}

impl CaseOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: CaseStore,
        audit: AuditLogger,
        analyzer: Arc<PolicyAnalyzer>,
        scorer: StrategyScorer,
        intelligence: Arc<StrategicIntelligenceAgent>,
        payer_gateway: Arc<dyn PayerGateway>,
        waypoints: WaypointWriter,
        events: EventHub,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            audit,
            analyzer,
            scorer,
            intelligence,
            payer_gateway,
            waypoints,
            events,
            settings,
        }
    }

    pub fn store(&self) -> &CaseStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn waypoints(&self) -> &WaypointWriter {
        &self.waypoints
    }

    pub(crate) fn analyzer(&self) -> &Arc<PolicyAnalyzer> {
        &self.analyzer
    }

    /// Validate intake data, create the case, and start its audit chain.
    pub fn create_case(&self, patient_data: &Value, medication_data: &Value) -> Result<CaseState> {
        let case = IntakeAgent::create_case(patient_data, medication_data)?;
        self.store.create(&case)?;

        let patient_id = case
            .patient
            .as_ref()
            .map(|p| p.patient_id.clone())
            .unwrap_or_default();
        let medication_name = case
            .medication
            .as_ref()
            .map(|m| m.medication_name.clone())
            .unwrap_or_default();
        // Audit is best-effort everywhere except the chain itself:
        // a failed append surfaces at verification, never silently.
        if let Err(e) = self
            .audit
            .log_case_created(&case.case_id, &patient_id, &medication_name)
        {
            warn!(case_id = %case.case_id, error = %e, "case-created audit event failed");
        }
        Ok(case)
    }

    /// Revert a case to an intake-equivalent state and start a fresh
    /// run of its audit narrative with a new case-created event.
    pub fn reset_case(&self, case_id: &str) -> Result<CaseState> {
        let state = self.store.reset(case_id)?;
        let patient_id = state
            .patient
            .as_ref()
            .map(|p| p.patient_id.clone())
            .unwrap_or_default();
        let medication_name = state
            .medication
            .as_ref()
            .map(|m| m.medication_name.clone())
            .unwrap_or_default();
        if let Err(e) = self
            .audit
            .log_case_created(case_id, &patient_id, &medication_name)
        {
            warn!(case_id, error = %e, "reset audit event failed");
        }
        Ok(state)
    }

    /// Run a case until it reaches a terminal stage or pauses at the
    /// human-decision gate.
    pub async fn run_case(&self, case_id: &str) -> Result<RunOutcome> {
        loop {
            let case = self.store.get(case_id)?;
            if case.stage.is_terminal() {
                return Ok(RunOutcome {
                    awaiting_human_decision: false,
                    case,
                });
            }
            if case.stage == CaseStage::AwaitingHumanDecision {
                return Ok(RunOutcome {
                    awaiting_human_decision: true,
                    case,
                });
            }

            let from_stage = case.stage;
            let delta = self.run_handler(&case).await?;
            let persisted = self.apply_delta(case_id, delta).await?;

            if persisted.stage != from_stage {
                if let Err(e) = self.audit.log_stage_change(
                    case_id,
                    &from_stage.to_string(),
                    &persisted.stage.to_string(),
                    "Stage handler completed",
                ) {
                    warn!(case_id, error = %e, "stage-change audit event failed");
                }
            }
        }
    }

    /// Run exactly one stage handler.
    ///
    /// With `refresh = false`, stages that already have results on the
    /// case return them marked as cached instead of re-running.
    pub async fn run_stage(&self, case_id: &str, stage: CaseStage, refresh: bool) -> Result<Value> {
        let case = self.store.get(case_id)?;

        if !refresh {
            if let Some(cached) = self.cached_stage_result(&case, stage) {
                info!(case_id, stage = %stage, "returning cached stage result");
                return Ok(cached);
            }
        }

        let delta = match stage {
            CaseStage::Intake => self.handle_intake(&case).await?,
            CaseStage::PolicyAnalysis => self.handle_policy_analysis(&case).await?,
            CaseStage::CohortAnalysis => self.handle_cohort_analysis(&case).await?,
            CaseStage::AiRecommendation => self.handle_ai_recommendation(&case).await?,
            CaseStage::StrategyGeneration => self.handle_strategy_generation(&case).await?,
            CaseStage::StrategySelection => self.handle_strategy_selection(&case).await?,
            CaseStage::ActionCoordination => self.handle_action_coordination(&case).await?,
            CaseStage::Monitoring => self.handle_monitoring(&case).await?,
            CaseStage::Recovery => self.handle_recovery(&case).await?,
            CaseStage::AwaitingHumanDecision | CaseStage::Completed | CaseStage::Failed => {
                return Err(Error::Validation(format!(
                    "stage {} has no runnable handler",
                    stage
                )))
            }
        };
        let persisted = self.apply_delta(case_id, delta).await?;
        Ok(json!({
            "case_id": case_id,
            "stage": persisted.stage,
            "cached": false,
            "version": persisted.version,
        }))
    }

    fn cached_stage_result(&self, case: &CaseState, stage: CaseStage) -> Option<Value> {
        let cached = match stage {
            CaseStage::PolicyAnalysis if !case.coverage_assessments.is_empty() => json!({
                "coverage_assessments": case.coverage_assessments,
                "documentation_gaps": case.documentation_gaps,
            }),
            CaseStage::CohortAnalysis
                if case.metadata.contains_key("strategic_intelligence") =>
            {
                case.metadata["strategic_intelligence"].clone()
            }
            CaseStage::AiRecommendation if case.metadata.contains_key("ai_recommendation") => {
                case.metadata["ai_recommendation"].clone()
            }
            CaseStage::StrategyGeneration if !case.available_strategies.is_empty() => {
                json!({ "available_strategies": case.available_strategies })
            }
            CaseStage::StrategySelection if case.selected_strategy_id.is_some() => json!({
                "selected_strategy_id": case.selected_strategy_id,
                "strategy_rationale": case.strategy_rationale,
            }),
            _ => return None,
        };
        Some(json!({
            "case_id": case.case_id,
            "stage": stage,
            "cached": true,
            "result": cached,
        }))
    }

    /// Persist a delta as one atomic mutation (version + snapshot).
    async fn apply_delta(&self, case_id: &str, delta: StageDelta) -> Result<CaseState> {
        let description = delta
            .stage
            .map(|s| format!("Stage handler: {}", s))
            .unwrap_or_else(|| "Stage delta".to_string());
        self.store
            .update(case_id, None, &description, "orchestrator", |state| {
                delta.apply(state);
            })
    }

    async fn run_handler(&self, case: &CaseState) -> Result<StageDelta> {
        match case.stage {
            CaseStage::Intake => self.handle_intake(case).await,
            CaseStage::PolicyAnalysis => self.handle_policy_analysis(case).await,
            CaseStage::CohortAnalysis => self.handle_cohort_analysis(case).await,
            CaseStage::AiRecommendation => self.handle_ai_recommendation(case).await,
            CaseStage::StrategyGeneration => self.handle_strategy_generation(case).await,
            CaseStage::StrategySelection => self.handle_strategy_selection(case).await,
            CaseStage::ActionCoordination => self.handle_action_coordination(case).await,
            CaseStage::Monitoring => self.handle_monitoring(case).await,
            CaseStage::Recovery => self.handle_recovery(case).await,
            CaseStage::AwaitingHumanDecision | CaseStage::Completed | CaseStage::Failed => {
                Err(Error::Internal(format!(
                    "run_handler called on non-runnable stage {}",
                    case.stage
                )))
            }
        }
    }

    // ---------------------------------------------------------------
    // Stage handlers
    // ---------------------------------------------------------------

    async fn handle_intake(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "processing intake");
        if case.patient.is_none() {
            return Ok(StageDelta::failed("Missing patient data"));
        }
        if case.medication.is_none() {
            return Ok(StageDelta::failed("Missing medication data"));
        }
        if case.payer_states.is_empty() {
            return Ok(StageDelta::failed("No payers configured for case"));
        }
        Ok(StageDelta::transition(CaseStage::PolicyAnalysis).with_message("Intake validated"))
    }

    async fn handle_policy_analysis(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "analyzing policies");
        let payers = case.payer_order();
        if payers.is_empty() {
            return Ok(StageDelta::failed("Cannot analyze policies: no payers"));
        }

        let patient_info = PolicyAnalyzer::build_patient_info(case)?;
        let medication_info = PolicyAnalyzer::build_medication_info(case)?;
        let options = GenerateOptions::for_case(&case.case_id);

        let evidence_warnings = self
            .analyzer
            .detect_evidence_gaps(&patient_info, options.clone())
            .await;

        let primary_payer = payers.first().cloned();
        let mut assessments: HashMap<String, CoverageAssessment> = HashMap::new();
        let mut reasoning_chain: Vec<String> = Vec::new();

        for payer in &payers {
            match self
                .analyzer
                .analyze_payer(
                    &patient_info,
                    &medication_info,
                    payer,
                    &evidence_warnings,
                    options.clone(),
                )
                .await
            {
                Ok(analysis) => {
                    reasoning_chain.extend(analysis.reasoning_chain);
                    assessments.insert(payer.clone(), analysis.assessment);
                }
                Err(e) => {
                    error!(case_id = %case.case_id, payer = %payer, error = %e, "payer analysis failed");
                    // Primary payer failure is critical; secondary
                    // failures reduce coverage of the analysis only.
                    if Some(payer) == primary_payer.as_ref() {
                        return Ok(StageDelta::failed(format!(
                            "Primary payer ({}) policy analysis failed: {}",
                            payer, e
                        )));
                    }
                }
            }
        }

        if assessments.is_empty() {
            return Ok(StageDelta::failed("Policy analysis produced no assessments"));
        }

        if let Err(e) = self.audit.log_event(
            &case.case_id,
            EventType::PolicyAnalyzed,
            format!("Analyzed {} payer policies", assessments.len()),
            reasoning_chain.join("\n"),
            CaseStage::PolicyAnalysis.to_string(),
            &json!({
                "payers": payers,
                "statuses": assessments
                    .iter()
                    .map(|(p, a)| (p.clone(), a.coverage_status.to_string()))
                    .collect::<HashMap<_, _>>(),
            }),
            vec![],
            "system",
        ) {
            warn!(case_id = %case.case_id, error = %e, "policy-analyzed audit event failed");
        }

        self.write_assessment_waypoint(case, &assessments);

        let requires_human = requires_human_decision(&assessments);
        let assessment_values: HashMap<String, Value> = assessments
            .iter()
            .map(|(payer, a)| Ok((payer.clone(), serde_json::to_value(a)?)))
            .collect::<Result<_>>()?;
        let gaps = PolicyAnalyzer::aggregate_documentation_gaps(&assessments);

        let mut delta = if requires_human {
            let mut delta = StageDelta::transition(CaseStage::AwaitingHumanDecision);
            delta.requires_human_decision = Some(true);
            delta.human_decision_reason =
                Some("Coverage assessment requires human review before proceeding".to_string());
            delta.with_message(format!(
                "Analyzed {} payer policies - awaiting human decision",
                assessment_values.len()
            ))
        } else {
            let mut delta = StageDelta::transition(CaseStage::StrategyGeneration);
            delta.requires_human_decision = Some(false);
            delta.with_message(format!("Analyzed {} payer policies", assessment_values.len()))
        };
        delta.coverage_assessments = Some(assessment_values);
        delta.documentation_gaps = Some(gaps);
        Ok(delta)
    }

    /// Cohort analysis: strategic intelligence over similar historical
    /// cases. Empty cohorts and missing corpora degrade softly.
    async fn handle_cohort_analysis(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "running cohort analysis");
        let case_value = serde_json::to_value(case)?;
        let patient_value = case
            .metadata
            .get("raw_patient")
            .cloned()
            .unwrap_or(Value::Null);

        let mut delta = StageDelta::transition(CaseStage::AiRecommendation);
        match self
            .intelligence
            .generate_strategic_intelligence(&case_value, &patient_value, false)
            .await
        {
            Ok(insights) => {
                delta.metadata.insert(
                    "strategic_intelligence".to_string(),
                    serde_json::to_value(&insights)?,
                );
                delta = delta.with_message(format!(
                    "Cohort analysis: {} similar cases, {:.0}% historical approval",
                    insights.similar_cases_count,
                    insights.approval_rate_for_similar * 100.0
                ));
            }
            Err(e) => {
                warn!(case_id = %case.case_id, error = %e, "cohort analysis unavailable, continuing");
                delta = delta.with_message("Cohort analysis unavailable".to_string());
            }
        }
        Ok(delta)
    }

    /// AI recommendation: summarize the assessment into an explicit
    /// recommendation block for the reviewer.
    async fn handle_ai_recommendation(&self, case: &CaseState) -> Result<StageDelta> {
        let assessments = self.deserialize_assessments(case)?;
        if assessments.is_empty() {
            return Ok(StageDelta::failed(
                "AI recommendation requires completed policy analysis",
            ));
        }
        let (recommendation, best_payer, best) = derive_recommendation(&assessments);

        let mut delta = if requires_human_decision(&assessments) {
            let mut delta = StageDelta::transition(CaseStage::AwaitingHumanDecision);
            delta.requires_human_decision = Some(true);
            delta.human_decision_reason =
                Some("AI recommendation requires human confirmation".to_string());
            delta
        } else {
            StageDelta::transition(CaseStage::StrategyGeneration)
        };
        delta.metadata.insert(
            "ai_recommendation".to_string(),
            json!({
                "recommendation": recommendation,
                "best_payer": best_payer,
                "confidence_score": best.approval_likelihood,
                "criteria_met": best.criteria_met_count,
                "criteria_total": best.criteria_total_count,
            }),
        );
        Ok(delta.with_message(format!("AI recommendation: {}", recommendation)))
    }

    async fn handle_strategy_generation(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "generating strategies");
        let assessments = self.deserialize_assessments(case)?;
        let payers = case.payer_order();
        let primary = payers.first().map(String::as_str);
        let secondary = payers.get(1).map(String::as_str);

        let strategies = self.scorer.generate_strategies(&assessments, primary, secondary);
        let strategy_values: Vec<Value> = strategies
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;

        if let Err(e) = self.audit.log_event(
            &case.case_id,
            EventType::StrategyGenerated,
            format!("Generated {} strategies", strategies.len()),
            "Sequential primary-first templates expanded over case payers",
            CaseStage::StrategyGeneration.to_string(),
            &json!({ "count": strategies.len() }),
            vec![],
            "system",
        ) {
            warn!(case_id = %case.case_id, error = %e, "strategy-generated audit event failed");
        }

        let mut delta = StageDelta::transition(CaseStage::StrategySelection)
            .with_message(format!("Generated {} strategies", strategies.len()));
        delta.available_strategies = Some(strategy_values);
        Ok(delta)
    }

    async fn handle_strategy_selection(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "selecting strategy");
        let assessments = self.deserialize_assessments(case)?;
        let strategies: Vec<Strategy> = case
            .available_strategies
            .iter()
            .map(|v| serde_json::from_value(v.clone()))
            .collect::<std::result::Result<_, _>>()?;
        if strategies.is_empty() {
            return Ok(StageDelta::failed("No strategies available to select"));
        }

        let (best, scores) =
            self.scorer
                .select_best_strategy(&strategies, &case.case_id, &assessments)?;
        let rationale = scores
            .first()
            .and_then(|s| s.recommendation_reasoning.clone())
            .unwrap_or_else(|| "Selected highest scoring strategy".to_string());

        let score_values: Vec<Value> = scores
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        if let Err(e) = self.audit.log_strategy_selected(
            &case.case_id,
            &serde_json::to_value(best)?,
            &score_values,
            &rationale,
        ) {
            warn!(case_id = %case.case_id, error = %e, "strategy-selected audit event failed");
        }

        let top_score = scores.first().map(|s| s.total_score).unwrap_or(0.0);
        let mut delta = StageDelta::transition(CaseStage::ActionCoordination).with_message(
            format!("Selected strategy: {} (score: {:.2})", best.name, top_score),
        );
        delta.selected_strategy_id = Some(best.strategy_id.clone());
        delta.strategy_rationale = Some(rationale);
        delta
            .metadata
            .insert("strategy_scores".to_string(), Value::Array(score_values));
        Ok(delta)
    }

    async fn handle_action_coordination(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "coordinating actions");
        let strategy = self.selected_strategy(case)?;

        // Execute the next pending submission in the strategy's order.
        let next_payer = strategy
            .payer_sequence
            .iter()
            .find(|payer| {
                case.payer_states
                    .get(*payer)
                    .map(|p| p.status == PayerStatus::NotSubmitted)
                    .unwrap_or(false)
            })
            .cloned();

        let Some(payer_name) = next_payer else {
            return Ok(StageDelta::transition(CaseStage::Monitoring)
                .with_message("All strategy submissions already in flight"));
        };

        let package = json!({
            "patient": case.patient,
            "medication": case.medication,
            "coverage_assessment": case.coverage_assessments.get(&payer_name),
        });
        let response = self
            .payer_gateway
            .submit_pa(&case.case_id, &payer_name, &package)
            .await?;

        if let Err(e) = self.audit.log_event(
            &case.case_id,
            EventType::ActionExecuted,
            format!("Executed submit_pa for {}", payer_name),
            format!(
                "Action succeeded: {}",
                response.details.get("message").and_then(Value::as_str).unwrap_or("")
            ),
            CaseStage::ActionCoordination.to_string(),
            &json!({"action_type": "submit_pa", "target": payer_name, "result": response.details}),
            vec![],
            "system",
        ) {
            warn!(case_id = %case.case_id, error = %e, "action-executed audit event failed");
        }

        let mut delta = StageDelta::transition(CaseStage::Monitoring)
            .with_message(format!("Action executed: submit_pa to {}", payer_name));
        delta.metadata.insert(
            "last_action".to_string(),
            json!({"action_type": "submit_pa", "target": payer_name}),
        );
        // The payer-state mutation rides in the same persisted delta.
        delta.payer_updates.push(
            PayerUpdate::new(&payer_name, response.status)
                .with_reference(response.reference_number.clone())
                .with_details(response.details),
        );
        Ok(delta)
    }

    async fn handle_monitoring(&self, case: &CaseState) -> Result<StageDelta> {
        let iterations = case
            .metadata
            .get("monitoring_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        info!(case_id = %case.case_id, iteration = iterations, "monitoring case");

        let previous_statuses: HashMap<String, PayerStatus> = case
            .payer_states
            .iter()
            .map(|(name, state)| (name.clone(), state.status))
            .collect();

        // Poll every payer with an active submission.
        let mut polled: HashMap<String, super::payer::PayerResponse> = HashMap::new();
        for (payer_name, payer_state) in &case.payer_states {
            if !payer_state.status.is_active() {
                continue;
            }
            match self
                .payer_gateway
                .check_status(&case.case_id, payer_name)
                .await
            {
                Ok(response) => {
                    if let Err(e) = self.audit.log_payer_response(
                        &case.case_id,
                        payer_name,
                        &format!("{:?}", response.status),
                        &response.details,
                        &CaseStage::Monitoring.to_string(),
                    ) {
                        warn!(case_id = %case.case_id, error = %e, "payer-response audit event failed");
                    }
                    polled.insert(payer_name.clone(), response);
                }
                Err(e) => {
                    error!(case_id = %case.case_id, payer = %payer_name, error = %e, "failed to check payer status");
                }
            }
        }

        // Project the post-poll status map for stale detection.
        let current_statuses: HashMap<String, PayerStatus> = case
            .payer_states
            .iter()
            .map(|(name, state)| {
                let status = polled.get(name).map(|r| r.status).unwrap_or(state.status);
                (name.clone(), status)
            })
            .collect();

        let mut stale_iterations = case
            .metadata
            .get("stale_iterations")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if current_statuses == previous_statuses {
            stale_iterations += 1;
        } else {
            stale_iterations = 0;
        }

        let mut delta = StageDelta::default();
        delta
            .metadata
            .insert("monitoring_iterations".to_string(), json!(iterations));
        delta
            .metadata
            .insert("stale_iterations".to_string(), json!(stale_iterations));
        for response in polled.values() {
            delta.payer_updates.push(
                PayerUpdate::new(&response.payer_name, response.status)
                    .with_details(response.details.clone()),
            );
        }

        // Stale progress: no status change across consecutive polls.
        if stale_iterations >= self.settings.monitoring_stale_threshold as u64 {
            warn!(case_id = %case.case_id, "no progress across consecutive monitoring polls, completing");
            delta.stage = Some(CaseStage::Completed);
            delta.metadata.insert(
                "final_outcome".to_string(),
                json!("Case processed - awaiting payer determinations"),
            );
            return Ok(delta.with_message("Monitoring: no progress detected, completing case"));
        }

        // Hard cap on monitoring passes.
        if iterations >= self.settings.monitoring_max_iterations as u64 {
            warn!(case_id = %case.case_id, "max monitoring iterations reached");
            delta.stage = Some(CaseStage::Completed);
            delta.metadata.insert(
                "final_outcome".to_string(),
                json!("Case processed - monitoring budget exhausted"),
            );
            return Ok(delta.with_message("Monitoring iteration cap reached"));
        }

        // Classify with the projected statuses applied.
        let mut projected = case.clone();
        for update in &delta.payer_updates {
            update.clone().apply(&mut projected);
        }

        match check_payer_responses(&projected) {
            PayerResponseSummary::Approved => {
                delta.stage = Some(CaseStage::Completed);
                delta
                    .metadata
                    .insert("final_outcome".to_string(), json!("All authorizations approved"));
                Ok(delta.with_message("All payers approved"))
            }
            PayerResponseSummary::Denied => {
                if needs_recovery(&projected) {
                    delta.stage = Some(CaseStage::Recovery);
                    if let Err(e) = self.audit.log_event(
                        &case.case_id,
                        EventType::RecoveryInitiated,
                        "Recovery initiated",
                        "Payer denial with appeal window open",
                        CaseStage::Recovery.to_string(),
                        &json!({"reason": "denial_with_appeal_deadline"}),
                        vec![],
                        "system",
                    ) {
                        warn!(case_id = %case.case_id, error = %e, "recovery audit event failed");
                    }
                    Ok(delta.with_message("Recovery initiated: payer denial - appeal available"))
                } else {
                    delta.stage = Some(CaseStage::Completed);
                    delta
                        .metadata
                        .insert("final_outcome".to_string(), json!("Authorization denied"));
                    Ok(delta.with_message("Authorization denied, no recovery path"))
                }
            }
            PayerResponseSummary::Partial | PayerResponseSummary::Pending => {
                // Stay in monitoring; the loop is bounded by the stale
                // counter and the hard cap above.
                Ok(delta.with_message("Monitoring: awaiting further payer determinations"))
            }
        }
    }

    async fn handle_recovery(&self, case: &CaseState) -> Result<StageDelta> {
        info!(case_id = %case.case_id, "processing recovery");
        let denied_payer = case
            .payer_states
            .values()
            .find(|p| p.status == PayerStatus::Denied && p.appeal_deadline.is_some())
            .map(|p| p.payer_name.clone());

        let Some(payer_name) = denied_payer else {
            return Ok(StageDelta::transition(CaseStage::Monitoring)
                .with_message("No appealable denial found, returning to monitoring"));
        };

        let appeal_context = json!({
            "denial_reason": case
                .payer_states
                .get(&payer_name)
                .and_then(|p| p.denial_reason.clone()),
            "coverage_assessment": case.coverage_assessments.get(&payer_name),
        });
        let response = self
            .payer_gateway
            .initiate_appeal(&case.case_id, &payer_name, &appeal_context)
            .await?;

        if let Err(e) = self.audit.log_event(
            &case.case_id,
            EventType::ActionExecuted,
            format!("Executed initiate_appeal for {}", payer_name),
            "Appeal filed against payer denial",
            CaseStage::Recovery.to_string(),
            &json!({"action_type": "initiate_appeal", "target": payer_name}),
            vec![],
            "system",
        ) {
            warn!(case_id = %case.case_id, error = %e, "appeal audit event failed");
        }

        let mut delta = StageDelta::transition(CaseStage::Monitoring)
            .with_message(format!("Recovery action: initiate_appeal for {}", payer_name));
        delta.payer_updates.push(
            PayerUpdate::new(&payer_name, response.status)
                .with_reference(response.reference_number.clone())
                .with_details(response.details),
        );
        Ok(delta)
    }

    // ---------------------------------------------------------------
    // Human decision ingestion
    // ---------------------------------------------------------------

    /// Record a human decision and resume the workflow.
    ///
    /// Idempotent for approvals: once the gate is cleared and the stage
    /// has advanced, replaying the same decision is a no-op.
    pub async fn resume_after_human_decision(
        &self,
        case_id: &str,
        mut decision: HumanDecision,
    ) -> Result<RunOutcome> {
        let case = self.store.get(case_id)?;

        if !case.requires_human_decision && case.stage != CaseStage::AwaitingHumanDecision {
            info!(
                case_id,
                stage = %case.stage,
                "human decision replay ignored - gate already cleared"
            );
            return Ok(RunOutcome {
                awaiting_human_decision: false,
                case,
            });
        }

        decision.stage = CaseStage::AwaitingHumanDecision.to_string();
        let action = decision.action;
        let reviewer_id = decision.reviewer_id.clone();

        if let Err(e) = self.audit.log_human_decision(
            case_id,
            action_str(action),
            &reviewer_id,
            &decision.stage,
            decision.notes.as_deref(),
        ) {
            warn!(case_id, error = %e, "human-decision audit event failed");
        }

        let updated = self.store.update(
            case_id,
            None,
            "Human decision recorded",
            &reviewer_id,
            |state| {
                state.human_decisions.push(decision.clone());
                match action {
                    HumanDecisionAction::Approve
                    | HumanDecisionAction::FollowRecommendation
                    | HumanDecisionAction::SubmitToPayer => {
                        state.requires_human_decision = false;
                        state.stage = CaseStage::StrategyGeneration;
                    }
                    HumanDecisionAction::Override => {
                        state.requires_human_decision = false;
                        state.stage = CaseStage::StrategyGeneration;
                        state
                            .metadata
                            .insert("human_override_applied".to_string(), json!(true));
                    }
                    HumanDecisionAction::Reject => {
                        state.requires_human_decision = false;
                        state.stage = CaseStage::Failed;
                        state.error_message = Some(format!(
                            "Case rejected by human reviewer: {}",
                            decision
                                .notes
                                .clone()
                                .or(decision.override_reason.clone())
                                .unwrap_or_else(|| "No reason provided".to_string())
                        ));
                    }
                    HumanDecisionAction::ReturnToProvider => {
                        state.requires_human_decision = false;
                        state.stage = CaseStage::Completed;
                        state.metadata.insert(
                            "final_outcome".to_string(),
                            json!("Returned to provider for additional documentation"),
                        );
                    }
                    HumanDecisionAction::Escalate => {
                        // The gate stays armed for the senior reviewer.
                        state.metadata.insert(
                            "escalation_note".to_string(),
                            json!(format!(
                                "Case escalated by {} for senior review",
                                decision.reviewer_id
                            )),
                        );
                    }
                }
            },
        )?;

        self.write_decision_waypoint(&updated, action);

        self.events
            .broadcast_case(CaseEvent::new(
                "human_decision",
                case_id,
                json!({
                    "action": action_str(action),
                    "reviewer_id": reviewer_id,
                    "stage": updated.stage,
                }),
            ))
            .await;

        match action {
            HumanDecisionAction::Approve
            | HumanDecisionAction::FollowRecommendation
            | HumanDecisionAction::SubmitToPayer
            | HumanDecisionAction::Override => self.run_case(case_id).await,
            _ => Ok(RunOutcome {
                awaiting_human_decision: updated.stage == CaseStage::AwaitingHumanDecision,
                case: updated,
            }),
        }
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn deserialize_assessments(
        &self,
        case: &CaseState,
    ) -> Result<HashMap<String, CoverageAssessment>> {
        case.coverage_assessments
            .iter()
            .map(|(payer, value)| {
                let assessment: CoverageAssessment = serde_json::from_value(value.clone())?;
                Ok((payer.clone(), assessment))
            })
            .collect()
    }

    fn selected_strategy(&self, case: &CaseState) -> Result<Strategy> {
        let selected_id = case
            .selected_strategy_id
            .as_ref()
            .ok_or_else(|| Error::Validation("no strategy selected".to_string()))?;
        case.available_strategies
            .iter()
            .filter_map(|v| serde_json::from_value::<Strategy>(v.clone()).ok())
            .find(|s| &s.strategy_id == selected_id)
            .ok_or_else(|| Error::Internal("selected strategy not among available".to_string()))
    }

    pub(crate) fn write_assessment_waypoint(
        &self,
        case: &CaseState,
        assessments: &HashMap<String, CoverageAssessment>,
    ) {
        if assessments.is_empty() {
            return;
        }
        let (recommendation, best_payer, best) = derive_recommendation(assessments);

        let patient_summary = case
            .patient
            .as_ref()
            .map(|p| {
                json!({
                    "patient_id": p.patient_id,
                    "name": format!("{} {}", p.first_name, p.last_name),
                    "primary_payer": p.primary_payer,
                    "secondary_payer": p.secondary_payer,
                    "diagnosis_codes": p.diagnosis_codes,
                })
            })
            .unwrap_or(Value::Null);
        let medication_summary = case
            .medication
            .as_ref()
            .map(|m| {
                json!({
                    "medication_name": m.medication_name,
                    "dose": m.dose,
                    "indication": m.diagnosis,
                    "icd10_code": m.icd10_code,
                    "prescriber_npi": m.prescriber_npi,
                })
            })
            .unwrap_or(Value::Null);
        let assessments_summary: Value = assessments
            .iter()
            .map(|(payer, a)| {
                (
                    payer.clone(),
                    json!({
                        "status": a.coverage_status,
                        "likelihood": a.approval_likelihood,
                        "criteria_met": a.criteria_met_count,
                        "criteria_total": a.criteria_total_count,
                    }),
                )
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();

        let reasoning = format!(
            "Analysis of {} payer(s). Best option: {} with {:.0}% approval likelihood. \
             Status: {}. Criteria met: {}/{}.",
            assessments.len(),
            best_payer,
            best.approval_likelihood * 100.0,
            best.coverage_status,
            best.criteria_met_count,
            best.criteria_total_count
        );

        // Waypoint writing is best-effort.
        if let Err(e) = self.waypoints.write_assessment_waypoint(
            &case.case_id,
            patient_summary,
            medication_summary,
            assessments_summary,
            json!(PolicyAnalyzer::aggregate_documentation_gaps(assessments)),
            &recommendation,
            best.approval_likelihood,
            &reasoning,
        ) {
            warn!(case_id = %case.case_id, error = %e, "failed to write assessment waypoint");
        }
    }

    fn write_decision_waypoint(&self, case: &CaseState, action: HumanDecisionAction) {
        let Some(decision) = case.human_decisions.last() else {
            return;
        };
        let (status, details, documentation_requests) = match action {
            HumanDecisionAction::Reject => (
                "denied",
                json!({
                    "reason": case.error_message,
                    "denial_reason": decision
                        .notes
                        .clone()
                        .or(decision.override_reason.clone()),
                }),
                vec![],
            ),
            HumanDecisionAction::ReturnToProvider => (
                "pend",
                json!({"reason": "Returned to provider for additional documentation"}),
                case.documentation_gaps.clone(),
            ),
            HumanDecisionAction::Approve
            | HumanDecisionAction::FollowRecommendation
            | HumanDecisionAction::SubmitToPayer
            | HumanDecisionAction::Override => (
                "approved_for_submission",
                json!({"next_stage": case.stage}),
                vec![],
            ),
            HumanDecisionAction::Escalate => return,
        };

        if let Err(e) = self.waypoints.write_decision_waypoint(
            &case.case_id,
            serde_json::to_value(decision).unwrap_or(Value::Null),
            status,
            details.clone(),
            documentation_requests,
        ) {
            warn!(case_id = %case.case_id, error = %e, "failed to write decision waypoint");
        }

        // Terminal decisions also get a notification letter.
        if matches!(
            action,
            HumanDecisionAction::Reject | HumanDecisionAction::ReturnToProvider
        ) {
            let patient_name = case
                .patient
                .as_ref()
                .map(|p| format!("{} {}", p.first_name, p.last_name))
                .unwrap_or_default();
            let medication_name = case
                .medication
                .as_ref()
                .map(|m| m.medication_name.clone())
                .unwrap_or_default();
            let payer_name = case.primary_payer().unwrap_or("").to_string();
            let letter_status = if action == HumanDecisionAction::Reject {
                "denied"
            } else {
                "pend"
            };
            if let Err(e) = self.waypoints.write_notification_letter(
                &case.case_id,
                letter_status,
                &patient_name,
                &medication_name,
                &payer_name,
                &details,
            ) {
                warn!(case_id = %case.case_id, error = %e, "failed to write notification letter");
            }
        }
    }
}

/// After policy analysis: does any payer's result force the human gate?
pub fn requires_human_decision(assessments: &HashMap<String, CoverageAssessment>) -> bool {
    assessments.values().any(|assessment| {
        matches!(
            assessment.coverage_status,
            CoverageStatus::NotCovered
                | CoverageStatus::RequiresHumanReview
                | CoverageStatus::Unknown
        ) || assessment.approval_likelihood < 0.5
    })
}

/// Derive the reviewer-facing recommendation from the best assessment.
pub(crate) fn derive_recommendation(
    assessments: &HashMap<String, CoverageAssessment>,
) -> (String, String, CoverageAssessment) {
    let (best_payer, best) = assessments
        .iter()
        .max_by(|a, b| {
            a.1.approval_likelihood
                .partial_cmp(&b.1.approval_likelihood)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(p, a)| (p.clone(), a.clone()))
        .unwrap_or_else(|| ("unknown".to_string(), CoverageAssessment::new("unknown", "unknown")));

    let recommendation = match best.coverage_status {
        CoverageStatus::Covered | CoverageStatus::LikelyCovered => "APPROVE",
        CoverageStatus::RequiresPa | CoverageStatus::Conditional | CoverageStatus::Pend => "PEND",
        _ => "REQUIRES_HUMAN_REVIEW",
    };
    (recommendation.to_string(), best_payer, best)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::error::ProviderErrorKind;
    use crate::llm::gateway::test_support::MockProvider;
    use crate::llm::{LlmGateway, Provider};
    use crate::policy::{PolicyReasoner, PolicyRepository, RubricLoader};
    use crate::prompt::PromptStore;
    use crate::store::{CaseStore, Database};
    use crate::strategy::StrategyScorer;
    use crate::waypoint::WaypointWriter;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Arc<CaseOrchestrator>,
        db: Arc<Database>,
        _dir: TempDir,
    }

    fn criteria_payload(met: &[bool], likelihood: f64, status: &str) -> Value {
        let criteria: Vec<Value> = met
            .iter()
            .enumerate()
            .map(|(i, is_met)| {
                json!({
                    "criterion_id": format!("C{}", i + 1),
                    "criterion_name": format!("criterion {}", i + 1),
                    "is_met": is_met,
                    "confidence": 0.9,
                    "supporting_evidence": [],
                    "gaps": [],
                    "reasoning": "assessed"
                })
            })
            .collect();
        json!({
            "coverage_status": status,
            "approval_likelihood": likelihood,
            "approval_likelihood_reasoning": "test",
            "criteria_assessments": criteria,
            "documentation_gaps": [],
            "recommendations": ["Submit with current documentation"],
            "step_therapy_required": false,
            "step_therapy_satisfied": true
        })
    }

    fn build_harness(claude_payload: Value) -> Harness {
        let dir = TempDir::new().unwrap();
        let prompts = dir.path().join("prompts");
        std::fs::create_dir_all(prompts.join("policy_analysis")).unwrap();
        std::fs::create_dir_all(prompts.join("system")).unwrap();
        std::fs::write(
            prompts.join("policy_analysis/coverage_assessment.txt"),
            "Assess {medication_info} for {payer_name} given {policy_criteria} and {policy_document}. {historical_context}",
        )
        .unwrap();
        std::fs::write(
            prompts.join("system/clinical_reasoning_base.txt"),
            "You are a clinical policy reviewer.",
        )
        .unwrap();
        std::fs::write(
            prompts.join("policy_analysis/evidence_gap_detection.txt"),
            "Scan {patient_info} for gaps.",
        )
        .unwrap();

        let settings = Settings::default()
            .with_gateway_timeout_secs(5)
            .with_transient_retry_delay_secs(0)
            .with_prompts_dir(prompts.to_str().unwrap())
            .with_policies_dir(dir.path().join("policies").to_str().unwrap())
            .with_rubrics_dir(dir.path().join("rubrics").to_str().unwrap())
            .with_waypoints_dir(dir.path().join("waypoints").to_str().unwrap())
            .with_outputs_dir(dir.path().join("outputs").to_str().unwrap())
            .with_historical_data_path(dir.path().join("historical.json").to_str().unwrap());

        let db = Arc::new(Database::in_memory().unwrap());
        db.put_policy(
            "cigna",
            "adalimumab",
            "v1",
            Some("Cigna adalimumab policy text"),
            None,
        )
        .unwrap();

        let gateway = Arc::new(
            LlmGateway::new(settings.clone())
                .with_provider(Arc::new(MockProvider::always_ok(
                    Provider::Claude,
                    claude_payload,
                )))
                .with_provider(Arc::new(MockProvider::always_ok(
                    Provider::Gemini,
                    json!({"evidence_warnings": [], "overall_readiness": "ready"}),
                )))
                .with_usage_sink(db.clone()),
        );
        let prompt_store = Arc::new(PromptStore::new(&settings.prompts_dir));
        let repository = PolicyRepository::new(db.clone(), settings.clone());
        let reasoner = Arc::new(PolicyReasoner::new(
            repository,
            prompt_store.clone(),
            gateway.clone(),
            RubricLoader::new(&settings.rubrics_dir),
        ));
        let analyzer = Arc::new(PolicyAnalyzer::new(
            reasoner,
            prompt_store.clone(),
            gateway.clone(),
            settings.clone(),
        ));
        let intelligence = Arc::new(StrategicIntelligenceAgent::new(
            db.clone(),
            gateway.clone(),
            prompt_store,
            settings.clone(),
        ));
        let store = CaseStore::new(db.clone());
        let audit = AuditLogger::new(db.clone());
        let waypoints =
            WaypointWriter::new(settings.waypoints_dir.clone(), settings.outputs_dir.clone());

        let orchestrator = Arc::new(CaseOrchestrator::new(
            store,
            audit,
            analyzer,
            StrategyScorer::with_default_weights(),
            intelligence,
            Arc::new(super::super::payer::MockPayerGateway::new()),
            waypoints,
            EventHub::default(),
            settings,
        ));

        Harness {
            orchestrator,
            db,
            _dir: dir,
        }
    }

    fn patient_json() -> Value {
        json!({
            "patient_id": "P-001",
            "first_name": "Jane",
            "last_name": "Doe",
            "date_of_birth": "1985-04-02",
            "primary_payer": "Cigna",
            "primary_member_id": "M123",
            "diagnosis_codes": ["K50.00"]
        })
    }

    fn medication_json() -> Value {
        json!({
            "medication_name": "adalimumab",
            "generic_name": "adalimumab",
            "ndc_code": "0074-3799-02",
            "dose": "40 mg",
            "frequency": "every other week",
            "route": "subcutaneous",
            "duration": "ongoing",
            "diagnosis": "Crohn's disease",
            "icd10_code": "K50.00",
            "prescriber_npi": "1234567890",
            "prescriber_name": "Dr. Smith",
            "clinical_rationale": "Moderate-to-severe CD, failed conventional therapy"
        })
    }

    #[tokio::test]
    async fn test_happy_path_runs_to_completion() {
        let harness = build_harness(criteria_payload(&[true, true, true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();

        assert!(!outcome.awaiting_human_decision);
        assert_eq!(outcome.case.stage, CaseStage::Completed);
        assert!(!outcome.case.requires_human_decision);
        assert_eq!(
            outcome.case.metadata["final_outcome"],
            "All authorizations approved"
        );

        // Stage sequence through the snapshots, strictly increasing versions.
        let snapshots = orchestrator.store().get_snapshots(&case.case_id).unwrap();
        for pair in snapshots.windows(2) {
            assert!(pair[1].version > pair[0].version);
        }
        let stages: Vec<CaseStage> = snapshots.iter().map(|s| s.state.stage).collect();
        for expected in [
            CaseStage::Intake,
            CaseStage::PolicyAnalysis,
            CaseStage::StrategyGeneration,
            CaseStage::StrategySelection,
            CaseStage::ActionCoordination,
            CaseStage::Monitoring,
            CaseStage::Completed,
        ] {
            assert!(stages.contains(&expected), "missing stage {:?}", expected);
        }

        // Audit chain is intact and substantial.
        let trail = orchestrator.audit().get_audit_trail(&case.case_id).unwrap();
        assert!(trail.events.len() >= 6, "only {} events", trail.events.len());
        assert!(trail.verify_chain());

        // Payer ended approved.
        assert_eq!(
            outcome.case.payer_states["Cigna"].status,
            PayerStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_ai_never_denies() {
        let harness = build_harness(criteria_payload(&[false, false], 0.15, "not_covered"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();

        assert!(outcome.awaiting_human_decision);
        assert_eq!(outcome.case.stage, CaseStage::AwaitingHumanDecision);
        assert!(outcome.case.requires_human_decision);

        let assessment = &outcome.case.coverage_assessments["Cigna"];
        assert_eq!(assessment["coverage_status"], "requires_human_review");
        // NOT_COVERED never survives to output.
        assert_ne!(assessment["coverage_status"], "not_covered");
    }

    #[tokio::test]
    async fn test_human_reject_fails_case_with_waypoint() {
        let harness = build_harness(criteria_payload(&[false, false], 0.15, "not_covered"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        orchestrator.run_case(&case.case_id).await.unwrap();

        let decision = HumanDecision::new(HumanDecisionAction::Reject, "rev-42")
            .with_notes("No medical necessity documented");
        let outcome = orchestrator
            .resume_after_human_decision(&case.case_id, decision)
            .await
            .unwrap();

        assert_eq!(outcome.case.stage, CaseStage::Failed);
        assert!(outcome
            .case
            .error_message
            .as_deref()
            .unwrap()
            .contains("No medical necessity documented"));

        // Audit event carries the reviewer as actor.
        let trail = orchestrator.audit().get_audit_trail(&case.case_id).unwrap();
        let decision_event = trail
            .events
            .iter()
            .find(|e| e.event_type == EventType::HumanDecision)
            .unwrap();
        assert_eq!(decision_event.actor, "rev-42");
        assert!(trail.verify_chain());

        // Decision waypoint with denied outcome.
        let waypoint = orchestrator
            .waypoints()
            .load_waypoint(&case.case_id, "decision")
            .unwrap();
        assert_eq!(waypoint["outcome"]["status"], "denied");
    }

    #[tokio::test]
    async fn test_likelihood_clamped_down_forces_gate() {
        // 3 criteria, 1 met (ratio 1/3) with claimed 0.95: clamp to <= 0.433.
        let harness = build_harness(criteria_payload(&[true, false, false], 0.95, "covered"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();

        let likelihood = outcome.case.coverage_assessments["Cigna"]["approval_likelihood"]
            .as_f64()
            .unwrap();
        assert!(likelihood <= 1.0 / 3.0 + 0.1 + 1e-9, "likelihood {}", likelihood);
        // The clamped likelihood lands under 0.5, so the gate arms.
        assert!(outcome.awaiting_human_decision);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let harness = build_harness(criteria_payload(&[true, true], 0.45, "requires_pa"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();
        assert!(outcome.awaiting_human_decision);

        let decision = HumanDecision::new(HumanDecisionAction::Approve, "rev-7");
        let first = orchestrator
            .resume_after_human_decision(&case.case_id, decision.clone())
            .await
            .unwrap();
        assert_eq!(first.case.stage, CaseStage::Completed);
        assert_eq!(first.case.human_decisions.len(), 1);
        let version_after_first = first.case.version;

        // Replaying the same approved decision is a no-op.
        let second = orchestrator
            .resume_after_human_decision(&case.case_id, decision)
            .await
            .unwrap();
        assert_eq!(second.case.stage, CaseStage::Completed);
        assert_eq!(second.case.human_decisions.len(), 1);
        assert_eq!(second.case.version, version_after_first);
    }

    #[tokio::test]
    async fn test_escalate_keeps_gate_armed() {
        let harness = build_harness(criteria_payload(&[false], 0.2, "unknown"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        orchestrator.run_case(&case.case_id).await.unwrap();

        let decision = HumanDecision::new(HumanDecisionAction::Escalate, "rev-1")
            .with_notes("needs senior review");
        let outcome = orchestrator
            .resume_after_human_decision(&case.case_id, decision)
            .await
            .unwrap();

        assert!(outcome.awaiting_human_decision);
        assert_eq!(outcome.case.stage, CaseStage::AwaitingHumanDecision);
        assert!(outcome.case.requires_human_decision);
        assert!(outcome.case.metadata["escalation_note"]
            .as_str()
            .unwrap()
            .contains("rev-1"));
    }

    #[tokio::test]
    async fn test_return_to_provider_completes_with_note() {
        let harness = build_harness(criteria_payload(&[false], 0.2, "unknown"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        orchestrator.run_case(&case.case_id).await.unwrap();

        let decision = HumanDecision::new(HumanDecisionAction::ReturnToProvider, "rev-9");
        let outcome = orchestrator
            .resume_after_human_decision(&case.case_id, decision)
            .await
            .unwrap();

        assert_eq!(outcome.case.stage, CaseStage::Completed);
        assert!(outcome.case.metadata["final_outcome"]
            .as_str()
            .unwrap()
            .contains("Returned to provider"));
        let waypoint = orchestrator
            .waypoints()
            .load_waypoint(&case.case_id, "decision")
            .unwrap();
        assert_eq!(waypoint["outcome"]["status"], "pend");
    }

    #[tokio::test]
    async fn test_empty_payer_list_fails() {
        let harness = build_harness(criteria_payload(&[true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;

        // Bypass intake validation to plant a payerless case.
        let mut case = CaseState::new();
        case.patient = serde_json::from_value(patient_json()).ok();
        case.medication = serde_json::from_value(medication_json()).ok();
        orchestrator.store().create(&case).unwrap();

        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();
        assert_eq!(outcome.case.stage, CaseStage::Failed);
        assert!(outcome
            .case
            .error_message
            .as_deref()
            .unwrap()
            .contains("No payers"));
    }

    #[tokio::test]
    async fn test_run_stage_returns_cached_results() {
        let harness = build_harness(criteria_payload(&[true, true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;

        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        orchestrator.run_case(&case.case_id).await.unwrap();

        let result = orchestrator
            .run_stage(&case.case_id, CaseStage::PolicyAnalysis, false)
            .await
            .unwrap();
        assert_eq!(result["cached"], true);
        assert!(result["result"]["coverage_assessments"]["Cigna"].is_object());
    }

    #[tokio::test]
    async fn test_denial_with_appeal_recovers_then_completes() {
        let harness = build_harness(criteria_payload(&[true, true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;
        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();

        // Manually deny with an appeal deadline, then run monitoring.
        orchestrator
            .store()
            .update(&case.case_id, None, "setup", "test", |state| {
                state.stage = CaseStage::Monitoring;
                let payer = state.payer_states.get_mut("Cigna").unwrap();
                payer.status = PayerStatus::Denied;
                payer.appeal_deadline = Some(chrono::Utc::now() + chrono::Duration::days(30));
            })
            .unwrap();

        let outcome = harness.orchestrator.run_case(&case.case_id).await.unwrap();
        // Recovery appeals, monitoring resumes, the mock approves the
        // appeal, and the case completes.
        assert_eq!(outcome.case.stage, CaseStage::Completed);
        let trail = harness
            .orchestrator
            .audit()
            .get_audit_trail(&case.case_id)
            .unwrap();
        assert!(trail
            .events
            .iter()
            .any(|e| e.event_type == EventType::RecoveryInitiated));
        assert!(trail.verify_chain());
    }

    #[tokio::test]
    async fn test_monitoring_stale_forces_completion() {
        let harness = build_harness(criteria_payload(&[true, true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;
        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();

        // Park the case in monitoring with a payer stuck not_submitted:
        // no polls happen, statuses never change, stale counter trips.
        orchestrator
            .store()
            .update(&case.case_id, None, "setup", "test", |state| {
                state.stage = CaseStage::Monitoring;
            })
            .unwrap();

        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();
        assert_eq!(outcome.case.stage, CaseStage::Completed);
        assert!(outcome.case.metadata["final_outcome"]
            .as_str()
            .unwrap()
            .contains("awaiting payer determinations"));
        // Stale threshold (2) rather than the hard cap ended the loop.
        assert!(outcome.case.metadata["monitoring_iterations"].as_u64().unwrap() <= 3);
    }

    #[tokio::test]
    async fn test_usage_recorded_for_case() {
        let harness = build_harness(criteria_payload(&[true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;
        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        orchestrator.run_case(&case.case_id).await.unwrap();

        let usage = harness.db.usage_for_case(&case.case_id).unwrap();
        assert!(!usage.is_empty());
        assert!(usage.iter().any(|u| u.provider == Provider::Claude));
    }

    #[tokio::test]
    async fn test_stream_policy_analysis_emits_ordered_events() {
        use futures::StreamExt;

        let harness = build_harness(criteria_payload(&[true, true], 0.9, "covered"));
        let orchestrator = &harness.orchestrator;
        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();

        let stream = orchestrator.stream_policy_analysis(&case.case_id, false);
        let events: Vec<Value> = stream.collect().await;

        let kinds: Vec<&str> = events
            .iter()
            .filter_map(|e| e.get("event").and_then(Value::as_str))
            .collect();
        assert_eq!(kinds.first(), Some(&"stage_start"));
        assert_eq!(kinds.last(), Some(&"done"));
        assert!(kinds.contains(&"payer_start"));
        assert!(kinds.contains(&"payer_complete"));
        assert!(kinds.contains(&"stage_complete"));
        assert!(!kinds.contains(&"error"));

        let payer_complete = events
            .iter()
            .find(|e| e.get("event").and_then(Value::as_str) == Some("payer_complete"))
            .unwrap();
        assert_eq!(payer_complete["payer_name"], "Cigna");
        assert_eq!(payer_complete["criteria_met"], 2);

        let stage_complete = events
            .iter()
            .find(|e| e.get("event").and_then(Value::as_str) == Some("stage_complete"))
            .unwrap();
        assert_eq!(stage_complete["percent"], 100);

        // The analysis persisted exactly as the batch stage would.
        let persisted = orchestrator.store().get(&case.case_id).unwrap();
        assert!(persisted.coverage_assessments.contains_key("Cigna"));
        assert_eq!(persisted.stage, CaseStage::StrategyGeneration);

        // A second stream replays the cached results.
        let stream = orchestrator.stream_policy_analysis(&case.case_id, false);
        let events: Vec<Value> = stream.collect().await;
        let cached = events
            .iter()
            .find(|e| e.get("event").and_then(Value::as_str) == Some("stage_complete"))
            .unwrap();
        assert_eq!(cached["cached"], true);
    }

    #[tokio::test]
    async fn test_gateway_exhaustion_fails_stage() {
        // Both clinical providers permanently broken: policy reasoning
        // exhausts the route and the primary-payer failure fails the case.
        let failing = build_failing_harness();
        let orchestrator = &failing.orchestrator;
        let case = orchestrator
            .create_case(&patient_json(), &medication_json())
            .unwrap();
        let outcome = orchestrator.run_case(&case.case_id).await.unwrap();
        assert_eq!(outcome.case.stage, CaseStage::Failed);
        assert!(outcome
            .case
            .error_message
            .as_deref()
            .unwrap()
            .contains("Primary payer"));
    }

    fn build_failing_harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let prompts = dir.path().join("prompts");
        std::fs::create_dir_all(prompts.join("policy_analysis")).unwrap();
        std::fs::create_dir_all(prompts.join("system")).unwrap();
        std::fs::write(
            prompts.join("policy_analysis/coverage_assessment.txt"),
            "Assess {payer_name}.",
        )
        .unwrap();
        std::fs::write(prompts.join("system/clinical_reasoning_base.txt"), "sys").unwrap();

        let settings = Settings::default()
            .with_gateway_timeout_secs(5)
            .with_transient_retry_delay_secs(0)
            .with_prompts_dir(prompts.to_str().unwrap())
            .with_waypoints_dir(dir.path().join("waypoints").to_str().unwrap())
            .with_outputs_dir(dir.path().join("outputs").to_str().unwrap());

        let db = Arc::new(Database::in_memory().unwrap());
        db.put_policy("cigna", "adalimumab", "v1", Some("text"), None)
            .unwrap();

        let gateway = Arc::new(
            LlmGateway::new(settings.clone())
                .with_provider(Arc::new(MockProvider::always_err(
                    Provider::Claude,
                    ProviderErrorKind::Authentication,
                )))
                .with_provider(Arc::new(MockProvider::always_err(
                    Provider::AzureOpenAi,
                    ProviderErrorKind::Authentication,
                )))
                .with_provider(Arc::new(MockProvider::always_ok(
                    Provider::Gemini,
                    json!({"evidence_warnings": []}),
                ))),
        );
        let prompt_store = Arc::new(PromptStore::new(&settings.prompts_dir));
        let repository = PolicyRepository::new(db.clone(), settings.clone());
        let reasoner = Arc::new(PolicyReasoner::new(
            repository,
            prompt_store.clone(),
            gateway.clone(),
            RubricLoader::new(&settings.rubrics_dir),
        ));
        let analyzer = Arc::new(PolicyAnalyzer::new(
            reasoner,
            prompt_store.clone(),
            gateway.clone(),
            settings.clone(),
        ));
        let intelligence = Arc::new(StrategicIntelligenceAgent::new(
            db.clone(),
            gateway,
            prompt_store,
            settings.clone(),
        ));
        let orchestrator = Arc::new(CaseOrchestrator::new(
            CaseStore::new(db.clone()),
            AuditLogger::new(db.clone()),
            analyzer,
            StrategyScorer::with_default_weights(),
            intelligence,
            Arc::new(super::super::payer::MockPayerGateway::new()),
            WaypointWriter::new(settings.waypoints_dir.clone(), settings.outputs_dir.clone()),
            EventHub::default(),
            settings,
        ));
        Harness {
            orchestrator,
            db,
            _dir: dir,
        }
    }
}

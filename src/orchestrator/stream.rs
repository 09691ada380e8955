//! Streaming policy analysis: a lazy producer of progress events.
//!
//! The producer flushes each event as it happens and never buffers the
//! whole analysis; dropping the stream cancels the underlying task at
//! its next send, leaving the case at its prior version if the stage
//! had not yet persisted.

use futures::channel::mpsc;
use futures::Stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{error, info};

use crate::case::types::CaseStage;
use crate::events::CaseEvent;
use crate::llm::GenerateOptions;
use crate::policy::types::CoverageAssessment;
use crate::policy::PolicyAnalyzer;

use super::engine::{requires_human_decision, CaseOrchestrator};
use super::state::StageDelta;

/// A boxed stream of progress event payloads.
pub type ProgressStream = Pin<Box<dyn Stream<Item = Value> + Send>>;

impl CaseOrchestrator {
    /// Stream policy analysis progress for a case.
    ///
    /// Emits `stage_start`, `progress`, `payer_start`, `payer_complete`,
    /// `stage_complete` (or `error`), then `done`. With `refresh = false`
    /// and cached assessments present, the cached results are replayed
    /// without re-running the analysis.
    pub fn stream_policy_analysis(self: &Arc<Self>, case_id: &str, refresh: bool) -> ProgressStream {
        let (sender, receiver) = mpsc::unbounded::<Value>();
        let orchestrator = self.clone();
        let case_id = case_id.to_string();

        tokio::spawn(async move {
            let emit = |event: Value| {
                // A closed receiver means the client went away; stop
                // producing.
                sender.unbounded_send(event).is_ok()
            };
            if let Err(e) = orchestrator.stream_inner(&case_id, refresh, &emit).await {
                error!(case_id = %case_id, error = %e, "streamed policy analysis failed");
                let _ = emit(json!({"event": "error", "message": e.to_string()}));
            }
            let _ = emit(json!({"event": "done"}));
        });

        Box::pin(receiver)
    }

    async fn stream_inner(
        self: &Arc<Self>,
        case_id: &str,
        refresh: bool,
        emit: &(dyn Fn(Value) -> bool + Sync),
    ) -> crate::error::Result<()> {
        let case = self.store().get(case_id)?;

        let broadcast = |event: &Value| {
            let hub = self.events().clone();
            let event_name = event
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or("progress")
                .to_string();
            let case_id = case_id.to_string();
            let payload = event.clone();
            tokio::spawn(async move {
                hub.broadcast_case(CaseEvent::new(event_name, case_id, payload)).await;
            });
        };

        let send = |event: Value| -> bool {
            broadcast(&event);
            emit(event)
        };

        if !send(json!({
            "event": "stage_start",
            "stage": CaseStage::PolicyAnalysis,
            "case_id": case_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })) {
            return Ok(());
        }

        // Cached results short-circuit the analysis entirely.
        if !refresh && !case.coverage_assessments.is_empty() {
            info!(case_id, "streaming cached policy analysis results");
            let total = case.coverage_assessments.len();
            for (i, (payer_name, assessment)) in case.coverage_assessments.iter().enumerate() {
                let percent = 10 + (80 * (i + 1) / total.max(1));
                if !send(json!({
                    "event": "payer_complete",
                    "payer_name": payer_name,
                    "coverage_status": assessment.get("coverage_status"),
                    "approval_likelihood": assessment.get("approval_likelihood"),
                    "criteria_met": assessment.get("criteria_met_count"),
                    "criteria_total": assessment.get("criteria_total_count"),
                    "percent": percent,
                    "cached": true,
                })) {
                    return Ok(());
                }
            }
            send(json!({
                "event": "stage_complete",
                "stage": CaseStage::PolicyAnalysis,
                "reasoning": "Returned cached analysis results",
                "confidence": Value::Null,
                "findings": [],
                "recommendations": [],
                "warnings": [],
                "assessments": case.coverage_assessments,
                "documentation_gaps": case.documentation_gaps,
                "percent": 100,
                "cached": true,
            }));
            return Ok(());
        }

        let payers = case.payer_order();
        if payers.is_empty() {
            return Err(crate::error::Error::Validation(
                "cannot analyze policies: case has no payers".to_string(),
            ));
        }

        let patient_info = PolicyAnalyzer::build_patient_info(&case)?;
        let medication_info = PolicyAnalyzer::build_medication_info(&case)?;
        let options = GenerateOptions::for_case(case_id);

        if !send(json!({
            "event": "progress",
            "message": "Scanning patient record for evidence gaps",
            "percent": 5,
        })) {
            return Ok(());
        }
        let evidence_warnings = self
            .analyzer()
            .detect_evidence_gaps(&patient_info, options.clone())
            .await;

        let total = payers.len();
        let mut assessments: HashMap<String, CoverageAssessment> = HashMap::new();
        let mut findings: Vec<String> = Vec::new();

        for (i, payer_name) in payers.iter().enumerate() {
            let start_percent = 10 + (80 * i / total);
            if !send(json!({
                "event": "payer_start",
                "payer_name": payer_name,
                "percent": start_percent,
            })) {
                return Ok(());
            }

            let analysis = self
                .analyzer()
                .analyze_payer(
                    &patient_info,
                    &medication_info,
                    payer_name,
                    &evidence_warnings,
                    options.clone(),
                )
                .await;

            match analysis {
                Ok(analysis) => {
                    findings.extend(analysis.reasoning_chain.clone());
                    let assessment = analysis.assessment;
                    let percent = 10 + (80 * (i + 1) / total);
                    if !send(json!({
                        "event": "payer_complete",
                        "payer_name": payer_name,
                        "coverage_status": assessment.coverage_status,
                        "approval_likelihood": assessment.approval_likelihood,
                        "criteria_met": assessment.criteria_met_count,
                        "criteria_total": assessment.criteria_total_count,
                        "percent": percent,
                    })) {
                        return Ok(());
                    }
                    assessments.insert(payer_name.clone(), assessment);
                }
                Err(e) => {
                    // Primary failure aborts the stream; secondary
                    // failures narrow it.
                    if i == 0 {
                        return Err(e);
                    }
                    error!(case_id, payer = %payer_name, error = %e, "secondary payer analysis failed");
                }
            }
        }

        if assessments.is_empty() {
            return Err(crate::error::Error::Internal(
                "policy analysis produced no assessments".to_string(),
            ));
        }

        // Persist exactly as the non-streaming stage would.
        let requires_human = requires_human_decision(&assessments);
        let gaps = PolicyAnalyzer::aggregate_documentation_gaps(&assessments);
        let assessment_values: HashMap<String, Value> = assessments
            .iter()
            .map(|(payer, a)| Ok((payer.clone(), serde_json::to_value(a)?)))
            .collect::<crate::error::Result<_>>()?;

        let mut delta = if requires_human {
            let mut delta = StageDelta::transition(CaseStage::AwaitingHumanDecision);
            delta.requires_human_decision = Some(true);
            delta.human_decision_reason =
                Some("Coverage assessment requires human review before proceeding".to_string());
            delta
        } else {
            let mut delta = StageDelta::transition(CaseStage::StrategyGeneration);
            delta.requires_human_decision = Some(false);
            delta
        };
        delta.coverage_assessments = Some(assessment_values.clone());
        delta.documentation_gaps = Some(gaps.clone());

        let persisted = self.store().update(
            case_id,
            None,
            "Streamed policy analysis",
            "orchestrator",
            |state| delta.apply(state),
        )?;
        self.write_assessment_waypoint(&persisted, &assessments);

        let best_likelihood = assessments
            .values()
            .map(|a| a.approval_likelihood)
            .fold(0.0f64, f64::max);
        let recommendations: Vec<String> = assessments
            .values()
            .flat_map(|a| a.recommendations.clone())
            .collect();

        send(json!({
            "event": "stage_complete",
            "stage": CaseStage::PolicyAnalysis,
            "reasoning": format!(
                "Analyzed {} payer(s); human review {}",
                assessments.len(),
                if requires_human { "required" } else { "not required" }
            ),
            "confidence": best_likelihood,
            "findings": findings,
            "recommendations": recommendations,
            "warnings": evidence_warnings,
            "assessments": assessment_values,
            "documentation_gaps": gaps,
            "percent": 100,
        }));

        Ok(())
    }
}

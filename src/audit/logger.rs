//! Append-only audit logger with chain integrity.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::store::Database;

use super::event::{AuditTrail, DecisionEvent, EventType};

/// Immutable audit logger for tracking all decisions.
///
/// Each appended event is chained to the case's latest stored event; a
/// refused append becomes a hole that chain verification will expose —
/// events are never silently rolled back.
#[derive(Clone)]
pub struct AuditLogger {
    db: Arc<Database>,
}

impl AuditLogger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Log a decision event with chain integrity.
    #[allow(clippy::too_many_arguments)]
    pub fn log_event(
        &self,
        case_id: &str,
        event_type: EventType,
        decision_made: impl Into<String>,
        reasoning: impl Into<String>,
        stage: impl Into<String>,
        input_data: &Value,
        alternatives: Vec<Value>,
        actor: impl Into<String>,
    ) -> Result<DecisionEvent> {
        let last_event = self.db.last_event(case_id)?;
        let previous_event_id = last_event.as_ref().map(|e| e.event_id.clone());
        let previous_signature = last_event.and_then(|e| e.signature);

        let mut event = DecisionEvent::new(
            case_id,
            event_type,
            decision_made,
            reasoning,
            stage,
            input_data,
            alternatives,
            actor,
        );
        event.previous_event_id = previous_event_id;
        event.signature = Some(event.compute_signature(previous_signature.as_deref()));

        self.db.insert_event(&event)?;

        info!(
            event_id = %event.event_id,
            case_id,
            event_type = %event_type,
            "audit event logged"
        );
        Ok(event)
    }

    /// Log case creation.
    pub fn log_case_created(
        &self,
        case_id: &str,
        patient_id: &str,
        medication_name: &str,
    ) -> Result<DecisionEvent> {
        self.log_event(
            case_id,
            EventType::CaseCreated,
            format!("Created case for patient {}", patient_id),
            format!("Prior authorization case initiated for {}", medication_name),
            "intake",
            &json!({"patient_id": patient_id, "medication": medication_name}),
            vec![],
            "system",
        )
    }

    /// Log a stage transition.
    pub fn log_stage_change(
        &self,
        case_id: &str,
        from_stage: &str,
        to_stage: &str,
        reason: &str,
    ) -> Result<DecisionEvent> {
        self.log_event(
            case_id,
            EventType::StageChanged,
            format!("Transitioned from {} to {}", from_stage, to_stage),
            reason,
            to_stage,
            &json!({"from_stage": from_stage, "to_stage": to_stage}),
            vec![],
            "system",
        )
    }

    /// Log strategy selection with the losing scores as alternatives.
    pub fn log_strategy_selected(
        &self,
        case_id: &str,
        selected: &Value,
        all_scores: &[Value],
        reasoning: &str,
    ) -> Result<DecisionEvent> {
        let selected_id = selected.get("strategy_id").cloned().unwrap_or(Value::Null);
        let alternatives: Vec<Value> = all_scores
            .iter()
            .filter(|s| s.get("strategy_id") != Some(&selected_id))
            .map(|s| {
                json!({
                    "strategy_id": s.get("strategy_id"),
                    "score": s.get("total_score"),
                    "rank": s.get("rank"),
                })
            })
            .collect();

        self.log_event(
            case_id,
            EventType::StrategySelected,
            format!(
                "Selected strategy: {}",
                selected
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
            ),
            reasoning,
            "strategy_selection",
            &json!({"selected": selected, "scores": all_scores}),
            alternatives,
            "system",
        )
    }

    /// Log a payer response.
    pub fn log_payer_response(
        &self,
        case_id: &str,
        payer_name: &str,
        response_type: &str,
        details: &Value,
        stage: &str,
    ) -> Result<DecisionEvent> {
        self.log_event(
            case_id,
            EventType::PayerResponse,
            format!("{} response: {}", payer_name, response_type),
            details
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("Payer determination received"),
            stage,
            &json!({"payer": payer_name, "response_type": response_type, "details": details}),
            vec![],
            "system",
        )
    }

    /// Log a human decision; the actor is the reviewer.
    pub fn log_human_decision(
        &self,
        case_id: &str,
        action: &str,
        reviewer_id: &str,
        stage: &str,
        notes: Option<&str>,
    ) -> Result<DecisionEvent> {
        self.log_event(
            case_id,
            EventType::HumanDecision,
            format!("Human decision: {}", action),
            notes.unwrap_or("Reviewer decision recorded"),
            stage,
            &json!({"action": action, "reviewer_id": reviewer_id}),
            vec![],
            reviewer_id,
        )
    }

    /// The complete audit trail for a case, in insertion order.
    pub fn get_audit_trail(&self, case_id: &str) -> Result<AuditTrail> {
        let events = self.db.events_for_case(case_id)?;
        let last_signature = events.last().and_then(|e| e.signature.clone());
        Ok(AuditTrail {
            case_id: case_id.to_string(),
            events,
            last_signature,
        })
    }

    /// Recompute signatures in order and report chain validity.
    pub fn verify_chain(&self, case_id: &str) -> Result<Value> {
        let trail = self.get_audit_trail(case_id)?;
        let is_valid = trail.verify_chain();
        Ok(json!({
            "case_id": case_id,
            "chain_valid": is_valid,
            "event_count": trail.events.len(),
            "first_event": trail.events.first().map(|e| e.timestamp.to_rfc3339()),
            "last_event": trail.events.last().map(|e| e.timestamp.to_rfc3339()),
        }))
    }
}

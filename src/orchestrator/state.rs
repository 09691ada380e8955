//! Stage deltas and transition helpers for the case stage machine.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

use crate::case::types::{CaseStage, CaseState, PayerStatus};

/// A payer-state mutation carried inside a stage delta.
#[derive(Debug, Clone)]
pub struct PayerUpdate {
    pub payer_name: String,
    pub status: PayerStatus,
    pub reference_number: Option<String>,
    pub details: Option<Value>,
}

impl PayerUpdate {
    pub fn new(payer_name: impl Into<String>, status: PayerStatus) -> Self {
        Self {
            payer_name: payer_name.into(),
            status,
            reference_number: None,
            details: None,
        }
    }

    pub fn with_reference(mut self, reference: Option<String>) -> Self {
        self.reference_number = reference;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Fold this update into the case's payer state.
    pub fn apply(self, state: &mut CaseState) {
        let Some(payer_state) = state.payer_states.get_mut(&self.payer_name) else {
            return;
        };
        payer_state.status = self.status;
        payer_state.last_updated = Some(Utc::now());
        if let Some(reference) = self.reference_number {
            payer_state.reference_number = Some(reference);
            payer_state.submitted_at = Some(Utc::now());
        }
        if let Some(details) = self.details {
            if let Some(reason) = details.get("denial_reason").and_then(Value::as_str) {
                payer_state.denial_reason = Some(reason.to_string());
            }
            if let Some(deadline) = details
                .get("appeal_deadline")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            {
                payer_state.appeal_deadline = Some(deadline.with_timezone(&Utc));
            }
            if let Some(docs) = details.get("required_documents").and_then(Value::as_array) {
                payer_state.required_documents = docs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
            }
            payer_state.response_details = Some(details);
        }
    }
}

/// The mutation a stage handler wants applied to the case.
///
/// Handlers return deltas instead of mutating stored state directly so
/// the engine can merge, persist (one version bump per stage), and
/// audit in one place.
#[derive(Debug, Clone, Default)]
pub struct StageDelta {
    pub stage: Option<CaseStage>,
    pub coverage_assessments: Option<HashMap<String, Value>>,
    pub documentation_gaps: Option<Vec<Value>>,
    pub available_strategies: Option<Vec<Value>>,
    pub selected_strategy_id: Option<String>,
    pub strategy_rationale: Option<String>,
    pub requires_human_decision: Option<bool>,
    pub human_decision_reason: Option<String>,
    pub error_message: Option<String>,
    pub payer_updates: Vec<PayerUpdate>,
    pub metadata: HashMap<String, Value>,
    pub messages: Vec<String>,
}

impl StageDelta {
    pub fn transition(stage: CaseStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            stage: Some(CaseStage::Failed),
            error_message: Some(error.clone()),
            messages: vec![format!("Case failed: {}", error)],
            ..Default::default()
        }
    }

    pub fn completed(outcome: impl Into<String>) -> Self {
        let outcome = outcome.into();
        let mut delta = Self::transition(CaseStage::Completed);
        delta
            .metadata
            .insert("final_outcome".to_string(), Value::String(outcome.clone()));
        delta.messages.push(format!("Case completed: {}", outcome));
        delta
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Merge this delta into a case state (version handling is the
    /// store's job).
    pub fn apply(self, state: &mut CaseState) {
        if let Some(stage) = self.stage {
            state.stage = stage;
        }
        if let Some(assessments) = self.coverage_assessments {
            state.coverage_assessments = assessments;
        }
        if let Some(gaps) = self.documentation_gaps {
            state.documentation_gaps = gaps;
        }
        if let Some(strategies) = self.available_strategies {
            state.available_strategies = strategies;
        }
        if let Some(id) = self.selected_strategy_id {
            state.selected_strategy_id = Some(id);
        }
        if let Some(rationale) = self.strategy_rationale {
            state.strategy_rationale = Some(rationale);
        }
        if let Some(required) = self.requires_human_decision {
            state.requires_human_decision = required;
        }
        if let Some(reason) = self.human_decision_reason {
            state.human_decision_reason = Some(reason);
        }
        if let Some(error) = self.error_message {
            state.error_message = Some(error);
        }
        for update in self.payer_updates {
            update.apply(state);
        }
        for (key, value) in self.metadata {
            state.metadata.insert(key, value);
        }
        if !self.messages.is_empty() {
            let log = state
                .metadata
                .entry("messages".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(entries) = log {
                entries.extend(self.messages.into_iter().map(Value::String));
            }
        }
    }
}

/// Aggregate payer-response status across a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayerResponseSummary {
    Approved,
    Denied,
    Partial,
    Pending,
}

/// Classify the current payer-state map.
pub fn check_payer_responses(state: &CaseState) -> PayerResponseSummary {
    let mut approvals = 0usize;
    let mut denials = 0usize;
    let mut pending = 0usize;

    for payer_state in state.payer_states.values() {
        match payer_state.status {
            PayerStatus::Approved | PayerStatus::AppealApproved => approvals += 1,
            PayerStatus::Denied | PayerStatus::AppealDenied => denials += 1,
            PayerStatus::Submitted
            | PayerStatus::PendingInfo
            | PayerStatus::UnderReview
            | PayerStatus::AppealSubmitted => pending += 1,
            PayerStatus::NotSubmitted => {}
        }
    }

    let total = state.payer_states.len();
    if total > 0 && approvals == total {
        PayerResponseSummary::Approved
    } else if denials > 0 && pending == 0 {
        PayerResponseSummary::Denied
    } else if approvals > 0 && (denials > 0 || pending > 0) {
        PayerResponseSummary::Partial
    } else {
        PayerResponseSummary::Pending
    }
}

/// Whether any denial still has an open appeal path.
pub fn needs_recovery(state: &CaseState) -> bool {
    state.payer_states.values().any(|payer_state| {
        payer_state.status == PayerStatus::Denied && payer_state.appeal_deadline.is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::types::PayerState;

    fn state_with_statuses(statuses: &[(&str, PayerStatus)]) -> CaseState {
        let mut state = CaseState::new();
        for (name, status) in statuses {
            let mut payer_state = PayerState::new(*name);
            payer_state.status = *status;
            state.payer_states.insert(name.to_string(), payer_state);
        }
        state
    }

    #[test]
    fn test_delta_apply_merges_fields() {
        let mut state = CaseState::new();
        let mut delta = StageDelta::transition(CaseStage::PolicyAnalysis);
        delta.requires_human_decision = Some(true);
        delta.human_decision_reason = Some("low likelihood".to_string());
        delta.messages.push("analyzed".to_string());
        delta.apply(&mut state);

        assert_eq!(state.stage, CaseStage::PolicyAnalysis);
        assert!(state.requires_human_decision);
        assert_eq!(state.human_decision_reason.as_deref(), Some("low likelihood"));
        let messages = state.metadata["messages"].as_array().unwrap();
        assert_eq!(messages[0], "analyzed");
    }

    #[test]
    fn test_failed_delta() {
        let mut state = CaseState::new();
        StageDelta::failed("boom").apply(&mut state);
        assert_eq!(state.stage, CaseStage::Failed);
        assert_eq!(state.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_all_approved() {
        let state = state_with_statuses(&[
            ("Cigna", PayerStatus::Approved),
            ("Aetna", PayerStatus::AppealApproved),
        ]);
        assert_eq!(check_payer_responses(&state), PayerResponseSummary::Approved);
    }

    #[test]
    fn test_denied_when_no_pending() {
        let state = state_with_statuses(&[("Cigna", PayerStatus::Denied)]);
        assert_eq!(check_payer_responses(&state), PayerResponseSummary::Denied);
    }

    #[test]
    fn test_partial_mix() {
        let state = state_with_statuses(&[
            ("Cigna", PayerStatus::Approved),
            ("Aetna", PayerStatus::UnderReview),
        ]);
        assert_eq!(check_payer_responses(&state), PayerResponseSummary::Partial);
    }

    #[test]
    fn test_pending_default() {
        let state = state_with_statuses(&[("Cigna", PayerStatus::Submitted)]);
        assert_eq!(check_payer_responses(&state), PayerResponseSummary::Pending);
        let empty = CaseState::new();
        assert_eq!(check_payer_responses(&empty), PayerResponseSummary::Pending);
    }

    #[test]
    fn test_needs_recovery_requires_appeal_deadline() {
        let mut state = state_with_statuses(&[("Cigna", PayerStatus::Denied)]);
        assert!(!needs_recovery(&state));
        state
            .payer_states
            .get_mut("Cigna")
            .unwrap()
            .appeal_deadline = Some(chrono::Utc::now());
        assert!(needs_recovery(&state));
    }
}

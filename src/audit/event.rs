//! Hash-chained decision events.
//!
//! Each event's signature covers its own fields plus the previous
//! event's signature, so any mutation anywhere in a case's history is
//! visible at verification time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Types of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CaseCreated,
    StageChanged,
    PolicyAnalyzed,
    StrategyGenerated,
    StrategySelected,
    ActionExecuted,
    PayerResponse,
    HumanDecision,
    RecoveryInitiated,
    CaseCompleted,
    ErrorOccurred,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CaseCreated => "case_created",
            Self::StageChanged => "stage_changed",
            Self::PolicyAnalyzed => "policy_analyzed",
            Self::StrategyGenerated => "strategy_generated",
            Self::StrategySelected => "strategy_selected",
            Self::ActionExecuted => "action_executed",
            Self::PayerResponse => "payer_response",
            Self::HumanDecision => "human_decision",
            Self::RecoveryInitiated => "recovery_initiated",
            Self::CaseCompleted => "case_completed",
            Self::ErrorOccurred => "error_occurred",
        };
        write!(f, "{}", s)
    }
}

/// An immutable record of a decision or action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub event_id: String,
    pub case_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,

    /// What happened
    pub decision_made: String,
    pub reasoning: String,

    /// Case stage when this occurred
    pub stage: String,
    /// Who/what made this decision
    pub actor: String,

    /// SHA-256 of the canonicalized input data
    pub input_data_hash: String,
    /// Truncated key/value map for quick inspection
    pub input_data_summary: Value,

    /// Other options that were considered
    #[serde(default)]
    pub alternatives: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,

    /// Chain signature; None only before signing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_event_id: Option<String>,
}

impl DecisionEvent {
    /// Build an unsigned event; the audit logger signs and persists it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        case_id: impl Into<String>,
        event_type: EventType,
        decision_made: impl Into<String>,
        reasoning: impl Into<String>,
        stage: impl Into<String>,
        input_data: &Value,
        alternatives: Vec<Value>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            case_id: case_id.into(),
            event_type,
            timestamp: Utc::now(),
            decision_made: decision_made.into(),
            reasoning: reasoning.into(),
            stage: stage.into(),
            actor: actor.into(),
            input_data_hash: Self::hash_input_data(input_data),
            input_data_summary: Self::summarize_input(input_data),
            alternatives,
            outcome: None,
            signature: None,
            previous_event_id: None,
        }
    }

    /// Compute the chain signature for this event.
    ///
    /// Canonical form is serde_json's default map serialization, which
    /// orders keys lexicographically.
    pub fn compute_signature(&self, previous_signature: Option<&str>) -> String {
        let data_to_sign = json!({
            "event_id": self.event_id,
            "case_id": self.case_id,
            "event_type": self.event_type,
            "timestamp": self.timestamp.to_rfc3339(),
            "decision_made": self.decision_made,
            "reasoning": self.reasoning,
            "input_data_hash": self.input_data_hash,
            "previous_signature": previous_signature.unwrap_or(""),
        });
        let serialized = serde_json::to_string(&data_to_sign).expect("signing payload serializes");
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// SHA-256 of input data in canonical (key-sorted) JSON.
    pub fn hash_input_data(data: &Value) -> String {
        let serialized = serde_json::to_string(data).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Truncated key/value summary of input data (first 10 keys, values
    /// cut to 100 chars).
    pub fn summarize_input(data: &Value) -> Value {
        match data {
            Value::Object(map) => {
                let mut summary = serde_json::Map::new();
                for (key, value) in map.iter().take(10) {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let truncated: String = rendered.chars().take(100).collect();
                    summary.insert(key.clone(), Value::String(truncated));
                }
                Value::Object(summary)
            }
            other => {
                let rendered: String = other.to_string().chars().take(200).collect();
                json!({ "data": rendered })
            }
        }
    }
}

/// Complete audit trail for a case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditTrail {
    pub case_id: String,
    pub events: Vec<DecisionEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_signature: Option<String>,
}

impl AuditTrail {
    pub fn new(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            events: Vec::new(),
            last_signature: None,
        }
    }

    /// Append an event, chaining it to the current tail.
    pub fn add_event(&mut self, mut event: DecisionEvent) -> &DecisionEvent {
        event.previous_event_id = self.events.last().map(|e| e.event_id.clone());
        event.signature = Some(event.compute_signature(self.last_signature.as_deref()));
        self.last_signature = event.signature.clone();
        self.events.push(event);
        self.events.last().expect("just pushed")
    }

    /// Recompute every signature in order; true iff nothing was altered.
    pub fn verify_chain(&self) -> bool {
        let mut previous_signature: Option<String> = None;
        for event in &self.events {
            let expected = event.compute_signature(previous_signature.as_deref());
            if event.signature.as_deref() != Some(expected.as_str()) {
                return false;
            }
            previous_signature = event.signature.clone();
        }
        true
    }

    pub fn events_by_type(&self, event_type: EventType) -> Vec<&DecisionEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(case_id: &str, decision: &str) -> DecisionEvent {
        DecisionEvent::new(
            case_id,
            EventType::StageChanged,
            decision,
            "test reasoning",
            "policy_analysis",
            &json!({"from": "intake", "to": "policy_analysis"}),
            vec![],
            "system",
        )
    }

    #[test]
    fn test_signature_is_reproducible() {
        let mut trail = AuditTrail::new("CASE-1");
        trail.add_event(sample_event("CASE-1", "first"));
        let event = trail.events[0].clone();

        let recomputed = event.compute_signature(None);
        assert_eq!(event.signature.as_deref(), Some(recomputed.as_str()));
    }

    #[test]
    fn test_chain_verifies_when_untouched() {
        let mut trail = AuditTrail::new("CASE-1");
        for i in 0..5 {
            trail.add_event(sample_event("CASE-1", &format!("decision {}", i)));
        }
        assert!(trail.verify_chain());
    }

    #[test]
    fn test_mutating_any_field_breaks_chain() {
        let mut trail = AuditTrail::new("CASE-1");
        for i in 0..4 {
            trail.add_event(sample_event("CASE-1", &format!("decision {}", i)));
        }

        let mut tampered = trail.clone();
        tampered.events[1].reasoning = "rewritten after the fact".to_string();
        assert!(!tampered.verify_chain());

        let mut tampered = trail.clone();
        tampered.events[2].decision_made = "something else".to_string();
        assert!(!tampered.verify_chain());

        let mut tampered = trail;
        tampered.events[0].input_data_hash = "0".repeat(64);
        assert!(!tampered.verify_chain());
    }

    #[test]
    fn test_each_event_chains_previous_signature() {
        let mut trail = AuditTrail::new("CASE-1");
        trail.add_event(sample_event("CASE-1", "a"));
        trail.add_event(sample_event("CASE-1", "b"));

        let first_sig = trail.events[0].signature.clone().unwrap();
        let second = &trail.events[1];
        assert_eq!(
            second.signature.as_deref(),
            Some(second.compute_signature(Some(&first_sig)).as_str())
        );
        assert_eq!(
            second.previous_event_id.as_deref(),
            Some(trail.events[0].event_id.as_str())
        );
    }

    #[test]
    fn test_input_hash_is_order_independent() {
        let a = json!({"zeta": 1, "alpha": 2});
        let b = json!({"alpha": 2, "zeta": 1});
        assert_eq!(
            DecisionEvent::hash_input_data(&a),
            DecisionEvent::hash_input_data(&b)
        );
    }

    #[test]
    fn test_summary_truncates() {
        let long = "x".repeat(500);
        let data = json!({"note": long, "other": 1});
        let summary = DecisionEvent::summarize_input(&data);
        let note = summary["note"].as_str().unwrap();
        assert_eq!(note.len(), 100);
        assert_eq!(summary["other"], "1");
    }

    #[test]
    fn test_empty_trail_verifies() {
        assert!(AuditTrail::new("CASE-1").verify_chain());
    }
}

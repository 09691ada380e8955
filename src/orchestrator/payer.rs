//! Payer interaction seam: submission, status polling, and appeals.
//!
//! The orchestrator talks to payers only through [`PayerGateway`];
//! production wires a real clearinghouse client, tests and demos use
//! the deterministic mock.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::case::types::PayerStatus;
use crate::error::Result;

/// Result of a submission or status poll.
#[derive(Debug, Clone)]
pub struct PayerResponse {
    pub payer_name: String,
    pub status: PayerStatus,
    pub reference_number: Option<String>,
    pub details: Value,
}

/// External payer operations.
#[async_trait]
pub trait PayerGateway: Send + Sync {
    /// Submit a PA request to a payer.
    async fn submit_pa(&self, case_id: &str, payer_name: &str, package: &Value)
        -> Result<PayerResponse>;

    /// Poll the payer for the current determination status.
    async fn check_status(&self, case_id: &str, payer_name: &str) -> Result<PayerResponse>;

    /// File an appeal against a denial.
    async fn initiate_appeal(
        &self,
        case_id: &str,
        payer_name: &str,
        appeal_context: &Value,
    ) -> Result<PayerResponse>;
}

/// Scripted outcome a mock payer should eventually reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOutcome {
    Approve,
    Deny,
    PendInfo,
}

/// Deterministic in-memory payer gateway.
///
/// Submissions return a reference number immediately; each status poll
/// advances submitted → under_review → terminal outcome. Outcomes are
/// scripted per payer (default approve).
pub struct MockPayerGateway {
    outcomes: Mutex<HashMap<String, MockOutcome>>,
    poll_counts: Mutex<HashMap<(String, String), u32>>,
}

impl MockPayerGateway {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            poll_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Script the terminal outcome for a payer.
    pub fn script_outcome(&self, payer_name: &str, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .insert(payer_name.to_lowercase(), outcome);
    }

    fn outcome_for(&self, payer_name: &str) -> MockOutcome {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .get(&payer_name.to_lowercase())
            .copied()
            .unwrap_or(MockOutcome::Approve)
    }
}

impl Default for MockPayerGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayerGateway for MockPayerGateway {
    async fn submit_pa(
        &self,
        case_id: &str,
        payer_name: &str,
        _package: &Value,
    ) -> Result<PayerResponse> {
        self.poll_counts
            .lock()
            .expect("poll counts lock")
            .insert((case_id.to_string(), payer_name.to_string()), 0);
        let reference = format!("PA-{}", &Uuid::new_v4().to_string()[..8]);
        Ok(PayerResponse {
            payer_name: payer_name.to_string(),
            status: PayerStatus::Submitted,
            reference_number: Some(reference.clone()),
            details: json!({
                "message": "Submission acknowledged",
                "reference_number": reference,
            }),
        })
    }

    async fn check_status(&self, case_id: &str, payer_name: &str) -> Result<PayerResponse> {
        let polls = {
            let mut counts = self.poll_counts.lock().expect("poll counts lock");
            let entry = counts
                .entry((case_id.to_string(), payer_name.to_string()))
                .or_insert(0);
            *entry += 1;
            *entry
        };

        let (status, details) = match polls {
            1 => (
                PayerStatus::UnderReview,
                json!({"message": "Clinical review in progress"}),
            ),
            _ => match self.outcome_for(payer_name) {
                MockOutcome::Approve => (
                    PayerStatus::Approved,
                    json!({"message": "Authorization approved", "reason": "Criteria met"}),
                ),
                MockOutcome::Deny => (
                    PayerStatus::Denied,
                    json!({
                        "message": "Authorization denied",
                        "reason": "Step therapy requirements not met",
                        "denial_reason": "Step therapy requirements not met",
                        "appeal_deadline": (Utc::now() + Duration::days(30)).to_rfc3339(),
                    }),
                ),
                MockOutcome::PendInfo => (
                    PayerStatus::PendingInfo,
                    json!({
                        "message": "Additional information requested",
                        "reason": "Missing documentation",
                        "required_documents": ["TB screening result", "Recent CRP"],
                    }),
                ),
            },
        };

        Ok(PayerResponse {
            payer_name: payer_name.to_string(),
            status,
            reference_number: None,
            details,
        })
    }

    async fn initiate_appeal(
        &self,
        case_id: &str,
        payer_name: &str,
        _appeal_context: &Value,
    ) -> Result<PayerResponse> {
        // An appeal restarts the poll ladder toward the scripted outcome;
        // mock appeals always succeed on the next determination.
        self.poll_counts
            .lock()
            .expect("poll counts lock")
            .insert((case_id.to_string(), payer_name.to_string()), 0);
        self.script_outcome(payer_name, MockOutcome::Approve);
        Ok(PayerResponse {
            payer_name: payer_name.to_string(),
            status: PayerStatus::AppealSubmitted,
            reference_number: Some(format!("APPEAL-{}", &Uuid::new_v4().to_string()[..8])),
            details: json!({"message": "Appeal submitted"}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submission_yields_reference_number() {
        let gateway = MockPayerGateway::new();
        let response = gateway
            .submit_pa("CASE-1", "Cigna", &json!({}))
            .await
            .unwrap();
        assert_eq!(response.status, PayerStatus::Submitted);
        assert!(response.reference_number.unwrap().starts_with("PA-"));
    }

    #[tokio::test]
    async fn test_status_ladder_to_approval() {
        let gateway = MockPayerGateway::new();
        gateway.submit_pa("CASE-1", "Cigna", &json!({})).await.unwrap();

        let first = gateway.check_status("CASE-1", "Cigna").await.unwrap();
        assert_eq!(first.status, PayerStatus::UnderReview);
        let second = gateway.check_status("CASE-1", "Cigna").await.unwrap();
        assert_eq!(second.status, PayerStatus::Approved);
    }

    #[tokio::test]
    async fn test_scripted_denial_carries_appeal_deadline() {
        let gateway = MockPayerGateway::new();
        gateway.script_outcome("Cigna", MockOutcome::Deny);
        gateway.submit_pa("CASE-1", "Cigna", &json!({})).await.unwrap();

        gateway.check_status("CASE-1", "Cigna").await.unwrap();
        let decision = gateway.check_status("CASE-1", "Cigna").await.unwrap();
        assert_eq!(decision.status, PayerStatus::Denied);
        assert!(decision.details["appeal_deadline"].is_string());
        assert_eq!(
            decision.details["denial_reason"],
            "Step therapy requirements not met"
        );
    }

    #[tokio::test]
    async fn test_appeal_resets_toward_approval() {
        let gateway = MockPayerGateway::new();
        gateway.script_outcome("Cigna", MockOutcome::Deny);
        gateway.submit_pa("CASE-1", "Cigna", &json!({})).await.unwrap();
        gateway.check_status("CASE-1", "Cigna").await.unwrap();
        gateway.check_status("CASE-1", "Cigna").await.unwrap();

        let appeal = gateway
            .initiate_appeal("CASE-1", "Cigna", &json!({}))
            .await
            .unwrap();
        assert_eq!(appeal.status, PayerStatus::AppealSubmitted);

        gateway.check_status("CASE-1", "Cigna").await.unwrap();
        let final_status = gateway.check_status("CASE-1", "Cigna").await.unwrap();
        assert_eq!(final_status.status, PayerStatus::Approved);
    }
}

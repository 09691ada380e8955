//! Waypoint writer: portable, human-readable audit artifacts.
//!
//! Two JSON waypoints per case — the assessment before human review and
//! the decision after it — plus a plain-text notification letter for
//! terminal decisions. Every artifact carries an explicit statement
//! that AI output requires human review.

use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Writes waypoint files and notification letters.
#[derive(Clone)]
pub struct WaypointWriter {
    waypoints_dir: PathBuf,
    outputs_dir: PathBuf,
}

impl WaypointWriter {
    pub fn new(waypoints_dir: impl Into<PathBuf>, outputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            waypoints_dir: waypoints_dir.into(),
            outputs_dir: outputs_dir.into(),
        }
    }

    /// Write the assessment waypoint: the AI's coverage analysis before
    /// human review.
    #[allow(clippy::too_many_arguments)]
    pub fn write_assessment_waypoint(
        &self,
        case_id: &str,
        patient_summary: Value,
        medication_summary: Value,
        coverage_assessments: Value,
        documentation_gaps: Value,
        ai_recommendation: &str,
        confidence_score: f64,
        reasoning: &str,
    ) -> Result<PathBuf> {
        let waypoint = json!({
            "waypoint_type": "assessment",
            "version": "1.0",
            "generated_at": Utc::now().to_rfc3339(),
            "case_id": case_id,
            "stage": "policy_analysis_complete",
            "patient_summary": patient_summary,
            "medication_summary": medication_summary,
            "coverage_assessments": coverage_assessments,
            "documentation_gaps": documentation_gaps,
            "ai_analysis": {
                "recommendation": ai_recommendation,
                "confidence_score": confidence_score,
                "reasoning": reasoning,
                "disclaimer": "This is an AI-generated recommendation. Human review is \
                               required before any decision is finalized.",
            },
            "audit": {
                "requires_human_review": true,
                "human_reviewed": false,
            },
        });

        let path = self.waypoint_path(case_id, "assessment");
        self.write_json(&path, &waypoint)?;
        info!(case_id, path = %path.display(), "assessment waypoint written");
        Ok(path)
    }

    /// Write the decision waypoint after a human decision, referencing
    /// the assessment waypoint it acted on.
    #[allow(clippy::too_many_arguments)]
    pub fn write_decision_waypoint(
        &self,
        case_id: &str,
        human_decision: Value,
        outcome_status: &str,
        outcome_details: Value,
        documentation_requests: Vec<Value>,
    ) -> Result<PathBuf> {
        let assessment_ref = self.waypoint_path(case_id, "assessment");
        let waypoint = json!({
            "waypoint_type": "decision",
            "version": "1.0",
            "generated_at": Utc::now().to_rfc3339(),
            "case_id": case_id,
            "stage": "human_decision_complete",
            "assessment_waypoint": assessment_ref.to_string_lossy(),
            "human_decision": human_decision,
            "outcome": {
                "status": outcome_status,
                "details": outcome_details,
            },
            "documentation_requests": documentation_requests,
            "compliance": {
                "human_in_the_loop": true,
                "ai_final_decision": false,
                "note": "Final determination was made by a human reviewer. AI output \
                         served as decision support only.",
            },
        });

        let path = self.waypoint_path(case_id, "decision");
        self.write_json(&path, &waypoint)?;
        info!(case_id, path = %path.display(), "decision waypoint written");
        Ok(path)
    }

    /// Render the notification letter for a terminal decision.
    pub fn write_notification_letter(
        &self,
        case_id: &str,
        outcome_status: &str,
        patient_name: &str,
        medication_name: &str,
        payer_name: &str,
        details: &Value,
    ) -> Result<PathBuf> {
        let body = match outcome_status {
            "approved" => approval_letter(patient_name, medication_name, payer_name, details),
            "pend" | "pending_info" => {
                pend_letter(patient_name, medication_name, payer_name, details)
            }
            _ => denial_letter(patient_name, medication_name, payer_name, details),
        };

        std::fs::create_dir_all(&self.outputs_dir)
            .map_err(|e| Error::Storage(format!("cannot create outputs dir: {}", e)))?;
        let path = self.notification_path(case_id);
        std::fs::write(&path, body)
            .map_err(|e| Error::Storage(format!("cannot write notification letter: {}", e)))?;
        info!(case_id, path = %path.display(), "notification letter written");
        Ok(path)
    }

    /// Path of a waypoint file for a case.
    pub fn waypoint_path(&self, case_id: &str, waypoint_type: &str) -> PathBuf {
        self.waypoints_dir
            .join(format!("{}_{}.json", waypoint_type, case_id))
    }

    /// Path of the notification letter for a case.
    pub fn notification_path(&self, case_id: &str) -> PathBuf {
        self.outputs_dir.join(format!("notification_{}.txt", case_id))
    }

    /// Read a waypoint back, if it exists.
    pub fn load_waypoint(&self, case_id: &str, waypoint_type: &str) -> Option<Value> {
        let path = self.waypoint_path(case_id, waypoint_type);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable waypoint file");
                None
            }
        }
    }

    fn write_json(&self, path: &Path, data: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.waypoints_dir)
            .map_err(|e| Error::Storage(format!("cannot create waypoints dir: {}", e)))?;
        let rendered = serde_json::to_string_pretty(data)?;
        std::fs::write(path, rendered)
            .map_err(|e| Error::Storage(format!("cannot write waypoint: {}", e)))
    }
}

fn letter_header(patient_name: &str, payer_name: &str) -> String {
    format!(
        "Date: {}\n\nRe: Prior Authorization Determination\nPatient: {}\nPayer: {}\n\n",
        Utc::now().format("%Y-%m-%d"),
        patient_name,
        payer_name
    )
}

fn approval_letter(
    patient_name: &str,
    medication_name: &str,
    payer_name: &str,
    details: &Value,
) -> String {
    let reference = details
        .get("reference_number")
        .and_then(Value::as_str)
        .unwrap_or("N/A");
    format!(
        "{}Dear Provider,\n\n\
         We are pleased to inform you that the prior authorization request for \
         {} has been APPROVED.\n\n\
         Authorization reference: {}\n\n\
         Please retain this notice for your records. Claims for the approved \
         medication should reference the authorization number above.\n\n\
         Sincerely,\nPrior Authorization Department\n",
        letter_header(patient_name, payer_name),
        medication_name,
        reference
    )
}

fn pend_letter(
    patient_name: &str,
    medication_name: &str,
    payer_name: &str,
    details: &Value,
) -> String {
    let requested: Vec<String> = details
        .get("required_documents")
        .and_then(Value::as_array)
        .map(|docs| {
            docs.iter()
                .filter_map(Value::as_str)
                .map(|d| format!("  - {}", d))
                .collect()
        })
        .unwrap_or_default();
    let requested = if requested.is_empty() {
        "  - Additional clinical documentation".to_string()
    } else {
        requested.join("\n")
    };
    format!(
        "{}Dear Provider,\n\n\
         The prior authorization request for {} is PENDING additional information.\n\n\
         The following documentation is required to complete the review:\n{}\n\n\
         Please submit the requested documentation within 14 calendar days to avoid \
         administrative closure of this request.\n\n\
         Sincerely,\nPrior Authorization Department\n",
        letter_header(patient_name, payer_name),
        medication_name,
        requested
    )
}

fn denial_letter(
    patient_name: &str,
    medication_name: &str,
    payer_name: &str,
    details: &Value,
) -> String {
    let reason = details
        .get("denial_reason")
        .and_then(Value::as_str)
        .unwrap_or("The request did not meet the applicable coverage criteria.");
    format!(
        "{}Dear Provider,\n\n\
         After review by a clinical reviewer, the prior authorization request for \
         {} has been DENIED.\n\n\
         Reason for determination:\n  {}\n\n\
         This determination was made by a qualified human reviewer. You have the \
         right to appeal this decision. Appeal instructions and deadlines are \
         included with the payer's formal determination notice.\n\n\
         Sincerely,\nPrior Authorization Department\n",
        letter_header(patient_name, payer_name),
        medication_name,
        reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn writer() -> (TempDir, WaypointWriter) {
        let dir = TempDir::new().unwrap();
        let writer = WaypointWriter::new(dir.path().join("waypoints"), dir.path().join("outputs"));
        (dir, writer)
    }

    #[test]
    fn test_assessment_waypoint_round_trip() {
        let (_dir, writer) = writer();
        let path = writer
            .write_assessment_waypoint(
                "CASE-1",
                json!({"patient_id": "P-1"}),
                json!({"medication_name": "adalimumab"}),
                json!({"Cigna": {"status": "requires_pa", "likelihood": 0.82}}),
                json!([]),
                "PEND",
                0.82,
                "Most criteria met; documentation gap on TB screening",
            )
            .unwrap();
        assert!(path.ends_with("assessment_CASE-1.json"));

        let loaded = writer.load_waypoint("CASE-1", "assessment").unwrap();
        assert_eq!(loaded["waypoint_type"], "assessment");
        assert_eq!(loaded["ai_analysis"]["recommendation"], "PEND");
        assert!(loaded["ai_analysis"]["disclaimer"]
            .as_str()
            .unwrap()
            .contains("Human review is"));
        assert_eq!(loaded["audit"]["requires_human_review"], true);
    }

    #[test]
    fn test_decision_waypoint_references_assessment() {
        let (_dir, writer) = writer();
        let path = writer
            .write_decision_waypoint(
                "CASE-2",
                json!({"action": "reject", "reviewer_id": "rev-42"}),
                "denied",
                json!({"reason": "No medical necessity documented"}),
                vec![],
            )
            .unwrap();
        assert!(path.ends_with("decision_CASE-2.json"));

        let loaded = writer.load_waypoint("CASE-2", "decision").unwrap();
        assert_eq!(loaded["outcome"]["status"], "denied");
        assert_eq!(loaded["human_decision"]["reviewer_id"], "rev-42");
        assert_eq!(loaded["compliance"]["human_in_the_loop"], true);
        assert_eq!(loaded["compliance"]["ai_final_decision"], false);
        assert!(loaded["assessment_waypoint"]
            .as_str()
            .unwrap()
            .contains("assessment_CASE-2.json"));
    }

    #[test]
    fn test_letter_variants() {
        let (_dir, writer) = writer();

        let path = writer
            .write_notification_letter(
                "CASE-3",
                "approved",
                "Jane Doe",
                "adalimumab",
                "Cigna",
                &json!({"reference_number": "REF-77"}),
            )
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("APPROVED"));
        assert!(body.contains("REF-77"));

        let path = writer
            .write_notification_letter(
                "CASE-4",
                "pend",
                "Jane Doe",
                "adalimumab",
                "Cigna",
                &json!({"required_documents": ["TB screening result"]}),
            )
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("PENDING additional information"));
        assert!(body.contains("TB screening result"));

        let path = writer
            .write_notification_letter(
                "CASE-5",
                "denied",
                "Jane Doe",
                "adalimumab",
                "Cigna",
                &json!({"denial_reason": "No medical necessity documented"}),
            )
            .unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("DENIED"));
        assert!(body.contains("No medical necessity documented"));
        assert!(body.contains("human reviewer"));
        assert!(body.contains("right to appeal"));
    }

    #[test]
    fn test_load_missing_waypoint() {
        let (_dir, writer) = writer();
        assert!(writer.load_waypoint("CASE-nope", "assessment").is_none());
    }
}

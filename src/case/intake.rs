//! Intake validation: builds a case from raw patient and medication
//! payloads, rejecting incomplete submissions before a case exists.

use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};

use super::types::{CaseState, MedicationRequest, PatientInfo, PayerState};

/// Patient fields that must be present at intake.
const REQUIRED_PATIENT_FIELDS: &[&str] = &[
    "patient_id",
    "first_name",
    "last_name",
    "date_of_birth",
    "primary_payer",
    "primary_member_id",
];

/// Medication fields that must be present at intake.
const REQUIRED_MEDICATION_FIELDS: &[&str] = &[
    "medication_name",
    "dose",
    "diagnosis",
    "icd10_code",
    "prescriber_npi",
];

/// Validates intake payloads and constructs the initial case state.
pub struct IntakeAgent;

impl IntakeAgent {
    /// Validate intake data and build a new case.
    ///
    /// Fails with a [`Error::Validation`] naming every missing field;
    /// no case is created on failure. Payer states are seeded from the
    /// patient's primary (and optional secondary) insurance.
    pub fn create_case(patient_data: &Value, medication_data: &Value) -> Result<CaseState> {
        let mut missing: Vec<String> = Vec::new();
        for field in REQUIRED_PATIENT_FIELDS {
            if !has_nonempty_field(patient_data, field) {
                missing.push(format!("patient.{}", field));
            }
        }
        for field in REQUIRED_MEDICATION_FIELDS {
            if !has_nonempty_field(medication_data, field) {
                missing.push(format!("medication.{}", field));
            }
        }
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "intake missing required fields: {}",
                missing.join(", ")
            )));
        }

        let patient: PatientInfo = serde_json::from_value(patient_data.clone())
            .map_err(|e| Error::Validation(format!("invalid patient data: {}", e)))?;
        let medication: MedicationRequest = serde_json::from_value(medication_data.clone())
            .map_err(|e| Error::Validation(format!("invalid medication data: {}", e)))?;

        let mut case = CaseState::new();
        case.payer_states.insert(
            patient.primary_payer.clone(),
            PayerState::new(&patient.primary_payer),
        );
        if let Some(secondary) = patient.secondary_payer.as_ref().filter(|s| !s.is_empty()) {
            case.payer_states
                .insert(secondary.clone(), PayerState::new(secondary));
        }
        case.patient = Some(patient);
        case.medication = Some(medication);

        info!(
            case_id = %case.case_id,
            payers = case.payer_states.len(),
            "intake validated, case created"
        );
        Ok(case)
    }
}

fn has_nonempty_field(data: &Value, field: &str) -> bool {
    match data.get(field) {
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_patient() -> Value {
        json!({
            "patient_id": "P-1",
            "first_name": "Jane",
            "last_name": "Doe",
            "date_of_birth": "1985-04-02",
            "primary_payer": "Cigna",
            "primary_member_id": "M123",
            "secondary_payer": "Aetna",
            "secondary_member_id": "M456",
            "diagnosis_codes": ["K50.00"]
        })
    }

    fn valid_medication() -> Value {
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
            "clinical_rationale": "failed conventional therapy"
        })
    }

    #[test]
    fn test_valid_intake_creates_case() {
        let case = IntakeAgent::create_case(&valid_patient(), &valid_medication()).unwrap();
        assert_eq!(case.version, 1);
        assert!(case.patient.is_some());
        assert!(case.medication.is_some());
        assert_eq!(case.payer_states.len(), 2);
        assert!(case.payer_states.contains_key("Cigna"));
        assert!(case.payer_states.contains_key("Aetna"));
    }

    #[test]
    fn test_missing_fields_listed() {
        let mut patient = valid_patient();
        patient["patient_id"] = json!("");
        patient.as_object_mut().unwrap().remove("primary_payer");
        let mut medication = valid_medication();
        medication["icd10_code"] = json!(null);

        let err = IntakeAgent::create_case(&patient, &medication).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("patient.patient_id"));
        assert!(message.contains("patient.primary_payer"));
        assert!(message.contains("medication.icd10_code"));
    }

    #[test]
    fn test_primary_only_seeds_one_payer() {
        let mut patient = valid_patient();
        patient.as_object_mut().unwrap().remove("secondary_payer");
        patient.as_object_mut().unwrap().remove("secondary_member_id");

        let case = IntakeAgent::create_case(&patient, &valid_medication()).unwrap();
        assert_eq!(case.payer_states.len(), 1);
    }
}

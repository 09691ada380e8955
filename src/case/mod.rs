//! Case aggregate: state entities and intake validation.

pub mod intake;
pub mod types;

pub use intake::IntakeAgent;
pub use types::{
    CaseStage, CaseState, HumanDecision, HumanDecisionAction, MedicationRequest, PatientInfo,
    PayerState, PayerStatus,
};

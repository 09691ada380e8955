//! Policy domain: digitized policies, the coverage reasoner, iterative
//! refinement, and the payer-facing analyzer.

pub mod analyzer;
pub mod reasoner;
pub mod refiner;
pub mod repository;
pub mod rubric;
pub mod types;

pub use analyzer::{PayerAnalysis, PolicyAnalyzer};
pub use reasoner::{
    apply_conservative_status_mapping, format_policy_criteria, validate_approval_likelihood,
    PolicyReasoner,
};
pub use refiner::IterativeRefiner;
pub use repository::PolicyRepository;
pub use rubric::{DecisionRubric, RubricLoader};
pub use types::{
    ClinicalCode, CoverageAssessment, CoverageStatus, Criterion, CriterionAssessment,
    CriterionGroup, DigitizedPolicy, DocumentationGap, ExclusionCriterion, GapPriority,
    GroupOperator, Indication, StepTherapyRequirement, Threshold,
};

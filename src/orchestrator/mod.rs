//! Case orchestration: the stage machine, payer interactions, stage
//! deltas, and streamed progress.

pub mod engine;
pub mod payer;
pub mod state;
pub mod stream;

pub use engine::{requires_human_decision, CaseOrchestrator, RunOutcome};
pub use payer::{MockOutcome, MockPayerGateway, PayerGateway, PayerResponse};
pub use state::{
    check_payer_responses, needs_recovery, PayerResponseSummary, PayerUpdate, StageDelta,
};
pub use stream::ProgressStream;

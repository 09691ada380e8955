//! Persistence: SQLite schema, the low-level [`Database`], and the
//! versioned [`CaseStore`].

pub mod case_store;
pub mod database;
pub mod schema;

pub use case_store::CaseStore;
pub use database::{
    CaseSnapshot, Database, IntelligenceCacheRow, PolicyCacheRow, PredictionOutcome,
};

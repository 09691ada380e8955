//! Prompt store: remote-managed prompts with a local template fallback.

pub mod store;

pub use store::{PromptResult, PromptSource, PromptStore, RemotePromptSource};

//! Per-payer decision rubrics: key/value hints guiding LLM reasoning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// Key/value reasoning hints for one payer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionRubric {
    #[serde(default)]
    pub payer_name: String,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

impl DecisionRubric {
    /// Render the rubric as a prompt context section.
    pub fn to_prompt_context(&self) -> String {
        if self.hints.is_empty() {
            return String::new();
        }
        let mut lines = vec!["### Payer Decision Rubric".to_string()];
        for (key, value) in &self.hints {
            lines.push(format!("- {}: {}", key, value));
        }
        lines.join("\n")
    }
}

/// Loads rubric JSON files from a directory, one per payer.
#[derive(Clone)]
pub struct RubricLoader {
    rubrics_dir: PathBuf,
}

impl RubricLoader {
    pub fn new(rubrics_dir: impl Into<PathBuf>) -> Self {
        Self {
            rubrics_dir: rubrics_dir.into(),
        }
    }

    /// Load the rubric for a payer; missing files yield an empty rubric.
    pub fn load(&self, payer_name: &str) -> DecisionRubric {
        let key = payer_name.trim().to_lowercase().replace(' ', "_");
        let path = self.rubrics_dir.join(format!("{}.json", key));
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<DecisionRubric>(&content) {
                Ok(mut rubric) => {
                    if rubric.payer_name.is_empty() {
                        rubric.payer_name = payer_name.to_string();
                    }
                    rubric
                }
                Err(e) => {
                    debug!(payer = payer_name, error = %e, "rubric file unparseable, using empty rubric");
                    DecisionRubric {
                        payer_name: payer_name.to_string(),
                        ..Default::default()
                    }
                }
            },
            Err(_) => DecisionRubric {
                payer_name: payer_name.to_string(),
                ..Default::default()
            },
        }
    }
}

//! Policy lookup by (payer, medication) with brand/generic aliasing.
//!
//! The database is the primary source for both digitized criteria and
//! raw policy text; local text files are the fallback. PDF-only local
//! policies yield a placeholder marker so assessment can still run from
//! digitized criteria alone.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::store::Database;

use super::types::DigitizedPolicy;

/// Lowercase and replace spaces with underscores.
fn normalize_key(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Repository over the policy cache and local policy files.
#[derive(Clone)]
pub struct PolicyRepository {
    db: Arc<Database>,
    policies_dir: PathBuf,
    settings: Settings,
}

impl PolicyRepository {
    pub fn new(db: Arc<Database>, settings: Settings) -> Self {
        Self {
            db,
            policies_dir: settings.policies_dir.clone(),
            settings,
        }
    }

    /// Medication keys to try: the normalized name plus its alias.
    fn medication_keys(&self, medication: &str) -> Vec<String> {
        let primary = normalize_key(medication);
        let mut keys = vec![primary.clone()];
        if let Some(alias) = self.settings.medication_alias(&primary) {
            keys.push(normalize_key(alias));
        }
        keys
    }

    /// Load the digitized policy for a payer/medication pair.
    ///
    /// Returns the newest cached entry; `None` when no structured policy
    /// exists (callers may still have raw text to work from).
    pub fn load(&self, payer: &str, medication: &str) -> Result<Option<DigitizedPolicy>> {
        let payer_key = normalize_key(payer);
        for med_key in self.medication_keys(medication) {
            if let Some(row) = self.db.get_policy(&payer_key, &med_key)? {
                if let Some(criteria) = row.parsed_criteria {
                    let mut policy: DigitizedPolicy = serde_json::from_value(criteria)?;
                    policy.version = Some(row.policy_version);
                    info!(payer = %payer_key, medication = %med_key, "digitized policy loaded");
                    return Ok(Some(policy));
                }
            }
        }
        Ok(None)
    }

    /// Load raw policy text: database first, local files as fallback.
    ///
    /// Returns `None` only when nothing textual exists anywhere; a
    /// PDF-only local policy yields a placeholder marker instead.
    pub fn load_raw_text(&self, payer: &str, medication: &str) -> Result<Option<String>> {
        let payer_key = normalize_key(payer);
        let med_keys = self.medication_keys(medication);

        // Database is the primary source
        for med_key in &med_keys {
            if let Some(row) = self.db.get_policy(&payer_key, med_key)? {
                if let Some(text) = row.policy_text.filter(|t| !t.is_empty()) {
                    info!(payer = %payer_key, medication = %med_key, "policy text loaded from database");
                    return Ok(Some(text));
                }
            }
        }

        // Local `{payer}_{med}.txt` files
        for med_key in &med_keys {
            let path = self.policies_dir.join(format!("{}_{}.txt", payer_key, med_key));
            if let Ok(text) = std::fs::read_to_string(&path) {
                return Ok(Some(text));
            }
        }

        // Generic `{payer}.txt` policy
        let generic = self.policies_dir.join(format!("{}.txt", payer_key));
        if let Ok(text) = std::fs::read_to_string(&generic) {
            return Ok(Some(text));
        }

        // PDF-only policy: digitized criteria are passed separately
        for med_key in &med_keys {
            let pdf = self.policies_dir.join(format!("{}_{}.pdf", payer_key, med_key));
            if pdf.exists() {
                info!(
                    payer = %payer_key,
                    medication = %med_key,
                    "policy available as PDF only, using placeholder text"
                );
                return Ok(Some(format!(
                    "[Policy for {}/{} is available as PDF only. Raw policy text not \
                     available for direct inclusion. Use the digitized policy criteria \
                     structure below for evaluation.]",
                    payer, medication
                )));
            }
        }

        warn!(payer = %payer_key, medication = %medication, "no policy text found");
        Ok(None)
    }

    /// Load both forms, failing only when neither exists.
    pub fn load_policy_context(
        &self,
        payer: &str,
        medication: &str,
    ) -> Result<(Option<DigitizedPolicy>, String)> {
        let digitized = self.load(payer, medication)?;
        let raw_text = self.load_raw_text(payer, medication)?;

        if digitized.is_none() && raw_text.is_none() {
            return Err(Error::policy_not_found(payer, medication));
        }
        Ok((digitized, raw_text.unwrap_or_default()))
    }
}

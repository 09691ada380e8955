//! Load prompts from a remote prompt service (primary) or local `.txt`
//! templates (fallback), with `{variable}` substitution.
//!
//! The remote service compiles `{{var}}` double-brace templates itself;
//! local templates use single-brace `{var}` placeholders. Non-scalar
//! variables are JSON-encoded before substitution either way.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// TTL for remote prompt cache entries.
const REMOTE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Where a prompt was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    Remote,
    Local,
}

/// Result of loading a prompt, with provenance.
#[derive(Debug, Clone)]
pub struct PromptResult {
    pub text: String,
    pub source: PromptSource,
}

/// A remote prompt service keyed by path-derived names.
///
/// `fetch_compiled` receives variables already stringified so the remote
/// side can substitute its own `{{var}}` syntax. Implementations return
/// `Ok(None)` when the prompt is not managed remotely.
pub trait RemotePromptSource: Send + Sync {
    fn fetch_compiled(
        &self,
        name: &str,
        variables: &HashMap<String, String>,
    ) -> Result<Option<String>>;
}

/// Convert a hierarchical prompt path to the remote service's flat name
/// (`policy_analysis/coverage_assessment.txt` → `policy_analysis-coverage_assessment`).
pub fn prompt_path_to_remote_name(path: &str) -> String {
    path.trim_end_matches(".txt").replace('/', "-")
}

struct RemoteCacheEntry {
    text: String,
    fetched_at: Instant,
}

/// Prompt store with process-lifetime local caching and TTL-cached
/// remote reads.
pub struct PromptStore {
    prompts_dir: PathBuf,
    remote: Option<Box<dyn RemotePromptSource>>,
    local_cache: Mutex<HashMap<String, String>>,
    remote_cache: Mutex<HashMap<String, RemoteCacheEntry>>,
}

impl PromptStore {
    /// Create a store over a local prompt tree with no remote source.
    pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            remote: None,
            local_cache: Mutex::new(HashMap::new()),
            remote_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a remote prompt service as the primary source.
    pub fn with_remote(mut self, remote: Box<dyn RemotePromptSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Load a prompt and substitute variables.
    pub fn load(&self, prompt_path: &str, variables: &HashMap<String, Value>) -> Result<String> {
        let result = self.load_with_meta(prompt_path, variables)?;

        // Leftover placeholders mean a variable the template expected was
        // not supplied; the remote side validates its own.
        if result.source == PromptSource::Local {
            let placeholder = Regex::new(r"\{(\w+)\}").expect("static regex");
            let remaining: Vec<&str> = placeholder
                .captures_iter(&result.text)
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect();
            if !remaining.is_empty() {
                warn!(
                    prompt_path,
                    variables = ?remaining,
                    "unsubstituted variables in prompt"
                );
            }
        }

        Ok(result.text)
    }

    /// Load a prompt with provenance metadata.
    pub fn load_with_meta(
        &self,
        prompt_path: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<PromptResult> {
        if let Some(text) = self.try_remote(prompt_path, variables) {
            return Ok(PromptResult {
                text,
                source: PromptSource::Remote,
            });
        }

        let raw = self.load_raw_local(prompt_path)?;
        let text = substitute_variables(&raw, variables);
        Ok(PromptResult {
            text,
            source: PromptSource::Local,
        })
    }

    fn try_remote(&self, prompt_path: &str, variables: &HashMap<String, Value>) -> Option<String> {
        let remote = self.remote.as_ref()?;
        let name = prompt_path_to_remote_name(prompt_path);

        // Remote cache keys include the variable values since the remote
        // service returns compiled text.
        let stringified = stringify_variables(variables);
        let cache_key = format!("{}::{:?}", name, {
            let mut entries: Vec<_> = stringified.iter().collect();
            entries.sort();
            entries
        });

        {
            let cache = self.remote_cache.lock().expect("remote cache lock");
            if let Some(entry) = cache.get(&cache_key) {
                if entry.fetched_at.elapsed() < REMOTE_CACHE_TTL {
                    return Some(entry.text.clone());
                }
            }
        }

        match remote.fetch_compiled(&name, &stringified) {
            Ok(Some(text)) => {
                debug!(name, "prompt loaded from remote service");
                self.remote_cache
                    .lock()
                    .expect("remote cache lock")
                    .insert(
                        cache_key,
                        RemoteCacheEntry {
                            text: text.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                Some(text)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(name, error = %e, "remote prompt fetch failed, falling back to local");
                None
            }
        }
    }

    fn load_raw_local(&self, prompt_path: &str) -> Result<String> {
        {
            let cache = self.local_cache.lock().expect("local cache lock");
            if let Some(text) = cache.get(prompt_path) {
                return Ok(text.clone());
            }
        }

        let full_path = self.resolve_local_path(prompt_path)?;
        let content = std::fs::read_to_string(&full_path)
            .map_err(|_| Error::PromptNotFound(prompt_path.to_string()))?;

        debug!(prompt_path, length = content.len(), "loaded prompt from disk");
        self.local_cache
            .lock()
            .expect("local cache lock")
            .insert(prompt_path.to_string(), content.clone());
        Ok(content)
    }

    /// Resolve a prompt path inside the prompt root, rejecting traversal.
    fn resolve_local_path(&self, prompt_path: &str) -> Result<PathBuf> {
        if Path::new(prompt_path)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
        {
            return Err(Error::PromptNotFound(prompt_path.to_string()));
        }
        let full = self.prompts_dir.join(prompt_path);
        if !full.is_file() {
            return Err(Error::PromptNotFound(prompt_path.to_string()));
        }
        Ok(full)
    }

    /// List every available local prompt, grouped by directory.
    pub fn list_prompts(&self) -> HashMap<String, Vec<String>> {
        let mut prompts: HashMap<String, Vec<String>> = HashMap::new();
        let pattern = self.prompts_dir.join("**/*.txt");
        let Some(pattern) = pattern.to_str() else {
            return prompts;
        };
        let Ok(paths) = glob::glob(pattern) else {
            return prompts;
        };
        for path in paths.flatten() {
            let Ok(rel) = path.strip_prefix(&self.prompts_dir) else {
                continue;
            };
            let dir = rel
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            prompts.entry(dir).or_default().push(name);
        }
        for names in prompts.values_mut() {
            names.sort();
        }
        prompts
    }

    /// Extract `{variable}` names from a local template.
    pub fn prompt_variables(&self, prompt_path: &str) -> Result<Vec<String>> {
        let raw = self.load_raw_local(prompt_path)?;
        let placeholder = Regex::new(r"\{(\w+)\}").expect("static regex");
        Ok(placeholder
            .captures_iter(&raw)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect())
    }

    /// Drop both caches (test hook; also used after remote prompt edits).
    pub fn clear_cache(&self) {
        self.local_cache.lock().expect("local cache lock").clear();
        self.remote_cache.lock().expect("remote cache lock").clear();
        info!("prompt cache cleared (local + remote)");
    }
}

/// Substitute `{name}` placeholders; dicts and lists are JSON-encoded.
fn substitute_variables(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut result = template.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{}}}", key);
        result = result.replace(&placeholder, &stringify_value(value));
    }
    result
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

fn stringify_variables(variables: &HashMap<String, Value>) -> HashMap<String, String> {
    variables
        .iter()
        .map(|(k, v)| (k.clone(), stringify_value(v)))
        .collect()
}

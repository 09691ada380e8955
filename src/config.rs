//! Runtime configuration for pa-core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Weights for the deterministic strategy scorer. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub speed: f64,
    pub approval: f64,
    pub low_rework: f64,
    pub patient_burden: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            speed: 0.30,
            approval: 0.40,
            low_rework: 0.20,
            patient_burden: 0.10,
        }
    }
}

impl ScoringWeights {
    /// Check the weights sum to 1.0 within floating-point tolerance.
    pub fn validate(&self) -> bool {
        let sum = self.speed + self.approval + self.low_rework + self.patient_burden;
        (sum - 1.0).abs() < 1e-6
    }
}

/// Process-wide settings.
///
/// Defaults mirror production values; tests override individual knobs
/// through the `with_*` builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Wall-clock budget for a full gateway `generate` call, including
    /// the retry on the same provider.
    pub llm_gateway_timeout_secs: u64,
    /// Fixed backoff before retrying a provider after a transient error.
    pub transient_retry_delay_secs: u64,
    /// Consecutive failures before a provider's circuit breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Seconds a tripped provider is skipped before a probe is allowed.
    pub circuit_breaker_cooldown_secs: u64,

    /// Model identifiers per provider.
    pub claude_model: String,
    pub gemini_model: String,
    pub azure_openai_deployment: String,
    /// Max output tokens per provider call.
    pub claude_max_output_tokens: u32,
    pub gemini_max_output_tokens: u32,
    pub azure_max_output_tokens: u32,
    /// Embedding vector dimensionality (Gemini embedding channel).
    pub embed_dim: usize,

    /// TTL for cached strategic intelligence.
    pub cache_ttl_hours: i64,
    /// Version label requested from the policy cache when none is given.
    pub policy_cache_default_version: String,

    /// Strategy scoring weights.
    pub scoring_weights: ScoringWeights,

    /// Criterion confidence below this triggers targeted refinement.
    pub low_confidence_threshold: f64,
    /// Upper bound on refinement passes per payer.
    pub max_refinement_iterations: u32,

    /// Consecutive no-change monitoring polls before forcing completion.
    pub monitoring_stale_threshold: u32,
    /// Hard cap on monitoring polls per case run.
    pub monitoring_max_iterations: u32,

    /// Seconds of subscriber inactivity before a heartbeat is sent.
    pub heartbeat_interval_secs: u64,
    /// Number of recent system notifications replayed on connect.
    pub notification_replay_count: usize,

    /// Root of the local prompt template tree.
    pub prompts_dir: PathBuf,
    /// Local policy documents directory.
    pub policies_dir: PathBuf,
    /// Historical PA cases corpus (JSON).
    pub historical_data_path: PathBuf,
    /// Per-payer decision rubric directory (JSON files).
    pub rubrics_dir: PathBuf,
    /// Waypoint artifact output directory.
    pub waypoints_dir: PathBuf,
    /// Notification letter output directory.
    pub outputs_dir: PathBuf,

    /// Brand/generic medication aliases used by policy lookup and the
    /// intelligence corpus filter. Keys and values are lowercased.
    pub medication_aliases: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_gateway_timeout_secs: 180,
            transient_retry_delay_secs: 2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: 60,

            claude_model: "claude-sonnet-4-20250514".to_string(),
            gemini_model: "gemini-2.0-flash".to_string(),
            azure_openai_deployment: "gpt-4o".to_string(),
            claude_max_output_tokens: 8192,
            gemini_max_output_tokens: 8192,
            azure_max_output_tokens: 16384,
            embed_dim: 768,

            cache_ttl_hours: 24,
            policy_cache_default_version: "latest".to_string(),

            scoring_weights: ScoringWeights::default(),

            low_confidence_threshold: 0.70,
            max_refinement_iterations: 2,

            monitoring_stale_threshold: 2,
            monitoring_max_iterations: 10,

            heartbeat_interval_secs: 30,
            notification_replay_count: 10,

            prompts_dir: PathBuf::from("prompts"),
            policies_dir: PathBuf::from("data/policies"),
            historical_data_path: PathBuf::from("data/historical_pa_cases.json"),
            rubrics_dir: PathBuf::from("data/rubrics"),
            waypoints_dir: PathBuf::from("waypoints"),
            outputs_dir: PathBuf::from("outputs"),

            medication_aliases: default_medication_aliases(),
        }
    }
}

/// Default brand/generic alias pairs, both directions.
fn default_medication_aliases() -> HashMap<String, String> {
    let pairs = [
        ("humira", "adalimumab"),
        ("remicade", "infliximab"),
        ("stelara", "ustekinumab"),
        ("entyvio", "vedolizumab"),
        ("skyrizi", "risankizumab"),
    ];
    let mut aliases = HashMap::new();
    for (brand, generic) in pairs {
        aliases.insert(brand.to_string(), generic.to_string());
        aliases.insert(generic.to_string(), brand.to_string());
    }
    aliases
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway timeout as a [`Duration`].
    pub fn llm_gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_gateway_timeout_secs)
    }

    /// Transient retry backoff as a [`Duration`].
    pub fn transient_retry_delay(&self) -> Duration {
        Duration::from_secs(self.transient_retry_delay_secs)
    }

    /// Circuit breaker cooldown as a [`Duration`].
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }

    pub fn with_gateway_timeout_secs(mut self, secs: u64) -> Self {
        self.llm_gateway_timeout_secs = secs;
        self
    }

    pub fn with_transient_retry_delay_secs(mut self, secs: u64) -> Self {
        self.transient_retry_delay_secs = secs;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown_secs: u64) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_cooldown_secs = cooldown_secs;
        self
    }

    pub fn with_cache_ttl_hours(mut self, hours: i64) -> Self {
        self.cache_ttl_hours = hours;
        self
    }

    pub fn with_scoring_weights(mut self, weights: ScoringWeights) -> Self {
        self.scoring_weights = weights;
        self
    }

    pub fn with_monitoring_limits(mut self, stale_threshold: u32, max_iterations: u32) -> Self {
        self.monitoring_stale_threshold = stale_threshold;
        self.monitoring_max_iterations = max_iterations;
        self
    }

    /// Set the prompt root, expanding `~` and environment references.
    pub fn with_prompts_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.prompts_dir = expand_path(dir.as_ref());
        self
    }

    pub fn with_policies_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.policies_dir = expand_path(dir.as_ref());
        self
    }

    pub fn with_historical_data_path(mut self, path: impl AsRef<str>) -> Self {
        self.historical_data_path = expand_path(path.as_ref());
        self
    }

    pub fn with_rubrics_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.rubrics_dir = expand_path(dir.as_ref());
        self
    }

    pub fn with_waypoints_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.waypoints_dir = expand_path(dir.as_ref());
        self
    }

    pub fn with_outputs_dir(mut self, dir: impl AsRef<str>) -> Self {
        self.outputs_dir = expand_path(dir.as_ref());
        self
    }

    pub fn with_medication_alias(
        mut self,
        name: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        let name = name.into().to_lowercase();
        let alias = alias.into().to_lowercase();
        self.medication_aliases
            .insert(name.clone(), alias.clone());
        self.medication_aliases.insert(alias, name);
        self
    }

    /// Resolve a medication's alias (brand ↔ generic), if configured.
    pub fn medication_alias(&self, name: &str) -> Option<&str> {
        self.medication_aliases
            .get(&name.to_lowercase())
            .map(String::as_str)
    }
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!(ScoringWeights::default().validate());
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let weights = ScoringWeights {
            speed: 0.5,
            approval: 0.5,
            low_rework: 0.5,
            patient_burden: 0.5,
        };
        assert!(!weights.validate());
    }

    #[test]
    fn test_defaults_match_production_values() {
        let settings = Settings::default();
        assert_eq!(settings.llm_gateway_timeout_secs, 180);
        assert_eq!(settings.circuit_breaker_threshold, 3);
        assert_eq!(settings.circuit_breaker_cooldown_secs, 60);
        assert_eq!(settings.transient_retry_delay_secs, 2);
        assert_eq!(settings.low_confidence_threshold, 0.70);
        assert_eq!(settings.max_refinement_iterations, 2);
        assert_eq!(settings.monitoring_stale_threshold, 2);
        assert_eq!(settings.monitoring_max_iterations, 10);
        assert_eq!(settings.embed_dim, 768);
        assert_eq!(settings.cache_ttl_hours, 24);
    }

    #[test]
    fn test_alias_map_is_bidirectional() {
        let settings = Settings::default();
        assert_eq!(settings.medication_alias("Humira"), Some("adalimumab"));
        assert_eq!(settings.medication_alias("adalimumab"), Some("humira"));
        assert_eq!(settings.medication_alias("aspirin"), None);
    }

    #[test]
    fn test_custom_alias() {
        let settings = Settings::default().with_medication_alias("Cosentyx", "secukinumab");
        assert_eq!(settings.medication_alias("cosentyx"), Some("secukinumab"));
        assert_eq!(settings.medication_alias("SECUKINUMAB"), Some("cosentyx"));
    }
}

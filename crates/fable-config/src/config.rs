use anyhow::{Context, Result};
use fable_core::{BackendCandidate, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Concurrency limit used when `max_concurrent` is absent or unparsable.
pub const DEFAULT_MAX_CONCURRENT: u32 = 1;

/// Weight used when a model entry omits `weight`.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Top-level configuration for a generation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgeConfig {
    #[serde(default)]
    pub run: RunConfig,
    /// Backend definitions keyed by backend name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub backends: HashMap<String, BackendConfig>,
    /// Model entries per task kind (`image`, `music`, `voice`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub models: HashMap<String, Vec<ModelEntry>>,
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Size of the main worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Regenerate assets even when an artifact already exists.
    #[serde(default)]
    pub overwrite: bool,
    /// Backoff between retries while every candidate is saturated.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How often the run monitor reports progress.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    /// Cancel split tasks still running this long after the main pool drained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub straggler_timeout_secs: Option<u64>,
    /// Wait for the current tier instead of borrowing idle lower tiers.
    #[serde(default)]
    pub strict_tiers: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Rewrite applied to a prompt when a task is split off; `{prompt}` is
    /// replaced with the original prompt.
    #[serde(default = "default_split_prompt_template")]
    pub split_prompt_template: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            overwrite: false,
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_secs: default_progress_interval_secs(),
            straggler_timeout_secs: None,
            strict_tiers: false,
            output_dir: default_output_dir(),
            split_prompt_template: default_split_prompt_template(),
        }
    }
}

impl RunConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    pub fn straggler_timeout(&self) -> Option<Duration> {
        self.straggler_timeout_secs.map(Duration::from_secs)
    }

    /// Apply the split rewrite template to `prompt`.
    pub fn split_prompt(&self, prompt: &str) -> String {
        self.split_prompt_template.replace("{prompt}", prompt)
    }
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_progress_interval_secs() -> u64 {
    5
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("assets")
}

fn default_split_prompt_template() -> String {
    "A gentle, family-friendly depiction of: {prompt}".to_string()
}

/// `[backends.<name>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Raw value; see [`parse_max_concurrent`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<toml::Value>,
    #[serde(default)]
    pub endpoint: String,
    /// Environment variable holding a bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// JSON request body; `{prompt}` is replaced by the JSON-escaped prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// JSON pointer to a URL in the response to download the artifact from.
    /// When absent the response body itself is the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_pointer: Option<String>,
    /// Attempts per task before the backend counts as permanently failed.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Regexes matched against failure responses that mean the backend
    /// refuses this prompt (as opposed to a transient error).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbid_patterns: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            endpoint: String::new(),
            api_key_env: None,
            headers: HashMap::new(),
            body: None,
            result_pointer: None,
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
            forbid_patterns: Vec::new(),
        }
    }
}

impl BackendConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    120
}

/// One `[[models.<kind>]]` entry, kept loosely typed until validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<toml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<toml::Value>,
}

impl ModelEntry {
    /// Integer priority, or `None` when missing or not an integer.
    pub fn parsed_priority(&self) -> Option<i64> {
        match &self.priority {
            Some(toml::Value::Integer(p)) => Some(*p),
            _ => None,
        }
    }

    /// Weight as written (number or numeric string), before clamping.
    /// `None` when it is not a finite number.
    pub fn raw_weight(&self) -> Option<f64> {
        let raw = match &self.weight {
            None => return Some(DEFAULT_WEIGHT),
            Some(toml::Value::Integer(w)) => *w as f64,
            Some(toml::Value::Float(w)) => *w,
            Some(toml::Value::String(s)) => s.trim().parse::<f64>().ok()?,
            Some(_) => return None,
        };
        raw.is_finite().then_some(raw)
    }

    /// Weight as a non-negative number, or `None` when it is not a number.
    pub fn parsed_weight(&self) -> Option<f64> {
        self.raw_weight().map(|w| w.max(0.0))
    }

    /// Validate into a candidate record. Entries without an integer priority
    /// are rejected; unparsable weights fall back to [`DEFAULT_WEIGHT`].
    pub fn to_candidate(&self) -> Option<BackendCandidate> {
        let priority = self.parsed_priority()?;
        let weight = self.parsed_weight().unwrap_or(DEFAULT_WEIGHT);
        Some(BackendCandidate::new(self.backend.clone(), weight, priority))
    }
}

/// Parse a configured concurrency limit.
///
/// Accepts integers, floats (truncated) and numeric strings. Negative values
/// clamp to 0; anything absent or unparsable yields [`DEFAULT_MAX_CONCURRENT`].
pub fn parse_max_concurrent(value: Option<&toml::Value>) -> u32 {
    match value.and_then(raw_max_concurrent) {
        Some(n) => n.clamp(0, i64::from(u32::MAX)) as u32,
        None => DEFAULT_MAX_CONCURRENT,
    }
}

/// A `max_concurrent` value as written, before clamping. `None` when it is
/// neither a number nor a numeric string.
pub fn raw_max_concurrent(value: &toml::Value) -> Option<i64> {
    match value {
        toml::Value::Integer(n) => Some(*n),
        toml::Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
        toml::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

impl ForgeConfig {
    /// Load config from `{project_root}/.fable/config.toml`.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    pub fn load_from_root(project_root: &Path) -> Result<Option<Self>> {
        let path = Self::default_path(project_root);
        if !path.exists() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    /// Load config from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// `{project_root}/.fable/config.toml`
    pub fn default_path(project_root: &Path) -> PathBuf {
        project_root.join(".fable").join("config.toml")
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    /// Raw model entries for `kind`.
    pub fn model_entries(&self, kind: TaskKind) -> &[ModelEntry] {
        self.models
            .get(kind.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Validated backend candidates for `kind`.
    ///
    /// Entries without an integer priority are dropped with a warning.
    /// Entries naming unknown backends are kept: the scheduler ignores
    /// candidates missing from the capacity registry when loading a tier.
    pub fn candidates(&self, kind: TaskKind) -> Vec<BackendCandidate> {
        self.model_entries(kind)
            .iter()
            .filter_map(|entry| {
                let candidate = entry.to_candidate();
                if candidate.is_none() {
                    warn!(
                        kind = %kind,
                        backend = %entry.backend,
                        priority = ?entry.priority,
                        "Dropping model entry without an integer priority"
                    );
                }
                candidate
            })
            .collect()
    }

    /// `(backend, max_concurrent)` for every configured backend, sorted by name.
    pub fn capacity_limits(&self) -> Vec<(String, u32)> {
        let mut limits: Vec<(String, u32)> = self
            .backends
            .iter()
            .map(|(name, backend)| {
                (
                    name.clone(),
                    parse_max_concurrent(backend.max_concurrent.as_ref()),
                )
            })
            .collect();
        limits.sort();
        limits
    }

    /// Task kinds that have at least one model entry.
    pub fn configured_kinds(&self) -> Vec<TaskKind> {
        [TaskKind::Image, TaskKind::Music, TaskKind::Voice]
            .into_iter()
            .filter(|kind| !self.model_entries(*kind).is_empty())
            .collect()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

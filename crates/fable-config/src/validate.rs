use anyhow::Result;
use fable_core::AppError;
use regex::Regex;
use tracing::warn;

use crate::config::{ForgeConfig, raw_max_concurrent};

/// Strictly validate a loaded configuration.
///
/// The scheduler tolerates malformed entries (it skips them), so this is
/// only used to give users early, descriptive feedback.
pub fn validate_config(config: &ForgeConfig) -> Result<()> {
    validate_run(config)?;
    validate_backends(config)?;
    validate_models(config)?;
    warn_unused_backends(config);
    Ok(())
}

fn invalid(message: String) -> anyhow::Error {
    AppError::InvalidConfig(message).into()
}

fn validate_run(config: &ForgeConfig) -> Result<()> {
    let run = &config.run;
    if run.workers == 0 {
        return Err(invalid("run.workers must be > 0 (got 0)".to_string()));
    }
    if run.poll_interval_ms == 0 {
        return Err(invalid(
            "run.poll_interval_ms must be > 0 (got 0)".to_string(),
        ));
    }
    if !run.split_prompt_template.contains("{prompt}") {
        return Err(invalid(format!(
            "run.split_prompt_template must contain '{{prompt}}' (got '{}')",
            run.split_prompt_template
        )));
    }
    Ok(())
}

fn validate_backends(config: &ForgeConfig) -> Result<()> {
    let mut names: Vec<&String> = config.backends.keys().collect();
    names.sort();

    for name in names {
        let backend = &config.backends[name];
        if backend.endpoint.trim().is_empty() {
            return Err(invalid(format!("backends.{name}.endpoint cannot be empty")));
        }
        if let Some(raw) = &backend.max_concurrent {
            if !raw_max_concurrent(raw).is_some_and(|n| n >= 0) {
                return Err(invalid(format!(
                    "backends.{name}.max_concurrent must be a non-negative number (got {raw})"
                )));
            }
        }
        if backend.retries == 0 {
            return Err(invalid(format!("backends.{name}.retries must be > 0 (got 0)")));
        }
        for pattern in &backend.forbid_patterns {
            if let Err(e) = Regex::new(pattern) {
                return Err(invalid(format!(
                    "backends.{name}.forbid_patterns: invalid regex '{pattern}': {e}"
                )));
            }
        }
    }
    Ok(())
}

fn validate_models(config: &ForgeConfig) -> Result<()> {
    let mut kinds: Vec<&String> = config.models.keys().collect();
    kinds.sort();

    for kind in kinds {
        if !["image", "music", "voice"].contains(&kind.as_str()) {
            return Err(invalid(format!(
                "Unknown task kind 'models.{kind}'. Known kinds: image, music, voice"
            )));
        }
        for (i, entry) in config.models[kind].iter().enumerate() {
            if !config.backends.contains_key(&entry.backend) {
                return Err(invalid(format!(
                    "models.{kind}[{i}] references unknown backend '{}'",
                    entry.backend
                )));
            }
            if entry.parsed_priority().is_none() {
                return Err(invalid(format!(
                    "models.{kind}[{i}].priority must be an integer (got {})",
                    entry
                        .priority
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "nothing".to_string())
                )));
            }
            if !entry.raw_weight().is_some_and(|w| w >= 0.0) {
                return Err(invalid(format!(
                    "models.{kind}[{i}].weight must be a number >= 0"
                )));
            }
        }
    }
    Ok(())
}

fn warn_unused_backends(config: &ForgeConfig) {
    for name in config.backends.keys() {
        let referenced = config
            .models
            .values()
            .flatten()
            .any(|entry| &entry.backend == name);
        if !referenced {
            warn!(backend = %name, "Backend is not referenced by any [[models.*]] entry");
        }
    }
}

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;

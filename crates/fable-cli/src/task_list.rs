//! Task list files.
//!
//! Either TOML:
//!
//! ```toml
//! [[tasks]]
//! key = "hero"
//! prompt = "A knight in silver armor"
//! ```
//!
//! or JSON, as a bare array or wrapped in `{"tasks": [...]}`.

use anyhow::{Context, Result, bail};
use fable_core::GenerationTask;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::store::file_stem;

#[derive(Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<GenerationTask>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonTasks {
    Bare(Vec<GenerationTask>),
    Wrapped(TaskFile),
}

pub(crate) fn load_tasks(path: &Path) -> Result<Vec<GenerationTask>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task list: {}", path.display()))?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let tasks = if is_json {
        match serde_json::from_str::<JsonTasks>(&content)
            .with_context(|| format!("Failed to parse task list: {}", path.display()))?
        {
            JsonTasks::Bare(tasks) => tasks,
            JsonTasks::Wrapped(file) => file.tasks,
        }
    } else {
        toml::from_str::<TaskFile>(&content)
            .with_context(|| format!("Failed to parse task list: {}", path.display()))?
            .tasks
    };

    // Repeated keys are deduplicated by the run; distinct keys must not share
    // an artifact file.
    let mut stems: HashMap<String, String> = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        if task.key.trim().is_empty() {
            bail!("Task #{} in {} has an empty key", i + 1, path.display());
        }
        let stem = file_stem(&task.key);
        let first = stems
            .entry(stem.clone())
            .or_insert_with(|| task.key.clone());
        if *first != task.key {
            bail!(
                "Task keys '{}' and '{}' in {} both map to artifact file '{}'",
                first,
                task.key,
                path.display(),
                stem
            );
        }
    }
    Ok(tasks)
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use fable_core::TaskKind;
use fable_scheduler::ArtifactStore;
use std::path::PathBuf;

/// Artifacts on disk at `<root>/<kind>/<key>.<ext>`.
#[derive(Debug, Clone)]
pub(crate) struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, kind: TaskKind, key: &str) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(format!("{}.{}", file_stem(key), kind.default_extension()))
    }

    pub async fn write(&self, kind: TaskKind, key: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(kind, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // Readers only ever see a complete file.
        let partial = path.with_extension("partial");
        tokio::fs::write(&partial, bytes)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, &path)
            .await
            .with_context(|| format!("Failed to move artifact into {}", path.display()))?;
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn exists(&self, kind: TaskKind, key: &str) -> Result<bool> {
        let path = self.path_for(kind, key);
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to check {}", path.display()))
    }
}

/// Keys become file names; anything outside `[A-Za-z0-9._-]` is replaced.
pub(crate) fn file_stem(key: &str) -> String {
    let stem: String = key
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem.to_string()
    }
}

//! Seams between the scheduler and the outside world.

use anyhow::Result;
use async_trait::async_trait;
use fable_core::{AttemptOutcome, BackendCandidate, TaskKind};
use tracing::info;

/// Produces one artifact with one backend.
///
/// Implementations run their own bounded retry loop and report the verdict.
/// An `Err` means something unexpected happened (not a backend refusal); the
/// task is then marked as a worker error.
#[async_trait]
pub trait Generator: Send + Sync {
    /// `allow_split` is `false` for split-off attempts, which must not split
    /// again.
    async fn attempt(
        &self,
        backend: &BackendCandidate,
        prompt: &str,
        key: &str,
        allow_split: bool,
    ) -> Result<AttemptOutcome>;
}

/// Answers whether an artifact is already on disk (or wherever it lives).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn exists(&self, kind: TaskKind, key: &str) -> Result<bool>;
}

/// Store that never has anything; every task is generated.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyStore;

#[async_trait]
impl ArtifactStore for EmptyStore {
    async fn exists(&self, _kind: TaskKind, _key: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Receives human-readable progress lines.
pub trait StatusSink: Send + Sync {
    fn report(&self, line: &str);
}

impl<F> StatusSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn report(&self, line: &str) {
        self(line)
    }
}

/// Forwards progress lines to the `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn report(&self, line: &str) {
        info!("{line}");
    }
}

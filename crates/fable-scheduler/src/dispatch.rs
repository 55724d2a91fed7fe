//! Main worker loop.
//!
//! Each worker pops tasks from the shared table and walks them through the
//! root [`TierScheduler`] until they succeed, get split off, or run out of
//! backends.

use anyhow::anyhow;
use fable_core::{
    AppError, AttemptOutcome, BackendCandidate, GenerationTask, ReleaseOutcome, TaskKind,
    TaskStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::generator::{ArtifactStore, Generator, StatusSink};
use crate::split;
use crate::task_table::TaskTable;
use crate::tier::{Acquisition, TierScheduler};

/// Everything a main or split worker needs, shared by all of them.
pub(crate) struct DispatchContext {
    pub kind: TaskKind,
    pub root: Arc<TierScheduler>,
    pub table: Arc<TaskTable>,
    pub generator: Arc<dyn Generator>,
    pub store: Arc<dyn ArtifactStore>,
    pub status: Arc<dyn StatusSink>,
    pub cancel: CancellationToken,
    pub overwrite: bool,
    pub poll_interval: Duration,
    pub splits: TaskTracker,
}

impl DispatchContext {
    pub fn report(&self, line: String) {
        self.status.report(&line);
    }
}

/// Outcome of one guarded generation attempt.
pub(crate) enum AttemptResult {
    Finished(anyhow::Result<AttemptOutcome>),
    Cancelled,
}

/// Run one generation attempt on its own task so a panic in the generator
/// surfaces as an error instead of killing the worker. Cancellation aborts
/// the attempt.
pub(crate) async fn guarded_attempt(
    ctx: &DispatchContext,
    backend: &BackendCandidate,
    prompt: &str,
    key: &str,
    allow_split: bool,
) -> AttemptResult {
    let generator = Arc::clone(&ctx.generator);
    let backend = backend.clone();
    let prompt = prompt.to_string();
    let key = key.to_string();
    let mut handle = tokio::spawn(async move {
        generator
            .attempt(&backend, &prompt, &key, allow_split)
            .await
    });

    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            handle.abort();
            AttemptResult::Cancelled
        }
        joined = &mut handle => match joined {
            Ok(result) => AttemptResult::Finished(result),
            Err(e) if e.is_cancelled() => AttemptResult::Cancelled,
            Err(e) => AttemptResult::Finished(Err(anyhow!("generation attempt panicked: {e}"))),
        },
    }
}

/// Main worker: drain the queue, one task at a time.
///
/// Exits when the queue is empty or the run is cancelled. Tasks still queued
/// at cancellation are finalized by the run.
pub(crate) async fn run_worker(ctx: Arc<DispatchContext>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    loop {
        if ctx.cancel.is_cancelled() {
            debug!(worker_id, "Worker stopping: cancelled");
            break;
        }
        let Some(task) = ctx.table.pop() else {
            debug!(worker_id, "Worker stopping: queue drained");
            break;
        };
        process_task(&ctx, task).await;
    }
}

async fn process_task(ctx: &Arc<DispatchContext>, task: GenerationTask) {
    let key = task.key.as_str();

    if !ctx.overwrite {
        match ctx.store.exists(ctx.kind, key).await {
            Ok(true) => {
                ctx.table.set_status(key, TaskStatus::Skipped, None);
                info!(key, "Artifact exists; skipping");
                ctx.report(format!("{key}: skipped (already exists)"));
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(key, error = %format!("{e:#}"), "Artifact lookup failed; generating anyway");
            }
        }
    }

    // Backends that already gave up on this task.
    let mut failed_on: HashSet<String> = HashSet::new();

    loop {
        let lease = match ctx.root.acquire_backend(&failed_on).await {
            Acquisition::Acquired(lease) => lease,
            Acquisition::Exhausted => {
                let err = AppError::ConfigurationExhausted {
                    kind: ctx.kind.to_string(),
                };
                warn!(key, failed_on = ?failed_on, "{err}");
                ctx.table.set_status(key, TaskStatus::FailedPermanent, None);
                ctx.report(format!("{key}: failed (no backends left)"));
                return;
            }
            Acquisition::Cancelled => {
                ctx.table.set_status(key, TaskStatus::FailedCancelled, None);
                return;
            }
        };

        let candidate = lease.candidate().clone();
        debug!(key, backend = %candidate.name, priority = candidate.priority, "Attempting");

        match guarded_attempt(ctx, &candidate, &task.prompt, key, true).await {
            AttemptResult::Cancelled => {
                ctx.root.release_backend(lease, ReleaseOutcome::Success).await;
                ctx.table.set_status(key, TaskStatus::FailedCancelled, None);
                return;
            }
            AttemptResult::Finished(Ok(AttemptOutcome::Success)) => {
                ctx.root.release_backend(lease, ReleaseOutcome::Success).await;
                ctx.table.set_status(key, TaskStatus::Success, Some(&candidate.name));
                info!(key, backend = %candidate.name, "Generated");
                ctx.report(format!("{key}: done via {}", candidate.name));
                return;
            }
            AttemptResult::Finished(Ok(AttemptOutcome::PermanentFailure)) => {
                ctx.root.release_backend(lease, ReleaseOutcome::PermanentFailure).await;
                failed_on.insert(candidate.name.clone());
                let err = AppError::BackendPermanentFailure {
                    backend: candidate.name.clone(),
                    reason: "retry budget exhausted".to_string(),
                };
                warn!(key, "{err}; trying next backend");
                ctx.report(format!("{key}: {} gave up, trying another backend", candidate.name));
            }
            AttemptResult::Finished(Ok(AttemptOutcome::Split(new_prompt))) => {
                // The backend did its job; the task just needs a different prompt.
                ctx.root.release_backend(lease, ReleaseOutcome::Success).await;
                let derived = ctx.root.derive().await;
                ctx.table.set_status(key, TaskStatus::SplitPending, None);
                info!(key, backend = %candidate.name, "Handing task to split worker");
                ctx.report(format!("{key}: retrying with a rewritten prompt"));
                ctx.splits.spawn(split::run_split(
                    Arc::clone(ctx),
                    derived,
                    GenerationTask::new(key, new_prompt),
                ));
                return;
            }
            AttemptResult::Finished(Err(e)) => {
                ctx.root.release_backend(lease, ReleaseOutcome::Success).await;
                let err = AppError::WorkerUnexpected(format!("{e:#}"));
                error!(key, backend = %candidate.name, "{err}");
                ctx.table.set_status(key, TaskStatus::WorkerError, None);
                ctx.report(format!("{key}: failed ({err})"));
                return;
            }
        }
    }
}

//! Split worker loop.
//!
//! A split task retries one key with a rewritten prompt, outside the main
//! rotation. It walks its own derived [`TierScheduler`] and asks the root for
//! permission (and a capacity slot) before every attempt, so it only ever
//! uses capacity the main workers are not competing for.

use fable_core::{AttemptOutcome, GenerationTask, TaskStatus};
use fable_lock::format_capacity_diagnostic;
use std::sync::Arc;
use tracing::{Level, debug, error, info, warn};

use crate::dispatch::{AttemptResult, DispatchContext, guarded_attempt};
use crate::tier::{DenyReason, SplitPermit, TierScheduler};

pub(crate) async fn run_split(
    ctx: Arc<DispatchContext>,
    derived: TierScheduler,
    task: GenerationTask,
) {
    let key = task.key.as_str();
    info!(key, "Split worker started");

    let (status, backend) = loop {
        if ctx.cancel.is_cancelled() {
            break (TaskStatus::FailedCancelled, None);
        }

        let Some(candidate) = derived.select_candidate().await else {
            warn!(key, "Split task ran out of backends");
            break (TaskStatus::FailedPermanent, None);
        };

        let slot = match ctx.root.can_split_use(&candidate.name, Some(candidate.priority)).await {
            SplitPermit::Granted(slot) => slot,
            SplitPermit::Denied(DenyReason::Priority) => {
                debug!(key, backend = %candidate.name, "Backend reserved for main workers; dropping it");
                derived.retire(&candidate.name).await;
                continue;
            }
            SplitPermit::Denied(DenyReason::Saturated) => {
                if tracing::enabled!(Level::DEBUG) {
                    let snapshot = ctx.root.registry().snapshot().await;
                    debug!(key, "{}", format_capacity_diagnostic(&candidate.name, &snapshot));
                }
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {}
                    _ = tokio::time::sleep(ctx.poll_interval) => {}
                }
                continue;
            }
        };

        let result = guarded_attempt(&ctx, &candidate, &task.prompt, key, false).await;
        slot.release().await;

        match result {
            AttemptResult::Cancelled => break (TaskStatus::FailedCancelled, None),
            AttemptResult::Finished(Ok(AttemptOutcome::Success)) => {
                break (TaskStatus::Success, Some(candidate.name));
            }
            AttemptResult::Finished(Ok(AttemptOutcome::PermanentFailure)) => {
                warn!(key, backend = %candidate.name, "Split attempt failed; trying another backend");
                derived.retire(&candidate.name).await;
            }
            AttemptResult::Finished(Ok(AttemptOutcome::Split(_))) => {
                warn!(key, backend = %candidate.name, "Split task asked to split again; treating as failure");
                derived.retire(&candidate.name).await;
            }
            AttemptResult::Finished(Err(e)) => {
                error!(key, backend = %candidate.name, error = %format!("{e:#}"), "Split attempt errored");
                break (TaskStatus::WorkerError, None);
            }
        }
    };

    ctx.table.set_status(key, status, backend.as_deref());
    match status {
        TaskStatus::Success => ctx.report(format!(
            "{key}: done via {} (rewritten prompt)",
            backend.as_deref().unwrap_or("?")
        )),
        other => ctx.report(format!("{key}: split retry ended as {other}")),
    }
}

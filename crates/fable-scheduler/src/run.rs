//! Run entry point: worker pool, split tracking, progress monitor.

use chrono::Utc;
use fable_core::{BackendCandidate, GenerationTask, RunSummary, TaskKind, TaskStatus};
use fable_lock::CapacityRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};
use ulid::Ulid;

use crate::dispatch::{self, DispatchContext};
use crate::generator::{ArtifactStore, EmptyStore, Generator, StatusSink, TracingStatus};
use crate::task_table::TaskTable;
use crate::tier::TierScheduler;

const DEFAULT_WORKERS: usize = 4;

/// One generation run over a task list for a single [`TaskKind`].
///
/// ```ignore
/// let summary = GenerationRun::new(TaskKind::Image, candidates, limits, generator)
///     .workers(2)
///     .store(store)
///     .run(tasks)
///     .await;
/// ```
pub struct GenerationRun {
    kind: TaskKind,
    candidates: Vec<BackendCandidate>,
    registry: Arc<CapacityRegistry>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn ArtifactStore>,
    status: Arc<dyn StatusSink>,
    workers: usize,
    overwrite: bool,
    poll_interval: Duration,
    progress_interval: Duration,
    straggler_timeout: Option<Duration>,
    strict_tiers: bool,
    cancel: CancellationToken,
    seed: Option<u64>,
}

impl GenerationRun {
    /// `capacity_limits` are `(backend, max_concurrent)` pairs; the registry
    /// built from them is shared by every scheduler in the run.
    pub fn new<I, S>(
        kind: TaskKind,
        candidates: Vec<BackendCandidate>,
        capacity_limits: I,
        generator: Arc<dyn Generator>,
    ) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            kind,
            candidates,
            registry: Arc::new(CapacityRegistry::new(capacity_limits)),
            generator,
            store: Arc::new(EmptyStore),
            status: Arc::new(TracingStatus),
            workers: DEFAULT_WORKERS,
            overwrite: false,
            poll_interval: Duration::from_millis(250),
            progress_interval: Duration::from_secs(5),
            straggler_timeout: None,
            strict_tiers: false,
            cancel: CancellationToken::new(),
            seed: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// How long to wait for split tasks once the main pool has drained
    /// before cancelling them. `None` waits indefinitely.
    pub fn straggler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.straggler_timeout = timeout;
        self
    }

    pub fn strict_tiers(mut self, strict: bool) -> Self {
        self.strict_tiers = strict;
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn status_sink(mut self, sink: impl StatusSink + 'static) -> Self {
        self.status = Arc::new(sink);
        self
    }

    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The capacity registry for this run, for inspection.
    pub fn capacity(&self) -> Arc<CapacityRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process every task and report the outcome.
    ///
    /// Never fails: exhaustion, cancellation and generator errors all end up
    /// as per-task statuses in the summary.
    pub async fn run(self, tasks: Vec<GenerationTask>) -> RunSummary {
        let run_id = Ulid::new();
        let span = info_span!("run", %run_id, kind = %self.kind);
        self.run_inner(run_id, tasks).instrument(span).await
    }

    async fn run_inner(self, run_id: Ulid, tasks: Vec<GenerationTask>) -> RunSummary {
        let started_at = Utc::now();
        let table = Arc::new(TaskTable::new(tasks));

        let mut root = TierScheduler::new(self.kind, self.candidates, Arc::clone(&self.registry))
            .with_poll_interval(self.poll_interval)
            .with_cancellation(self.cancel.clone())
            .with_strict_tiers(self.strict_tiers);
        if let Some(seed) = self.seed {
            root = root.with_seed(seed);
        }
        let root = Arc::new(root);
        root.ensure_tier_loaded().await;

        let ctx = Arc::new(DispatchContext {
            kind: self.kind,
            root,
            table: Arc::clone(&table),
            generator: self.generator,
            store: self.store,
            status: Arc::clone(&self.status),
            cancel: self.cancel.clone(),
            overwrite: self.overwrite,
            poll_interval: self.poll_interval,
            splits: TaskTracker::new(),
        });

        info!(tasks = table.len(), workers = self.workers, "Run started");
        ctx.report(format!(
            "Generating {} {} asset(s) with {} worker(s)",
            table.len(),
            self.kind,
            self.workers
        ));

        let stop_monitor = CancellationToken::new();
        let monitor = tokio::spawn(monitor_progress(
            Arc::clone(&table),
            Arc::clone(&self.registry),
            Arc::clone(&self.status),
            self.progress_interval,
            stop_monitor.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            workers.spawn(dispatch::run_worker(Arc::clone(&ctx), worker_id));
        }
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                error!("Worker join error: {}", e);
            }
        }

        ctx.splits.close();
        if !ctx.splits.is_empty() {
            info!(splits = ctx.splits.len(), "Main workers done; waiting for split tasks");
        }
        match self.straggler_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, ctx.splits.wait()).await.is_err() {
                    warn!(
                        timeout_secs = limit.as_secs_f64(),
                        remaining = ctx.splits.len(),
                        "Split tasks still running after timeout; cancelling"
                    );
                    ctx.report(format!(
                        "Cancelling {} straggling split task(s)",
                        ctx.splits.len()
                    ));
                    self.cancel.cancel();
                    ctx.splits.wait().await;
                }
            }
            None => ctx.splits.wait().await,
        }

        stop_monitor.cancel();
        if let Err(e) = monitor.await {
            error!("Progress monitor join error: {}", e);
        }

        let finalized = table.finalize_unresolved(self.cancel.is_cancelled());
        if !finalized.is_empty() {
            warn!(count = finalized.len(), keys = ?finalized, "Finalized unresolved tasks");
        }

        let in_flight = self.registry.total_in_flight().await;
        if in_flight != 0 {
            warn!(in_flight, "Capacity slots still held at end of run");
        }

        let summary = table.summary(run_id, started_at, Utc::now());
        info!(
            success = summary.success.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "Run finished"
        );
        self.status.report(&format!(
            "Finished: {} succeeded, {} failed, {} skipped",
            summary.success.len(),
            summary.failed.len(),
            summary.skipped.len()
        ));
        summary
    }
}

/// Periodic progress line until `stop` fires.
async fn monitor_progress(
    table: Arc<TaskTable>,
    registry: Arc<CapacityRegistry>,
    status: Arc<dyn StatusSink>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let counts = table.counts();
                let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
                let done = table.len() - table.unresolved();
                let in_flight = registry.total_in_flight().await;
                status.report(&format!(
                    "Progress: {done}/{} done ({} ok, {} split pending, {} queued, {in_flight} in flight)",
                    table.len(),
                    count(TaskStatus::Success),
                    count(TaskStatus::SplitPending),
                    table.queued(),
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;

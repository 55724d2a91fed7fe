//! Shared task queue and status map for one run.

use chrono::{DateTime, Utc};
use fable_core::{GenerationTask, RunSummary, TaskStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

/// Status of one task plus the backend that produced it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub key: String,
    pub status: TaskStatus,
    pub backend: Option<String>,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<GenerationTask>,
    /// Insertion order, for stable summaries.
    order: Vec<String>,
    records: HashMap<String, TaskRecord>,
}

/// FIFO queue of pending tasks and the status of every task in the run.
///
/// Uses a std mutex: it is only held for short map operations and never
/// across an `.await`.
#[derive(Debug)]
pub struct TaskTable {
    inner: Mutex<Inner>,
}

impl TaskTable {
    /// Build the table. Duplicate keys keep the first occurrence.
    pub fn new(tasks: Vec<GenerationTask>) -> Self {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::with_capacity(tasks.len());
        let mut order = Vec::with_capacity(tasks.len());
        let mut records = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if !seen.insert(task.key.clone()) {
                warn!(key = %task.key, "Duplicate task key; keeping the first occurrence");
                continue;
            }
            order.push(task.key.clone());
            records.insert(
                task.key.clone(),
                TaskRecord {
                    key: task.key.clone(),
                    status: TaskStatus::Pending,
                    backend: None,
                },
            );
            queue.push_back(task);
        }

        Self {
            inner: Mutex::new(Inner {
                queue,
                order,
                records,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every update is a single assignment, so poisoning is harmless.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next pending task, or `None` once the queue is drained.
    pub fn pop(&self) -> Option<GenerationTask> {
        self.lock().queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a new status for `key`.
    ///
    /// `Success` always wins. Any other status only replaces a non-terminal
    /// one, so a late failure can never overwrite a finished task. Returns
    /// whether the status changed.
    pub fn set_status(&self, key: &str, status: TaskStatus, backend: Option<&str>) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.records.get_mut(key) else {
            warn!(key, %status, "Status update for unknown task");
            return false;
        };

        let applies = status == TaskStatus::Success || !record.status.is_terminal();
        if !applies {
            debug!(key, current = %record.status, ignored = %status, "Ignoring late status update");
            return false;
        }
        record.status = status;
        if let Some(backend) = backend {
            record.backend = Some(backend.to_string());
        }
        true
    }

    pub fn status(&self, key: &str) -> Option<TaskStatus> {
        self.lock().records.get(key).map(|r| r.status)
    }

    pub fn record(&self, key: &str) -> Option<TaskRecord> {
        self.lock().records.get(key).cloned()
    }

    /// Records in insertion order.
    pub fn records(&self) -> Vec<TaskRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|key| inner.records.get(key).cloned())
            .collect()
    }

    /// Count of tasks per status.
    pub fn counts(&self) -> HashMap<TaskStatus, usize> {
        let inner = self.lock();
        let mut counts = HashMap::new();
        for record in inner.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    /// Number of tasks that are not yet terminal.
    pub fn unresolved(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// Close out every non-terminal task at the end of a run.
    ///
    /// When the run was cancelled they become `FailedCancelled`; otherwise the
    /// worker that owned them died, and they become `WorkerError`.
    pub fn finalize_unresolved(&self, cancelled: bool) -> Vec<String> {
        let status = if cancelled {
            TaskStatus::FailedCancelled
        } else {
            TaskStatus::WorkerError
        };
        let mut inner = self.lock();
        inner.queue.clear();

        let mut finalized = Vec::new();
        let Inner { order, records, .. } = &mut *inner;
        for key in order.iter() {
            if let Some(record) = records.get_mut(key)
                && !record.status.is_terminal()
            {
                record.status = status;
                finalized.push(key.clone());
            }
        }
        finalized
    }

    /// Group keys by outcome in insertion order.
    pub fn summary(
        &self,
        run_id: Ulid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> RunSummary {
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            success: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        };
        for record in self.records() {
            match record.status {
                TaskStatus::Success => summary.success.push(record.key),
                TaskStatus::Skipped => summary.skipped.push(record.key),
                // Unresolved tasks count as failed if summarized early.
                _ => summary.failed.push(record.key),
            }
        }
        summary
    }
}

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Kind of creative asset a task produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Image,
    Music,
    Voice,
}

impl TaskKind {
    /// Returns the config-facing name for this kind (`[[models.<name>]]`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Music => "music",
            Self::Voice => "voice",
        }
    }

    /// File extension used when storing artifacts of this kind.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Music => "mp3",
            Self::Voice => "wav",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A backend usable for one priority tier, validated at config load time.
///
/// The same backend name may appear in several tiers and in several
/// scheduler instances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendCandidate {
    pub name: String,
    /// Relative share within the tier; always `>= 0`.
    pub weight: f64,
    /// Higher is preferred.
    pub priority: i64,
}

impl BackendCandidate {
    pub fn new(name: impl Into<String>, weight: f64, priority: i64) -> Self {
        Self {
            name: name.into(),
            weight: weight.max(0.0),
            priority,
        }
    }
}

/// One unit of work as delivered by the task-list source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTask {
    /// Stable identifier, e.g. the image name. Unique within a run.
    pub key: String,
    pub prompt: String,
}

impl GenerationTask {
    pub fn new(key: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prompt: prompt.into(),
        }
    }
}

/// Lifecycle status of a generation task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    SplitPending,
    Success,
    Skipped,
    FailedPermanent,
    FailedCancelled,
    WorkerError,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::SplitPending => "split-pending",
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::FailedPermanent => "failed-permanent",
            Self::FailedCancelled => "failed-cancelled",
            Self::WorkerError => "worker-error",
        }
    }

    /// `true` once the task can no longer change outcome on its own.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::SplitPending)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::FailedPermanent | Self::FailedCancelled | Self::WorkerError
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one call to the generation routine for one backend.
///
/// The routine runs its own bounded retry loop; this is the verdict after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// The backend exhausted its retry budget for this task.
    PermanentFailure,
    /// Retry the task outside the normal rotation with a rewritten prompt.
    Split(String),
}

/// How a capacity slot is handed back to the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    /// Retire the backend from the scheduler's current tier.
    PermanentFailure,
}

/// Final per-run report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Ulid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.success.len() + self.failed.len() + self.skipped.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Output format for CLI responses
#[derive(Clone, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

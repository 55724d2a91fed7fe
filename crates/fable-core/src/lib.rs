//! Shared types and error taxonomy for the fable asset generator.

pub mod error;
pub mod types;

pub use error::AppError;
pub use types::{
    AttemptOutcome, BackendCandidate, GenerationTask, OutputFormat, ReleaseOutcome, RunSummary,
    TaskKind, TaskStatus,
};

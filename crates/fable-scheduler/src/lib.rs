//! Scheduler: priority-tier backend selection, capacity-bounded task dispatch,
//! and split-off task negotiation.

mod dispatch;
pub mod generator;
pub mod run;
mod split;
pub mod task_table;
pub mod tier;
pub mod weighted;

pub use generator::{ArtifactStore, EmptyStore, Generator, StatusSink, TracingStatus};
pub use run::GenerationRun;
pub use task_table::{TaskRecord, TaskTable};
pub use tier::{
    Acquisition, BackendLease, DenyReason, SplitPermit, TierScheduler, ordered_priorities,
};
pub use weighted::pick_weighted;

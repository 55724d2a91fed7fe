//! In-process concurrency accounting for generation backends.
//!
//! One [`CapacityRegistry`] exists per generation run. The root scheduler and
//! every derived (split) scheduler hold the same `Arc` to it, so capacity is a
//! single pool shared across all of them.

pub mod capacity;

pub use capacity::{CapacityRegistry, CapacitySlot, CapacityStatus, format_capacity_diagnostic};

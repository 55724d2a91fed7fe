//! Per-backend in-flight request counters.
//!
//! Each backend has a fixed `max` and a `current` in-flight count. Reserving
//! a slot means incrementing `current` under the registry mutex if
//! `current < max`. The reservation is represented by a [`CapacitySlot`]
//! guard which hands the slot back exactly once: explicitly via
//! [`CapacitySlot::release`], or on drop if the owner never got that far
//! (cancellation, panic, early return).

use fable_core::AppError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Snapshot of one backend's capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityStatus {
    pub backend: String,
    pub max: u32,
    pub current: u32,
}

impl CapacityStatus {
    pub fn free(&self) -> u32 {
        self.max.saturating_sub(self.current)
    }
}

/// Global capacity table for one generation run.
///
/// Limits are fixed at construction; only the in-flight counters change, and
/// only while the registry mutex is held. The mutex is never held across an
/// `.await` other than its own acquisition.
#[derive(Debug)]
pub struct CapacityRegistry {
    limits: HashMap<String, u32>,
    in_flight: Mutex<HashMap<String, u32>>,
}

impl CapacityRegistry {
    /// Build the registry from `(backend, max_concurrent)` pairs.
    ///
    /// A backend listed twice keeps the last limit.
    pub fn new<I, S>(limits: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let limits: HashMap<String, u32> = limits
            .into_iter()
            .map(|(name, max)| (name.into(), max))
            .collect();
        let in_flight = limits.keys().map(|name| (name.clone(), 0)).collect();
        Self {
            limits,
            in_flight: Mutex::new(in_flight),
        }
    }

    /// Whether `backend` was configured for this run.
    pub fn contains(&self, backend: &str) -> bool {
        self.limits.contains_key(backend)
    }

    /// Configured concurrency limit, `None` for unknown backends.
    pub fn max(&self, backend: &str) -> Option<u32> {
        self.limits.get(backend).copied()
    }

    /// Current in-flight count for `backend` (0 for unknown backends).
    pub async fn current(&self, backend: &str) -> u32 {
        let in_flight = self.in_flight.lock().await;
        in_flight.get(backend).copied().unwrap_or(0)
    }

    /// `true` if a reservation for `backend` would succeed right now.
    pub async fn has_capacity(&self, backend: &str) -> bool {
        let Some(max) = self.max(backend) else {
            return false;
        };
        let in_flight = self.in_flight.lock().await;
        in_flight.get(backend).copied().unwrap_or(0) < max
    }

    /// Reserve one slot for `backend`.
    ///
    /// Fails with [`AppError::GlobalSaturation`] when the backend is at its
    /// limit or is not part of this registry.
    pub async fn reserve(self: &Arc<Self>, backend: &str) -> Result<CapacitySlot, AppError> {
        let Some(max) = self.max(backend) else {
            return Err(AppError::GlobalSaturation {
                backend: backend.to_string(),
            });
        };

        let mut in_flight = self.in_flight.lock().await;
        let current = in_flight.entry(backend.to_string()).or_insert(0);
        if *current >= max {
            return Err(AppError::GlobalSaturation {
                backend: backend.to_string(),
            });
        }
        *current += 1;
        debug!(backend, current = *current, max, "Reserved capacity slot");

        Ok(CapacitySlot {
            registry: Arc::clone(self),
            backend: backend.to_string(),
            released: false,
        })
    }

    /// Non-failing form of [`reserve`](Self::reserve).
    pub async fn try_reserve(self: &Arc<Self>, backend: &str) -> Option<CapacitySlot> {
        self.reserve(backend).await.ok()
    }

    /// Hand one slot for `backend` back to the pool.
    ///
    /// Releasing a slot that is not held is a logic error upstream; it is
    /// logged and otherwise ignored so counters never go below zero.
    pub async fn release(&self, backend: &str) {
        let mut in_flight = self.in_flight.lock().await;
        Self::decrement(&mut in_flight, backend);
    }

    fn decrement(in_flight: &mut HashMap<String, u32>, backend: &str) {
        match in_flight.get_mut(backend) {
            Some(current) if *current > 0 => {
                *current -= 1;
                debug!(backend, current = *current, "Released capacity slot");
            }
            Some(_) => {
                warn!(backend, "Release of capacity slot that is not held; ignoring");
            }
            None => {
                warn!(backend, "Release for unknown backend; ignoring");
            }
        }
    }

    /// Capacity of every backend, sorted by name.
    pub async fn snapshot(&self) -> Vec<CapacityStatus> {
        let in_flight = self.in_flight.lock().await;
        let mut statuses: Vec<CapacityStatus> = self
            .limits
            .iter()
            .map(|(backend, max)| CapacityStatus {
                backend: backend.clone(),
                max: *max,
                current: in_flight.get(backend).copied().unwrap_or(0),
            })
            .collect();
        statuses.sort_by(|a, b| a.backend.cmp(&b.backend));
        statuses
    }

    /// Sum of in-flight requests across all backends.
    pub async fn total_in_flight(&self) -> u32 {
        let in_flight = self.in_flight.lock().await;
        in_flight.values().sum()
    }
}

/// A reserved capacity slot. Hands the slot back on drop if not released.
pub struct CapacitySlot {
    registry: Arc<CapacityRegistry>,
    backend: String,
    released: bool,
}

impl std::fmt::Debug for CapacitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacitySlot")
            .field("backend", &self.backend)
            .field("released", &self.released)
            .finish()
    }
}

impl CapacitySlot {
    /// The backend this slot belongs to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Explicitly hand the slot back.
    pub async fn release(mut self) {
        self.released = true;
        self.registry.release(&self.backend).await;
    }
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Ok(mut in_flight) = self.registry.in_flight.try_lock() {
            CapacityRegistry::decrement(&mut in_flight, &self.backend);
            return;
        }

        // Registry is momentarily contended; finish the release on the runtime.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = Arc::clone(&self.registry);
                let backend = std::mem::take(&mut self.backend);
                handle.spawn(async move {
                    registry.release(&backend).await;
                });
            }
            Err(_) => {
                warn!(
                    backend = %self.backend,
                    "Capacity slot dropped outside a runtime while registry was busy; slot leaked"
                );
            }
        }
    }
}

/// Format a diagnostic message for a saturated backend.
pub fn format_capacity_diagnostic(backend: &str, all: &[CapacityStatus]) -> String {
    let mut lines = Vec::new();

    if let Some(status) = all.iter().find(|s| s.backend == backend) {
        lines.push(format!(
            "[fable:capacity] {}: {}/{} slots in flight",
            backend, status.current, status.max
        ));
    } else {
        lines.push(format!("[fable:capacity] {}: not configured", backend));
    }

    let usage: Vec<String> = all
        .iter()
        .map(|s| format!("{} {}/{}", s.backend, s.current, s.max))
        .collect();
    lines.push(format!("[fable:capacity] usage: {}", usage.join(" | ")));

    let alternatives: Vec<String> = all
        .iter()
        .filter(|s| s.backend != backend && s.free() > 0)
        .map(|s| format!("{} ({} free)", s.backend, s.free()))
        .collect();
    if !alternatives.is_empty() {
        lines.push(format!(
            "[fable:capacity] free elsewhere: {}",
            alternatives.join(", ")
        ));
    }

    lines.join("\n")
}

#[cfg(test)]
#[path = "capacity_tests.rs"]
mod tests;

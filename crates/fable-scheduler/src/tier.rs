//! Priority-tier backend selection.
//!
//! A [`TierScheduler`] walks the distinct backend priorities of one task kind
//! from best to worst. The *current tier* is the set of backends sharing the
//! priority under the cursor. Backends are retired from the current tier when
//! they fail permanently; once the tier is empty the cursor moves to the next
//! tier that has at least one usable backend. When no tier is left the
//! scheduler is terminal and stays that way.
//!
//! A failure on a backend borrowed from a lower tier only concerns the task
//! that hit it. Callers keep a per-task exclusion set for that; lower tiers
//! are always loaded in full when the cursor reaches them.
//!
//! Capacity is not owned here: every scheduler (the root and any derived
//! split scheduler) reserves slots from the same shared [`CapacityRegistry`].
//!
//! Lock order is always instance state first, then the registry.

use fable_core::{AppError, BackendCandidate, ReleaseOutcome, TaskKind};
use fable_lock::{CapacityRegistry, CapacitySlot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::weighted::pick_weighted;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Distinct priorities present in `candidates`, best (highest) first.
pub fn ordered_priorities(candidates: &[BackendCandidate]) -> Vec<i64> {
    let mut priorities: Vec<i64> = candidates.iter().map(|c| c.priority).collect();
    priorities.sort_unstable_by(|a, b| b.cmp(a));
    priorities.dedup();
    priorities
}

/// A backend handed out by [`TierScheduler::acquire_backend`], together with
/// the capacity slot reserved for it.
#[derive(Debug)]
pub struct BackendLease {
    candidate: BackendCandidate,
    slot: CapacitySlot,
}

impl BackendLease {
    pub fn candidate(&self) -> &BackendCandidate {
        &self.candidate
    }

    pub fn backend(&self) -> &str {
        &self.candidate.name
    }
}

/// Result of asking the root scheduler for a backend.
#[derive(Debug)]
pub enum Acquisition {
    Acquired(BackendLease),
    /// No backend is left for this caller: every tier is used up, or the
    /// remaining ones are all in the caller's exclusion set.
    Exhausted,
    Cancelled,
}

/// Why the root refused a split task's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The backend is outside the root's current tier and the split task's
    /// tier is not worse than the root's. Retrying will not help.
    Priority,
    /// Allowed, but the backend has no free slot right now.
    Saturated,
}

/// Result of [`TierScheduler::can_split_use`].
#[derive(Debug)]
pub enum SplitPermit {
    Granted(CapacitySlot),
    Denied(DenyReason),
}

#[derive(Debug)]
struct TierState {
    /// `None` until the first load.
    ordered_priorities: Option<Vec<i64>>,
    /// `None` until the first tier is loaded; only ever increases.
    cursor: Option<usize>,
    current: Vec<BackendCandidate>,
    terminal: bool,
    rng: StdRng,
}

impl TierState {
    fn current_priority(&self) -> Option<i64> {
        if self.terminal {
            return None;
        }
        let cursor = self.cursor?;
        self.ordered_priorities.as_ref()?.get(cursor).copied()
    }
}

/// Priority-tier state machine over one kind's backend candidates.
pub struct TierScheduler {
    kind: TaskKind,
    configured: Arc<[BackendCandidate]>,
    registry: Arc<CapacityRegistry>,
    state: Mutex<TierState>,
    poll_interval: Duration,
    strict_tiers: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TierScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierScheduler")
            .field("kind", &self.kind)
            .field("configured", &self.configured.len())
            .field("strict_tiers", &self.strict_tiers)
            .finish_non_exhaustive()
    }
}

impl TierScheduler {
    /// Create a root scheduler. `configured` is every validated candidate for
    /// `kind`; those missing from `registry` are ignored when loading tiers.
    pub fn new(
        kind: TaskKind,
        configured: Vec<BackendCandidate>,
        registry: Arc<CapacityRegistry>,
    ) -> Self {
        Self {
            kind,
            configured: configured.into(),
            registry,
            state: Mutex::new(TierState {
                ordered_priorities: None,
                cursor: None,
                current: Vec::new(),
                terminal: false,
                rng: StdRng::from_os_rng(),
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
            strict_tiers: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Backoff used while every candidate is saturated.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Disable borrowing spare capacity from lower tiers while the current
    /// tier is saturated; callers wait for the current tier instead.
    pub fn with_strict_tiers(mut self, strict: bool) -> Self {
        self.strict_tiers = strict;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deterministic weighted draws, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    /// Establish the ordered priority list on first use.
    ///
    /// Returns `false` (and turns terminal) when no candidate has been
    /// configured for this kind at all.
    pub async fn ensure_tier_loaded(&self) -> bool {
        let mut state = self.state.lock().await;
        self.ensure_loaded_locked(&mut state)
    }

    fn ensure_loaded_locked(&self, state: &mut TierState) -> bool {
        if state.terminal {
            return false;
        }
        if state.ordered_priorities.is_some() {
            return true;
        }

        let priorities = ordered_priorities(&self.configured);
        if priorities.is_empty() {
            let err = AppError::ConfigurationExhausted {
                kind: self.kind.to_string(),
            };
            warn!(kind = %self.kind, "{err}");
            state.terminal = true;
            return false;
        }
        debug!(kind = %self.kind, priorities = ?priorities, "Loaded priority tiers");
        state.ordered_priorities = Some(priorities);
        true
    }

    /// Move the cursor to the next tier that has usable backends.
    ///
    /// Tiers whose backends are all unknown to the registry or have zero
    /// capacity are skipped. Returns `false` and turns
    /// terminal once the last tier is passed.
    pub async fn advance_and_load_tier(&self) -> bool {
        let mut state = self.state.lock().await;
        self.advance_locked(&mut state)
    }

    fn advance_locked(&self, state: &mut TierState) -> bool {
        if !self.ensure_loaded_locked(state) {
            return false;
        }
        let priorities = state.ordered_priorities.clone().unwrap_or_default();

        loop {
            let next = state.cursor.map_or(0, |c| c + 1);
            state.cursor = Some(next);

            let Some(&priority) = priorities.get(next) else {
                state.current.clear();
                state.terminal = true;
                info!(kind = %self.kind, "All priority tiers exhausted");
                return false;
            };

            let tier = self.usable_in_tier(priority);
            if tier.is_empty() {
                debug!(kind = %self.kind, priority, "Skipping tier without usable backends");
                continue;
            }

            info!(
                kind = %self.kind,
                priority,
                backends = ?tier.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Entered priority tier"
            );
            state.current = tier;
            return true;
        }
    }

    fn usable_in_tier(&self, priority: i64) -> Vec<BackendCandidate> {
        self.configured
            .iter()
            .filter(|c| c.priority == priority)
            .filter(|c| self.registry.max(&c.name).is_some_and(|max| max > 0))
            .cloned()
            .collect()
    }

    /// Reserve a backend for one generation attempt (root scheduler).
    ///
    /// Draws by weight among current-tier backends with a free slot, leaving
    /// out the names in `excluded` (backends that already failed for this
    /// task). When the whole tier is saturated, spare capacity in the best
    /// lower tier is borrowed (unless strict tiers are enabled); if there is
    /// none the call backs off and retries. A current tier made only of
    /// excluded backends can never serve the caller, so lower tiers are used
    /// even in strict mode, and the call returns `Exhausted` once no tier has
    /// a backend left for it. Saturation never advances the cursor; only
    /// retirement does.
    pub async fn acquire_backend(&self, excluded: &HashSet<String>) -> Acquisition {
        loop {
            if self.cancel.is_cancelled() {
                return Acquisition::Cancelled;
            }

            {
                let mut state = self.state.lock().await;
                if state.terminal {
                    return Acquisition::Exhausted;
                }
                if state.current.is_empty() && !self.advance_locked(&mut state) {
                    return Acquisition::Exhausted;
                }

                let eligible: Vec<BackendCandidate> = state
                    .current
                    .iter()
                    .filter(|c| !excluded.contains(&c.name))
                    .cloned()
                    .collect();
                let mut available = self.with_capacity(&eligible).await;
                if available.is_empty() && (eligible.is_empty() || !self.strict_tiers) {
                    let (spare, lower_eligible) =
                        self.spare_in_lower_tiers(&state, excluded).await;
                    if eligible.is_empty() && !lower_eligible {
                        debug!(kind = %self.kind, excluded = ?excluded, "No backend left for task");
                        return Acquisition::Exhausted;
                    }
                    available = spare;
                }

                if let Some(chosen) = pick_weighted(&available, &mut state.rng).cloned() {
                    if let Some(slot) = self.registry.try_reserve(&chosen.name).await {
                        debug!(
                            kind = %self.kind,
                            backend = %chosen.name,
                            priority = chosen.priority,
                            "Acquired backend"
                        );
                        return Acquisition::Acquired(BackendLease {
                            candidate: chosen,
                            slot,
                        });
                    }
                    // Lost the slot to a split task between check and reserve.
                    continue;
                }
            }

            debug!(kind = %self.kind, "All candidate backends saturated; backing off");
            tokio::select! {
                _ = self.cancel.cancelled() => return Acquisition::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn with_capacity(&self, candidates: &[BackendCandidate]) -> Vec<BackendCandidate> {
        let mut available = Vec::new();
        for candidate in candidates {
            if self.registry.has_capacity(&candidate.name).await {
                available.push(candidate.clone());
            }
        }
        available
    }

    /// Free backends from the best lower tier that has any, and whether any
    /// lower tier holds a non-excluded backend at all.
    async fn spare_in_lower_tiers(
        &self,
        state: &TierState,
        excluded: &HashSet<String>,
    ) -> (Vec<BackendCandidate>, bool) {
        let (Some(cursor), Some(priorities)) = (state.cursor, state.ordered_priorities.as_ref())
        else {
            return (Vec::new(), false);
        };
        let mut any_eligible = false;
        for &priority in priorities.iter().skip(cursor + 1) {
            let tier: Vec<BackendCandidate> = self
                .usable_in_tier(priority)
                .into_iter()
                .filter(|c| !excluded.contains(&c.name))
                .collect();
            any_eligible |= !tier.is_empty();
            let available = self.with_capacity(&tier).await;
            if !available.is_empty() {
                return (available, true);
            }
        }
        (Vec::new(), any_eligible)
    }

    /// Hand a lease back. A permanent failure on a current-tier backend
    /// retires it from the tier before the slot is freed; the cursor moves on
    /// lazily on the next acquisition that finds the tier empty. A failure on
    /// a borrowed lower-tier backend changes nothing here.
    pub async fn release_backend(&self, lease: BackendLease, outcome: ReleaseOutcome) {
        let BackendLease { candidate, slot } = lease;
        if outcome == ReleaseOutcome::PermanentFailure {
            self.retire_in_tier(&candidate.name, candidate.priority).await;
        }
        slot.release().await;
    }

    /// Retire `backend` from the current tier.
    pub async fn retire(&self, backend: &str) {
        let priority = {
            let state = self.state.lock().await;
            state.current_priority()
        };
        if let Some(priority) = priority {
            self.retire_in_tier(backend, priority).await;
        }
    }

    async fn retire_in_tier(&self, backend: &str, priority: i64) {
        let mut state = self.state.lock().await;
        if state.current_priority() != Some(priority) {
            debug!(
                kind = %self.kind,
                backend,
                priority,
                "Failure outside current tier; not retiring"
            );
            return;
        }
        let before = state.current.len();
        state.current.retain(|c| c.name != backend);
        if state.current.len() != before {
            info!(
                kind = %self.kind,
                backend,
                priority,
                remaining = state.current.len(),
                "Retired backend from tier"
            );
        }
    }

    /// Priority under the cursor; `None` before the first load or once terminal.
    pub async fn current_tier_priority(&self) -> Option<i64> {
        self.state.lock().await.current_priority()
    }

    pub async fn current_candidates(&self) -> Vec<BackendCandidate> {
        self.state.lock().await.current.clone()
    }

    pub async fn is_terminal(&self) -> bool {
        self.state.lock().await.terminal
    }

    /// Copy this scheduler's tier position into an independent scheduler that
    /// shares the same capacity registry.
    pub async fn derive(&self) -> TierScheduler {
        let mut state = self.state.lock().await;
        let seed: u64 = state.rng.random();
        TierScheduler {
            kind: self.kind,
            configured: Arc::clone(&self.configured),
            registry: Arc::clone(&self.registry),
            state: Mutex::new(TierState {
                ordered_priorities: state.ordered_priorities.clone(),
                cursor: state.cursor,
                current: state.current.clone(),
                terminal: state.terminal,
                rng: StdRng::seed_from_u64(seed),
            }),
            poll_interval: self.poll_interval,
            strict_tiers: self.strict_tiers,
            cancel: self.cancel.clone(),
        }
    }

    /// Weighted draw from this scheduler's own current tier, advancing tiers
    /// as needed. Does not look at capacity. Used by split workers.
    pub async fn select_candidate(&self) -> Option<BackendCandidate> {
        let mut state = self.state.lock().await;
        if state.terminal {
            return None;
        }
        if state.current.is_empty() && !self.advance_locked(&mut state) {
            return None;
        }
        let TierState { current, rng, .. } = &mut *state;
        pick_weighted(current.as_slice(), rng).cloned()
    }

    /// Decide whether a split task at `split_priority` may use `backend`,
    /// reserving a slot if so (root scheduler).
    ///
    /// Allowed when the backend is in the root's current tier, or when the
    /// root has a current tier and the split task's tier is strictly worse.
    /// Otherwise denied without touching capacity.
    pub async fn can_split_use(&self, backend: &str, split_priority: Option<i64>) -> SplitPermit {
        let state = self.state.lock().await;
        let in_root_tier = state.current.iter().any(|c| c.name == backend);
        let dominated = matches!(
            (state.current_priority(), split_priority),
            (Some(root), Some(split)) if split < root
        );

        if !in_root_tier && !dominated {
            debug!(
                backend,
                root_priority = ?state.current_priority(),
                split_priority = ?split_priority,
                "Split request denied by priority"
            );
            return SplitPermit::Denied(DenyReason::Priority);
        }

        match self.registry.try_reserve(backend).await {
            Some(slot) => SplitPermit::Granted(slot),
            None => SplitPermit::Denied(DenyReason::Saturated),
        }
    }
}

#[cfg(test)]
#[path = "tier_tests.rs"]
mod tests;

//! Weighted random choice among backend candidates.

use fable_core::BackendCandidate;
use rand::Rng;

/// Pick one candidate with probability proportional to its weight.
///
/// Zero-weight candidates are only chosen when every weight is zero, in
/// which case the draw is uniform. Returns `None` for an empty slice.
pub fn pick_weighted<'a, R: Rng + ?Sized>(
    candidates: &'a [BackendCandidate],
    rng: &mut R,
) -> Option<&'a BackendCandidate> {
    if candidates.is_empty() {
        return None;
    }

    let total: f64 = candidates.iter().map(|c| c.weight.max(0.0)).sum();
    if !total.is_finite() || total <= 0.0 {
        return candidates.get(rng.random_range(0..candidates.len()));
    }

    let mut point = rng.random_range(0.0..total);
    for candidate in candidates {
        let weight = candidate.weight.max(0.0);
        if point < weight {
            return Some(candidate);
        }
        point -= weight;
    }

    // Floating point leftovers land on the last positive-weight entry.
    candidates.iter().rev().find(|c| c.weight > 0.0)
}

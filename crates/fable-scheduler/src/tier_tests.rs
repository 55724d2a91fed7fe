use super::*;

fn registry(limits: &[(&str, u32)]) -> Arc<CapacityRegistry> {
    Arc::new(CapacityRegistry::new(
        limits.iter().map(|(name, max)| (name.to_string(), *max)),
    ))
}

fn scheduler(candidates: Vec<BackendCandidate>, limits: &[(&str, u32)]) -> TierScheduler {
    TierScheduler::new(TaskKind::Image, candidates, registry(limits))
        .with_poll_interval(Duration::from_millis(5))
        .with_seed(7)
}

fn lease_of(acq: Acquisition) -> BackendLease {
    match acq {
        Acquisition::Acquired(lease) => lease,
        other => panic!("expected a lease, got {other:?}"),
    }
}

#[test]
fn test_ordered_priorities_distinct_descending() {
    let candidates = vec![
        BackendCandidate::new("a", 1.0, 1),
        BackendCandidate::new("b", 1.0, 3),
        BackendCandidate::new("c", 1.0, 1),
        BackendCandidate::new("d", 1.0, -2),
    ];
    assert_eq!(ordered_priorities(&candidates), vec![3, 1, -2]);
    assert!(ordered_priorities(&[]).is_empty());
}

#[tokio::test]
async fn test_no_candidates_is_terminal() {
    let s = scheduler(vec![], &[("a", 1)]);
    assert!(!s.ensure_tier_loaded().await);
    assert!(s.is_terminal().await);
    assert!(matches!(s.acquire_backend(&HashSet::new()).await, Acquisition::Exhausted));
    assert_eq!(s.current_tier_priority().await, None);
}

#[tokio::test]
async fn test_unregistered_and_zero_capacity_backends_are_skipped() {
    let s = scheduler(
        vec![
            BackendCandidate::new("ghost", 1.0, 9),
            BackendCandidate::new("closed", 1.0, 5),
            BackendCandidate::new("open", 1.0, 1),
        ],
        &[("closed", 0), ("open", 1)],
    );
    let lease = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(lease.backend(), "open");
    assert_eq!(s.current_tier_priority().await, Some(1));
    s.release_backend(lease, ReleaseOutcome::Success).await;
    assert_eq!(s.registry().current("open").await, 0);
}

#[tokio::test]
async fn test_only_unusable_backends_exhausts_on_first_acquire() {
    let s = scheduler(vec![BackendCandidate::new("ghost", 1.0, 1)], &[("a", 2)]);
    assert!(matches!(s.acquire_backend(&HashSet::new()).await, Acquisition::Exhausted));
    assert!(s.is_terminal().await);
}

#[tokio::test]
async fn test_tiers_walk_down_on_permanent_failure() {
    let s = scheduler(
        vec![
            BackendCandidate::new("p3", 1.0, 3),
            BackendCandidate::new("p2", 1.0, 2),
            BackendCandidate::new("p1", 1.0, 1),
        ],
        &[("p3", 1), ("p2", 1), ("p1", 1)],
    );

    let mut seen = Vec::new();
    for expected in [3, 2, 1] {
        let lease = lease_of(s.acquire_backend(&HashSet::new()).await);
        assert_eq!(lease.candidate().priority, expected);
        assert_eq!(s.current_tier_priority().await, Some(expected));
        seen.push(expected);
        s.release_backend(lease, ReleaseOutcome::PermanentFailure).await;
    }
    assert_eq!(seen, vec![3, 2, 1]);
    assert!(matches!(s.acquire_backend(&HashSet::new()).await, Acquisition::Exhausted));
    assert!(s.is_terminal().await);
    // Terminal is sticky.
    assert!(!s.advance_and_load_tier().await);
}

#[tokio::test]
async fn test_retired_backend_never_returns_within_tier() {
    let s = scheduler(
        vec![
            BackendCandidate::new("x", 1.0, 1),
            BackendCandidate::new("y", 1.0, 1),
        ],
        &[("x", 4), ("y", 4)],
    );
    assert!(s.advance_and_load_tier().await);
    s.retire("x").await;

    for _ in 0..20 {
        let lease = lease_of(s.acquire_backend(&HashSet::new()).await);
        assert_eq!(lease.backend(), "y");
        s.release_backend(lease, ReleaseOutcome::Success).await;
    }
    let names: Vec<String> = s
        .current_candidates()
        .await
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, vec!["y".to_string()]);
}

#[tokio::test]
async fn test_saturated_tier_borrows_from_lower_tier() {
    let s = scheduler(
        vec![
            BackendCandidate::new("a", 1.0, 1),
            BackendCandidate::new("b", 1.0, 0),
        ],
        &[("a", 1), ("b", 1)],
    );
    let first = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(first.backend(), "a");
    let second = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(second.backend(), "b");
    // Borrowing does not move the cursor.
    assert_eq!(s.current_tier_priority().await, Some(1));

    s.release_backend(second, ReleaseOutcome::Success).await;
    s.release_backend(first, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn test_strict_tiers_wait_for_current_tier() {
    let s = Arc::new(
        scheduler(
            vec![
                BackendCandidate::new("a", 1.0, 1),
                BackendCandidate::new("b", 1.0, 0),
            ],
            &[("a", 1), ("b", 1)],
        )
        .with_strict_tiers(true),
    );
    let first = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(first.backend(), "a");

    let waiter = {
        let s = Arc::clone(&s);
        tokio::spawn(async move { s.acquire_backend(&HashSet::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    s.release_backend(first, ReleaseOutcome::Success).await;
    let second = lease_of(waiter.await.unwrap());
    assert_eq!(second.backend(), "a");
    s.release_backend(second, ReleaseOutcome::Success).await;
    assert_eq!(s.registry().current("b").await, 0);
}

#[tokio::test]
async fn test_acquire_observes_cancellation() {
    let cancel = CancellationToken::new();
    let s = scheduler(vec![BackendCandidate::new("a", 1.0, 1)], &[("a", 1)])
        .with_cancellation(cancel.clone())
        .with_strict_tiers(true);
    let held = lease_of(s.acquire_backend(&HashSet::new()).await);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });
    assert!(matches!(s.acquire_backend(&HashSet::new()).await, Acquisition::Cancelled));
    canceller.await.unwrap();

    s.release_backend(held, ReleaseOutcome::Success).await;
    assert_eq!(s.registry().current("a").await, 0);
}

#[tokio::test]
async fn test_failure_on_borrowed_backend_leaves_tiers_alone() {
    let s = scheduler(
        vec![
            BackendCandidate::new("a", 1.0, 1),
            BackendCandidate::new("b", 1.0, 0),
        ],
        &[("a", 1), ("b", 1)],
    );
    let a = lease_of(s.acquire_backend(&HashSet::new()).await);
    let b = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(b.backend(), "b");
    s.release_backend(b, ReleaseOutcome::PermanentFailure).await;

    assert_eq!(s.current_tier_priority().await, Some(1));
    assert_eq!(s.current_candidates().await.len(), 1);

    // Tier 0 is loaded in full once `a` is retired: `b` only failed for one task.
    s.release_backend(a, ReleaseOutcome::PermanentFailure).await;
    let next = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(next.backend(), "b");
    assert_eq!(s.current_tier_priority().await, Some(0));
    s.release_backend(next, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn test_excluded_backends_exhaust_only_that_caller() {
    let s = scheduler(
        vec![
            BackendCandidate::new("a", 1.0, 1),
            BackendCandidate::new("b", 1.0, 0),
        ],
        &[("a", 2), ("b", 2)],
    );
    let failed_on = HashSet::from(["a".to_string()]);

    // The current tier is useless to this caller, so it borrows from below.
    let lease = lease_of(s.acquire_backend(&failed_on).await);
    assert_eq!(lease.backend(), "b");
    assert_eq!(s.current_tier_priority().await, Some(1));
    s.release_backend(lease, ReleaseOutcome::Success).await;

    let both = HashSet::from(["a".to_string(), "b".to_string()]);
    assert!(matches!(s.acquire_backend(&both).await, Acquisition::Exhausted));
    assert!(!s.is_terminal().await);

    let lease = lease_of(s.acquire_backend(&HashSet::new()).await);
    assert_eq!(lease.backend(), "a");
    s.release_backend(lease, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn test_strict_tiers_still_leave_an_excluded_tier() {
    let s = scheduler(
        vec![
            BackendCandidate::new("a", 1.0, 1),
            BackendCandidate::new("b", 1.0, 0),
        ],
        &[("a", 1), ("b", 1)],
    )
    .with_strict_tiers(true);
    let lease = lease_of(s.acquire_backend(&HashSet::from(["a".to_string()])).await);
    assert_eq!(lease.backend(), "b");
    s.release_backend(lease, ReleaseOutcome::Success).await;
}

#[tokio::test]
async fn test_derive_copies_position_but_not_future_changes() {
    let s = scheduler(
        vec![
            BackendCandidate::new("hi", 1.0, 5),
            BackendCandidate::new("lo", 1.0, 1),
        ],
        &[("hi", 2), ("lo", 2)],
    );
    assert!(s.advance_and_load_tier().await);

    let derived = s.derive().await;
    assert_eq!(derived.current_tier_priority().await, Some(5));
    assert!(Arc::ptr_eq(derived.registry(), s.registry()));

    derived.retire("hi").await;
    assert_eq!(s.current_tier_priority().await, Some(5));
    assert_eq!(s.current_candidates().await.len(), 1);

    let next = derived.select_candidate().await.unwrap();
    assert_eq!(next.name, "lo");
    assert_eq!(derived.current_tier_priority().await, Some(1));
}

#[tokio::test]
async fn test_split_allowed_in_root_tier() {
    let root = scheduler(vec![BackendCandidate::new("x", 1.0, 5)], &[("x", 1)]);
    assert!(root.advance_and_load_tier().await);

    match root.can_split_use("x", Some(5)).await {
        SplitPermit::Granted(slot) => {
            assert_eq!(root.registry().current("x").await, 1);
            // Full now, so a second request is a saturation denial.
            assert!(matches!(
                root.can_split_use("x", Some(5)).await,
                SplitPermit::Denied(DenyReason::Saturated)
            ));
            slot.release().await;
        }
        other => panic!("expected grant, got {other:?}"),
    }
    assert_eq!(root.registry().current("x").await, 0);
}

#[tokio::test]
async fn test_split_dominance_by_priority() {
    let root = scheduler(
        vec![
            BackendCandidate::new("x", 1.0, 5),
            BackendCandidate::new("y", 1.0, 3),
            BackendCandidate::new("y", 1.0, 7),
        ],
        &[("x", 1), ("y", 2)],
    );
    // Start the root at the tier holding `x`.
    assert!(root.advance_and_load_tier().await);
    root.retire("y").await;
    assert!(root.advance_and_load_tier().await);
    assert_eq!(root.current_tier_priority().await, Some(5));

    // Split task on a worse tier may use a backend outside the root tier.
    match root.can_split_use("y", Some(3)).await {
        SplitPermit::Granted(slot) => slot.release().await,
        other => panic!("expected grant, got {other:?}"),
    }

    // A split task on a better tier must not compete with the root.
    assert!(matches!(
        root.can_split_use("y", Some(7)).await,
        SplitPermit::Denied(DenyReason::Priority)
    ));
    // Equal priority is not dominated either.
    assert!(matches!(
        root.can_split_use("y", Some(5)).await,
        SplitPermit::Denied(DenyReason::Priority)
    ));
    assert_eq!(root.registry().current("y").await, 0);
}

#[tokio::test]
async fn test_split_denied_when_root_terminal() {
    let root = scheduler(vec![BackendCandidate::new("x", 1.0, 1)], &[("x", 1)]);
    let lease = lease_of(root.acquire_backend(&HashSet::new()).await);
    root.release_backend(lease, ReleaseOutcome::PermanentFailure).await;
    assert!(matches!(root.acquire_backend(&HashSet::new()).await, Acquisition::Exhausted));

    assert!(matches!(
        root.can_split_use("x", Some(0)).await,
        SplitPermit::Denied(DenyReason::Priority)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_respects_capacity() {
    let s = Arc::new(scheduler(
        vec![
            BackendCandidate::new("a", 3.0, 1),
            BackendCandidate::new("b", 1.0, 1),
        ],
        &[("a", 2), ("b", 1)],
    ));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let s = Arc::clone(&s);
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                let lease = lease_of(s.acquire_backend(&HashSet::new()).await);
                let max = s.registry().max(lease.backend()).unwrap();
                assert!(s.registry().current(lease.backend()).await <= max);
                tokio::task::yield_now().await;
                s.release_backend(lease, ReleaseOutcome::Success).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(s.registry().total_in_flight().await, 0);
}

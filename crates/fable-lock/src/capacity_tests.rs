use super::*;
use proptest::prelude::*;

fn registry(limits: &[(&str, u32)]) -> Arc<CapacityRegistry> {
    Arc::new(CapacityRegistry::new(limits.iter().map(|(n, m)| (*n, *m))))
}

#[tokio::test]
async fn test_reserve_until_full() {
    let reg = registry(&[("flux", 2)]);

    let a = reg.try_reserve("flux").await;
    let b = reg.try_reserve("flux").await;
    assert!(a.is_some());
    assert!(b.is_some());
    assert_eq!(reg.current("flux").await, 2);

    let err = reg.reserve("flux").await.unwrap_err();
    assert!(matches!(err, AppError::GlobalSaturation { ref backend } if backend == "flux"));
    assert!(!reg.has_capacity("flux").await);

    a.unwrap().release().await;
    assert_eq!(reg.current("flux").await, 1);
    assert!(reg.has_capacity("flux").await);
}

#[tokio::test]
async fn test_unknown_backend_is_never_reservable() {
    let reg = registry(&[("flux", 1)]);
    assert!(!reg.contains("suno"));
    assert_eq!(reg.max("suno"), None);
    assert!(reg.try_reserve("suno").await.is_none());
    assert!(!reg.has_capacity("suno").await);
}

#[tokio::test]
async fn test_zero_capacity_backend() {
    let reg = registry(&[("disabled", 0)]);
    assert!(reg.contains("disabled"));
    assert!(reg.try_reserve("disabled").await.is_none());
    assert_eq!(reg.current("disabled").await, 0);
}

#[tokio::test]
async fn test_release_without_reserve_does_not_underflow() {
    let reg = registry(&[("flux", 1)]);
    reg.release("flux").await;
    reg.release("flux").await;
    assert_eq!(reg.current("flux").await, 0);

    // Counter still works normally afterwards.
    let slot = reg.try_reserve("flux").await.unwrap();
    assert_eq!(reg.current("flux").await, 1);
    slot.release().await;
    assert_eq!(reg.current("flux").await, 0);
}

#[tokio::test]
async fn test_release_unknown_backend_is_ignored() {
    let reg = registry(&[("flux", 1)]);
    reg.release("nope").await;
    assert_eq!(reg.total_in_flight().await, 0);
}

#[tokio::test]
async fn test_dropped_slot_is_released() {
    let reg = registry(&[("flux", 1)]);
    {
        let _slot = reg.try_reserve("flux").await.unwrap();
        assert_eq!(reg.current("flux").await, 1);
    }
    assert_eq!(reg.current("flux").await, 0);
}

#[tokio::test]
async fn test_released_slot_is_not_released_again_on_drop() {
    let reg = registry(&[("flux", 2)]);
    let held = reg.try_reserve("flux").await.unwrap();
    let other = reg.try_reserve("flux").await.unwrap();
    other.release().await;
    // `other` was consumed by release; only `held` remains.
    assert_eq!(reg.current("flux").await, 1);
    drop(held);
    assert_eq!(reg.current("flux").await, 0);
}

#[tokio::test]
async fn test_snapshot_sorted_by_name() {
    let reg = registry(&[("suno", 1), ("flux", 3)]);
    let _slot = reg.try_reserve("flux").await.unwrap();
    let snap = reg.snapshot().await;
    assert_eq!(
        snap,
        vec![
            CapacityStatus {
                backend: "flux".into(),
                max: 3,
                current: 1,
            },
            CapacityStatus {
                backend: "suno".into(),
                max: 1,
                current: 0,
            },
        ]
    );
    assert_eq!(snap[0].free(), 2);
}

#[tokio::test]
async fn test_dropped_future_holding_slot_releases() {
    let reg = registry(&[("flux", 1)]);
    let reg_clone = Arc::clone(&reg);
    let handle = tokio::spawn(async move {
        let _slot = reg_clone.try_reserve("flux").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(reg.current("flux").await, 1);

    handle.abort();
    let _ = handle.await;
    assert_eq!(reg.current("flux").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reserve_release_respects_limits() {
    let reg = registry(&[("a", 1), ("b", 2), ("c", 3)]);
    let names = ["a", "b", "c"];
    let mut handles = Vec::new();

    for worker in 0..32usize {
        let reg = Arc::clone(&reg);
        handles.push(tokio::spawn(async move {
            for i in 0..200usize {
                let name = names[(worker + i) % names.len()];
                if let Some(slot) = reg.try_reserve(name).await {
                    let current = reg.current(name).await;
                    let max = reg.max(name).unwrap();
                    assert!(current <= max, "{name}: {current} > {max}");
                    tokio::task::yield_now().await;
                    slot.release().await;
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    for status in reg.snapshot().await {
        assert_eq!(status.current, 0, "{} leaked slots", status.backend);
    }
}

#[test]
fn test_format_capacity_diagnostic() {
    let all = vec![
        CapacityStatus {
            backend: "flux".into(),
            max: 2,
            current: 2,
        },
        CapacityStatus {
            backend: "sdxl".into(),
            max: 3,
            current: 1,
        },
    ];
    let msg = format_capacity_diagnostic("flux", &all);
    assert!(msg.contains("flux: 2/2 slots in flight"));
    assert!(msg.contains("usage: flux 2/2 | sdxl 1/3"));
    assert!(msg.contains("free elsewhere: sdxl (2 free)"));
}

#[test]
fn test_format_capacity_diagnostic_unknown_backend() {
    let msg = format_capacity_diagnostic("ghost", &[]);
    assert!(msg.contains("ghost: not configured"));
    assert!(!msg.contains("free elsewhere"));
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(usize),
    ReleaseHeld(usize),
    ReleaseRaw(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..3).prop_map(Op::Reserve),
        (0usize..8).prop_map(Op::ReleaseHeld),
        (0usize..3).prop_map(Op::ReleaseRaw),
    ]
}

proptest! {
    #[test]
    fn prop_counters_stay_within_bounds(
        maxes in proptest::collection::vec(0u32..4, 3),
        ops in proptest::collection::vec(op_strategy(), 1..80),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let names = ["a", "b", "c"];
            let reg = Arc::new(CapacityRegistry::new(
                names.iter().zip(maxes.iter()).map(|(n, m)| (*n, *m)),
            ));
            let mut held: Vec<CapacitySlot> = Vec::new();

            for op in &ops {
                match op {
                    Op::Reserve(i) => {
                        if let Some(slot) = reg.try_reserve(names[*i]).await {
                            held.push(slot);
                        }
                    }
                    Op::ReleaseHeld(i) => {
                        if !held.is_empty() {
                            let slot = held.remove(i % held.len());
                            slot.release().await;
                        }
                    }
                    Op::ReleaseRaw(i) => reg.release(names[*i]).await,
                }

                for status in reg.snapshot().await {
                    assert!(
                        status.current <= status.max,
                        "{} over limit: {}/{}",
                        status.backend,
                        status.current,
                        status.max
                    );
                }
            }

            for slot in held.drain(..) {
                slot.release().await;
            }
            assert_eq!(reg.total_in_flight().await, 0);
        });
    }
}

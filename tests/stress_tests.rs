//! Concurrency stress tests: disjoint-partition churn, oracle parity,
//! readers racing writers, and timeout behavior under a held latch.
//!
//! Thread counts and iteration budgets are sized to finish quickly in CI
//! while still driving plenty of splits, merges, and latch contention
//! (small fan-outs keep the tree deep).

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use latchtree::{LatchTree, TimedOut, Timeout};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WAIT: Timeout = Timeout::Infinite;

// ============================================================================
//  Disjoint partitions
// ============================================================================

/// Each thread owns a disjoint key partition and churns add/remove inside
/// it, verifying membership after every step. No thread ever observes
/// another partition's keys changing under it, the invariants hold at the
/// end, and the global count matches the sum of per-thread live sets.
#[test]
fn partitioned_churn() {
    common::init_tracing();

    const THREADS: usize = 8;
    const KEYS_PER_THREAD: u32 = 32;
    const OPS_PER_THREAD: usize = 3_000;

    let tree: Arc<LatchTree<u32, u32>> = Arc::new(LatchTree::with_order(4));
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));
    let live_total: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS as u32)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            let live_total = Arc::clone(&live_total);
            thread::spawn(move || {
                let mut rng: StdRng = StdRng::seed_from_u64(0xC0FFEE + u64::from(t));
                let base: u32 = t * KEYS_PER_THREAD;
                let mut live: Vec<bool> = vec![false; KEYS_PER_THREAD as usize];
                barrier.wait();

                for _ in 0..OPS_PER_THREAD {
                    let offset: u32 = rng.gen_range(0..KEYS_PER_THREAD);
                    let key: u32 = base + offset;
                    if live[offset as usize] {
                        assert_eq!(tree.remove(&key, WAIT).unwrap(), Some(key * 7));
                        assert!(!tree.contains_key(&key, WAIT).unwrap());
                        live[offset as usize] = false;
                    } else {
                        assert!(tree.insert_if_absent(key, key * 7, WAIT).unwrap());
                        assert!(tree.contains_key(&key, WAIT).unwrap());
                        live[offset as usize] = true;
                    }
                }

                let survivors: usize = live.iter().filter(|&&alive| alive).count();
                live_total.fetch_add(survivors, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tree.len(), live_total.load(Ordering::Relaxed));
    tree.verify_invariants();
}

// ============================================================================
//  Oracle parity
// ============================================================================

/// Threads mutate disjoint partitions while mirroring every committed op
/// into a local `BTreeMap`; afterwards the tree must equal the merged
/// mirrors element-wise, forward and in reverse.
#[test]
fn parity_with_oracle() {
    common::init_tracing();

    const THREADS: usize = 6;
    const KEYS_PER_THREAD: u64 = 64;
    const OPS_PER_THREAD: usize = 4_000;

    let tree: Arc<LatchTree<u64, u64>> = Arc::new(LatchTree::with_order(5));
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng: StdRng = StdRng::seed_from_u64(0xBEEF + t);
                let base: u64 = t * KEYS_PER_THREAD;
                let mut mirror: BTreeMap<u64, u64> = BTreeMap::new();
                barrier.wait();

                for round in 0..OPS_PER_THREAD {
                    let key: u64 = base + rng.gen_range(0..KEYS_PER_THREAD);
                    let value: u64 = round as u64;
                    match rng.gen_range(0..4u8) {
                        0 => {
                            assert_eq!(
                                tree.insert(key, value, WAIT).unwrap(),
                                mirror.insert(key, value)
                            );
                        }

                        1 => {
                            let inserted: bool =
                                tree.insert_if_absent(key, value, WAIT).unwrap();
                            assert_eq!(inserted, !mirror.contains_key(&key));
                            if inserted {
                                mirror.insert(key, value);
                            }
                        }

                        2 => {
                            assert_eq!(tree.remove(&key, WAIT).unwrap(), mirror.remove(&key));
                        }

                        _ => {
                            assert_eq!(
                                tree.get(&key, WAIT).unwrap(),
                                mirror.get(&key).copied()
                            );
                        }
                    }
                }

                mirror
            })
        })
        .collect();

    let mut merged: BTreeMap<u64, u64> = BTreeMap::new();
    for handle in handles {
        merged.append(&mut handle.join().unwrap());
    }

    let forward: Vec<(u64, u64)> = tree.iter().collect();
    let expected: Vec<(u64, u64)> = merged.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(forward, expected);

    let backward: Vec<(u64, u64)> = tree.iter().rev().collect();
    let mut expected_rev: Vec<(u64, u64)> = expected;
    expected_rev.reverse();
    assert_eq!(backward, expected_rev);

    assert_eq!(tree.len(), merged.len());
    tree.verify_invariants();
}

// ============================================================================
//  Readers racing writers
// ============================================================================

/// Iteration under concurrent mutation stays strictly ascending and only
/// ever yields keys some writer actually owns.
#[test]
fn iteration_races_writers() {
    common::init_tracing();

    const WRITERS: usize = 4;
    const KEYS_PER_WRITER: u32 = 256;

    let tree: Arc<LatchTree<u32, u32>> = Arc::new(LatchTree::with_order(4));
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(WRITERS + 1));

    let writers: Vec<_> = (0..WRITERS as u32)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let base: u32 = t * KEYS_PER_WRITER;
                barrier.wait();
                for offset in 0..KEYS_PER_WRITER {
                    tree.insert(base + offset, t, WAIT).unwrap();
                }
                for offset in (0..KEYS_PER_WRITER).step_by(2) {
                    tree.remove(&(base + offset), WAIT).unwrap();
                }
            })
        })
        .collect();

    barrier.wait();
    let limit: u32 = WRITERS as u32 * KEYS_PER_WRITER;
    for _ in 0..50 {
        let mut previous: Option<u32> = None;
        for (key, _) in tree.iter() {
            if let Some(prev) = previous {
                assert!(key > prev, "iteration yielded {key} after {prev}");
            }
            assert!(key < limit);
            previous = Some(key);
        }
    }

    for handle in writers {
        handle.join().unwrap();
    }
    tree.verify_invariants();
}

/// All threads racing `get_or_insert` on one key observe the same winner.
#[test]
fn get_or_insert_single_winner() {
    const THREADS: usize = 8;

    let tree: Arc<LatchTree<u32, usize>> = Arc::new(LatchTree::with_order(3));
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                tree.get_or_insert(7, t, WAIT).unwrap()
            })
        })
        .collect();

    let observed: Vec<usize> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let winner: usize = tree.get(&7, WAIT).unwrap().unwrap();
    assert!(observed.iter().all(|&seen| seen == winner));
    assert_eq!(tree.len(), 1);
}

// ============================================================================
//  Timeouts under contention
// ============================================================================

/// While one thread parks inside `get_or_insert_with` — holding the leaf's
/// write latch — bounded and non-blocking operations against that leaf time
/// out without side effects, and succeed once the latch drops.
#[test]
fn timeouts_under_a_held_leaf_latch() {
    common::init_tracing();

    let tree: Arc<LatchTree<u32, u32>> = Arc::new(LatchTree::with_order(3));
    tree.insert(1, 10, WAIT).unwrap();
    tree.insert(2, 20, WAIT).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            // Key 3 is absent and the leaf can absorb it, so the closure
            // runs with the leaf write-latched.
            let value: u32 = tree
                .get_or_insert_with(
                    3,
                    move || {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        30
                    },
                    WAIT,
                )
                .unwrap();
            assert_eq!(value, 30);
        })
    };

    entered_rx.recv().unwrap();

    // Every point operation on the latched leaf times out, mutating nothing.
    let brief: Timeout = Timeout::from_millis(1);
    assert!(tree.remove(&1, brief).is_err());
    assert!(tree.insert(4, 40, brief).is_err());
    assert!(tree.insert_if_absent(4, 40, brief).is_err());
    assert!(tree.get_or_insert(4, 40, brief).is_err());
    assert_eq!(tree.get(&1, Timeout::Immediate), Err(TimedOut));
    assert_eq!(tree.contains_key(&2, Timeout::Immediate), Err(TimedOut));

    // A budgeted iterator surfaces the timeout as an error item.
    let mut timed = tree.iter().with_timeout(Timeout::from_millis(1));
    assert_eq!(timed.next(), Some(Err(TimedOut)));
    assert_eq!(timed.next(), None);

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    // The parked insert committed; everything is reachable again.
    assert_eq!(tree.get(&3, WAIT).unwrap(), Some(30));
    assert_eq!(tree.remove(&1, WAIT).unwrap(), Some(10));
    assert_eq!(tree.len(), 2);
    tree.verify_invariants();
}

/// A bounded timeout respects its budget rather than waiting forever.
#[test]
fn bounded_timeout_returns_promptly() {
    let tree: Arc<LatchTree<u32, u32>> = Arc::new(LatchTree::with_order(3));
    tree.insert(1, 1, WAIT).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            tree.get_or_insert_with(
                2,
                move || {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    2
                },
                WAIT,
            )
            .unwrap();
        })
    };

    entered_rx.recv().unwrap();

    let started = std::time::Instant::now();
    assert_eq!(tree.get(&1, Timeout::from_millis(10)), Err(TimedOut));
    let waited: Duration = started.elapsed();
    assert!(
        waited < Duration::from_secs(5),
        "timed out far beyond its budget: {waited:?}"
    );

    release_tx.send(()).unwrap();
    holder.join().unwrap();
}

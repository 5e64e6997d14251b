//! Property-based tests for `LatchTree`.
//!
//! Uses differential testing against `BTreeMap` as an oracle: any sequence
//! of point operations must leave both maps observably identical, and every
//! run must end with the structural invariants intact.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

use std::collections::{BTreeMap, BTreeSet};

use latchtree::{LatchTree, Timeout};
use proptest::prelude::*;

const WAIT: Timeout = Timeout::Infinite;

// ============================================================================
//  Strategies
// ============================================================================

/// Keys from a small domain so inserts collide and nodes split/merge often.
fn key() -> impl Strategy<Value = i32> {
    0..96i32
}

/// Fan-outs from the minimum upward, including odd and even values.
fn order() -> impl Strategy<Value = usize> {
    prop_oneof![Just(3), Just(4), Just(5), Just(8), Just(32)]
}

/// Operations for random differential testing.
#[derive(Debug, Clone)]
enum Op {
    Insert(i32, u32),
    InsertIfAbsent(i32, u32),
    GetOrInsert(i32, u32),
    Remove(i32),
    Get(i32),
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (key(), any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
            2 => (key(), any::<u32>()).prop_map(|(k, v)| Op::InsertIfAbsent(k, v)),
            1 => (key(), any::<u32>()).prop_map(|(k, v)| Op::GetOrInsert(k, v)),
            3 => key().prop_map(Op::Remove),
            2 => key().prop_map(Op::Get),
        ],
        0..=max_ops,
    )
}

// ============================================================================
//  Differential properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Random op sequences leave the tree and a `BTreeMap` observably equal,
    /// forward and backward, with the invariants intact.
    #[test]
    fn differential_vs_btreemap(order in order(), ops in operations(400)) {
        let tree: LatchTree<i32, u32> = LatchTree::with_order(order);
        let mut oracle: BTreeMap<i32, u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    prop_assert_eq!(tree.insert(k, v, WAIT).unwrap(), oracle.insert(k, v));
                }

                Op::InsertIfAbsent(k, v) => {
                    let inserted: bool = tree.insert_if_absent(k, v, WAIT).unwrap();
                    prop_assert_eq!(inserted, !oracle.contains_key(&k));
                    if inserted {
                        oracle.insert(k, v);
                    }
                }

                Op::GetOrInsert(k, v) => {
                    let expected: u32 = *oracle.entry(k).or_insert(v);
                    prop_assert_eq!(tree.get_or_insert(k, v, WAIT).unwrap(), expected);
                }

                Op::Remove(k) => {
                    prop_assert_eq!(tree.remove(&k, WAIT).unwrap(), oracle.remove(&k));
                }

                Op::Get(k) => {
                    prop_assert_eq!(tree.get(&k, WAIT).unwrap(), oracle.get(&k).copied());
                }
            }
        }

        prop_assert_eq!(tree.len(), oracle.len());
        prop_assert_eq!(tree.is_empty(), oracle.is_empty());

        let forward: Vec<(i32, u32)> = tree.iter().collect();
        let expected: Vec<(i32, u32)> = oracle.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(&forward, &expected);

        let backward: Vec<(i32, u32)> = tree.iter().rev().collect();
        let mut expected_rev: Vec<(i32, u32)> = expected;
        expected_rev.reverse();
        prop_assert_eq!(&backward, &expected_rev);

        tree.verify_invariants();
    }

    /// Inserting a set of distinct keys and then deleting them all leaves an
    /// empty depth-1 tree.
    #[test]
    fn insert_all_delete_all(order in order(), keys in prop::collection::btree_set(key(), 0..128)) {
        let tree: LatchTree<i32, i32> = LatchTree::with_order(order);
        for &k in &keys {
            prop_assert!(tree.insert_if_absent(k, -k, WAIT).unwrap());
        }
        prop_assert_eq!(tree.len(), keys.len());
        tree.verify_invariants();

        for &k in &keys {
            prop_assert_eq!(tree.remove(&k, WAIT).unwrap(), Some(-k));
        }
        prop_assert_eq!(tree.len(), 0);
        prop_assert_eq!(tree.depth(), 1);
        tree.verify_invariants();
    }

    /// Keys never inserted are never found.
    #[test]
    fn absent_keys_stay_absent(keys in prop::collection::btree_set(key(), 0..64)) {
        let tree: LatchTree<i32, i32> = LatchTree::with_order(4);
        let present: BTreeSet<i32> = keys.iter().copied().filter(|k| k % 2 == 0).collect();
        for &k in &present {
            tree.insert(k, k, WAIT).unwrap();
        }
        for &k in &keys {
            prop_assert_eq!(tree.contains_key(&k, WAIT).unwrap(), present.contains(&k));
        }
    }

    /// `range` agrees with `BTreeMap::range` over arbitrary bounds, in both
    /// directions.
    #[test]
    fn range_matches_btreemap(
        order in order(),
        keys in prop::collection::btree_set(key(), 0..96),
        a in key(),
        b in key(),
    ) {
        let tree: LatchTree<i32, i32> = LatchTree::with_order(order);
        let mut oracle: BTreeMap<i32, i32> = BTreeMap::new();
        for &k in &keys {
            tree.insert(k, k * 3, WAIT).unwrap();
            oracle.insert(k, k * 3);
        }

        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let got: Vec<(i32, i32)> = tree.range(lo..hi).collect();
        let expected: Vec<(i32, i32)> = oracle.range(lo..hi).map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(&got, &expected);

        let got: Vec<(i32, i32)> = tree.range(lo..=hi).rev().collect();
        let expected: Vec<(i32, i32)> =
            oracle.range(lo..=hi).rev().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(&got, &expected);

        let got: Vec<(i32, i32)> = tree.range(lo..).collect();
        let expected: Vec<(i32, i32)> = oracle.range(lo..).map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(&got, &expected);

        let got: Vec<(i32, i32)> = tree.range(..=hi).collect();
        let expected: Vec<(i32, i32)> = oracle.range(..=hi).map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(&got, &expected);
    }

    /// Updates always win: the last written value is the one read back.
    #[test]
    fn last_update_wins(k in key(), values in prop::collection::vec(any::<u32>(), 1..16)) {
        let tree: LatchTree<i32, u32> = LatchTree::with_order(4);
        for &v in &values {
            tree.insert(k, v, WAIT).unwrap();
        }
        prop_assert_eq!(tree.get(&k, WAIT).unwrap(), values.last().copied());
        prop_assert_eq!(tree.len(), 1);
    }

    /// `first`/`last` agree with full iteration.
    #[test]
    fn edges_agree_with_iteration(keys in prop::collection::btree_set(key(), 0..64)) {
        let tree: LatchTree<i32, i32> = LatchTree::with_order(5);
        for &k in &keys {
            tree.insert(k, k, WAIT).unwrap();
        }
        let all: Vec<(i32, i32)> = tree.iter().collect();
        prop_assert_eq!(tree.first(WAIT).unwrap(), all.first().copied());
        prop_assert_eq!(tree.last(WAIT).unwrap(), all.last().copied());
    }
}

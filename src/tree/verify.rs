//! Structural invariant verification.
//!
//! [`LatchTree::verify_invariants`] walks the whole tree under read latches
//! and panics on the first violation. It is a debugging aid for the test
//! suite, meant to run while the tree is quiescent; it latches correctly
//! under concurrency, but the entry-count comparison is only meaningful with
//! no mutations in flight.

use std::sync::Weak;

use crate::latch::{Deadline, NodeReadLatch, Timeout};
use crate::node::{min_occupancy, Cells, Node, NodeRef};

use super::LatchTree;

impl<K: Ord + Clone, V> LatchTree<K, V> {
    /// Check every structural invariant, panicking with context on the first
    /// violation:
    ///
    /// - every non-root node holds between `⌈order/2⌉` and `order` entries;
    ///   a root branch holds at least two;
    /// - entries are strictly key-ordered within every node and across the
    ///   tree (which also makes keys globally unique);
    /// - every branch's slot 0 has no separator and every other slot does,
    ///   and each child's keys fall inside its separator window;
    /// - all leaves sit at the same depth, which matches the depth counter;
    /// - every child's parent backlink points at the branch holding it, and
    ///   no branch holds the same child twice;
    /// - the entry count across all leaves matches the length counter.
    pub fn verify_invariants(&self) {
        let deadline: Deadline = Deadline::start(Timeout::Infinite);
        let root_guard = self
            .lock_root(false, &deadline)
            .expect("infinite latch acquisition cannot time out");

        let mut walk = Walk {
            order: self.order,
            leaf_depth: None,
            entries: 0,
        };
        walk.node(&*root_guard, &deadline, Frame {
            depth: 1,
            is_root: true,
            parent: None,
            lower: None,
            upper: None,
        });

        assert_eq!(
            walk.leaf_depth.expect("tree has at least one leaf"),
            self.depth(),
            "depth counter disagrees with the leaf level"
        );
        assert_eq!(
            walk.entries,
            self.len(),
            "length counter disagrees with the leaf entry total"
        );
    }
}

/// Per-node context for the walk.
struct Frame<'a, K, V> {
    depth: usize,
    is_root: bool,
    parent: Option<&'a NodeRef<K, V>>,
    /// Inclusive lower bound on every key under this node.
    lower: Option<&'a K>,
    /// Exclusive upper bound on every key under this node.
    upper: Option<&'a K>,
}

/// Accumulated state for the walk.
struct Walk {
    order: usize,
    leaf_depth: Option<usize>,
    entries: usize,
}

impl Walk {
    fn node<K: Ord + Clone, V>(
        &mut self,
        node: &NodeRef<K, V>,
        deadline: &Deadline,
        frame: Frame<'_, K, V>,
    ) {
        let latch: NodeReadLatch<K, V> =
            NodeReadLatch::acquire(node, deadline).expect("infinite latch acquisition");
        let cells: &Cells<K, V> = latch.cells();

        // Kind flag agrees with the storage variant.
        assert_eq!(
            node.is_leaf(),
            matches!(cells, Cells::Leaf(_)),
            "node kind flag disagrees with its storage (depth {})",
            frame.depth
        );

        // Parent backlink identity.
        let backlink: Weak<Node<K, V>> = node.parent();
        match frame.parent {
            None => assert!(
                backlink.upgrade().is_none(),
                "root node carries a parent backlink"
            ),

            Some(parent) => {
                let target = backlink
                    .upgrade()
                    .expect("non-root node with a dead parent backlink");
                assert!(
                    NodeRef::ptr_eq(&target, parent),
                    "parent backlink points at a foreign node (depth {})",
                    frame.depth
                );
            }
        }

        // Occupancy.
        let len: usize = cells.len();
        assert!(
            len <= self.order,
            "node over capacity: {len} entries at order {} (depth {})",
            self.order,
            frame.depth
        );
        if frame.is_root {
            if !node.is_leaf() {
                assert!(
                    len >= 2,
                    "root branch with {len} child(ren) was not collapsed"
                );
            }
        } else {
            assert!(
                len >= min_occupancy(self.order),
                "node under minimum occupancy: {len} entries at order {} (depth {})",
                self.order,
                frame.depth
            );
        }

        match cells {
            Cells::Leaf(entries) => {
                if let Some(expected) = self.leaf_depth {
                    assert_eq!(
                        expected, frame.depth,
                        "leaves at unequal depths ({expected} vs {})",
                        frame.depth
                    );
                } else {
                    self.leaf_depth = Some(frame.depth);
                }
                self.entries += entries.len();

                let mut previous: Option<&K> = None;
                for (key, _) in entries {
                    if let Some(lower) = frame.lower {
                        // Inclusive: a separator may still equal the key it
                        // was minted from.
                        assert!(
                            key >= lower,
                            "leaf key below its subtree window (depth {})",
                            frame.depth
                        );
                    }
                    if let Some(upper) = frame.upper {
                        assert!(
                            key < upper,
                            "leaf key at or above its subtree window (depth {})",
                            frame.depth
                        );
                    }
                    if let Some(prev) = previous {
                        assert!(key > prev, "leaf keys out of order (depth {})", frame.depth);
                    }
                    previous = Some(key);
                }
            }

            Cells::Branch(entries) => {
                assert!(
                    entries[0].separator.is_none(),
                    "branch slot 0 carries a separator (depth {})",
                    frame.depth
                );

                // Separators are strictly ascending inside the window; the
                // first sits strictly above the window's lower bound because
                // child 0 holds at least one key between the two.
                let mut previous: Option<&K> = frame.lower;
                for (slot, entry) in entries.iter().enumerate().skip(1) {
                    let separator: &K = entry
                        .separator
                        .as_ref()
                        .unwrap_or_else(|| panic!("branch slot {slot} without separator"));
                    if let Some(bound) = previous {
                        assert!(
                            separator > bound,
                            "branch separators out of order (depth {})",
                            frame.depth
                        );
                    }
                    if let Some(upper) = frame.upper {
                        assert!(
                            separator < upper,
                            "branch separator at or above its window (depth {})",
                            frame.depth
                        );
                    }
                    previous = Some(separator);
                }

                // No child appears twice.
                for (i, entry) in entries.iter().enumerate() {
                    for other in &entries[i + 1..] {
                        assert!(
                            !NodeRef::ptr_eq(&entry.child, &other.child),
                            "branch holds the same child twice (depth {})",
                            frame.depth
                        );
                    }
                }

                for (slot, entry) in entries.iter().enumerate() {
                    let lower: Option<&K> = match &entry.separator {
                        Some(separator) => Some(separator),

                        None => frame.lower,
                    };
                    let upper: Option<&K> = match entries.get(slot + 1) {
                        Some(next) => next.separator.as_ref(),

                        None => frame.upper,
                    };
                    self.node(&entry.child, deadline, Frame {
                        depth: frame.depth + 1,
                        is_root: false,
                        parent: Some(node),
                        lower,
                        upper,
                    });
                }
            }
        }
    }
}

//! Overflow rebalancing: bottom-up splits along the held chain.
//!
//! After a pessimistic insert lands in a leaf occupying its overflow slot,
//! the leaf is split and the new sibling's separator is inserted into the
//! parent — which may overflow in turn. The walk uses only latches the
//! descent chain already holds: crabbing guarantees the chain bottoms out at
//! a node that can absorb one extra entry (or at the root, whose split grows
//! the tree under the still-held root-pointer write guard).
//!
//! A new sibling is unshared until the parent entry that publishes it is
//! written, and that write happens under the parent's exclusive latch, so no
//! other thread can observe a half-built sibling.

use std::sync::Arc;

use crate::latch::{Deadline, LatchChain, NodeWriteLatch, Timeout};
use crate::node::{BranchEntry, Cells, Node, NodeRef};
use crate::tracing_support::{debug_log, trace_log};

use super::LatchTree;

impl<K: Ord + Clone, V> LatchTree<K, V> {
    /// Restore the occupancy invariant after a leaf-level insert, splitting
    /// upward along `chain` as long as nodes overflow.
    pub(super) fn rebalance_after_insert(&self, chain: &mut LatchChain<'_, K, V>) {
        let mut level: usize = chain.len() - 1;

        loop {
            let node: NodeRef<K, V> = NodeRef::clone(chain.latch(level).node());

            // Split the node's upper half off into a fresh sibling.
            let (separator, sibling): (K, NodeRef<K, V>) = {
                let cells: &mut Cells<K, V> = chain.latch_mut(level).expect_write().cells_mut();
                if !cells.must_split(self.order) {
                    return;
                }

                let mid: usize = cells.len() / 2;
                let split = match cells {
                    Cells::Leaf(entries) => {
                        let upper: Vec<(K, V)> = entries.split_off(mid);
                        let separator: K = upper[0].0.clone();
                        (separator, Node::leaf_with(self.order, upper))
                    }

                    Cells::Branch(entries) => {
                        let mut upper: Vec<BranchEntry<K, V>> = entries.split_off(mid);
                        // The first moved entry becomes the sibling's
                        // negative-infinity slot; its separator moves up.
                        let separator: K = upper[0]
                            .separator
                            .take()
                            .expect("split midpoint without separator");
                        (separator, Node::branch_with(self.order, upper))
                    }
                };
                node.bump_version();
                split
            };

            // Retarget moved children before the sibling is published. The
            // sibling is unshared, so the latch is uncontended; it exists to
            // satisfy the access discipline, not to exclude anyone.
            if !sibling.is_leaf() {
                let guard: NodeWriteLatch<K, V> =
                    NodeWriteLatch::acquire(&sibling, &Deadline::start(Timeout::Infinite))
                        .expect("unshared sibling latch");
                for entry in guard.cells().branch() {
                    entry.child.set_parent(Arc::downgrade(&sibling));
                }
            }
            sibling.bump_version();

            trace_log!(
                level,
                node_version = node.version(),
                "split node; separator moves up"
            );

            if level == 0 {
                debug_assert!(
                    chain.holds_root(),
                    "an overflowing chain bottom must be the root"
                );

                // Grow the tree: a new branch root adopts both halves.
                let new_root: NodeRef<K, V> = Node::branch_with(
                    self.order,
                    vec![
                        BranchEntry {
                            separator: None,
                            child: NodeRef::clone(&node),
                        },
                        BranchEntry {
                            separator: Some(separator),
                            child: NodeRef::clone(&sibling),
                        },
                    ],
                );
                node.set_parent(Arc::downgrade(&new_root));
                sibling.set_parent(Arc::downgrade(&new_root));

                *chain.root_guard_mut().slot_mut() = NodeRef::clone(&new_root);
                self.depth.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug_log!(
                    depth = self.depth.load(std::sync::atomic::Ordering::Relaxed),
                    "root split; tree grew"
                );
                return;
            }

            // Publish the sibling right after the split node in the parent.
            let parent: NodeRef<K, V> = NodeRef::clone(chain.latch(level - 1).node());
            sibling.set_parent(Arc::downgrade(&parent));
            {
                let parent_cells: &mut Cells<K, V> =
                    chain.latch_mut(level - 1).expect_write().cells_mut();
                let slot: usize = parent_cells
                    .slot_of(&node)
                    .expect("split node missing from its parent");
                parent_cells.branch_mut().insert(
                    slot + 1,
                    BranchEntry {
                        separator: Some(separator),
                        child: sibling,
                    },
                );
                parent.bump_version();
            }

            level -= 1;
        }
    }
}

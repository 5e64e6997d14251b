//! Underflow rebalancing: bottom-up adoption and merging along the held
//! chain.
//!
//! After a pessimistic delete drops a node below minimum occupancy, the node
//! first tries to adopt an entry from a sibling that can spare one (left,
//! then right — adoption is cheap, no parent entry is removed). Failing that,
//! it merges with a sibling, removing one entry from the parent and possibly
//! underflowing it in turn. The ancestors come from the descent chain; the
//! sibling involved is write-latched for the duration of the transfer.
//!
//! Sibling latching stays deadlock-free: this thread already holds the
//! parent exclusively, so no new descent can reach the sibling, and any
//! operation already at or below it only ever releases latches at this level
//! — it never waits on the parent we hold.
//!
//! At the root, underflow is legal for a leaf; a branch reduced to a single
//! child hands the root slot to that child under the still-held root-pointer
//! write guard.

use std::sync::Arc;

use crate::latch::{Deadline, LatchChain, NodeWriteLatch, Timeout};
use crate::node::{BranchEntry, Cells, NodeRef};
use crate::tracing_support::{debug_log, trace_log};

use super::LatchTree;

/// Write-latch a sibling for an entry transfer. Blocking: rebalancing
/// operates entirely on latches it is entitled to and cannot fail.
fn latch_sibling<K, V>(sibling: &NodeRef<K, V>) -> NodeWriteLatch<K, V> {
    NodeWriteLatch::acquire(sibling, &Deadline::start(Timeout::Infinite))
        .expect("infinite latch acquisition cannot time out")
}

impl<K: Ord + Clone, V> LatchTree<K, V> {
    /// Restore the occupancy invariant after a leaf-level delete, adopting or
    /// merging upward along `chain` as long as nodes underflow.
    pub(super) fn rebalance_after_delete(&self, chain: &mut LatchChain<'_, K, V>) {
        let mut level: usize = chain.len() - 1;

        loop {
            if !chain.latch(level).cells().must_merge(self.order) {
                return;
            }

            let node: NodeRef<K, V> = NodeRef::clone(chain.latch(level).node());

            if level == 0 {
                debug_assert!(
                    chain.holds_root(),
                    "an underflowing chain bottom must be the root"
                );
                self.collapse_root(chain);
                return;
            }

            // Locate the node and its adjacent siblings in the parent.
            let (slot, left, right) = {
                let entries = chain.latch(level - 1).cells().branch();
                let slot: usize = chain
                    .latch(level - 1)
                    .cells()
                    .slot_of(&node)
                    .expect("underflowing node missing from its parent");
                let left: Option<NodeRef<K, V>> =
                    slot.checked_sub(1).map(|i| NodeRef::clone(&entries[i].child));
                let right: Option<NodeRef<K, V>> =
                    entries.get(slot + 1).map(|e| NodeRef::clone(&e.child));
                (slot, left, right)
            };

            let mut left_latch: Option<NodeWriteLatch<K, V>> =
                left.as_ref().map(|sibling| latch_sibling(sibling));

            // Adopt from the left sibling if it can spare an entry.
            if let (Some(left_node), Some(latch)) = (&left, left_latch.as_mut()) {
                if latch.cells().can_safely_delete(self.order) {
                    self.adopt_from_left(chain, level, &node, left_node, latch, slot);
                    return;
                }
            }

            let mut right_latch: Option<NodeWriteLatch<K, V>> =
                right.as_ref().map(|sibling| latch_sibling(sibling));

            // Adopt from the right sibling if it can spare an entry.
            if let (Some(right_node), Some(latch)) = (&right, right_latch.as_mut()) {
                if latch.cells().can_safely_delete(self.order) {
                    self.adopt_from_right(chain, level, &node, right_node, latch, slot);
                    return;
                }
            }

            // No adoption possible; merge with a sibling and recurse on the
            // parent, which just lost an entry.
            if let (Some(right_node), Some(mut latch)) = (right, right_latch.take()) {
                self.merge_right_into_node(chain, level, &node, &right_node, &mut latch, slot);
            } else {
                let left_node: NodeRef<K, V> =
                    left.expect("underflowing non-root node with no siblings");
                let mut latch: NodeWriteLatch<K, V> =
                    left_latch.take().expect("left sibling latch");
                self.merge_node_into_left(chain, level, &node, &left_node, &mut latch, slot);
            }

            level -= 1;
        }
    }

    /// Root underflow: legal for a leaf; a branch with a single child hands
    /// the root slot to that child.
    fn collapse_root(&self, chain: &mut LatchChain<'_, K, V>) {
        let sole_child: Option<NodeRef<K, V>> = match chain.latch(0).cells() {
            Cells::Branch(entries) if entries.len() <= 1 => {
                Some(NodeRef::clone(&entries[0].child))
            }

            // A root leaf may hold fewer than the minimum, down to empty;
            // a root branch keeps serving while it has two children.
            _ => None,
        };

        if let Some(child) = sole_child {
            child.clear_parent();
            chain.latch(0).node().bump_version();
            *chain.root_guard_mut().slot_mut() = child;
            self.depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            debug_log!(
                depth = self.depth.load(std::sync::atomic::Ordering::Relaxed),
                "root collapsed onto its sole child"
            );
        }
    }

    /// Move the left sibling's greatest entry to the front of `node`.
    fn adopt_from_left(
        &self,
        chain: &mut LatchChain<'_, K, V>,
        level: usize,
        node: &NodeRef<K, V>,
        left_node: &NodeRef<K, V>,
        left_latch: &mut NodeWriteLatch<K, V>,
        slot: usize,
    ) {
        // `node`'s separator in the parent: the true minimum of its current
        // negative-infinity slot when `node` is a branch.
        let node_sep: Option<K> = chain.latch(level - 1).cells().branch()[slot]
            .separator
            .clone();
        debug_assert!(node_sep.is_some(), "a node with a left sibling has a separator");

        let new_parent_sep: Option<K>;
        {
            let cells: &mut Cells<K, V> = chain.latch_mut(level).expect_write().cells_mut();
            match cells {
                Cells::Leaf(entries) => {
                    let moved: (K, V) = left_latch
                        .cells_mut()
                        .leaf_mut()
                        .pop()
                        .expect("donor leaf is empty");
                    entries.insert(0, moved);
                    new_parent_sep = Some(entries[0].0.clone());
                }

                Cells::Branch(entries) => {
                    let BranchEntry { separator, child } = left_latch
                        .cells_mut()
                        .branch_mut()
                        .pop()
                        .expect("donor branch is empty");
                    debug_assert!(separator.is_some(), "donor's last slot has a separator");
                    child.set_parent(Arc::downgrade(node));
                    // The former negative-infinity slot regains its real
                    // minimum; the moved child takes over as negative
                    // infinity, and its separator moves up to the parent.
                    entries[0].separator = node_sep;
                    entries.insert(
                        0,
                        BranchEntry {
                            separator: None,
                            child,
                        },
                    );
                    new_parent_sep = separator;
                }
            }
        }

        chain.latch_mut(level - 1).expect_write().cells_mut().branch_mut()[slot].separator =
            new_parent_sep;

        node.bump_version();
        left_node.bump_version();
        chain.latch(level - 1).node().bump_version();
        trace_log!(level, "adopted an entry from the left sibling");
    }

    /// Move the right sibling's least entry to the tail of `node`.
    fn adopt_from_right(
        &self,
        chain: &mut LatchChain<'_, K, V>,
        level: usize,
        node: &NodeRef<K, V>,
        right_node: &NodeRef<K, V>,
        right_latch: &mut NodeWriteLatch<K, V>,
        slot: usize,
    ) {
        // The right sibling's separator in the parent: the true minimum of
        // its negative-infinity slot when it is a branch.
        let right_sep: Option<K> = chain.latch(level - 1).cells().branch()[slot + 1]
            .separator
            .clone();
        debug_assert!(right_sep.is_some(), "a right sibling has a separator");

        let new_parent_sep: Option<K>;
        {
            let cells: &mut Cells<K, V> = chain.latch_mut(level).expect_write().cells_mut();
            match cells {
                Cells::Leaf(entries) => {
                    let moved: (K, V) = right_latch.cells_mut().leaf_mut().remove(0);
                    entries.push(moved);
                    new_parent_sep = Some(right_latch.cells().leaf()[0].0.clone());
                }

                Cells::Branch(entries) => {
                    let BranchEntry { separator, child } =
                        right_latch.cells_mut().branch_mut().remove(0);
                    debug_assert!(separator.is_none(), "slot 0 is the negative-infinity slot");
                    child.set_parent(Arc::downgrade(node));
                    entries.push(BranchEntry {
                        separator: right_sep,
                        child,
                    });
                    // The right sibling's new first slot becomes its negative
                    // infinity; its separator moves up to the parent.
                    new_parent_sep = right_latch.cells_mut().branch_mut()[0].separator.take();
                }
            }
        }

        chain.latch_mut(level - 1).expect_write().cells_mut().branch_mut()[slot + 1].separator =
            new_parent_sep;

        node.bump_version();
        right_node.bump_version();
        chain.latch(level - 1).node().bump_version();
        trace_log!(level, "adopted an entry from the right sibling");
    }

    /// Concatenate the right sibling's entries after `node`'s and unlink the
    /// sibling from the parent.
    fn merge_right_into_node(
        &self,
        chain: &mut LatchChain<'_, K, V>,
        level: usize,
        node: &NodeRef<K, V>,
        right_node: &NodeRef<K, V>,
        right_latch: &mut NodeWriteLatch<K, V>,
        slot: usize,
    ) {
        let right_sep: Option<K> = chain.latch(level - 1).cells().branch()[slot + 1]
            .separator
            .clone();
        debug_assert!(right_sep.is_some(), "a right sibling has a separator");

        {
            let cells: &mut Cells<K, V> = chain.latch_mut(level).expect_write().cells_mut();
            match cells {
                Cells::Leaf(entries) => {
                    entries.append(right_latch.cells_mut().leaf_mut());
                }

                Cells::Branch(entries) => {
                    let donor: &mut Vec<BranchEntry<K, V>> = right_latch.cells_mut().branch_mut();
                    // The sibling's negative-infinity slot regains its real
                    // minimum before the concatenation.
                    donor[0].separator = right_sep;
                    for entry in donor.iter() {
                        entry.child.set_parent(Arc::downgrade(node));
                    }
                    entries.append(donor);
                }
            }
        }

        let removed: BranchEntry<K, V> = chain
            .latch_mut(level - 1)
            .expect_write()
            .cells_mut()
            .branch_mut()
            .remove(slot + 1);
        debug_assert!(Arc::ptr_eq(&removed.child, right_node));
        right_node.clear_parent();

        node.bump_version();
        right_node.bump_version();
        chain.latch(level - 1).node().bump_version();
        trace_log!(level, "merged the right sibling into the node");
    }

    /// Concatenate `node`'s entries after the left sibling's and unlink
    /// `node` from the parent.
    fn merge_node_into_left(
        &self,
        chain: &mut LatchChain<'_, K, V>,
        level: usize,
        node: &NodeRef<K, V>,
        left_node: &NodeRef<K, V>,
        left_latch: &mut NodeWriteLatch<K, V>,
        slot: usize,
    ) {
        let node_sep: Option<K> = chain.latch(level - 1).cells().branch()[slot]
            .separator
            .clone();
        debug_assert!(node_sep.is_some(), "a node with a left sibling has a separator");

        {
            let cells: &mut Cells<K, V> = chain.latch_mut(level).expect_write().cells_mut();
            match cells {
                Cells::Leaf(entries) => {
                    left_latch.cells_mut().leaf_mut().append(entries);
                }

                Cells::Branch(entries) => {
                    entries[0].separator = node_sep;
                    for entry in entries.iter() {
                        entry.child.set_parent(Arc::downgrade(left_node));
                    }
                    left_latch.cells_mut().branch_mut().append(entries);
                }
            }
        }

        let removed: BranchEntry<K, V> = chain
            .latch_mut(level - 1)
            .expect_write()
            .cells_mut()
            .branch_mut()
            .remove(slot);
        debug_assert!(Arc::ptr_eq(&removed.child, node));
        node.clear_parent();

        node.bump_version();
        left_node.bump_version();
        chain.latch(level - 1).node().bump_version();
        trace_log!(level, "merged the node into the left sibling");
    }
}

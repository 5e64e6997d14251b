//! B+ tree node storage.
//!
//! A [`Node`] is a fan-out-`order` cell holding either ordered key→value
//! entries (leaf) or ordered separator→child entries (branch). Entries are
//! packed in a `Vec` allocated once with capacity `order + 1` — the extra slot
//! is the overflow slot occupied between an insert and the split that follows
//! it — so a single-node mutation is an in-array shift, never an allocation.
//!
//! The node's entry storage lives in an [`UnsafeCell`] guarded by the node's
//! raw reader–writer latch; the typed guards in [`crate::latch`] are the only
//! way to reach it. Three fields are deliberately *outside* the latch:
//!
//! - `is_leaf` is immutable for the node's lifetime, so a descent may decide
//!   the latch polarity for a child before latching it.
//! - `version` is a monotonic structural counter consumed by diagnostics.
//! - `parent` is a `Weak` backlink behind its own uncontended mutex, so
//!   rebalancing can retarget moved children without taking their latches.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::latch::LatchIntent;

/// Shared handle to a node. Ownership flows root→leaf through branch entries.
pub(crate) type NodeRef<K, V> = Arc<Node<K, V>>;

/// Minimum entry count for a non-root node: `⌈order / 2⌉`.
#[inline]
pub(crate) const fn min_occupancy(order: usize) -> usize {
    order.div_ceil(2)
}

// ============================================================================
//  Node
// ============================================================================

/// One B+ tree node: latch, structural version, parent backlink, entries.
pub(crate) struct Node<K, V> {
    /// Leaf or branch. Immutable, readable without the latch.
    is_leaf: bool,

    /// The per-node reader–writer latch guarding `cells`.
    latch: RawRwLock,

    /// Incremented on every structural modification. Diagnostics only.
    version: AtomicU32,

    /// Backlink to the parent node; `Weak::new()` iff this node is the root
    /// or has been unlinked by a merge. A lookup aid, not ownership.
    parent: Mutex<Weak<Node<K, V>>>,

    /// Entry storage. Guarded by `latch`.
    cells: UnsafeCell<Cells<K, V>>,
}

// SAFETY: all access to `cells` goes through the latch guards in
// `crate::latch`, which enforce the reader–writer discipline; the remaining
// fields are either immutable, atomic, or internally synchronized.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
    /// Create an empty leaf with capacity for `order + 1` entries.
    pub(crate) fn new_leaf(order: usize) -> NodeRef<K, V> {
        Self::from_cells(true, Cells::Leaf(Vec::with_capacity(order + 1)))
    }

    /// Create a leaf owning the given entries (used by splits).
    pub(crate) fn leaf_with(order: usize, entries: Vec<(K, V)>) -> NodeRef<K, V> {
        debug_assert!(entries.len() <= order + 1);
        let mut store: Vec<(K, V)> = Vec::with_capacity(order + 1);
        store.extend(entries);
        Self::from_cells(true, Cells::Leaf(store))
    }

    /// Create a branch owning the given entries (splits and root growth).
    pub(crate) fn branch_with(order: usize, entries: Vec<BranchEntry<K, V>>) -> NodeRef<K, V> {
        debug_assert!(entries.len() <= order + 1);
        let mut store: Vec<BranchEntry<K, V>> = Vec::with_capacity(order + 1);
        store.extend(entries);
        Self::from_cells(false, Cells::Branch(store))
    }

    fn from_cells(is_leaf: bool, cells: Cells<K, V>) -> NodeRef<K, V> {
        Arc::new(Self {
            is_leaf,
            latch: RawRwLock::INIT,
            version: AtomicU32::new(0),
            parent: Mutex::new(Weak::new()),
            cells: UnsafeCell::new(cells),
        })
    }

    /// Whether this node is a leaf. Immutable, so no latch is required.
    #[inline]
    pub(crate) const fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// The raw latch. Only [`crate::latch`] acquires or releases it.
    #[inline]
    pub(crate) const fn latch(&self) -> &RawRwLock {
        &self.latch
    }

    /// Record a structural modification; returns the new version.
    #[inline]
    pub(crate) fn bump_version(&self) -> u32 {
        self.version.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Current structural version.
    #[inline]
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pub(crate) fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Retarget the parent backlink.
    pub(crate) fn set_parent(&self, parent: Weak<Node<K, V>>) {
        *self.parent.lock() = parent;
    }

    /// Clear the parent backlink (root installation, merge unlink).
    pub(crate) fn clear_parent(&self) {
        *self.parent.lock() = Weak::new();
    }

    /// Snapshot the parent backlink.
    pub(crate) fn parent(&self) -> Weak<Node<K, V>> {
        self.parent.lock().clone()
    }

    /// Access the entries while the shared latch is held.
    ///
    /// # Safety
    ///
    /// The caller must hold this node's latch (shared or exclusive) for the
    /// lifetime of the returned reference.
    #[inline]
    pub(crate) unsafe fn cells_unchecked(&self) -> &Cells<K, V> {
        // SAFETY: latch held per precondition; writers are excluded.
        unsafe { &*self.cells.get() }
    }

    /// Access the entries mutably while the exclusive latch is held.
    ///
    /// # Safety
    ///
    /// The caller must hold this node's exclusive latch and must not create a
    /// second live reference to the cells.
    #[inline]
    #[expect(clippy::mut_from_ref, reason = "interior mutability behind the exclusive latch")]
    pub(crate) unsafe fn cells_mut_unchecked(&self) -> &mut Cells<K, V> {
        // SAFETY: exclusive latch held per precondition; no aliasing.
        unsafe { &mut *self.cells.get() }
    }
}

// ============================================================================
//  Cells
// ============================================================================

/// A branch entry: the minimum key of the child's subtree plus the child.
///
/// Entry 0's separator is `None` — the logical negative infinity of the
/// left-most subtree. All other entries carry `Some`.
pub(crate) struct BranchEntry<K, V> {
    pub(crate) separator: Option<K>,
    pub(crate) child: NodeRef<K, V>,
}

/// Entry storage for one node.
pub(crate) enum Cells<K, V> {
    Leaf(Vec<(K, V)>),
    Branch(Vec<BranchEntry<K, V>>),
}

impl<K, V> Cells<K, V> {
    /// Number of occupied entries.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Leaf(entries) => entries.len(),

            Self::Branch(entries) => entries.len(),
        }
    }

    /// Leaf entries; panics if this is a branch.
    #[inline]
    pub(crate) fn leaf(&self) -> &Vec<(K, V)> {
        match self {
            Self::Leaf(entries) => entries,

            Self::Branch(_) => unreachable!("leaf access on a branch node"),
        }
    }

    /// Mutable leaf entries; panics if this is a branch.
    #[inline]
    pub(crate) fn leaf_mut(&mut self) -> &mut Vec<(K, V)> {
        match self {
            Self::Leaf(entries) => entries,

            Self::Branch(_) => unreachable!("leaf access on a branch node"),
        }
    }

    /// Branch entries; panics if this is a leaf.
    #[inline]
    pub(crate) fn branch(&self) -> &Vec<BranchEntry<K, V>> {
        match self {
            Self::Branch(entries) => entries,

            Self::Leaf(_) => unreachable!("branch access on a leaf node"),
        }
    }

    /// Mutable branch entries; panics if this is a leaf.
    #[inline]
    pub(crate) fn branch_mut(&mut self) -> &mut Vec<BranchEntry<K, V>> {
        match self {
            Self::Branch(entries) => entries,

            Self::Leaf(_) => unreachable!("branch access on a leaf node"),
        }
    }

    /// Post-insert will not overflow.
    #[inline]
    pub(crate) fn can_safely_insert(&self, order: usize) -> bool {
        self.len() < order
    }

    /// Post-delete will not underflow.
    #[inline]
    pub(crate) fn can_safely_delete(&self, order: usize) -> bool {
        self.len() > min_occupancy(order)
    }

    /// The node currently occupies the overflow slot and must split.
    #[inline]
    pub(crate) fn must_split(&self, order: usize) -> bool {
        self.len() > order
    }

    /// The node is below minimum occupancy and must merge or adopt.
    #[inline]
    pub(crate) fn must_merge(&self, order: usize) -> bool {
        self.len() < min_occupancy(order)
    }

    /// Whether the intended point mutation can complete on this node alone,
    /// without cascading into its parent.
    pub(crate) fn is_safe_for(&self, intent: LatchIntent, order: usize) -> bool {
        match intent {
            LatchIntent::Read => true,

            LatchIntent::Insert | LatchIntent::InsertTest => self.can_safely_insert(order),

            LatchIntent::Delete | LatchIntent::DeleteTest => self.can_safely_delete(order),
        }
    }
}

impl<K: Ord, V> Cells<K, V> {
    /// Binary search a leaf for `key`: `Ok(index)` on a match, `Err(slot)`
    /// with the insertion slot otherwise.
    #[inline]
    pub(crate) fn leaf_search(&self, key: &K) -> Result<usize, usize> {
        self.leaf().binary_search_by(|(entry_key, _)| entry_key.cmp(key))
    }

    /// Index of the child to descend into for `key`.
    ///
    /// A key equal to a separator follows that separator's child; with
    /// `strictly_less` the tie goes to the child on the left instead, which
    /// selects the subtree of greatest keys strictly below `key`.
    pub(crate) fn child_slot(&self, key: &K, strictly_less: bool) -> usize {
        let entries: &Vec<BranchEntry<K, V>> = self.branch();

        // Entry 0 has no separator; search the separators of entries 1...
        entries[1..].partition_point(|entry| {
            let separator: &K = entry
                .separator
                .as_ref()
                .expect("non-zero branch slot without separator");
            if strictly_less {
                separator < key
            } else {
                separator <= key
            }
        })
    }

    /// Slot of `child` in this branch, by reference identity.
    pub(crate) fn slot_of(&self, child: &NodeRef<K, V>) -> Option<usize> {
        self.branch()
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.child, child))
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_cells(keys: &[i32]) -> Cells<i32, i32> {
        Cells::Leaf(keys.iter().map(|&k| (k, k * 10)).collect())
    }

    fn branch_cells(separators: &[Option<i32>]) -> Cells<i32, i32> {
        Cells::Branch(
            separators
                .iter()
                .map(|&s| BranchEntry {
                    separator: s,
                    child: Node::new_leaf(4),
                })
                .collect(),
        )
    }

    #[test]
    fn test_leaf_search() {
        let cells = leaf_cells(&[2, 4, 6]);
        assert_eq!(cells.leaf_search(&4), Ok(1));
        assert_eq!(cells.leaf_search(&1), Err(0));
        assert_eq!(cells.leaf_search(&5), Err(2));
        assert_eq!(cells.leaf_search(&7), Err(3));
    }

    #[test]
    fn test_child_slot_follows_equal_separator() {
        let cells = branch_cells(&[None, Some(10), Some(20)]);
        assert_eq!(cells.child_slot(&5, false), 0);
        assert_eq!(cells.child_slot(&10, false), 1);
        assert_eq!(cells.child_slot(&15, false), 1);
        assert_eq!(cells.child_slot(&20, false), 2);
        assert_eq!(cells.child_slot(&99, false), 2);
    }

    #[test]
    fn test_child_slot_strictly_less_breaks_ties_left() {
        let cells = branch_cells(&[None, Some(10), Some(20)]);
        assert_eq!(cells.child_slot(&10, true), 0);
        assert_eq!(cells.child_slot(&20, true), 1);
        assert_eq!(cells.child_slot(&21, true), 2);
    }

    #[test]
    fn test_safety_predicates() {
        // order 4: min occupancy 2.
        let two = leaf_cells(&[1, 2]);
        let four = leaf_cells(&[1, 2, 3, 4]);
        assert!(two.can_safely_insert(4));
        assert!(!four.can_safely_insert(4));
        assert!(!two.can_safely_delete(4));
        assert!(four.can_safely_delete(4));
        assert!(!four.must_split(4));
        assert!(leaf_cells(&[1, 2, 3, 4, 5]).must_split(4));
        assert!(leaf_cells(&[1]).must_merge(4));
        assert!(!two.must_merge(4));
    }

    #[test]
    fn test_min_occupancy() {
        assert_eq!(min_occupancy(3), 2);
        assert_eq!(min_occupancy(4), 2);
        assert_eq!(min_occupancy(32), 16);
    }

    #[test]
    fn test_version_bump() {
        let node: NodeRef<i32, i32> = Node::new_leaf(4);
        assert_eq!(node.version(), 0);
        assert_eq!(node.bump_version(), 1);
        assert_eq!(node.bump_version(), 2);
        assert_eq!(node.version(), 2);
    }
}

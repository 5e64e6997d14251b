//! `LatchTree` — the public concurrent ordered map.
//!
//! This module owns the root pointer and the tree-level counters, and drives
//! every point operation through the two-phase descent protocol:
//!
//! 1. **Optimistic pass**: shared latches down the path, an exclusive latch
//!    on the leaf alone. Sufficient whenever the leaf can absorb the
//!    mutation without rebalancing — the overwhelmingly common case.
//! 2. **Pessimistic pass**: exclusive latches all the way down (crab-released
//!    as nodes prove safe), taken only when the optimistic pass reports an
//!    unsafe leaf. Conditional operations (`insert_if_absent`, `remove`)
//!    often skip the second pass entirely: the optimistic descent retains the
//!    unsafe leaf's latch just long enough to see that the condition already
//!    settles the outcome.
//!
//! Submodules: [`traverse`] (descent engine), [`split`] / [`merge`]
//! (rebalancing), [`iter`] (subtree-locked enumeration), [`verify`]
//! (invariant harness).

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::latch::{Deadline, LatchIntent, Timeout};
use crate::node::{Node, NodeRef};
use crate::tracing_support::debug_log;

use self::traverse::{DescentEnd, DescentRequest, Reached, Target};

pub mod iter;

mod merge;
mod split;
mod traverse;
mod verify;

/// Fan-out used by [`LatchTree::new`].
const DEFAULT_ORDER: usize = 32;

/// Smallest permitted fan-out.
const MIN_ORDER: usize = 3;

/// Deepest supported tree. With the minimum fan-out this already admits more
/// than 2³² entries; the latch chain bound leaves headroom above it.
pub(crate) const MAX_DEPTH: usize = 30;

// ============================================================================
//  Errors
// ============================================================================

/// A latch acquisition exceeded the operation's budget. No side effect
/// occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock acquisition timed out")
    }
}

impl std::error::Error for TimedOut {}

/// Errors an inserting operation can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// A latch acquisition exceeded the budget; nothing was inserted.
    TimedOut,

    /// The insert would grow the tree beyond the supported depth; nothing
    /// was inserted.
    CapacityExceeded,
}

impl fmt::Display for InsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "lock acquisition timed out"),

            Self::CapacityExceeded => write!(f, "tree reached its maximum supported depth"),
        }
    }
}

impl std::error::Error for InsertError {}

impl From<TimedOut> for InsertError {
    fn from(_: TimedOut) -> Self {
        Self::TimedOut
    }
}

// ============================================================================
//  LatchTree
// ============================================================================

/// A concurrent ordered map over a B+ tree with per-node latch crabbing.
///
/// Point operations and enumeration may run concurrently from any number of
/// threads; operations on disjoint subtrees make independent progress. Every
/// operation takes a [`Timeout`] bounding its latch waits: on expiry the
/// operation backs out with no side effect.
///
/// `order` is the maximum entry count per node; every non-root node keeps at
/// least `⌈order / 2⌉` entries.
pub struct LatchTree<K, V> {
    /// The root pointer, guarded by its own reader–writer lock — distinct
    /// from any node latch, so swapping the root is atomic with respect to
    /// descents that have not yet latched the root node.
    root: RwLock<NodeRef<K, V>>,

    /// Fan-out. Fixed at construction.
    order: usize,

    /// Total entry count. Best-effort snapshot under concurrency.
    len: AtomicUsize,

    /// Current depth (1 = the root is a leaf). Best-effort snapshot.
    depth: AtomicUsize,
}

impl<K: Ord + Clone, V> LatchTree<K, V> {
    /// Create an empty map with the default fan-out of 32.
    #[must_use]
    pub fn new() -> Self {
        Self::with_order(DEFAULT_ORDER)
    }

    /// Create an empty map with the given fan-out.
    ///
    /// # Panics
    ///
    /// Panics if `order < 3`.
    #[must_use]
    pub fn with_order(order: usize) -> Self {
        assert!(
            order >= MIN_ORDER,
            "order must be at least {MIN_ORDER}, got {order}"
        );
        Self {
            root: RwLock::new(Node::new_leaf(order)),
            order,
            len: AtomicUsize::new(0),
            depth: AtomicUsize::new(1),
        }
    }

    /// The fan-out this map was constructed with.
    #[inline]
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Number of entries. Best-effort snapshot under concurrency.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the map is empty. Best-effort snapshot.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current tree depth (1 = the root is a leaf). Best-effort snapshot.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    //  Mutations
    // ------------------------------------------------------------------

    /// Insert `key → value`, replacing and returning any previous value.
    pub fn insert(&self, key: K, value: V, timeout: Timeout) -> Result<Option<V>, InsertError> {
        let deadline: Deadline = Deadline::start(timeout);

        let request = DescentRequest::point(Target::Key(&key), LatchIntent::Insert, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => return Err(InsertError::TimedOut),

            DescentEnd::Reached(mut reached) => {
                // Safe leaf: the write completes without rebalancing.
                return Ok(self.write_leaf_entry(&mut reached, key, value));
            }

            DescentEnd::UnsafeLeaf => {}

            DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("unconditional inserts never retain an unsafe leaf")
            }
        }

        let request = DescentRequest::point(Target::Key(&key), LatchIntent::Insert, true);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(InsertError::TimedOut),

            DescentEnd::Reached(mut reached) => {
                if reached.found.is_none() {
                    self.check_capacity(&reached)?;
                }
                let replaced: Option<V> = self.write_leaf_entry(&mut reached, key, value);
                if replaced.is_none() {
                    self.rebalance_after_insert(&mut reached.chain);
                }
                Ok(replaced)
            }

            DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("pessimistic descents reach the leaf or time out")
            }
        }
    }

    /// Insert `key → value` only if the key is absent. Returns `true` if the
    /// entry was inserted, `false` if the key was already present.
    pub fn insert_if_absent(
        &self,
        key: K,
        value: V,
        timeout: Timeout,
    ) -> Result<bool, InsertError> {
        let deadline: Deadline = Deadline::start(timeout);

        let request = DescentRequest::point(Target::Key(&key), LatchIntent::InsertTest, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => return Err(InsertError::TimedOut),

            DescentEnd::Reached(mut reached) => {
                if reached.found.is_some() {
                    return Ok(false);
                }
                self.write_leaf_entry(&mut reached, key, value);
                return Ok(true);
            }

            DescentEnd::UnsafeLeafRetained(reached) => {
                // The unsafe leaf already settles the negative case with no
                // second descent.
                if reached.found.is_some() {
                    return Ok(false);
                }
                // Release the retained leaf before re-descending: the
                // pessimistic pass will latch it again.
                drop(reached);
            }

            DescentEnd::UnsafeLeaf => unreachable!("test intents retain the unsafe leaf"),
        }

        let request = DescentRequest::point(Target::Key(&key), LatchIntent::InsertTest, true);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(InsertError::TimedOut),

            DescentEnd::Reached(mut reached) => {
                if reached.found.is_some() {
                    return Ok(false);
                }
                self.check_capacity(&reached)?;
                self.write_leaf_entry(&mut reached, key, value);
                self.rebalance_after_insert(&mut reached.chain);
                Ok(true)
            }

            DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("pessimistic descents reach the leaf or time out")
            }
        }
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&self, key: &K, timeout: Timeout) -> Result<Option<V>, TimedOut> {
        let deadline: Deadline = Deadline::start(timeout);

        let request = DescentRequest::point(Target::Key(key), LatchIntent::DeleteTest, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => return Err(TimedOut),

            DescentEnd::Reached(mut reached) => {
                // Safe leaf: the removal completes without rebalancing.
                return Ok(self.take_leaf_entry(&mut reached));
            }

            DescentEnd::UnsafeLeafRetained(reached) => {
                if reached.found.is_none() {
                    return Ok(None);
                }
                drop(reached);
            }

            DescentEnd::UnsafeLeaf => unreachable!("test intents retain the unsafe leaf"),
        }

        let request = DescentRequest::point(Target::Key(key), LatchIntent::Delete, true);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(TimedOut),

            DescentEnd::Reached(mut reached) => {
                let removed: Option<V> = self.take_leaf_entry(&mut reached);
                if removed.is_some() {
                    self.rebalance_after_delete(&mut reached.chain);
                }
                Ok(removed)
            }

            DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("pessimistic descents reach the leaf or time out")
            }
        }
    }

    /// Drop every entry, installing a fresh empty root.
    ///
    /// Concurrent readers that already latched into the old tree finish on
    /// their own snapshot of it.
    pub fn clear(&self, timeout: Timeout) -> Result<(), TimedOut> {
        let deadline: Deadline = Deadline::start(timeout);
        let Some(mut guard) = self.lock_root(true, &deadline) else {
            return Err(TimedOut);
        };

        *guard.slot_mut() = Node::new_leaf(self.order);
        self.len.store(0, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
        debug_log!("cleared; fresh empty root installed");
        Ok(())
    }

    // ------------------------------------------------------------------
    //  Lookups
    // ------------------------------------------------------------------

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K, timeout: Timeout) -> Result<bool, TimedOut> {
        let deadline: Deadline = Deadline::start(timeout);
        let request = DescentRequest::point(Target::Key(key), LatchIntent::Read, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(TimedOut),

            DescentEnd::Reached(reached) => Ok(reached.found.is_some()),

            DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("read descents have no unsafe leaves")
            }
        }
    }

    // ------------------------------------------------------------------
    //  Internal leaf edits
    // ------------------------------------------------------------------

    /// Write `key → value` into the latched leaf on top of the chain:
    /// replace in place on a match, insert at the descent's slot otherwise.
    fn write_leaf_entry(&self, reached: &mut Reached<'_, K, V>, key: K, value: V) -> Option<V> {
        let leaf = reached.chain.top_mut().expect_write();
        let replaced: Option<V> = {
            let entries: &mut Vec<(K, V)> = leaf.cells_mut().leaf_mut();
            match reached.found {
                Some(index) => Some(mem::replace(&mut entries[index].1, value)),

                None => {
                    entries.insert(reached.slot, (key, value));
                    None
                }
            }
        };

        if replaced.is_none() {
            leaf.node().bump_version();
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    /// Remove the matched entry from the latched leaf on top of the chain.
    fn take_leaf_entry(&self, reached: &mut Reached<'_, K, V>) -> Option<V> {
        let index: usize = reached.found?;
        let leaf = reached.chain.top_mut().expect_write();
        let (_, value) = leaf.cells_mut().leaf_mut().remove(index);
        leaf.node().bump_version();
        // Saturating: a concurrent `clear` may already have zeroed the
        // counter while this remover finished on the detached tree.
        let _ = self
            .len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |len| {
                Some(len.saturating_sub(1))
            });
        Some(value)
    }

    /// Refuse an insert whose cascade would grow the tree past [`MAX_DEPTH`].
    ///
    /// When the pessimistic chain still bottoms out at a full root, every
    /// node on the path is full, so inserting a fresh key splits all of them
    /// including the root — detection here is exact and precedes any
    /// mutation.
    fn check_capacity(&self, reached: &Reached<'_, K, V>) -> Result<(), InsertError> {
        if reached.depth >= MAX_DEPTH
            && reached.chain.holds_root()
            && !reached
                .chain
                .latch(0)
                .cells()
                .can_safely_insert(self.order)
        {
            return Err(InsertError::CapacityExceeded);
        }
        Ok(())
    }
}

impl<K: Ord + Clone, V: Clone> LatchTree<K, V> {
    /// Look up `key`, returning a clone of its value.
    pub fn get(&self, key: &K, timeout: Timeout) -> Result<Option<V>, TimedOut> {
        let deadline: Deadline = Deadline::start(timeout);
        let request = DescentRequest::point(Target::Key(key), LatchIntent::Read, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(TimedOut),

            DescentEnd::Reached(reached) => Ok(reached
                .found
                .map(|index| reached.chain.top().cells().leaf()[index].1.clone())),

            DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("read descents have no unsafe leaves")
            }
        }
    }

    /// Return the value under `key`, inserting `value` first if the key is
    /// absent.
    pub fn get_or_insert(&self, key: K, value: V, timeout: Timeout) -> Result<V, InsertError> {
        self.get_or_insert_with(key, move || value, timeout)
    }

    /// Return the value under `key`, inserting the closure's value first if
    /// the key is absent. The closure runs only on insertion.
    ///
    /// The closure executes while the destination leaf is write-latched: it
    /// must not call back into this map (the latch is non-reentrant), and
    /// operations touching that leaf from other threads block until it
    /// returns.
    pub fn get_or_insert_with<F>(&self, key: K, make: F, timeout: Timeout) -> Result<V, InsertError>
    where
        F: FnOnce() -> V,
    {
        let deadline: Deadline = Deadline::start(timeout);

        let request = DescentRequest::point(Target::Key(&key), LatchIntent::InsertTest, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(InsertError::TimedOut),

            DescentEnd::Reached(mut reached) => {
                if let Some(index) = reached.found {
                    return Ok(reached.chain.top().cells().leaf()[index].1.clone());
                }
                let value: V = make();
                let out: V = value.clone();
                self.write_leaf_entry(&mut reached, key, value);
                Ok(out)
            }

            DescentEnd::UnsafeLeafRetained(reached) => {
                if let Some(index) = reached.found {
                    return Ok(reached.chain.top().cells().leaf()[index].1.clone());
                }
                drop(reached);

                let request =
                    DescentRequest::point(Target::Key(&key), LatchIntent::InsertTest, true);
                match self.descend(&request, &deadline) {
                    DescentEnd::TimedOut => Err(InsertError::TimedOut),

                    DescentEnd::Reached(mut reached) => {
                        if let Some(index) = reached.found {
                            return Ok(reached.chain.top().cells().leaf()[index].1.clone());
                        }
                        self.check_capacity(&reached)?;
                        let value: V = make();
                        let out: V = value.clone();
                        self.write_leaf_entry(&mut reached, key, value);
                        self.rebalance_after_insert(&mut reached.chain);
                        Ok(out)
                    }

                    DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                        unreachable!("pessimistic descents reach the leaf or time out")
                    }
                }
            }

            DescentEnd::UnsafeLeaf => unreachable!("test intents retain the unsafe leaf"),
        }
    }

    /// The least entry, if any.
    pub fn first(&self, timeout: Timeout) -> Result<Option<(K, V)>, TimedOut> {
        self.edge_entry(Target::Min, timeout)
    }

    /// The greatest entry, if any.
    pub fn last(&self, timeout: Timeout) -> Result<Option<(K, V)>, TimedOut> {
        self.edge_entry(Target::Max, timeout)
    }

    fn edge_entry(
        &self,
        target: Target<'_, K>,
        timeout: Timeout,
    ) -> Result<Option<(K, V)>, TimedOut> {
        let take_last: bool = matches!(target, Target::Max);
        let deadline: Deadline = Deadline::start(timeout);
        let request = DescentRequest::point(target, LatchIntent::Read, false);
        match self.descend(&request, &deadline) {
            DescentEnd::TimedOut => Err(TimedOut),

            DescentEnd::Reached(reached) => {
                let entries: &Vec<(K, V)> = reached.chain.top().cells().leaf();
                Ok(if take_last {
                    entries.last().cloned()
                } else {
                    entries.first().cloned()
                })
            }

            DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                unreachable!("read descents have no unsafe leaves")
            }
        }
    }
}

// ============================================================================
//  Std trait impls
// ============================================================================

impl<K: Ord + Clone, V> Default for LatchTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for LatchTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatchTree")
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl<K: Ord + Clone, V> FromIterator<(K, V)> for LatchTree<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(entries: I) -> Self {
        let tree: Self = Self::new();
        for (key, value) in entries {
            tree.insert(key, value, Timeout::Infinite)
                .expect("tree capacity exceeded");
        }
        tree
    }
}

impl<K: Ord + Clone, V> Extend<(K, V)> for LatchTree<K, V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, entries: I) {
        for (key, value) in entries {
            self.insert(key, value, Timeout::Infinite)
                .expect("tree capacity exceeded");
        }
    }
}

//! Latches, timeouts, and the per-operation latch chain.
//!
//! Every tree operation owns a [`LatchChain`]: the bounded sequence of node
//! latches it currently holds, plus (early in a descent) the guard on the
//! tree's root pointer. The chain encodes the crabbing discipline:
//!
//! - **Coupled release** (reads and optimistic descents): after latching a
//!   child, everything above it is released, so at most two node latches are
//!   live at once.
//! - **Crab release** (pessimistic descents): ancestors are released only once
//!   a descendant proves *safe* — able to absorb the mutation without
//!   cascading — so rebalancing later finds every latch it needs already in
//!   the chain.
//!
//! Latches are owned guards over `Arc<Node>` + the node's raw lock; dropping a
//! guard releases the latch, so any exit path (success, timeout, panic)
//! unwinds the chain in LIFO order.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use parking_lot::lock_api::{RawRwLock as _, RawRwLockTimed as _};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::node::{Cells, NodeRef};

// ============================================================================
//  Timeout / Deadline
// ============================================================================

/// A lock-acquisition budget for one operation.
///
/// Mirrors the millisecond convention of the public API: `0` is a
/// non-blocking try, `-1` waits forever, positive values bound the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately if any latch on the path is contended.
    Immediate,

    /// Wait up to the given duration across the whole operation.
    Bounded(Duration),

    /// Wait as long as it takes.
    Infinite,
}

impl Timeout {
    /// Convert a millisecond count: `-1` → [`Timeout::Infinite`], `0` →
    /// [`Timeout::Immediate`], positive → [`Timeout::Bounded`].
    ///
    /// # Panics
    ///
    /// Panics on negative values other than `-1` (argument error).
    #[must_use]
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            -1 => Self::Infinite,

            0 => Self::Immediate,

            n if n > 0 => Self::Bounded(Duration::from_millis(n as u64)),

            n => panic!("negative timeout {n} ms (only -1 means infinite)"),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::Bounded(duration)
    }
}

/// A started [`Timeout`]: tracks how much of the budget remains.
///
/// The remainder is `budget − elapsed`, saturating at zero; once exhausted,
/// further acquisitions degrade to non-blocking tries.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    Immediate,
    Until(Instant),
    Infinite,
}

impl Deadline {
    pub(crate) fn start(timeout: Timeout) -> Self {
        match timeout {
            Timeout::Immediate => Self::Immediate,

            Timeout::Bounded(duration) => Self::Until(Instant::now() + duration),

            Timeout::Infinite => Self::Infinite,
        }
    }

    /// The budget left for the next acquisition.
    pub(crate) fn remaining(&self) -> Timeout {
        match self {
            Self::Immediate => Timeout::Immediate,

            Self::Infinite => Timeout::Infinite,

            Self::Until(instant) => {
                let left: Duration = instant.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Timeout::Immediate
                } else {
                    Timeout::Bounded(left)
                }
            }
        }
    }
}

// ============================================================================
//  Latch intents
// ============================================================================

/// What an operation intends to do at the leaf it descends to.
///
/// The `*Test` variants are conditional mutations (insert-if-absent,
/// remove-if-present): on an optimistic descent they retain the leaf's write
/// latch even when the leaf is structurally unsafe, so the caller can decide
/// atomically whether a pessimistic second descent is needed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LatchIntent {
    Read,
    Insert,
    InsertTest,
    Delete,
    DeleteTest,
}

impl LatchIntent {
    /// Whether the leaf will be write-latched.
    #[inline]
    pub(crate) fn is_mutation(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Whether an unsafe leaf should be retained instead of released.
    #[inline]
    pub(crate) fn is_test(self) -> bool {
        matches!(self, Self::InsertTest | Self::DeleteTest)
    }
}

// ============================================================================
//  Node latch guards
// ============================================================================

/// Shared latch on one node. Released on drop.
pub(crate) struct NodeReadLatch<K, V> {
    node: NodeRef<K, V>,

    // parking_lot guards must release on the acquiring thread.
    _not_send: PhantomData<*mut ()>,
}

/// Exclusive latch on one node. Released on drop.
pub(crate) struct NodeWriteLatch<K, V> {
    node: NodeRef<K, V>,
    _not_send: PhantomData<*mut ()>,
}

/// Try to acquire a raw latch within the deadline's remaining budget.
macro_rules! timed_acquire {
    ($raw:expr, $deadline:expr, $lock:ident, $try_lock:ident, $try_lock_for:ident) => {
        match $deadline.remaining() {
            Timeout::Infinite => {
                $raw.$lock();
                true
            }

            Timeout::Immediate => $raw.$try_lock(),

            Timeout::Bounded(left) => $raw.$try_lock_for(left),
        }
    };
}

impl<K, V> NodeReadLatch<K, V> {
    /// Acquire a shared latch on `node`, or `None` on timeout.
    pub(crate) fn acquire(node: &NodeRef<K, V>, deadline: &Deadline) -> Option<Self> {
        let acquired: bool = timed_acquire!(
            node.latch(),
            deadline,
            lock_shared,
            try_lock_shared,
            try_lock_shared_for
        );

        acquired.then(|| Self {
            node: NodeRef::clone(node),
            _not_send: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn node(&self) -> &NodeRef<K, V> {
        &self.node
    }

    #[inline]
    pub(crate) fn cells(&self) -> &Cells<K, V> {
        // SAFETY: this guard holds the shared latch.
        unsafe { self.node.cells_unchecked() }
    }
}

impl<K, V> Drop for NodeReadLatch<K, V> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the shared latch it is releasing.
        unsafe { self.node.latch().unlock_shared() }
    }
}

impl<K, V> NodeWriteLatch<K, V> {
    /// Acquire an exclusive latch on `node`, or `None` on timeout.
    pub(crate) fn acquire(node: &NodeRef<K, V>, deadline: &Deadline) -> Option<Self> {
        let acquired: bool = timed_acquire!(
            node.latch(),
            deadline,
            lock_exclusive,
            try_lock_exclusive,
            try_lock_exclusive_for
        );

        acquired.then(|| Self {
            node: NodeRef::clone(node),
            _not_send: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn node(&self) -> &NodeRef<K, V> {
        &self.node
    }

    #[inline]
    pub(crate) fn cells(&self) -> &Cells<K, V> {
        // SAFETY: this guard holds the exclusive latch.
        unsafe { self.node.cells_unchecked() }
    }

    #[inline]
    pub(crate) fn cells_mut(&mut self) -> &mut Cells<K, V> {
        // SAFETY: this guard holds the exclusive latch; `&mut self` prevents
        // a second live reference through the same guard.
        unsafe { self.node.cells_mut_unchecked() }
    }
}

impl<K, V> Drop for NodeWriteLatch<K, V> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the exclusive latch it is releasing.
        unsafe { self.node.latch().unlock_exclusive() }
    }
}

/// A held latch of either polarity.
pub(crate) enum NodeLatch<K, V> {
    Read(NodeReadLatch<K, V>),
    Write(NodeWriteLatch<K, V>),
}

impl<K, V> NodeLatch<K, V> {
    #[inline]
    pub(crate) fn node(&self) -> &NodeRef<K, V> {
        match self {
            Self::Read(latch) => latch.node(),

            Self::Write(latch) => latch.node(),
        }
    }

    #[inline]
    pub(crate) fn cells(&self) -> &Cells<K, V> {
        match self {
            Self::Read(latch) => latch.cells(),

            Self::Write(latch) => latch.cells(),
        }
    }

    /// The write guard beneath; panics if this latch is shared.
    #[inline]
    pub(crate) fn expect_write(&mut self) -> &mut NodeWriteLatch<K, V> {
        match self {
            Self::Write(latch) => latch,

            Self::Read(_) => unreachable!("write access through a shared latch"),
        }
    }
}

// ============================================================================
//  Root-pointer guard
// ============================================================================

/// Guard on the tree's root *pointer* (not the root node's contents).
pub(crate) enum RootGuard<'t, K, V> {
    Read(RwLockReadGuard<'t, NodeRef<K, V>>),
    Write(RwLockWriteGuard<'t, NodeRef<K, V>>),
}

impl<K, V> Deref for RootGuard<'_, K, V> {
    type Target = NodeRef<K, V>;

    fn deref(&self) -> &NodeRef<K, V> {
        match self {
            Self::Read(guard) => guard,

            Self::Write(guard) => guard,
        }
    }
}

impl<K, V> RootGuard<'_, K, V> {
    /// The root slot, writable; panics if the guard is shared.
    pub(crate) fn slot_mut(&mut self) -> &mut NodeRef<K, V> {
        match self {
            Self::Write(guard) => guard.deref_mut(),

            Self::Read(_) => unreachable!("root swap through a shared root guard"),
        }
    }
}

// ============================================================================
//  LatchChain
// ============================================================================

/// Maximum number of node latches a pessimistic descent may hold; one more
/// than the deepest supported tree.
pub(crate) const CHAIN_BOUND: usize = 32;

/// The latches held by one in-flight operation, in descent order.
pub(crate) struct LatchChain<'t, K, V> {
    root_guard: Option<RootGuard<'t, K, V>>,
    latches: SmallVec<[NodeLatch<K, V>; 2]>,

    /// Whether `latches[0]` latches the node installed in the root slot.
    first_is_root: bool,
}

impl<'t, K, V> LatchChain<'t, K, V> {
    pub(crate) fn new(root_guard: RootGuard<'t, K, V>) -> Self {
        Self {
            root_guard: Some(root_guard),
            latches: SmallVec::new(),
            first_is_root: true,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.latches.len()
    }

    #[inline]
    pub(crate) fn latch(&self, level: usize) -> &NodeLatch<K, V> {
        &self.latches[level]
    }

    #[inline]
    pub(crate) fn latch_mut(&mut self, level: usize) -> &mut NodeLatch<K, V> {
        &mut self.latches[level]
    }

    #[inline]
    pub(crate) fn top(&self) -> &NodeLatch<K, V> {
        self.latches.last().expect("latch chain is empty")
    }

    #[inline]
    pub(crate) fn top_mut(&mut self) -> &mut NodeLatch<K, V> {
        self.latches.last_mut().expect("latch chain is empty")
    }

    /// Whether the bottom of the chain still latches the root node (and the
    /// root-pointer guard is therefore still held for a pessimistic writer).
    #[inline]
    pub(crate) fn holds_root(&self) -> bool {
        self.first_is_root && !self.latches.is_empty()
    }

    /// The root-pointer guard, for root swaps. Panics if already released.
    pub(crate) fn root_guard_mut(&mut self) -> &mut RootGuard<'t, K, V> {
        self.root_guard.as_mut().expect("root guard already released")
    }

    /// The node currently installed in the root slot. Panics if the
    /// root-pointer guard was already released.
    pub(crate) fn root_node(&self) -> NodeRef<K, V> {
        let guard: &RootGuard<'t, K, V> = self
            .root_guard
            .as_ref()
            .expect("root guard already released");
        NodeRef::clone(&**guard)
    }

    pub(crate) fn push(&mut self, latch: NodeLatch<K, V>) {
        debug_assert!(self.latches.len() < CHAIN_BOUND);
        self.latches.push(latch);
    }

    /// Coupled release: keep only the most recent latch and drop the
    /// root-pointer guard. Used by reads and optimistic descents, where the
    /// ancestor latch has done its job once the child is latched.
    pub(crate) fn couple_release(&mut self) {
        let held: usize = self.latches.len();
        if held > 1 {
            self.latches.drain(..held - 1);
        }
        self.root_guard = None;
        self.first_is_root = false;
    }

    /// Crab release: a pessimistic descent proved the newest node safe, so
    /// every strict ancestor can go. The root-pointer guard is kept only
    /// while the remaining latch is the root node itself.
    pub(crate) fn crab_release(&mut self) {
        let held: usize = self.latches.len();
        if held > 1 {
            self.latches.drain(..held - 1);
            self.first_is_root = false;
        }
        if !self.first_is_root {
            self.root_guard = None;
        }
    }

    /// Release everything now, newest latch first, root-pointer guard last.
    pub(crate) fn release_all(&mut self) {
        while self.latches.pop().is_some() {}
        self.root_guard = None;
        self.first_is_root = false;
    }
}

impl<K, V> Drop for LatchChain<'_, K, V> {
    fn drop(&mut self) {
        self.release_all();
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(0), Timeout::Immediate);
        assert_eq!(
            Timeout::from_millis(25),
            Timeout::Bounded(Duration::from_millis(25))
        );
    }

    #[test]
    #[should_panic(expected = "negative timeout")]
    fn test_timeout_rejects_negative() {
        let _ = Timeout::from_millis(-2);
    }

    #[test]
    fn test_deadline_drains_to_immediate() {
        let deadline = Deadline::start(Timeout::Bounded(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(deadline.remaining(), Timeout::Immediate);
    }

    #[test]
    fn test_write_latch_excludes_readers() {
        let node: NodeRef<i32, i32> = Node::new_leaf(4);
        let immediate = Deadline::start(Timeout::Immediate);
        let infinite = Deadline::start(Timeout::Infinite);

        let write = NodeWriteLatch::acquire(&node, &infinite).unwrap();
        assert!(NodeReadLatch::acquire(&node, &immediate).is_none());
        assert!(NodeWriteLatch::acquire(&node, &immediate).is_none());
        drop(write);

        let read_a = NodeReadLatch::acquire(&node, &immediate).unwrap();
        let read_b = NodeReadLatch::acquire(&node, &immediate).unwrap();
        assert!(NodeWriteLatch::acquire(&node, &immediate).is_none());
        drop(read_a);
        drop(read_b);

        assert!(NodeWriteLatch::acquire(&node, &immediate).is_some());
    }
}

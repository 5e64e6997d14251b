//! Ordered enumeration over bounded-depth subtree latches.
//!
//! Rather than pin the whole tree under one read latch for the duration of
//! an enumeration, the iterator repeatedly descends to a *subtree*: the node
//! a couple of levels above the leaves on the path to the current boundary
//! key. The subtree is drained — depth-first, each node under its own shared
//! latch — into a buffer, every latch is dropped, and the buffer is yielded
//! entry by entry. No latch is ever held across a caller's pause.
//!
//! Between descents the tree may have been rebalanced, so two guards keep the
//! output exact:
//!
//! - the **boundary**: the deepest sibling separator recorded during the
//!   previous descent, which is where the next subtree begins;
//! - the **fence**: the last key yielded, filtering out entries a concurrent
//!   split may have shuffled into the next subtree.
//!
//! The enumeration is locally consistent — each subtree is a snapshot under
//! its latches — but deliberately not a global snapshot; concurrent mutations
//! on subtrees already passed or not yet reached are visible or not depending
//! on timing.

use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};

use crate::latch::{Deadline, NodeReadLatch, Timeout};
use crate::node::{Cells, NodeRef};

use super::traverse::{DescentEnd, DescentRequest, Target};
use super::{LatchTree, TimedOut};

/// Height of the subtree latched per descent: its root sits this many levels
/// above the leaves, so one descent drains at most `order ^ SUBTREE_HEIGHT`
/// entries before the latches drop.
const SUBTREE_HEIGHT: usize = 2;

// ============================================================================
//  Construction
// ============================================================================

impl<K: Ord + Clone, V: Clone> LatchTree<K, V> {
    /// Enumerate all entries in ascending key order.
    ///
    /// Entries are yielded as owned clones; the iterator never holds a latch
    /// between `next` calls. Latch waits are unbounded — see
    /// [`Iter::with_timeout`] for a budgeted variant.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        self.range(..)
    }

    /// Enumerate the entries whose keys fall in `range`, ascending.
    ///
    /// # Panics
    ///
    /// Panics if the range start is greater than its end, or if both are the
    /// same excluded bound.
    #[must_use]
    pub fn range<R: RangeBounds<K>>(&self, range: R) -> Iter<'_, K, V> {
        let lower: Bound<K> = range.start_bound().cloned();
        let upper: Bound<K> = range.end_bound().cloned();

        match (&lower, &upper) {
            (
                Bound::Included(start) | Bound::Excluded(start),
                Bound::Included(end) | Bound::Excluded(end),
            ) => {
                assert!(start <= end, "range start is greater than range end");
                if let (Bound::Excluded(start), Bound::Excluded(end)) = (&lower, &upper) {
                    assert!(start != end, "range start and end are equal and excluded");
                }
            }

            _ => {}
        }

        Iter {
            cursor: Cursor::new(self, lower, upper),
        }
    }
}

// ============================================================================
//  Iterators
// ============================================================================

/// Ordered enumeration with unbounded latch waits. Created by
/// [`LatchTree::iter`] and [`LatchTree::range`].
pub struct Iter<'t, K, V> {
    cursor: Cursor<'t, K, V>,
}

impl<'t, K: Ord + Clone, V: Clone> Iter<'t, K, V> {
    /// Flip to descending order.
    ///
    /// # Panics
    ///
    /// Panics if the iteration has already yielded an entry.
    #[must_use]
    pub fn rev(mut self) -> Self {
        assert!(
            !self.cursor.started,
            "direction must be chosen before iterating"
        );
        self.cursor.reverse = true;
        self
    }

    /// Budget every subtree descent with `timeout`; the resulting iterator
    /// yields `Err(TimedOut)` (once, then fuses) if a descent exceeds it.
    #[must_use]
    pub fn with_timeout(self, timeout: Timeout) -> TryIter<'t, K, V> {
        TryIter {
            cursor: self.cursor,
            timeout,
        }
    }
}

impl<K: Ord + Clone, V: Clone> Iterator for Iter<'_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        match self.cursor.next_entry(Timeout::Infinite) {
            Ok(entry) => entry,

            Err(TimedOut) => unreachable!("unbounded latch waits cannot time out"),
        }
    }
}

/// Ordered enumeration with a per-descent latch budget. Created by
/// [`Iter::with_timeout`].
pub struct TryIter<'t, K, V> {
    cursor: Cursor<'t, K, V>,
    timeout: Timeout,
}

impl<K: Ord + Clone, V: Clone> Iterator for TryIter<'_, K, V> {
    type Item = Result<(K, V), TimedOut>;

    fn next(&mut self) -> Option<Result<(K, V), TimedOut>> {
        match self.cursor.next_entry(self.timeout) {
            Ok(Some(entry)) => Some(Ok(entry)),

            Ok(None) => None,

            Err(timed_out) => {
                self.cursor.finished = true;
                Some(Err(timed_out))
            }
        }
    }
}

// ============================================================================
//  Cursor
// ============================================================================

/// Shared machinery behind [`Iter`] and [`TryIter`].
struct Cursor<'t, K, V> {
    tree: &'t LatchTree<K, V>,

    /// Entries drained from the current subtree, already filtered.
    buf: VecDeque<(K, V)>,

    reverse: bool,
    started: bool,
    finished: bool,

    /// Where the next subtree descent aims: the deepest sibling separator
    /// recorded by the previous descent.
    boundary: Option<K>,

    /// The last key yielded; later subtrees are filtered strictly past it.
    fence: Option<K>,

    lower: Bound<K>,
    upper: Bound<K>,
}

impl<'t, K: Ord + Clone, V: Clone> Cursor<'t, K, V> {
    fn new(tree: &'t LatchTree<K, V>, lower: Bound<K>, upper: Bound<K>) -> Self {
        Self {
            tree,
            buf: VecDeque::new(),
            reverse: false,
            started: false,
            finished: false,
            boundary: None,
            fence: None,
            lower,
            upper,
        }
    }

    /// Yield the next in-range entry, refilling from the tree as needed.
    /// Each refill descent gets a fresh `timeout` budget.
    fn next_entry(&mut self, timeout: Timeout) -> Result<Option<(K, V)>, TimedOut> {
        loop {
            if let Some(entry) = self.buf.pop_front() {
                self.fence = Some(entry.0.clone());
                return Ok(Some(entry));
            }
            if self.finished {
                return Ok(None);
            }
            self.fill(&Deadline::start(timeout))?;
        }
    }

    /// Drain one subtree into the buffer.
    fn fill(&mut self, deadline: &Deadline) -> Result<(), TimedOut> {
        if self.started && self.boundary.is_none() {
            // The previous subtree was the outermost one in this direction.
            self.finished = true;
            return Ok(());
        }

        let max_depth: usize = self.tree.depth().saturating_sub(SUBTREE_HEIGHT);

        let mut reached = {
            let target: Target<'_, K> = if self.started {
                let boundary: &K = self.boundary.as_ref().expect("boundary checked above");
                if self.reverse {
                    Target::Below(boundary)
                } else {
                    Target::Key(boundary)
                }
            } else if self.reverse {
                match &self.upper {
                    Bound::Unbounded => Target::Max,

                    Bound::Included(end) => Target::Key(end),

                    Bound::Excluded(end) => Target::Below(end),
                }
            } else {
                match &self.lower {
                    Bound::Unbounded => Target::Min,

                    Bound::Included(start) | Bound::Excluded(start) => Target::Key(start),
                }
            };

            match self
                .tree
                .descend(&DescentRequest::subtree(target, max_depth), deadline)
            {
                DescentEnd::TimedOut => return Err(TimedOut),

                DescentEnd::Reached(reached) => reached,

                DescentEnd::UnsafeLeaf | DescentEnd::UnsafeLeafRetained(_) => {
                    unreachable!("read descents have no unsafe leaves")
                }
            }
        };

        let mut collected: Vec<(K, V)> = Vec::new();
        collect_latched(reached.chain.top().cells(), deadline, self.reverse, &mut collected)?;

        self.boundary = if self.reverse {
            reached.prev_sep.take()
        } else {
            reached.next_sep.take()
        };
        // Latches drop before any entry is yielded.
        drop(reached);

        self.started = true;
        if self.boundary.is_none() {
            self.finished = true;
        }

        for (key, value) in collected {
            if self.reverse {
                if self.above_upper(&key) {
                    continue;
                }
                if matches!(&self.fence, Some(fence) if key >= *fence) {
                    continue;
                }
                if self.below_lower(&key) {
                    // Descending past the range start: nothing further
                    // qualifies.
                    self.finished = true;
                    break;
                }
            } else {
                if self.below_lower(&key) {
                    continue;
                }
                if matches!(&self.fence, Some(fence) if key <= *fence) {
                    continue;
                }
                if self.above_upper(&key) {
                    // Ascending past the range end: nothing further
                    // qualifies.
                    self.finished = true;
                    break;
                }
            }
            self.buf.push_back((key, value));
        }

        Ok(())
    }

    fn below_lower(&self, key: &K) -> bool {
        match &self.lower {
            Bound::Unbounded => false,

            Bound::Included(start) => key < start,

            Bound::Excluded(start) => key <= start,
        }
    }

    fn above_upper(&self, key: &K) -> bool {
        match &self.upper {
            Bound::Unbounded => false,

            Bound::Included(end) => key > end,

            Bound::Excluded(end) => key >= end,
        }
    }
}

// ============================================================================
//  Subtree draining
// ============================================================================

/// Clone a latched node's entries into `out` in direction order, latching
/// each descendant with its own shared latch while its parent's is held.
fn collect_latched<K: Clone, V: Clone>(
    cells: &Cells<K, V>,
    deadline: &Deadline,
    reverse: bool,
    out: &mut Vec<(K, V)>,
) -> Result<(), TimedOut> {
    match cells {
        Cells::Leaf(entries) => {
            if reverse {
                out.extend(entries.iter().rev().cloned());
            } else {
                out.extend(entries.iter().cloned());
            }
            Ok(())
        }

        Cells::Branch(entries) => {
            if reverse {
                for entry in entries.iter().rev() {
                    collect_child(&entry.child, deadline, reverse, out)?;
                }
            } else {
                for entry in entries {
                    collect_child(&entry.child, deadline, reverse, out)?;
                }
            }
            Ok(())
        }
    }
}

fn collect_child<K: Clone, V: Clone>(
    child: &NodeRef<K, V>,
    deadline: &Deadline,
    reverse: bool,
    out: &mut Vec<(K, V)>,
) -> Result<(), TimedOut> {
    let latch: NodeReadLatch<K, V> =
        NodeReadLatch::acquire(child, deadline).ok_or(TimedOut)?;
    collect_latched(latch.cells(), deadline, reverse, out)
}

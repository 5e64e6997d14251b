//! Root-to-leaf descent under the latch-crabbing protocol.
//!
//! A descent walks from the root pointer toward a terminal node — the leaf
//! for the target key, or the subtree root at a caller-supplied depth bound
//! for iteration — acquiring latches per the operation's intent:
//!
//! - **Read / optimistic**: shared latches in coupling pairs down the path;
//!   a mutation intent write-latches only the leaf. If the leaf turns out
//!   unable to absorb the mutation, the descent reports an unsafe leaf
//!   (retaining the leaf latch for `*Test` intents) and the caller retries
//!   pessimistically.
//! - **Pessimistic**: exclusive latches all the way down, crab-releasing
//!   ancestors as soon as a node proves safe, so the surviving chain is
//!   exactly the path rebalancing will walk back up.
//!
//! A child's latch is always acquired before any ancestor latch is released,
//! so no writer can slip between a descent and its next target.

use crate::latch::{
    Deadline, LatchChain, LatchIntent, NodeLatch, NodeReadLatch, NodeWriteLatch, RootGuard, Timeout,
};
use crate::node::{Cells, NodeRef};

use super::LatchTree;

// ============================================================================
//  Request / result types
// ============================================================================

/// Where a descent is headed.
#[derive(Debug)]
pub(crate) enum Target<'a, K> {
    /// Follow child 0 at every level (minimum key).
    Min,

    /// Follow the last child at every level (maximum key).
    Max,

    /// Standard key descent; a key equal to a separator follows that child.
    Key(&'a K),

    /// Descend toward the greatest keys strictly below the given bound;
    /// a key equal to a separator goes to the child on the left.
    Below(&'a K),
}

// Manual impls: the derives would demand `K: Copy` even though the variants
// only hold references.
impl<K> Clone for Target<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Target<'_, K> {}

/// Parameters for one descent.
pub(crate) struct DescentRequest<'a, K> {
    pub(crate) target: Target<'a, K>,
    pub(crate) intent: LatchIntent,
    pub(crate) pessimistic: bool,

    /// Stop at this depth (root = 0) instead of the leaf. Read intent only.
    pub(crate) max_depth: Option<usize>,

    /// Record the sibling-subtree boundary separators seen on the path.
    pub(crate) record_bounds: bool,
}

impl<'a, K> DescentRequest<'a, K> {
    /// A full-depth point descent for the given intent.
    pub(crate) fn point(target: Target<'a, K>, intent: LatchIntent, pessimistic: bool) -> Self {
        Self {
            target,
            intent,
            pessimistic,
            max_depth: None,
            record_bounds: false,
        }
    }

    /// A bounded-depth read descent for iteration.
    pub(crate) fn subtree(target: Target<'a, K>, max_depth: usize) -> Self {
        Self {
            target,
            intent: LatchIntent::Read,
            pessimistic: false,
            max_depth: Some(max_depth),
            record_bounds: true,
        }
    }
}

/// A completed descent: the chain (terminal latch on top) plus what the walk
/// observed on the way down.
pub(crate) struct Reached<'t, K, V> {
    pub(crate) chain: LatchChain<'t, K, V>,

    /// Entry index of the target key in the terminal leaf, if it matched.
    pub(crate) found: Option<usize>,

    /// Insertion slot for the target key in the terminal leaf.
    pub(crate) slot: usize,

    /// Number of levels on the path (1 = the terminal node is the root).
    pub(crate) depth: usize,

    /// Deepest right-sibling separator on the path: the minimum key of the
    /// next subtree after the terminal one, if any.
    pub(crate) next_sep: Option<K>,

    /// Deepest followed-child separator on the path: every key of the
    /// preceding sibling subtrees is strictly below it, if any.
    pub(crate) prev_sep: Option<K>,
}

/// Outcome of a descent.
pub(crate) enum DescentEnd<'t, K, V> {
    /// Terminal node latched per the intent.
    Reached(Reached<'t, K, V>),

    /// A latch acquisition exceeded the budget; every latch was released.
    TimedOut,

    /// Optimistic descent found the leaf unable to absorb the mutation; the
    /// chain was released. Retry pessimistically.
    UnsafeLeaf,

    /// Same, but the intent was a `*Test`: the leaf's write latch is retained
    /// (alone) so the caller can settle the condition before re-descending.
    UnsafeLeafRetained(Reached<'t, K, V>),
}

// ============================================================================
//  Descent
// ============================================================================

impl<K: Ord + Clone, V> LatchTree<K, V> {
    /// Acquire the root-pointer lock per the deadline.
    pub(crate) fn lock_root(
        &self,
        exclusive: bool,
        deadline: &Deadline,
    ) -> Option<RootGuard<'_, K, V>> {
        match deadline.remaining() {
            Timeout::Infinite => Some(if exclusive {
                RootGuard::Write(self.root.write())
            } else {
                RootGuard::Read(self.root.read())
            }),

            Timeout::Immediate => {
                if exclusive {
                    self.root.try_write().map(RootGuard::Write)
                } else {
                    self.root.try_read().map(RootGuard::Read)
                }
            }

            Timeout::Bounded(left) => {
                if exclusive {
                    self.root.try_write_for(left).map(RootGuard::Write)
                } else {
                    self.root.try_read_for(left).map(RootGuard::Read)
                }
            }
        }
    }

    /// Descend from the root per `request`, acquiring latches as we go.
    pub(crate) fn descend(
        &self,
        request: &DescentRequest<'_, K>,
        deadline: &Deadline,
    ) -> DescentEnd<'_, K, V> {
        debug_assert!(
            request.max_depth.is_none() || request.intent == LatchIntent::Read,
            "depth-bounded descents are read-only"
        );
        debug_assert!(
            request.intent.is_mutation() || !request.pessimistic,
            "read descents are never pessimistic"
        );

        let exclusive_root: bool = request.pessimistic && request.intent.is_mutation();
        let Some(root_guard) = self.lock_root(exclusive_root, deadline) else {
            return DescentEnd::TimedOut;
        };

        let mut chain: LatchChain<'_, K, V> = LatchChain::new(root_guard);
        let mut node: NodeRef<K, V> = chain.root_node();
        let mut depth_idx: usize = 0;
        let mut next_sep: Option<K> = None;
        let mut prev_sep: Option<K> = None;

        loop {
            // The leaf of a mutation gets an exclusive latch even on the
            // optimistic pass; `is_leaf` is immutable, so the polarity is
            // known before latching.
            let want_exclusive: bool =
                request.intent.is_mutation() && (request.pessimistic || node.is_leaf());

            let latch: NodeLatch<K, V> = if want_exclusive {
                match NodeWriteLatch::acquire(&node, deadline) {
                    Some(latch) => NodeLatch::Write(latch),

                    None => return DescentEnd::TimedOut,
                }
            } else {
                match NodeReadLatch::acquire(&node, deadline) {
                    Some(latch) => NodeLatch::Read(latch),

                    None => return DescentEnd::TimedOut,
                }
            };
            chain.push(latch);

            if request.pessimistic {
                if chain.top().cells().is_safe_for(request.intent, self.order) {
                    chain.crab_release();
                }
            } else {
                chain.couple_release();
            }

            if node.is_leaf() {
                let (found, slot) = match request.target {
                    Target::Key(key) => match chain.top().cells().leaf_search(key) {
                        Ok(index) => (Some(index), index),

                        Err(insert_slot) => (None, insert_slot),
                    },

                    Target::Min | Target::Max | Target::Below(_) => (None, 0),
                };

                let unsafe_leaf: bool = request.intent.is_mutation()
                    && !request.pessimistic
                    && !chain.top().cells().is_safe_for(request.intent, self.order);

                let reached = Reached {
                    chain,
                    found,
                    slot,
                    depth: depth_idx + 1,
                    next_sep,
                    prev_sep,
                };

                if unsafe_leaf {
                    if request.intent.is_test() {
                        return DescentEnd::UnsafeLeafRetained(reached);
                    }
                    // Dropping `reached` releases the leaf latch.
                    return DescentEnd::UnsafeLeaf;
                }

                return DescentEnd::Reached(reached);
            }

            if request.max_depth == Some(depth_idx) {
                // Terminal subtree root for a bounded descent.
                return DescentEnd::Reached(Reached {
                    chain,
                    found: None,
                    slot: 0,
                    depth: depth_idx + 1,
                    next_sep,
                    prev_sep,
                });
            }

            let child: NodeRef<K, V> = {
                let cells: &Cells<K, V> = chain.top().cells();
                let child_slot: usize = match request.target {
                    Target::Min => 0,

                    Target::Max => cells.len() - 1,

                    Target::Key(key) => cells.child_slot(key, false),

                    Target::Below(bound) => cells.child_slot(bound, true),
                };

                let entries = cells.branch();
                if request.record_bounds {
                    if let Some(entry) = entries.get(child_slot + 1) {
                        next_sep.clone_from(&entry.separator);
                    }
                    if child_slot > 0 {
                        prev_sep.clone_from(&entries[child_slot].separator);
                    }
                }

                NodeRef::clone(&entries[child_slot].child)
            };

            node = child;
            depth_idx += 1;
        }
    }
}

//! # latchtree
//!
//! A concurrent ordered map backed by a B+ tree with per-node reader–writer
//! latches.
//!
//! [`LatchTree`] supports concurrent point operations (insert, conditional
//! insert, get-or-insert, remove, lookup) and ordered traversal (forward,
//! reverse, ranges), with millisecond-grained timeouts on lock acquisition.
//!
//! ## Design
//!
//! - Keys live in fixed-capacity leaf nodes; branch nodes carry only separator
//!   keys and child references. The left-most branch slot has no separator
//!   (logical negative infinity).
//! - Descents use latch crabbing: an optimistic pass read-latches the path and
//!   write-latches only the leaf, falling back to a pessimistic
//!   write-all-the-way pass when the leaf cannot absorb the mutation without
//!   rebalancing. Writers on disjoint subtrees make independent progress.
//! - Splits and merges walk back up the latches the descent already holds, so
//!   rebalancing never acquires locks out of descent order.
//! - Iteration latches one bounded-depth subtree at a time instead of the
//!   whole tree.
//!
//! ## Example
//!
//! ```rust
//! use latchtree::{LatchTree, Timeout};
//!
//! let map: LatchTree<u64, String> = LatchTree::new();
//! map.insert(1, "one".into(), Timeout::Infinite).unwrap();
//! map.insert(2, "two".into(), Timeout::Infinite).unwrap();
//!
//! assert_eq!(map.get(&1, Timeout::Infinite).unwrap().as_deref(), Some("one"));
//! let keys: Vec<u64> = map.iter().map(|(k, _)| k).collect();
//! assert_eq!(keys, vec![1, 2]);
//! ```

pub mod latch;
pub mod tree;

mod node;
mod tracing_support;

pub use latch::Timeout;
pub use tree::iter::{Iter, TryIter};
pub use tree::{InsertError, LatchTree, TimedOut};

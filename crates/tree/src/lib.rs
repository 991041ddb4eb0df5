//! Sync tree data model: composite nodes, the per-slice hash cache, and the
//! cursors used to walk rooted trees.
//!
//! A slice's name set is represented as a rooted DAG of [`TreeNode`]s,
//! identified by content hash and shared through the [`HashCache`]. The
//! engine crate drives tree construction and reconciliation; this crate owns
//! the data structures and their invariants:
//!
//! - entries within a node are strictly ordered by name;
//! - adjacent child subtrees do not overlap (`C_i.max < C_{i+1}.min`);
//! - a node's identity hash is the XOR-fold of its descendants' leaf
//!   digests, so equal name sets yield equal hashes.

pub mod accum;
pub mod cache;
pub mod error;
pub mod node;
pub mod walker;

pub use accum::{IndexSorter, NameAccum};
pub use cache::{CacheEntry, EntryState, HashCache, PurgeOutcome};
pub use error::TreeError;
pub use node::{node_from_names, NodeBuilder, NodeEntry, SpanCmp, TreeNode};
pub use walker::{TreeWalker, WalkerFrame};

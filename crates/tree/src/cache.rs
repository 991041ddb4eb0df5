//! Content-addressed cache of local and remote tree nodes.
//!
//! Every hash the engine has ever seen for a slice, locally built or
//! remotely advertised, gets one [`CacheEntry`]. Entries carry the decoded
//! node (local and/or remote view), the retained canonical encoding, state
//! flags, and the bookkeeping the purge and durability paths need. The cache
//! owns its entries; roots and walkers refer to them by hash only, so
//! reachability is recomputed with [`HashCache::mark_reachable`] rather than
//! reference counting.

use std::collections::HashMap;
use std::sync::Arc;

use slicesync_primitives::{HighWater, NodeHash};
use tracing::debug;

use crate::error::TreeError;
use crate::node::{NodeEntry, TreeNode};

/// State flags of a cache entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryState {
    /// A locally built node with this hash exists (or once existed).
    pub local: bool,
    /// The hash was advertised or referenced by a peer.
    pub remote: bool,
    /// Every leaf beneath this hash is already present in some local tree.
    /// Sticky until the entry is evicted.
    pub covered: bool,
    /// A NodeFetch for this hash is in flight.
    pub fetching: bool,
    /// Queued for durable storage.
    pub storing: bool,
    /// The encoding has been handed to storage.
    pub stored: bool,
    /// Reachability mark, valid only between `clear_marks` and `purge`.
    pub marked: bool,
}

impl EntryState {
    pub const LOCAL: EntryState = EntryState {
        local: true,
        remote: false,
        covered: false,
        fetching: false,
        storing: false,
        stored: false,
        marked: false,
    };

    pub const REMOTE: EntryState = EntryState {
        local: false,
        remote: true,
        covered: false,
        fetching: false,
        storing: false,
        stored: false,
        marked: false,
    };

    fn merge(&mut self, other: EntryState) {
        self.local |= other.local;
        self.remote |= other.remote;
        self.covered |= other.covered;
        self.fetching |= other.fetching;
        self.storing |= other.storing;
        self.stored |= other.stored;
        self.marked |= other.marked;
    }
}

/// One cache slot, keyed by node hash.
#[derive(Debug)]
pub struct CacheEntry {
    hash: NodeHash,
    /// Canonical encoding, retained for decode-on-demand and transmission.
    pub encoding: Option<Arc<Vec<u8>>>,
    /// Decoded node as built locally.
    pub local_node: Option<Arc<TreeNode>>,
    /// Decoded node as fetched from a peer.
    pub remote_node: Option<Arc<TreeNode>>,
    pub state: EntryState,
    /// Microsecond timestamp of the last touch.
    pub last_used: u64,
    /// Microsecond timestamp of the last remote sighting.
    pub last_remote_fetch: u64,
    /// High-water mark to commit when this node reaches durable storage.
    pub stable_point: HighWater,
    /// Pin count held by remote-seen bookkeeping.
    pub busy: u32,
}

impl CacheEntry {
    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    /// The decoded node under the given bias, if present.
    pub fn node(&self, remote: bool) -> Option<&Arc<TreeNode>> {
        if remote {
            self.remote_node.as_ref()
        } else {
            self.local_node.as_ref()
        }
    }

    /// Covered check: a local entry is covered by definition.
    pub fn is_covered(&self) -> bool {
        self.state.covered || self.state.local
    }

    /// Marks the subtree covered. Only meaningful for remotely-seen hashes;
    /// the flag is sticky for the entry's lifetime.
    pub fn set_covered(&mut self) {
        if !self.state.covered && self.state.remote {
            debug!(hash = %self.hash, "subtree covered");
            self.state.covered = true;
        }
    }

    /// Installs a locally built node, retaining its encoding.
    pub fn install_local(&mut self, node: Arc<TreeNode>, now: u64) {
        if self.encoding.is_none() {
            self.encoding = Some(Arc::new(node.encode()));
        }
        self.local_node = Some(node);
        self.state.local = true;
        if self.state.remote {
            self.state.covered = true;
        }
        self.last_used = now;
    }

    /// Installs a node decoded from a peer's response.
    pub fn install_remote(&mut self, node: Arc<TreeNode>, now: u64) {
        self.remote_node = Some(node);
        self.state.remote = true;
        self.state.fetching = false;
        self.last_used = now;
        self.last_remote_fetch = now;
    }
}

/// What a purge pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Decoded local nodes dropped from stored, unreachable entries.
    pub nodes_dropped: usize,
    /// Remote-only entries evicted outright.
    pub entries_evicted: usize,
}

/// Map from node hash to cache entry for one slice.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: HashMap<NodeHash, CacheEntry>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Idempotent insert: creates the entry if needed, otherwise ORs
    /// `state` into the existing flags. A hash seen both locally and
    /// remotely becomes covered.
    pub fn enter(&mut self, hash: NodeHash, state: EntryState, now: u64) -> &mut CacheEntry {
        let entry = self.entries.entry(hash).or_insert_with(|| CacheEntry {
            hash,
            encoding: None,
            local_node: None,
            remote_node: None,
            state: EntryState::default(),
            last_used: now,
            last_remote_fetch: 0,
            stable_point: HighWater::NULL,
            busy: 0,
        });
        entry.state.merge(state);
        if entry.state.local && entry.state.remote {
            entry.state.covered = true;
        }
        entry.last_used = now;
        entry
    }

    pub fn lookup(&self, hash: &NodeHash) -> Option<&CacheEntry> {
        self.entries.get(hash)
    }

    pub fn lookup_mut(&mut self, hash: &NodeHash) -> Option<&mut CacheEntry> {
        self.entries.get_mut(hash)
    }

    pub fn contains(&self, hash: &NodeHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Resolves the decoded local node for `hash`, decoding the retained
    /// encoding on demand.
    pub fn fetch_local(&mut self, hash: &NodeHash) -> Result<Arc<TreeNode>, TreeError> {
        let entry = self
            .entries
            .get_mut(hash)
            .ok_or(TreeError::MissingEntry(*hash))?;
        if let Some(node) = &entry.local_node {
            return Ok(Arc::clone(node));
        }
        let encoding = entry
            .encoding
            .as_ref()
            .ok_or(TreeError::NodeNotDecoded(*hash))?;
        let node = Arc::new(TreeNode::decode(encoding)?);
        entry.local_node = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Clears all reachability marks.
    pub fn clear_marks(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state.marked = false;
        }
    }

    /// Marks every entry reachable from `root` through decoded nodes under
    /// the given bias.
    pub fn mark_reachable(&mut self, root: NodeHash, remote: bool) {
        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            let Some(entry) = self.entries.get_mut(&hash) else {
                continue;
            };
            if entry.state.marked {
                continue;
            }
            entry.state.marked = true;
            if let Some(node) = entry.node(remote) {
                for child in node.entries() {
                    if let NodeEntry::Node(child_hash) = child {
                        stack.push(*child_hash);
                    }
                }
            }
        }
    }

    /// Reclaims memory from entries that are not marked reachable and have
    /// been idle longer than `threshold` microseconds.
    ///
    /// Stored local entries lose their decoded node (the encoding can be
    /// re-fetched from storage); remote-only, un-pinned entries are evicted
    /// entirely. Call `clear_marks` + `mark_reachable` for every live root
    /// first.
    pub fn purge(&mut self, now: u64, threshold: u64) -> PurgeOutcome {
        let mut outcome = PurgeOutcome::default();
        self.entries.retain(|hash, entry| {
            if entry.state.marked || entry.busy > 0 {
                return true;
            }
            if now.saturating_sub(entry.last_used) <= threshold {
                return true;
            }
            if entry.state.local {
                if entry.state.stored && entry.local_node.is_some() {
                    entry.local_node = None;
                    outcome.nodes_dropped += 1;
                    debug!(hash = %hash, "dropped idle decoded node");
                }
                true
            } else if entry.state.fetching || entry.state.storing {
                true
            } else {
                outcome.entries_evicted += 1;
                debug!(hash = %hash, "evicted idle remote entry");
                false
            }
        });
        outcome
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }
}

//! Per-slice engine state.

use core::fmt::Write as _;
use std::collections::VecDeque;

use slicesync_primitives::{Accession, HighWater, Name, NodeHash, SliceConfig};
use slicesync_tree::{HashCache, NameAccum};
use tracing::debug;

use crate::actions::ActionId;
use crate::compare::Compare;
use crate::config::Micros;
use crate::stats::{format_instant, RootStats};
use crate::update::Update;

/// Engine-local identifier of a root.
pub type RootId = u32;

/// One remembered peer root hash. The list is kept most-recently-seen
/// first.
#[derive(Clone, Copy, Debug)]
pub struct RemoteHash {
    pub hash: NodeHash,
    pub last_seen: Micros,
}

/// All mutable state for one slice.
#[derive(Debug)]
pub struct Root {
    pub id: RootId,
    pub config: SliceConfig,
    pub slice_hash: NodeHash,

    /// Hash of the current local tree; `None` until the first Update lands.
    pub current_hash: Option<NodeHash>,
    /// Leaves in the current tree.
    pub current_size: u64,
    pub cache: HashCache,

    /// Names accepted for this slice, awaiting the next Update.
    pub names_to_add: NameAccum,
    /// Names a Compare decided we are missing.
    pub names_to_fetch: NameAccum,

    /// Outstanding actions owned by this root (sent state).
    pub actions: Vec<ActionId>,
    /// Peer root hashes, most recently seen first.
    pub remote_seen: Vec<RemoteHash>,

    pub compare: Option<Compare>,
    /// Bumped every time a Compare is created; stale fetch responses carry
    /// the epoch they were issued under.
    pub compare_epoch: u64,
    pub update: Option<Update>,

    /// Cache entries queued for durable storage, oldest first.
    pub storing: VecDeque<NodeHash>,

    pub stats: RootStats,
    pub advise_need: u32,
    pub last_advise: Micros,
    pub last_update: Micros,
    pub last_hash_change: Micros,
    /// `names_to_add` length at the previous heartbeat, for the adaptive
    /// update backoff.
    pub prev_add_len: usize,
    /// Root hash carried by the most recent RootAdvise we sent.
    pub last_local_sent: Option<NodeHash>,

    pub stable_point: HighWater,
    pub high_water: HighWater,

    /// Set at creation; cleared once the initial enumeration has started.
    pub needs_enum: bool,
    pub enum_busy: bool,
}

impl Root {
    pub fn new(id: RootId, config: SliceConfig) -> Self {
        let slice_hash = config.slice_hash();
        Self {
            id,
            config,
            slice_hash,
            current_hash: None,
            current_size: 0,
            cache: HashCache::new(),
            names_to_add: NameAccum::new(),
            names_to_fetch: NameAccum::new(),
            actions: Vec::new(),
            remote_seen: Vec::new(),
            compare: None,
            compare_epoch: 0,
            update: None,
            storing: VecDeque::new(),
            stats: RootStats::default(),
            advise_need: 0,
            last_advise: 0,
            last_update: 0,
            last_hash_change: 0,
            prev_add_len: 0,
            last_local_sent: None,
            stable_point: HighWater::NULL,
            high_water: HighWater::NULL,
            needs_enum: true,
            enum_busy: false,
        }
    }

    /// Offers a name to this root. Accepted names land in `names_to_add`
    /// unless they duplicate the previous tail entry.
    ///
    /// Returns true when the name was queued.
    pub fn offer_name(&mut self, name: &Name, item: Option<Accession>) -> bool {
        if !self.config.accepts(name) {
            return false;
        }
        self.stats.names_added += 1;
        if self.names_to_add.last_name() == Some(name) {
            debug!(root = self.id, %name, "ignore dup");
            return false;
        }
        self.names_to_add.append(name.clone(), item);
        if let Some(item) = item {
            self.high_water = self.high_water.update(item);
        }
        true
    }

    /// Records a sighting of a peer root hash, moving it to the front of
    /// `remote_seen`. A hash we also hold locally becomes covered
    /// immediately.
    pub fn note_remote_hash(&mut self, hash: NodeHash, now: Micros) {
        use slicesync_tree::EntryState;

        let entry = self.cache.enter(hash, EntryState::REMOTE, now);
        entry.last_remote_fetch = now;
        if entry.state.local {
            entry.set_covered();
        }

        if let Some(pos) = self.remote_seen.iter().position(|r| r.hash == hash) {
            let mut seen = self.remote_seen.remove(pos);
            seen.last_seen = now;
            self.remote_seen.insert(0, seen);
        } else {
            if let Some(entry) = self.cache.lookup_mut(&hash) {
                entry.busy += 1;
            }
            self.remote_seen.insert(
                0,
                RemoteHash {
                    hash,
                    last_seen: now,
                },
            );
        }
    }

    /// Drops a peer hash (a Compare against it failed); it can be
    /// re-learned from a future RootAdvise.
    pub fn remove_remote_hash(&mut self, hash: &NodeHash) {
        if let Some(pos) = self.remote_seen.iter().position(|r| r.hash == *hash) {
            self.remote_seen.remove(pos);
            if let Some(entry) = self.cache.lookup_mut(hash) {
                entry.busy = entry.busy.saturating_sub(1);
            }
        }
    }

    /// Picks the first remote, uncovered, recently-seen hash to compare
    /// against, pruning covered and stale entries along the way.
    pub fn choose_remote_hash(&mut self, now: Micros, stale_after: Micros) -> Option<NodeHash> {
        let mut chosen = None;
        let mut keep = Vec::with_capacity(self.remote_seen.len());
        for seen in self.remote_seen.drain(..) {
            if chosen.is_some() {
                keep.push(seen);
                continue;
            }
            let covered = self
                .cache
                .lookup(&seen.hash)
                .is_none_or(|entry| entry.is_covered() || !entry.state.remote);
            if covered || now.saturating_sub(seen.last_seen) >= stale_after {
                // prune: covered or too old to be worth chasing
                if let Some(entry) = self.cache.lookup_mut(&seen.hash) {
                    entry.busy = entry.busy.saturating_sub(1);
                }
                continue;
            }
            chosen = Some(seen.hash);
            keep.push(seen);
        }
        self.remote_seen = keep;
        chosen
    }

    /// Textual statistics snapshot served for the RootStats verb.
    pub fn format_stats(&self, now: Micros) -> String {
        let mut out = String::new();
        let _ = write!(out, "stats for root#{}", self.id);
        if let Some(hash) = &self.current_hash {
            let _ = write!(out, ", currentHash {hash}");
        }
        if let Some(compare) = &self.compare {
            let _ = write!(out, ", remoteHash {}", compare.hash_r());
            let _ = write!(
                out,
                ", compareBusy {}",
                now.saturating_sub(compare.start_time())
            );
        }
        if let Some(update) = &self.update {
            let _ = write!(
                out,
                ", updateBusy {}",
                now.saturating_sub(update.start_time())
            );
        }
        if self.last_hash_change != 0 {
            let _ = write!(
                out,
                ", lastHashChange {}",
                format_instant(self.last_hash_change)
            );
        }
        if !self.names_to_add.is_empty() {
            let _ = write!(out, ", namesToAdd {}", self.names_to_add.len());
        }
        let fetch_rem = self
            .names_to_fetch
            .len()
            .saturating_sub(self.compare.as_ref().map_or(0, Compare::content_pos));
        if fetch_rem > 0 {
            let _ = write!(out, ", namesToFetch {fetch_rem}");
        }
        if let Some(node) = self
            .current_hash
            .and_then(|hash| self.cache.lookup(&hash))
            .and_then(|entry| entry.node(false))
        {
            let _ = write!(out, ", treeDepth {}", node.depth());
            let _ = write!(out, ", treeNames {}", node.leaf_count());
            let _ = write!(
                out,
                ", treeBytes {}",
                node.byte_count() + node.encoded_size() as u64
            );
        }
        self.stats.format_into(&mut out);
        out
    }
}

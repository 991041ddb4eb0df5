//! The Update engine: folds pending names into the slice's tree.
//!
//! An Update merge-walks two name-ordered sources, the leaves of the
//! current tree and the sorted `names_to_add` backlog, into a single
//! stream, carving the stream into leaf nodes at split boundaries, then
//! combines the leaf nodes level by level until a single root remains.
//! Nodes whose long-hash already exists locally are shared, not rebuilt, so
//! an Update touching one corner of the namespace reuses most of the old
//! tree.

use std::sync::Arc;

use slicesync_primitives::{LongHash, Name};
use slicesync_tree::{
    node_from_names, EntryState, IndexSorter, NameAccum, NodeBuilder, NodeEntry, TreeError,
    TreeNode, TreeWalker,
};
use tracing::{debug, warn};

use crate::config::{EngineConfig, Micros};
use crate::root::Root;

/// Estimated encoded overhead per entry, used by the split estimators.
const ENTRY_OVERHEAD: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpdateState {
    Init,
    Inserted,
    Busy,
}

/// Outcome of one cooperative slice of Update work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStep {
    /// More work remains; re-enter after a short delay.
    Yield,
    /// The new root is installed; the caller should advertise it.
    Done,
    /// Unrecoverable failure; the update is abandoned.
    Failed,
}

/// In-flight state of one Update.
#[derive(Debug)]
pub struct Update {
    state: UpdateState,
    /// The backlog taken from the root at start.
    src: NameAccum,
    sorter: IndexSorter,
    /// Next src index to seed into the sorter.
    ix_pos: usize,
    walker: TreeWalker,
    /// Ordered run of names awaiting the next leaf-node cut.
    sort: NameAccum,
    name_len_accum: usize,
    /// Leaf-level nodes produced so far, in name order.
    nodes: Vec<Arc<TreeNode>>,
    names_added: usize,
    start_time: Micros,
}

impl Update {
    /// Begins an Update, taking the root's pending names. Returns `None`
    /// when there is nothing to do.
    pub fn start(root: &mut Root, now: Micros) -> Option<Self> {
        if root.names_to_add.is_empty() {
            return None;
        }
        let src = root.names_to_add.take();
        root.last_update = now;
        debug!(
            root = root.id,
            to_add = src.len(),
            current = root.current_size,
            "update start"
        );
        Some(Self {
            state: UpdateState::Init,
            sorter: IndexSorter::with_capacity(src.len()),
            src,
            ix_pos: 0,
            walker: TreeWalker::new(root.current_hash, false),
            sort: NameAccum::new(),
            name_len_accum: 0,
            nodes: Vec::new(),
            names_added: 0,
            start_time: now,
        })
    }

    pub fn start_time(&self) -> Micros {
        self.start_time
    }

    /// Runs one bounded slice of work.
    pub fn step(&mut self, root: &mut Root, config: &EngineConfig, now: Micros) -> UpdateStep {
        match self.state {
            UpdateState::Init => {
                let mut budget = config.names_yield_inc;
                while self.ix_pos < self.src.len() && budget > 0 {
                    self.sorter.add(&self.src, self.ix_pos);
                    self.ix_pos += 1;
                    budget -= 1;
                }
                if self.ix_pos < self.src.len() {
                    return UpdateStep::Yield;
                }
                self.state = UpdateState::Inserted;
                UpdateStep::Yield
            }
            UpdateState::Inserted => match self.merge_names(root, config, now) {
                Err(err) => {
                    warn!(root = root.id, %err, "update merge failed");
                    UpdateStep::Failed
                }
                Ok(false) => UpdateStep::Yield,
                Ok(true) => {
                    // flush the tail run into a final leaf node
                    if !self.sort.is_empty() {
                        self.make_node_from_names(root, config, 0, now);
                    }
                    self.state = UpdateState::Busy;
                    UpdateStep::Yield
                }
            },
            UpdateState::Busy => match self.build_superstructure(root, config, now) {
                Err(err) => {
                    warn!(root = root.id, %err, "update build failed");
                    UpdateStep::Failed
                }
                Ok(top) => {
                    self.install(root, config, &top, now);
                    UpdateStep::Done
                }
            },
        }
    }

    /// Merge-walks tree leaves and sorted pending names. `Ok(true)` when
    /// both sources are exhausted, `Ok(false)` to yield.
    fn merge_names(
        &mut self,
        root: &mut Root,
        config: &EngineConfig,
        now: Micros,
    ) -> Result<bool, TreeError> {
        let mut budget = config.names_yield_inc;

        while !self.walker.is_done() {
            if budget == 0 {
                return Ok(false);
            }
            let Some(frame) = self.walker.top() else {
                break;
            };
            let node = root.cache.fetch_local(&frame.hash)?;
            if frame.pos >= node.entry_count() {
                self.walker.pop_and_advance();
                continue;
            }
            match node
                .entry(frame.pos)
                .ok_or(TreeError::Internal("walker position out of range"))?
            {
                NodeEntry::Node(child) => {
                    let child = *child;
                    self.walker.push(child);
                }
                NodeEntry::Leaf(leaf) => {
                    let leaf = leaf.clone();
                    let pending = self.sorter.best().and_then(|ix| self.src.name(ix)).cloned();
                    match pending {
                        Some(pending) if pending < leaf => {
                            self.add_update_name(root, config, pending.clone(), true, now);
                            self.drain_equal(&pending);
                        }
                        Some(pending) if pending == leaf => {
                            // already in the tree; drop the pending copies
                            debug!(root = root.id, name = %pending, "skip dup");
                            self.drain_equal(&pending);
                        }
                        _ => {
                            self.add_update_name(root, config, leaf, false, now);
                            self.walker.advance();
                        }
                    }
                    budget -= 1;
                }
            }
        }

        // tree consumed; drain what remains in the sorter
        while let Some(ix) = self.sorter.best() {
            if budget == 0 {
                return Ok(false);
            }
            let name = self
                .src
                .name(ix)
                .ok_or(TreeError::Internal("sorter index out of range"))?
                .clone();
            self.add_update_name(root, config, name.clone(), true, now);
            self.drain_equal(&name);
            budget -= 1;
        }
        Ok(true)
    }

    /// Removes the current best and every immediately-following equal name.
    fn drain_equal(&mut self, name: &Name) {
        loop {
            self.sorter.remove_best(&self.src);
            match self.sorter.best().and_then(|ix| self.src.name(ix)) {
                Some(next) if next == name => {}
                _ => break,
            }
        }
    }

    /// Appends one name to the pending run, cutting a leaf node when the
    /// run crosses the split threshold.
    fn add_update_name(
        &mut self,
        root: &mut Root,
        config: &EngineConfig,
        name: Name,
        fresh: bool,
        now: Micros,
    ) {
        self.name_len_accum += name.byte_len();
        self.names_added += 1;
        if fresh {
            root.stats.names_inserted += 1;
        }
        self.sort.append(name, None);
        if self.name_len_accum >= config.split_acc_limit() {
            let split = self.find_split(config);
            self.make_node_from_names(root, config, split, now);
        }
    }

    /// Chooses how many leading names of the pending run become the next
    /// leaf node. Zero means "all of them".
    fn find_split(&self, config: &EngineConfig) -> usize {
        let lim = self.sort.len();
        let acc_lim = config.split_acc_limit();
        let acc_min = config.split_acc_min();
        let mut max_len = 0usize;
        let mut acc_len = 0usize;
        let mut prev_match = 0usize;

        let mut split = 0;
        while split < lim {
            let name = match self.sort.name(split) {
                Some(name) => name,
                None => break,
            };
            let name_len = name.byte_len() + ENTRY_OVERHEAD;
            max_len = max_len.max(name_len);
            acc_len += name_len + (max_len - name_len) * 2;

            if split + 1 < lim {
                if let Some(next) = self.sort.name(split + 1) {
                    // level split: break where the shared-prefix depth drops
                    let matched = name.component_match(next);
                    if acc_len >= acc_min
                        && (matched < prev_match || matched > prev_match + 1)
                    {
                        break;
                    }
                    prev_match = matched;

                    // hash split: a low byte near the end of the name
                    if let Some(probe) = split_probe_byte(name) {
                        if acc_len >= acc_min && probe < config.hash_split_trigger {
                            break;
                        }
                    }
                }
            }
            if acc_len >= acc_lim {
                break;
            }
            split += 1;
        }
        split
    }

    /// Turns the first `split` names of the pending run into a leaf node
    /// (all of them when `split` is zero), reusing a cached node when the
    /// long-hash already exists.
    fn make_node_from_names(
        &mut self,
        root: &mut Root,
        config: &EngineConfig,
        split: usize,
        now: Micros,
    ) {
        let lim = self.sort.len();
        if lim == 0 {
            return;
        }
        let split = if split == 0 { lim } else { split.min(lim) };

        let mut long = LongHash::new();
        for ix in 0..split {
            if let Some(name) = self.sort.name(ix) {
                long.fold_name(name);
            }
        }
        let hash = long.finish();

        let existing = root
            .cache
            .lookup(&hash)
            .and_then(|entry| entry.node(false))
            .cloned();
        if let Some(node) = existing {
            debug!(root = root.id, %hash, "existing local node");
            root.stats.nodes_shared += 1;
            self.nodes.push(node);
        } else {
            let names: Vec<Name> = (0..split)
                .filter_map(|ix| self.sort.name(ix).cloned())
                .collect();
            match node_from_names(names.iter()) {
                Ok(node) => {
                    let node = Arc::new(node);
                    enter_local_node(root, config, &node, now);
                    self.nodes.push(node);
                }
                Err(err) => {
                    // names arrive ordered, so this cannot happen; note and
                    // drop the run rather than wedge the update
                    warn!(root = root.id, %err, "leaf node build failed");
                }
            }
        }

        self.sort.drain_front(split);
        self.name_len_accum = self.sort.iter().map(|(name, _)| name.byte_len()).sum();
    }

    /// Combines accumulated leaf nodes into parents, level by level, until
    /// one root remains.
    fn build_superstructure(
        &mut self,
        root: &mut Root,
        config: &EngineConfig,
        now: Micros,
    ) -> Result<Arc<TreeNode>, TreeError> {
        let mut level = core::mem::take(&mut self.nodes);
        if level.is_empty() {
            return Err(TreeError::EmptyNode);
        }
        let acc_lim = config.split_acc_limit();
        let child_len = 32 + ENTRY_OVERHEAD;

        while level.len() > 1 {
            let mut parents = Vec::new();
            let mut j = 0;
            while j < level.len() {
                let mut acc_len = 0;
                let mut i = j;
                while i < level.len() && acc_len < acc_lim {
                    acc_len += child_len;
                    i += 1;
                }

                let mut builder = NodeBuilder::new();
                for child in &level[j..i] {
                    builder.push_node(child)?;
                }
                let parent = builder.finish()?;
                let hash = parent.hash();

                let existing = root
                    .cache
                    .lookup(&hash)
                    .and_then(|entry| entry.node(false))
                    .cloned();
                if let Some(node) = existing {
                    root.stats.nodes_shared += 1;
                    parents.push(node);
                } else {
                    let parent = Arc::new(parent);
                    enter_local_node(root, config, &parent, now);
                    parents.push(parent);
                }
                j = i;
            }
            level = parents;
        }
        level.pop().ok_or(TreeError::EmptyNode)
    }

    /// Installs the new root hash and summary state.
    fn install(&mut self, root: &mut Root, config: &EngineConfig, top: &Arc<TreeNode>, now: Micros) {
        let hash = top.hash();
        let old = root.current_hash.replace(hash);
        root.current_size = top.leaf_count();
        if old != Some(hash) {
            root.last_hash_change = now;
        }
        root.stats.updates_done += 1;
        root.stats.last_update_micros = now.saturating_sub(self.start_time);
        root.advise_need = config.advise_need_reset;
        if let Some(entry) = root.cache.lookup_mut(&hash) {
            // the stable point rides with the root node until it is stored
            entry.stable_point = entry.stable_point.merge(root.high_water);
        }
        debug!(
            root = root.id,
            %hash,
            names = self.names_added,
            depth = top.depth(),
            micros = root.stats.last_update_micros,
            "update done"
        );
        if config.sync_action_flags & 4 != 0 {
            tracing::info!(root = root.id, stats = %root.format_stats(now), "update report");
        }
    }
}

/// Probe byte for the hash-split heuristic: second-to-last byte of the
/// name's final component, where content names typically carry digest
/// material.
fn split_probe_byte(name: &Name) -> Option<u8> {
    let last = name.components().last()?;
    (last.len() >= 2).then(|| last[last.len() - 2])
}

/// Registers a freshly built node in the cache and queues it for durable
/// storage.
fn enter_local_node(root: &mut Root, config: &EngineConfig, node: &Arc<TreeNode>, now: Micros) {
    let hash = node.hash();
    let entry = root.cache.enter(hash, EntryState::LOCAL, now);
    entry.install_local(Arc::clone(node), now);
    if !entry.state.stored && !entry.state.storing {
        entry.state.storing = true;
        root.storing.push_back(hash);
    }
    root.stats.nodes_created += 1;
    if node.encoded_size() >= config.node_split_trigger {
        debug!(
            root = root.id,
            %hash,
            size = node.encoded_size(),
            trigger = config.node_split_trigger,
            "node exceeds split trigger"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicesync_primitives::SliceConfig;

    fn test_root() -> Root {
        Root::new(
            0,
            SliceConfig::new(Name::parse_uri("/topo"), Name::parse_uri("/repo")),
        )
    }

    fn run_update(root: &mut Root, config: &EngineConfig, now: Micros) -> UpdateStep {
        let Some(mut update) = Update::start(root, now) else {
            return UpdateStep::Failed;
        };
        for _ in 0..100_000 {
            match update.step(root, config, now) {
                UpdateStep::Yield => {}
                done => return done,
            }
        }
        UpdateStep::Failed
    }

    fn add_names(root: &mut Root, uris: &[&str]) {
        for uri in uris {
            root.offer_name(&Name::parse_uri(uri), None);
        }
    }

    #[test]
    fn update_builds_root_from_empty() {
        let config = EngineConfig::default();
        let mut root = test_root();
        add_names(&mut root, &["/repo/a/1", "/repo/a/2", "/repo/b"]);

        assert_eq!(run_update(&mut root, &config, 10), UpdateStep::Done);
        let hash = root.current_hash.expect("root hash installed");
        assert_eq!(root.current_size, 3);
        assert_eq!(root.stats.updates_done, 1);
        assert_eq!(root.stats.names_inserted, 3);

        let node = root.cache.fetch_local(&hash).unwrap();
        assert_eq!(node.leaf_count(), 3);
        assert_eq!(node.min_name(), &Name::parse_uri("/repo/a/1"));
        assert_eq!(node.max_name(), &Name::parse_uri("/repo/b"));
        // the new root is queued for durable storage
        assert!(root.storing.contains(&hash));
    }

    #[test]
    fn permuted_insertion_yields_identical_hash() {
        let config = EngineConfig::default();

        let mut forward = test_root();
        add_names(&mut forward, &["/repo/x", "/repo/y", "/repo/z"]);
        run_update(&mut forward, &config, 0);

        let mut scrambled = test_root();
        add_names(&mut scrambled, &["/repo/z", "/repo/x", "/repo/y"]);
        run_update(&mut scrambled, &config, 0);

        assert_eq!(forward.current_hash, scrambled.current_hash);
    }

    #[test]
    fn update_is_monotone_inclusion() {
        let config = EngineConfig::default();
        let mut root = test_root();
        add_names(&mut root, &["/repo/a", "/repo/c"]);
        run_update(&mut root, &config, 0);
        let first = root.current_hash;

        add_names(&mut root, &["/repo/b", "/repo/a"]);
        run_update(&mut root, &config, 1);

        assert_ne!(root.current_hash, first);
        assert_eq!(root.current_size, 3);

        // directly building {a, b, c} gives the same hash
        let mut direct = test_root();
        add_names(&mut direct, &["/repo/a", "/repo/b", "/repo/c"]);
        run_update(&mut direct, &config, 0);
        assert_eq!(root.current_hash, direct.current_hash);
    }

    #[test]
    fn duplicate_backlog_inserts_once() {
        let config = EngineConfig::default();
        let mut root = test_root();
        // not adjacent, so tail suppression lets them through
        add_names(&mut root, &["/repo/a", "/repo/b", "/repo/a", "/repo/a"]);
        assert_eq!(root.names_to_add.len(), 3);

        run_update(&mut root, &config, 0);
        assert_eq!(root.current_size, 2);
        assert_eq!(root.stats.names_inserted, 2);
    }

    #[test]
    fn unchanged_set_keeps_hash_and_shares_nodes() {
        let config = EngineConfig::default();
        let mut root = test_root();
        add_names(&mut root, &["/repo/a", "/repo/b"]);
        run_update(&mut root, &config, 0);
        let first = root.current_hash;
        let created = root.stats.nodes_created;

        add_names(&mut root, &["/repo/a"]);
        run_update(&mut root, &config, 5);

        assert_eq!(root.current_hash, first);
        assert_eq!(root.stats.nodes_created, created);
        assert!(root.stats.nodes_shared > 0);
        assert_eq!(root.last_hash_change, 0);
    }

    #[test]
    fn large_backlog_splits_into_multiple_levels() {
        let config = EngineConfig::default();
        let mut root = test_root();
        let uris: Vec<String> = (0..2000).map(|i| format!("/repo/item/{i:05}")).collect();
        for uri in &uris {
            root.offer_name(&Name::parse_uri(uri), None);
        }

        assert_eq!(run_update(&mut root, &config, 0), UpdateStep::Done);
        assert_eq!(root.current_size, 2000);

        let top = root
            .cache
            .fetch_local(&root.current_hash.unwrap())
            .unwrap();
        assert!(top.depth() > 1, "expected an interior root");
        assert!(root.stats.nodes_created > 1);

        // every leaf survives the walk in order
        let mut walker = TreeWalker::new(root.current_hash, false);
        let mut leaves = Vec::new();
        while !walker.is_done() {
            let frame = *walker.top().unwrap();
            let node = root.cache.fetch_local(&frame.hash).unwrap();
            match node.entry(frame.pos) {
                None => {
                    walker.pop_and_advance();
                }
                Some(NodeEntry::Node(child)) => {
                    let child = *child;
                    walker.push(child);
                }
                Some(NodeEntry::Leaf(name)) => {
                    leaves.push(name.clone());
                    walker.advance();
                }
            }
        }
        assert_eq!(leaves.len(), 2000);
        assert!(leaves.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn single_oversized_name_becomes_singleton_leaf() {
        let config = EngineConfig::default();
        let mut root = test_root();
        let big = format!("/repo/{}", "x".repeat(5000));
        add_names(&mut root, &[big.as_str()]);

        assert_eq!(run_update(&mut root, &config, 0), UpdateStep::Done);
        assert_eq!(root.current_size, 1);
    }
}

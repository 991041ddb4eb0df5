//! The Compare engine: derives what a peer's tree has that ours lacks.
//!
//! A Compare walks the local tree `L` and the advertised remote tree `R` in
//! name order. Range summaries and the `covered` flag let it skip whole
//! subtrees, so the usual cost is proportional to the number of differences
//! rather than the union size. Remote nodes are preloaded in parallel before
//! the walk, missing leaves are collected into `names_to_fetch`, and the
//! waiting phase drives the content fetches that close the gap.

use std::collections::VecDeque;

use slicesync_primitives::{Name, NodeHash};
use slicesync_tree::{EntryState, NodeEntry, TreeWalker};
use tracing::{debug, warn};

use crate::actions::{ActionId, ActionKind, ActionTable};
use crate::config::{EngineConfig, Micros};
use crate::deps::{ContentStore, Transport};
use crate::root::Root;
use crate::wire::{command_prefix, Interest, Verb};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareState {
    Init,
    Preload,
    Busy,
    Waiting,
}

/// Outcome of one Compare step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareStep {
    /// State advanced; step again.
    Continue,
    /// Blocked on outstanding fetches; responses will rearm the Compare.
    Wait,
    /// Reconciliation finished.
    Done,
    /// Unrecoverable; the caller must abort this Compare.
    Abort(&'static str),
}

/// In-flight state of one Compare.
#[derive(Debug)]
pub struct Compare {
    state: CompareState,
    hash_r: NodeHash,
    tw_l: TreeWalker,
    tw_r: TreeWalker,
    /// Failed fetch actions awaiting retry.
    pub(crate) err_list: VecDeque<ActionId>,
    /// Compare generation; stale responses must not touch our counters.
    pub(crate) epoch: u64,
    pub(crate) names_added: usize,
    pub(crate) node_fetch_busy: usize,
    pub(crate) node_fetch_failed: usize,
    content_pos: usize,
    pub(crate) content_fetch_busy: usize,
    pub(crate) content_fetch_failed: usize,
    /// Names the waiting phase found already present locally; the engine
    /// feeds them back through `add_name`.
    pub(crate) local_hits: Vec<Name>,
    start_time: Micros,
    pub(crate) last_fetch_ok: Micros,
    pub(crate) last_mark: Micros,
}

impl Compare {
    /// Creates a Compare of the current local tree against `hash_r`.
    pub fn start(root: &mut Root, hash_r: NodeHash, now: Micros) -> Self {
        root.compare_epoch += 1;
        root.names_to_fetch.clear();
        root.cache.enter(hash_r, EntryState::REMOTE, now);
        debug!(
            root = root.id,
            local = ?root.current_hash,
            remote = %hash_r,
            "compare start"
        );
        Self {
            state: CompareState::Init,
            hash_r,
            tw_l: TreeWalker::new(root.current_hash, false),
            tw_r: TreeWalker::new(Some(hash_r), true),
            err_list: VecDeque::new(),
            epoch: root.compare_epoch,
            names_added: 0,
            node_fetch_busy: 0,
            node_fetch_failed: 0,
            content_pos: 0,
            content_fetch_busy: 0,
            content_fetch_failed: 0,
            local_hits: Vec::new(),
            start_time: now,
            last_fetch_ok: now,
            last_mark: now,
        }
    }

    pub fn hash_r(&self) -> NodeHash {
        self.hash_r
    }

    pub fn start_time(&self) -> Micros {
        self.start_time
    }

    pub fn content_pos(&self) -> usize {
        self.content_pos
    }

    /// Runs one state of the machine.
    pub fn step(
        &mut self,
        root: &mut Root,
        actions: &mut ActionTable,
        config: &EngineConfig,
        now: Micros,
        transport: &mut dyn Transport,
        store: &dyn ContentStore,
    ) -> CompareStep {
        match self.state {
            CompareState::Init => {
                self.state = CompareState::Preload;
                self.tw_r.reset(Some(self.hash_r));
                CompareStep::Continue
            }
            CompareState::Preload => {
                // restart the DFS each entry; covered/fetching checks make
                // the re-walk cheap
                self.tw_r.reset(Some(self.hash_r));
                if self.preload(root, actions, config, now, transport) {
                    self.tw_r.reset(Some(self.hash_r));
                    self.state = CompareState::Busy;
                    CompareStep::Continue
                } else {
                    CompareStep::Wait
                }
            }
            CompareState::Busy => match self.do_comparison(root, actions, config, now, transport) {
                WalkOutcome::Failed(why) => CompareStep::Abort(why),
                WalkOutcome::Pending => CompareStep::Wait,
                WalkOutcome::Complete => {
                    if self.err_list.is_empty() {
                        self.state = CompareState::Waiting;
                    } else {
                        // a fetch failed mid-walk; retreat one state
                        debug!(root = root.id, "compare retreats to preload");
                        self.tw_r.reset(Some(self.hash_r));
                        self.state = CompareState::Preload;
                    }
                    CompareStep::Continue
                }
            },
            CompareState::Waiting => {
                let busy_lim = config.max_fetch_busy;
                while self.content_fetch_busy < busy_lim
                    && self.content_pos < root.names_to_fetch.len()
                {
                    let Some(name) = root.names_to_fetch.name(self.content_pos).cloned() else {
                        break;
                    };
                    self.content_pos += 1;
                    self.start_content_fetch(root, actions, config, now, transport, store, name);
                }
                while self.content_fetch_busy < busy_lim {
                    let Some(id) = self.take_errored(actions, ActionKind::ContentFetch) else {
                        break;
                    };
                    if let Some(action) = actions.remove(id) {
                        self.start_content_fetch(
                            root, actions, config, now, transport, store, action.name,
                        );
                    }
                }
                if self.content_fetch_busy > 0 || !self.err_list.is_empty() {
                    CompareStep::Wait
                } else {
                    CompareStep::Done
                }
            }
        }
    }

    /// DFS over `R` requesting every reachable remote node that is neither
    /// covered nor local nor already in flight. Returns true when all of
    /// `R`'s reachable nodes are present.
    fn preload(
        &mut self,
        root: &mut Root,
        actions: &mut ActionTable,
        config: &EngineConfig,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> bool {
        loop {
            if self.node_fetch_busy >= config.max_fetch_busy {
                return false;
            }
            let Some(frame) = self.tw_r.top().copied() else {
                break;
            };
            let entry = root.cache.enter(frame.hash, EntryState::REMOTE, now);
            let state = entry.state;
            let covered = entry.is_covered();
            let node = entry.node(true).cloned();

            if state.fetching || covered {
                self.tw_r.pop_and_advance();
            } else if let Some(node) = node {
                // skip leaves, then descend into the next child reference
                let mut pos = frame.pos;
                while pos < node.entry_count() {
                    match node.entry(pos) {
                        Some(NodeEntry::Leaf(_)) => pos += 1,
                        _ => break,
                    }
                }
                if let Some(top) = self.tw_r.top_mut() {
                    top.pos = pos;
                }
                match node.entry(pos) {
                    Some(NodeEntry::Node(child)) => {
                        let child = *child;
                        ensure_remote_entry(root, child, now);
                        self.tw_r.push(child);
                    }
                    _ => {
                        self.tw_r.pop_and_advance();
                    }
                }
            } else {
                self.start_node_fetch(root, actions, config, now, transport, frame.hash);
                self.tw_r.pop_and_advance();
            }
        }

        // restart failed node fetches while the budget allows
        while self.node_fetch_busy < config.max_fetch_busy {
            let Some(id) = self.take_errored(actions, ActionKind::NodeFetch) else {
                break;
            };
            if let Some(action) = actions.remove(id) {
                if let Some(hash) = action.hash {
                    self.start_node_fetch(root, actions, config, now, transport, hash);
                }
            }
        }

        self.node_fetch_busy == 0 && self.err_list.is_empty() && self.tw_r.is_done()
    }

    /// The dual walk. Consumes both trees in name order, appending to
    /// `names_to_fetch` every name in `R` that `L` lacks.
    fn do_comparison(
        &mut self,
        root: &mut Root,
        actions: &mut ActionTable,
        config: &EngineConfig,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> WalkOutcome {
        loop {
            let Some(frame_r) = self.tw_r.top().copied() else {
                // the remote walk is done, so no more names to add
                return WalkOutcome::Complete;
            };
            let Some(entry_r) = root.cache.lookup_mut(&frame_r.hash) else {
                return WalkOutcome::Failed("bad cache entry for R");
            };
            entry_r.last_used = now;

            if frame_r.pos == 0 && entry_r.is_covered() {
                // nothing in this subtree we don't have
                self.tw_r.pop_and_advance();
                continue;
            }
            let Some(node_r) = entry_r.node(true).cloned() else {
                // top remote node not present, so go get it
                self.start_node_fetch(root, actions, config, now, transport, frame_r.hash);
                return WalkOutcome::Pending;
            };
            if frame_r.pos >= node_r.entry_count() {
                // went off the end; an untouched node is fully covered
                if frame_r.count == 0 {
                    if let Some(entry) = root.cache.lookup_mut(&frame_r.hash) {
                        entry.set_covered();
                    }
                }
                self.tw_r.pop_and_advance();
                continue;
            }
            let Some(entry) = node_r.entry(frame_r.pos).cloned() else {
                return WalkOutcome::Failed("bad element for R");
            };

            if self.tw_l.is_done() {
                // L is exhausted: everything remaining in R is missing
                match entry {
                    NodeEntry::Node(child) => {
                        ensure_remote_entry(root, child, now);
                        self.tw_r.push(child);
                    }
                    NodeEntry::Leaf(name) => self.add_name_from_compare(root, name),
                }
                continue;
            }

            let Some(frame_l) = self.tw_l.top().copied() else {
                return WalkOutcome::Failed("bad walker for L");
            };
            let node_l = match root.cache.fetch_local(&frame_l.hash) {
                Ok(node) => node,
                Err(_) => return WalkOutcome::Failed("bad cache entry for L"),
            };
            if let Some(entry_l) = root.cache.lookup_mut(&frame_l.hash) {
                entry_l.last_used = now;
            }
            if frame_l.pos >= node_l.entry_count() {
                self.tw_l.pop_and_advance();
                continue;
            }
            let Some(entry_l) = node_l.entry(frame_l.pos).cloned() else {
                return WalkOutcome::Failed("bad element for L");
            };

            match entry {
                NodeEntry::Node(child_r) => {
                    ensure_remote_entry(root, child_r, now);
                    let (sub_covered, sub_present) = root
                        .cache
                        .lookup(&child_r)
                        .map_or((false, false), |e| (e.is_covered(), e.node(true).is_some()));
                    if sub_covered {
                        // nothing to add from this child, even if absent
                        self.tw_r.advance();
                        continue;
                    }
                    if !sub_present {
                        // push into it to force the fetch
                        self.tw_r.push(child_r);
                        continue;
                    }
                    match entry_l {
                        NodeEntry::Leaf(name_l) => {
                            let sub_r = root
                                .cache
                                .lookup(&child_r)
                                .and_then(|e| e.node(true))
                                .cloned();
                            let Some(sub_r) = sub_r else {
                                return WalkOutcome::Failed("bad cache entry for R");
                            };
                            use slicesync_tree::SpanCmp;
                            match sub_r.compare_span(&name_l) {
                                SpanCmp::Before => self.tw_l.advance(),
                                SpanCmp::Max => {
                                    self.tw_l.advance();
                                    self.tw_r.advance();
                                }
                                _ => self.tw_r.push(child_r),
                            }
                        }
                        NodeEntry::Node(child_l) => {
                            let sub_l = match root.cache.fetch_local(&child_l) {
                                Ok(node) => node,
                                Err(_) => return WalkOutcome::Failed("bad cache entry for L"),
                            };
                            let sub_r_min = root
                                .cache
                                .lookup(&child_r)
                                .and_then(|e| e.node(true))
                                .map(|n| n.min_name().clone());
                            let Some(sub_r_min) = sub_r_min else {
                                return WalkOutcome::Failed("bad cache entry for R");
                            };
                            if sub_r_min > *sub_l.max_name() {
                                self.tw_l.advance();
                            } else {
                                self.tw_l.push(child_l);
                                self.tw_r.push(child_r);
                            }
                        }
                    }
                }
                NodeEntry::Leaf(name_r) => match entry_l {
                    NodeEntry::Leaf(name_l) => {
                        if name_l == name_r {
                            self.tw_l.advance();
                            self.tw_r.advance();
                        } else if name_l < name_r {
                            self.tw_l.advance();
                        } else {
                            self.add_name_from_compare(root, name_r);
                        }
                    }
                    NodeEntry::Node(child_l) => {
                        let sub_l = match root.cache.fetch_local(&child_l) {
                            Ok(node) => node,
                            Err(_) => return WalkOutcome::Failed("bad cache entry for L"),
                        };
                        use slicesync_tree::SpanCmp;
                        match sub_l.compare_span(&name_r) {
                            SpanCmp::Before => self.add_name_from_compare(root, name_r),
                            SpanCmp::Max => {
                                self.tw_l.advance();
                                self.tw_r.advance();
                            }
                            SpanCmp::Min => self.tw_r.advance(),
                            SpanCmp::After => self.tw_l.advance(),
                            SpanCmp::Inside => self.tw_l.push(child_l),
                        }
                    }
                },
            }
        }
    }

    /// Records a missing name and steps the remote walk past it.
    fn add_name_from_compare(&mut self, root: &mut Root, name: Name) {
        debug!(root = root.id, %name, "compare added");
        root.names_to_fetch.append(name, None);
        if let Some(top) = self.tw_r.top_mut() {
            top.pos += 1;
            top.count += 1;
        }
        self.names_added += 1;
    }

    /// Issues a NodeFetch for `hash` unless one is already pending.
    fn start_node_fetch(
        &mut self,
        root: &mut Root,
        actions: &mut ActionTable,
        config: &EngineConfig,
        now: Micros,
        transport: &mut dyn Transport,
        hash: NodeHash,
    ) {
        if root
            .cache
            .lookup(&hash)
            .is_some_and(|entry| entry.state.fetching)
        {
            return;
        }
        if actions.has_pending_fetch(&root.actions, ActionKind::NodeFetch, &hash) {
            return;
        }
        let name = command_prefix(&root.config.topo_prefix, Verb::NodeFetch, &root.slice_hash)
            .appended(hash.as_bytes().to_vec());
        let id = actions.create(
            root.id,
            ActionKind::NodeFetch,
            name.clone(),
            Some(hash),
            self.epoch,
            now,
        );
        root.actions.push(id);
        if let Some(entry) = root.cache.lookup_mut(&hash) {
            entry.state.fetching = true;
        }
        self.node_fetch_busy += 1;
        root.stats.node_fetch_sent += 1;
        debug!(root = root.id, %hash, "node fetch");
        transport.express_interest(id, Interest::new(name, config.fetch_lifetime));
    }

    /// Issues a ContentFetch for `name`, short-circuiting through local
    /// storage first.
    #[allow(clippy::too_many_arguments)]
    fn start_content_fetch(
        &mut self,
        root: &mut Root,
        actions: &mut ActionTable,
        config: &EngineConfig,
        now: Micros,
        transport: &mut dyn Transport,
        store: &dyn ContentStore,
        name: Name,
    ) {
        if store.lookup(&name).is_some() {
            // already in the repo, no need to fetch
            debug!(root = root.id, %name, "already present");
            self.local_hits.push(name);
            return;
        }
        let id = actions.create(
            root.id,
            ActionKind::ContentFetch,
            name.clone(),
            None,
            self.epoch,
            now,
        );
        root.actions.push(id);
        self.content_fetch_busy += 1;
        root.stats.content_fetch_sent += 1;
        debug!(root = root.id, %name, "content fetch");
        transport.express_interest(id, Interest::new(name, config.fetch_lifetime));
    }

    /// Pops the first errored action of `kind`, if any.
    fn take_errored(&mut self, actions: &ActionTable, kind: ActionKind) -> Option<ActionId> {
        let pos = self
            .err_list
            .iter()
            .position(|id| actions.get(*id).is_some_and(|a| a.kind == kind))?;
        self.err_list.remove(pos)
    }

    /// Called when a Compare is abandoned; logs the damage.
    pub(crate) fn note_abort(&self, root: &Root, reason: &str) {
        warn!(
            root = root.id,
            remote = %self.hash_r,
            reason,
            node_failures = self.node_fetch_failed,
            content_failures = self.content_fetch_failed,
            "compare aborted"
        );
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WalkOutcome {
    Complete,
    Pending,
    Failed(&'static str),
}

/// Ensures a remote child hash has a cache entry; a hash we also hold
/// locally is covered from the start.
fn ensure_remote_entry(root: &mut Root, hash: NodeHash, now: Micros) {
    let entry = root.cache.enter(hash, EntryState::REMOTE, now);
    if entry.state.local {
        entry.set_covered();
    }
}

//! The Sync engine proper: slice lifecycle, the heartbeat, and the
//! request/response exchanges that keep replicas converging.
//!
//! The engine is a deterministic, single-threaded state machine. Every
//! entry point takes the current time in microseconds and the two
//! collaborator seams ([`Transport`], [`ContentStore`]); nothing in here
//! reads a wall clock or spawns a task. `service::SyncService` adapts this
//! core to tokio for production use.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slicesync_primitives::{Accession, HighWater, Name, NodeHash, SliceConfig};
use slicesync_tree::TreeNode;
use tracing::{debug, info, warn};

use crate::actions::{ActionId, ActionKind, ActionState, ActionTable};
use crate::compare::{Compare, CompareStep};
use crate::config::{EngineConfig, Micros};
use crate::deps::{ContentStore, EnumToken, Transport};
use crate::error::EngineError;
use crate::events::{SyncEvent, SyncEventKind};
use crate::root::{Root, RootId};
use crate::update::{Update, UpdateStep};
use crate::wire::{
    command_prefix, decode_stable_point, encode_stable_point, hash_component,
    optional_hash_component, stable_point_name, ContentObject, Interest, Response, Verb,
    CMD_SLICE,
};

/// Safety bound on cooperative steps driven per entry point.
const MAX_DRIVE_STEPS: usize = 1_000_000;

/// The Sync engine. One instance serves every slice of a repository.
#[derive(Debug)]
pub struct SyncEngine {
    config: EngineConfig,
    roots: Vec<Root>,
    next_root_id: RootId,
    actions: ActionTable,
    compares_busy: usize,
    high_water: HighWater,
    stable_target: HighWater,
    stable_stored: HighWater,
    last_stable: Micros,
    last_cache_clean: Micros,
    /// One enumeration at a time across the engine.
    enum_busy: Option<(EnumToken, RootId)>,
    events: VecDeque<SyncEvent>,
    rng: StdRng,
}

impl SyncEngine {
    pub fn new(config: EngineConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.faux_error_seed);
        Self {
            config,
            roots: Vec::new(),
            next_root_id: 0,
            actions: ActionTable::new(),
            compares_busy: 0,
            high_water: HighWater::NULL,
            stable_target: HighWater::NULL,
            stable_stored: HighWater::NULL,
            last_stable: 0,
            last_cache_clean: 0,
            enum_busy: None,
            events: VecDeque::new(),
            rng,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn roots(&self) -> impl Iterator<Item = &Root> {
        self.roots.iter()
    }

    pub fn root(&self, id: RootId) -> Option<&Root> {
        self.roots.iter().find(|root| root.id == id)
    }

    pub fn root_by_slice(&self, slice_hash: &NodeHash) -> Option<&Root> {
        self.roots.iter().find(|root| root.slice_hash == *slice_hash)
    }

    /// Drains accumulated observability events.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain(..).collect()
    }

    /// True while any Update or Compare has runnable work.
    pub fn has_active_machines(&self) -> bool {
        self.roots
            .iter()
            .any(|root| root.update.is_some() || root.compare.is_some())
    }

    /// Startup: recover the persisted stable point and ask for replay past
    /// it, then solicit the stored slice announcements.
    pub fn start(&mut self, now: Micros, store: &mut dyn ContentStore) {
        let stable = store
            .lookup(&stable_point_name(&self.config.local_host_prefix))
            .and_then(|object| decode_stable_point(&object.body));
        match stable {
            Some(value) => {
                info!(value, "recovered stable point");
                self.stable_stored = HighWater::decode(value);
                self.stable_target = self.stable_stored;
                store.notify_after(value);
            }
            None => {
                debug!("no stable recovery point");
                store.notify_after(HighWater::NULL.encode());
            }
        }
        self.last_stable = now;

        let slice_prefix = self.config.local_host_prefix.appended(CMD_SLICE.to_vec());
        if let Err(err) = store.enumerate(&slice_prefix) {
            warn!(%err, "slice enumeration failed to start");
        }
    }

    /// Creates a root for `slice`. First announcement wins; a second
    /// announcement of the same slice hash is ignored.
    pub fn create_slice(
        &mut self,
        slice: SliceConfig,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> Result<RootId, EngineError> {
        let slice_hash = slice.slice_hash();
        if self.root_by_slice(&slice_hash).is_some() {
            return Err(EngineError::SliceExists(slice_hash));
        }
        let id = self.next_root_id;
        self.next_root_id += 1;
        let mut root = Root::new(id, slice);
        root.advise_need = self.config.advise_need_reset;

        for verb in [Verb::RootAdvise, Verb::NodeFetch, Verb::RootStats] {
            transport.set_interest_filter(command_prefix(
                &root.config.topo_prefix,
                verb,
                &slice_hash,
            ));
        }
        info!(
            root = id,
            slice = %slice_hash,
            topo = %root.config.topo_prefix,
            prefix = %root.config.naming_prefix,
            "slice created"
        );
        self.events
            .push_back(SyncEvent::new(id, now, SyncEventKind::SliceCreated { slice_hash }));
        self.roots.push(root);
        Ok(id)
    }

    /// Tears down the root for `slice_hash`: pending stores are dropped,
    /// machines abort, filters are withdrawn.
    pub fn remove_slice(
        &mut self,
        slice_hash: &NodeHash,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> Result<(), EngineError> {
        let pos = self
            .roots
            .iter()
            .position(|root| root.slice_hash == *slice_hash)
            .ok_or(EngineError::UnknownSlice(*slice_hash))?;
        let root = self.roots.remove(pos);
        if root.compare.is_some() {
            self.compares_busy = self.compares_busy.saturating_sub(1);
        }
        for id in &root.actions {
            self.actions.remove(*id);
        }
        if let Some(compare) = &root.compare {
            for id in &compare.err_list {
                self.actions.remove(*id);
            }
        }
        if self.enum_busy.is_some_and(|(_, rid)| rid == root.id) {
            self.enum_busy = None;
        }
        for verb in [Verb::RootAdvise, Verb::NodeFetch, Verb::RootStats] {
            transport.clear_interest_filter(command_prefix(
                &root.config.topo_prefix,
                verb,
                slice_hash,
            ));
        }
        info!(root = root.id, slice = %slice_hash, "slice removed");
        self.events.push_back(SyncEvent::new(
            root.id,
            now,
            SyncEventKind::SliceRemoved {
                slice_hash: *slice_hash,
            },
        ));
        Ok(())
    }

    /// Processes a slice announcement or tombstone observed by the host.
    pub fn handle_slice(
        &mut self,
        object: &ContentObject,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> Result<(), EngineError> {
        let prefix = self.config.local_host_prefix.appended(CMD_SLICE.to_vec());
        if !object.name.starts_with(&prefix) {
            return Err(EngineError::BadEncoding("not a slice announcement".into()));
        }
        let hash = hash_component(&object.name, prefix.len())
            .ok_or_else(|| EngineError::BadEncoding("invalid slice hash".into()))?;

        if object.gone {
            match self.remove_slice(&hash, now, transport) {
                Ok(()) | Err(EngineError::UnknownSlice(_)) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        if self.root_by_slice(&hash).is_some() {
            // first arrival wins
            debug!(slice = %hash, "slice announcement ignored");
            return Ok(());
        }
        let slice: SliceConfig = borsh::from_slice(&object.body)
            .map_err(|err| EngineError::BadEncoding(err.to_string()))?;
        if slice.slice_hash() != hash {
            warn!(named = %hash, actual = %slice.slice_hash(), "slice hash mismatch");
            return Err(EngineError::BadEncoding("slice hash mismatch".into()));
        }
        self.create_slice(slice, now, transport).map(|_| ())
    }

    /// Offers a newly stored (or enumerated) name to every matching root.
    /// Returns how many roots accepted it.
    pub fn add_name(&mut self, name: &Name, item: Option<Accession>, _now: Micros) -> usize {
        let mut count = 0;
        for root in &mut self.roots {
            if root.offer_name(name, item) {
                count += 1;
            }
        }
        if let Some(item) = item {
            self.high_water = self.high_water.update(item);
        }
        count
    }

    /// Marks an enumeration finished.
    pub fn note_enum_complete(&mut self, token: EnumToken) {
        if let Some((busy, root_id)) = self.enum_busy {
            if busy == token {
                self.enum_busy = None;
                if let Some(root) = self.roots.iter_mut().find(|r| r.id == root_id) {
                    root.enum_busy = false;
                }
            }
        }
    }

    /// The heartbeat: drives enumeration, Updates, RootAdvises, Compares,
    /// the durability queue, and the stable-point commit.
    pub fn heartbeat(
        &mut self,
        now: Micros,
        transport: &mut dyn Transport,
        store: &mut dyn ContentStore,
    ) {
        self.start_pending_enumeration(store);

        for ix in 0..self.roots.len() {
            let root = &mut self.roots[ix];
            root.actions.retain(|id| self.actions.get(*id).is_some());

            if root.update.is_some() {
                // update is busy, so don't process this root
                continue;
            }
            if root.compare.is_some() {
                // check for stall, then for excessive time since last fetch
                let mut assume_bad = false;
                if let Some(compare) = root.compare.as_mut() {
                    if now.saturating_sub(compare.last_mark) > self.config.update_stall_delta {
                        warn!(root = root.id, "compare stalled?");
                        compare.last_mark = now;
                    }
                    assume_bad =
                        now.saturating_sub(compare.last_fetch_ok) > self.config.compare_assume_bad;
                }
                if assume_bad {
                    if let Some(compare) = self.roots[ix].compare.take() {
                        self.abort_compare(ix, compare, "no progress", now);
                    }
                }
                continue;
            }

            let add_len = root.names_to_add.len();
            let delta_advise = now.saturating_sub(root.last_advise);
            let delta_update = now.saturating_sub(root.last_update);
            let mut need_update = self.config.update_need_delta;
            if add_len == root.prev_add_len {
                // quiescent tick: back off, bounded by the advise lifetime
                need_update = root
                    .stats
                    .last_update_micros
                    .saturating_mul(2)
                    .clamp(self.config.update_need_delta, self.config.root_advise_lifetime);
            }
            if root.advise_need == 0 && delta_advise > self.config.root_advise_lifetime {
                root.advise_need = self.config.advise_need_reset;
            }
            if delta_update >= need_update {
                if add_len > 0 {
                    root.update = Update::start(root, now);
                }
                let local_present = root.current_hash.is_some_and(|hash| {
                    root.cache
                        .lookup(&hash)
                        .is_some_and(|entry| entry.state.local)
                });
                match root.current_hash {
                    Some(hash) if local_present => {
                        if root.advise_need > 0 || root.last_local_sent != Some(hash) {
                            send_root_advise(
                                root,
                                &mut self.actions,
                                &self.config,
                                now,
                                transport,
                            );
                        }
                    }
                    None => {
                        // empty hash, so try for a starting response
                        send_root_advise(root, &mut self.actions, &self.config, now, transport);
                    }
                    _ => {}
                }
                if root.update.is_none() {
                    let stale_after = self.config.root_advise_lifetime.saturating_mul(3);
                    if let Some(remote) = root.choose_remote_hash(now, stale_after) {
                        if self.compares_busy < self.config.max_compares_busy {
                            root.compare = Some(Compare::start(root, remote, now));
                            self.compares_busy += 1;
                        }
                    }
                }
            }
            root.prev_add_len = root.names_to_add.len();
        }

        self.drive_machines(now, transport, store);
        self.clean_cache_batch(now, store);
        self.commit_stable_point(now, store);
    }

    /// Starts at most one pending per-slice enumeration.
    fn start_pending_enumeration(&mut self, store: &mut dyn ContentStore) {
        if self.enum_busy.is_some() {
            return;
        }
        let Some(root) = self.roots.iter_mut().find(|root| root.needs_enum) else {
            return;
        };
        match store.enumerate(&root.config.naming_prefix) {
            Ok(token) => {
                debug!(root = root.id, prefix = %root.config.naming_prefix, "slice enum start");
                root.needs_enum = false;
                root.enum_busy = true;
                self.enum_busy = Some((token, root.id));
            }
            Err(err) => {
                warn!(root = root.id, %err, "slice enum failed");
                root.needs_enum = false;
            }
        }
    }

    /// Advances every runnable Update and Compare until it completes or
    /// blocks on the network.
    fn drive_machines(
        &mut self,
        now: Micros,
        transport: &mut dyn Transport,
        store: &mut dyn ContentStore,
    ) {
        let mut fed_names: Vec<Name> = Vec::new();

        for ix in 0..self.roots.len() {
            if let Some(mut update) = self.roots[ix].update.take() {
                let mut outcome = UpdateStep::Yield;
                for _ in 0..MAX_DRIVE_STEPS {
                    outcome = update.step(&mut self.roots[ix], &self.config, now);
                    if outcome != UpdateStep::Yield {
                        break;
                    }
                }
                match outcome {
                    UpdateStep::Done => {
                        let root = &mut self.roots[ix];
                        if let Some(hash) = root.current_hash {
                            self.events.push_back(SyncEvent::new(
                                root.id,
                                now,
                                SyncEventKind::UpdateDone {
                                    root_hash: hash,
                                    names_inserted: root.stats.names_inserted,
                                    micros: root.stats.last_update_micros,
                                },
                            ));
                        }
                        send_root_advise(root, &mut self.actions, &self.config, now, transport);
                    }
                    UpdateStep::Failed => {
                        warn!(root = self.roots[ix].id, "update abandoned");
                    }
                    UpdateStep::Yield => {
                        // ran out of drive budget; resume next tick
                        self.roots[ix].update = Some(update);
                    }
                }
            }

            if let Some(mut compare) = self.roots[ix].compare.take() {
                let mut steps = 0;
                loop {
                    steps += 1;
                    if steps > MAX_DRIVE_STEPS {
                        self.abort_compare(ix, compare, "runaway compare", now);
                        break;
                    }
                    let root = &mut self.roots[ix];
                    match compare.step(root, &mut self.actions, &self.config, now, transport, store)
                    {
                        CompareStep::Continue => {}
                        CompareStep::Wait => {
                            fed_names.append(&mut compare.local_hits);
                            self.roots[ix].compare = Some(compare);
                            break;
                        }
                        CompareStep::Done => {
                            fed_names.append(&mut compare.local_hits);
                            self.finish_compare(ix, compare, now);
                            break;
                        }
                        CompareStep::Abort(reason) => {
                            self.abort_compare(ix, compare, reason, now);
                            break;
                        }
                    }
                }
            }
        }

        for name in fed_names {
            self.add_name(&name, None, now);
        }
    }

    fn finish_compare(&mut self, ix: usize, compare: Compare, now: Micros) {
        let root = &mut self.roots[ix];
        root.stats.compares_done += 1;
        root.stats.last_compare_micros = now.saturating_sub(compare.start_time());
        self.compares_busy = self.compares_busy.saturating_sub(1);
        debug!(
            root = root.id,
            remote = %compare.hash_r(),
            names = compare.names_added,
            micros = root.stats.last_compare_micros,
            "compare done"
        );
        if self.config.sync_action_flags & 4 != 0 {
            info!(root = root.id, stats = %root.format_stats(now), "compare report");
        }
        self.events.push_back(SyncEvent::new(
            root.id,
            now,
            SyncEventKind::CompareDone {
                remote_hash: compare.hash_r(),
                names_fetched: compare.names_added as u64,
                micros: root.stats.last_compare_micros,
            },
        ));
        root.names_to_fetch.clear();
    }

    /// A Compare failed outright: forget the peer hash so a fresh
    /// RootAdvise can re-teach it, and release the Compare's resources.
    fn abort_compare(&mut self, ix: usize, compare: Compare, reason: &'static str, now: Micros) {
        let root = &mut self.roots[ix];
        compare.note_abort(root, reason);
        for id in &compare.err_list {
            self.actions.remove(*id);
        }
        root.remove_remote_hash(&compare.hash_r());
        root.names_to_fetch.clear();
        root.advise_need = self.config.advise_need_reset;
        self.compares_busy = self.compares_busy.saturating_sub(1);
        self.events.push_back(SyncEvent::new(
            root.id,
            now,
            SyncEventKind::CompareAborted {
                remote_hash: compare.hash_r(),
                reason: reason.to_owned(),
            },
        ));
    }

    /// Hands a batch of queued node encodings to durable storage and
    /// advances the stable target as root nodes land.
    fn clean_cache_batch(&mut self, now: Micros, store: &mut dyn ContentStore) {
        if now.saturating_sub(self.last_cache_clean) < self.config.cache_clean_delta {
            return;
        }
        let mut budget = self.config.cache_clean_batch;
        for root in &mut self.roots {
            while budget > 0 {
                let Some(hash) = root.storing.pop_front() else {
                    break;
                };
                budget -= 1;
                let Some(entry) = root.cache.lookup_mut(&hash) else {
                    continue;
                };
                let Some(encoding) = entry.encoding.as_ref().map(Arc::clone) else {
                    entry.state.storing = false;
                    continue;
                };
                let name =
                    command_prefix(&root.config.topo_prefix, Verb::NodeFetch, &root.slice_hash)
                        .appended(hash.as_bytes().to_vec());
                match store.local_store(ContentObject::new(name, encoding.to_vec())) {
                    Ok(()) => {
                        entry.state.storing = false;
                        entry.state.stored = true;
                        let point = entry.stable_point;
                        if point > root.stable_point {
                            // the node that just got stored advances the root
                            root.stable_point = point;
                            self.last_stable = now;
                            if point > self.stable_target {
                                self.stable_target = point;
                            }
                            debug!(root = root.id, %point, "newly stable");
                        }
                    }
                    Err(err) => {
                        // storage failure is stats-visible only; re-queue
                        warn!(root = root.id, %hash, %err, "node store failed");
                        root.storing.push_back(hash);
                        break;
                    }
                }
            }
        }
        self.last_cache_clean = now;
    }

    /// Persists the stable point once everything is quiet.
    fn commit_stable_point(&mut self, now: Micros, store: &mut dyn ContentStore) {
        if self.stable_target <= self.stable_stored {
            return;
        }
        if self.roots.iter().any(|root| !root.storing.is_empty()) {
            return;
        }
        if now.saturating_sub(self.last_stable) <= self.config.stable_time_trig {
            return;
        }
        if self.roots.iter().any(|root| !root.names_to_add.is_empty()) {
            return;
        }
        let value = self.stable_target.encode();
        let object = ContentObject::new(
            stable_point_name(&self.config.local_host_prefix),
            encode_stable_point(value),
        );
        match store.local_store(object) {
            Ok(()) => {
                info!(value, "stable target reached");
                self.stable_stored = self.stable_target;
                self.last_stable = now;
                self.events.push_back(SyncEvent::new(
                    RootId::MAX,
                    now,
                    SyncEventKind::StablePoint { value },
                ));
            }
            Err(err) => warn!(%err, "stable target not stored"),
        }
    }

    /// Handles an arriving interest for one of the registered command
    /// prefixes. Returns true when a response was published.
    pub fn on_interest(
        &mut self,
        interest: &Interest,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> bool {
        let Some((ix, verb)) = self.match_interest(&interest.name) else {
            return false;
        };
        match verb {
            Verb::RootStats => {
                let root = &mut self.roots[ix];
                let mut body = format!("{}.{:06}: ", now / 1_000_000, now % 1_000_000);
                body.push_str(&root.format_stats(now));
                let name = interest.name.appended(now.to_string().into_bytes());
                transport.put(ContentObject::new(name, body.into_bytes()));
                true
            }
            Verb::NodeFetch => self.respond_node_fetch(ix, interest, now, transport),
            Verb::RootAdvise => self.respond_root_advise(ix, interest, now, transport),
        }
    }

    /// Finds which root and verb an interest name addresses.
    fn match_interest(&self, name: &Name) -> Option<(usize, Verb)> {
        for (ix, root) in self.roots.iter().enumerate() {
            let topo = &root.config.topo_prefix;
            if !name.starts_with(topo) || name.len() < topo.len() + 2 {
                continue;
            }
            let verb = match name.component(topo.len()) {
                Some(marker) if marker == Verb::RootAdvise.marker() => Verb::RootAdvise,
                Some(marker) if marker == Verb::NodeFetch.marker() => Verb::NodeFetch,
                Some(marker) if marker == Verb::RootStats.marker() => Verb::RootStats,
                _ => continue,
            };
            let Some(slice) = hash_component(name, topo.len() + 1) else {
                continue;
            };
            if slice == root.slice_hash {
                return Some((ix, verb));
            }
        }
        None
    }

    fn respond_node_fetch(
        &mut self,
        ix: usize,
        interest: &Interest,
        _now: Micros,
        transport: &mut dyn Transport,
    ) -> bool {
        let root = &mut self.roots[ix];
        root.stats.node_fetch_seen += 1;
        let skip = root.config.topo_prefix.len() + 2;
        let Some(hash) = hash_component(&interest.name, skip) else {
            debug!(root = root.id, "node fetch without hash");
            return false;
        };
        let encoding = match root.cache.fetch_local(&hash) {
            Ok(node) => node.encode(),
            Err(_) => {
                debug!(root = root.id, %hash, "no local node");
                return false;
            }
        };
        transport.put(ContentObject::new(interest.name.clone(), encoding));
        true
    }

    fn respond_root_advise(
        &mut self,
        ix: usize,
        interest: &Interest,
        now: Micros,
        transport: &mut dyn Transport,
    ) -> bool {
        let root = &mut self.roots[ix];
        root.stats.root_advise_seen += 1;
        let skip = root.config.topo_prefix.len() + 2;
        let Some(remote) = optional_hash_component(&interest.name, skip) else {
            debug!(root = root.id, "malformed advise hash");
            return false;
        };

        if let Some(hash) = remote {
            let first_sighting = root
                .cache
                .lookup(&hash)
                .is_none_or(|entry| entry.last_remote_fetch == 0);
            root.note_remote_hash(hash, now);
            root.advise_need = self.config.advise_need_reset;
            if first_sighting {
                // force any old advise interest to be inactive
                if let Some(id) = self
                    .actions
                    .find_kind(&root.actions, ActionKind::RootAdvise)
                {
                    self.actions.deactivate(id);
                }
            }
        }

        let Some(local) = root.current_hash else {
            if remote.is_none() {
                // both sides empty: suppress short-term thrashing
                root.advise_need = 0;
            }
            return false;
        };
        if remote == Some(local) {
            // same hash, so no response; a quiet moment for housekeeping
            purge_old_entries(root, &self.config, now);
            return false;
        }
        if interest.excludes(&local) {
            return false;
        }
        let encoding = match root.cache.fetch_local(&local) {
            Ok(node) => node.encode(),
            Err(err) => {
                warn!(root = root.id, %err, "local root not decodable");
                return false;
            }
        };
        root.advise_need = self.config.advise_need_reset;
        let name = interest.name.appended(local.as_bytes().to_vec());
        transport.put(ContentObject::new(name, encoding));
        true
    }

    /// Handles one transport upcall for an expressed interest.
    pub fn on_response(
        &mut self,
        action_id: ActionId,
        response: Response,
        now: Micros,
        transport: &mut dyn Transport,
        store: &mut dyn ContentStore,
    ) {
        let Some(action) = self.actions.get(action_id).cloned() else {
            return;
        };
        if matches!(response, Response::Final) {
            if action.state == ActionState::Sent {
                self.actions.remove(action_id);
                if let Some(root) = self.roots.iter_mut().find(|r| r.id == action.root) {
                    root.actions.retain(|id| *id != action_id);
                }
            }
            return;
        }
        if action.kind == ActionKind::None {
            // superseded; the response is of no interest
            return;
        }
        let Some(ix) = self.roots.iter().position(|r| r.id == action.root) else {
            self.actions.remove(action_id);
            return;
        };

        let faux = self.faux_error();
        match action.kind {
            ActionKind::RootAdvise => {
                self.on_advise_response(ix, &action, response, faux, now, transport)
            }
            ActionKind::NodeFetch => self.on_node_fetch_response(ix, &action, response, faux, now),
            ActionKind::ContentFetch => {
                self.on_content_fetch_response(ix, &action, response, faux, now, store)
            }
            ActionKind::None => {}
        }

        self.drive_machines(now, transport, store);
    }

    fn on_advise_response(
        &mut self,
        ix: usize,
        action: &crate::actions::SyncAction,
        response: Response,
        faux: bool,
        now: Micros,
        transport: &mut dyn Transport,
    ) {
        let root = &mut self.roots[ix];
        match response {
            Response::Timeout => {
                root.stats.root_advise_timeout += 1;
                // as long as we need a response, keep expressing it
                let mut interest =
                    Interest::new(action.name.clone(), self.config.root_advise_lifetime);
                interest.exclusions = exclusions_from_remote_seen(root, &self.config);
                transport.express_interest(action.id, interest);
            }
            Response::Final => {}
            other => {
                let Some(object) = other.content() else {
                    return;
                };
                let skip = action.name.len();
                let hash = hash_component(&object.name, skip);
                let mut failed = faux;
                match hash {
                    None => {
                        warn!(root = root.id, "advise response without hash");
                        failed = true;
                    }
                    Some(hash) if !failed => {
                        root.note_remote_hash(hash, now);
                        let covered = root
                            .cache
                            .lookup(&hash)
                            .is_some_and(slicesync_tree::CacheEntry::is_covered);
                        let present = root
                            .cache
                            .lookup(&hash)
                            .is_some_and(|e| e.node(true).is_some());
                        if !covered && !present {
                            match decode_remote_node(&object.body, &hash) {
                                Ok(node) => {
                                    if let Some(entry) = root.cache.lookup_mut(&hash) {
                                        entry.install_remote(node, now);
                                    }
                                    root.stats.root_advise_bytes += object.body.len() as u64;
                                }
                                Err(err) => {
                                    warn!(root = root.id, %err, "advise node rejected");
                                    failed = true;
                                }
                            }
                        }
                    }
                    Some(_) => {}
                }
                if failed {
                    root.stats.root_advise_failed += 1;
                } else {
                    root.stats.root_advise_received += 1;
                }
            }
        }
    }

    fn on_node_fetch_response(
        &mut self,
        ix: usize,
        action: &crate::actions::SyncAction,
        response: Response,
        faux: bool,
        now: Micros,
    ) {
        let root = &mut self.roots[ix];
        let Some(hash) = action.hash else {
            self.remove_action(ix, action.id);
            return;
        };
        let timed_out = matches!(response, Response::Timeout);
        let object = if timed_out {
            None
        } else {
            response.content().filter(|_| !faux)
        };
        let mut ok = false;
        if let Some(object) = &object {
            let covered_or_present = root.cache.lookup(&hash).is_some_and(|entry| {
                entry.is_covered() || entry.node(true).is_some()
            });
            if covered_or_present {
                // there was a race, and we no longer need this
                ok = true;
            } else {
                match decode_remote_node(&object.body, &hash) {
                    Ok(node) => {
                        if let Some(entry) = root.cache.lookup_mut(&hash) {
                            entry.install_remote(node, now);
                        }
                        ok = true;
                    }
                    Err(err) => {
                        warn!(root = root.id, %hash, %err, "node fetch rejected");
                    }
                }
            }
        }
        if let Some(entry) = root.cache.lookup_mut(&hash) {
            entry.state.fetching = false;
        }
        let epoch_matches = root
            .compare
            .as_ref()
            .is_some_and(|compare| compare.epoch == action.compare_epoch);
        if let Some(compare) = root.compare.as_mut().filter(|_| epoch_matches) {
            compare.node_fetch_busy = compare.node_fetch_busy.saturating_sub(1);
        }
        if ok {
            root.stats.node_fetch_received += 1;
            root.stats.node_fetch_bytes += object.map_or(0, |o| o.body.len() as u64);
            if let Some(compare) = root.compare.as_mut().filter(|_| epoch_matches) {
                compare.last_fetch_ok = now;
            }
            self.remove_action(ix, action.id);
        } else {
            if timed_out {
                root.stats.node_fetch_timeout += 1;
            } else {
                root.stats.node_fetch_failed += 1;
            }
            if epoch_matches {
                let root = &mut self.roots[ix];
                if let Some(compare) = root.compare.as_mut() {
                    compare.node_fetch_failed += 1;
                }
                self.move_action_to_err(ix, action.id);
            } else {
                self.remove_action(ix, action.id);
            }
        }
    }

    fn on_content_fetch_response(
        &mut self,
        ix: usize,
        action: &crate::actions::SyncAction,
        response: Response,
        faux: bool,
        now: Micros,
        store: &mut dyn ContentStore,
    ) {
        let timed_out = matches!(response, Response::Timeout);
        let object = if timed_out {
            None
        } else {
            response.content().filter(|_| !faux)
        };
        let mut stored: Option<Option<Accession>> = None;
        if let Some(object) = object {
            let bytes = object.body.len() as u64;
            match store.upcall_store(object) {
                Ok(item) => {
                    let root = &mut self.roots[ix];
                    root.stats.content_fetch_received += 1;
                    root.stats.content_fetch_bytes += bytes;
                    stored = Some(item);
                }
                Err(err) => {
                    warn!(%err, "content store failed");
                }
            }
        }
        let epoch_matches = self.roots[ix]
            .compare
            .as_ref()
            .is_some_and(|compare| compare.epoch == action.compare_epoch);
        if let Some(compare) = self.roots[ix]
            .compare
            .as_mut()
            .filter(|_| epoch_matches)
        {
            compare.content_fetch_busy = compare.content_fetch_busy.saturating_sub(1);
        }
        match stored {
            Some(item) => {
                if let Some(compare) = self.roots[ix]
                    .compare
                    .as_mut()
                    .filter(|_| epoch_matches)
                {
                    compare.last_fetch_ok = now;
                }
                self.remove_action(ix, action.id);
                // the fetched object needs to enter the tree, too
                self.add_name(&action.name, item, now);
            }
            None => {
                let root = &mut self.roots[ix];
                if timed_out {
                    root.stats.content_fetch_timeout += 1;
                } else {
                    root.stats.content_fetch_failed += 1;
                }
                if epoch_matches {
                    if let Some(compare) = root.compare.as_mut() {
                        compare.content_fetch_failed += 1;
                    }
                    self.move_action_to_err(ix, action.id);
                } else {
                    self.remove_action(ix, action.id);
                }
            }
        }
    }

    /// Drops an action from the table and its root's sent list.
    fn remove_action(&mut self, ix: usize, id: ActionId) {
        self.actions.remove(id);
        self.roots[ix].actions.retain(|a| *a != id);
    }

    /// Moves a failed fetch to the owning Compare's error list.
    fn move_action_to_err(&mut self, ix: usize, id: ActionId) {
        let root = &mut self.roots[ix];
        root.actions.retain(|a| *a != id);
        if let Some(action) = self.actions.get_mut(id) {
            action.state = ActionState::Errored;
        }
        if let Some(compare) = root.compare.as_mut() {
            compare.err_list.push_back(id);
        } else {
            self.actions.remove(id);
        }
    }

    /// Returns true with probability `faux_error_trigger` percent.
    fn faux_error(&mut self) -> bool {
        let trigger = self.config.faux_error_trigger;
        trigger > 0 && self.rng.gen_range(0..100) < trigger
    }
}

/// Decodes a node body and insists it answers to the requested hash.
fn decode_remote_node(body: &[u8], expected: &NodeHash) -> Result<Arc<TreeNode>, EngineError> {
    let node = TreeNode::decode(body)?;
    if node.hash() != *expected {
        return Err(EngineError::BadEncoding(
            "node body does not match requested hash".into(),
        ));
    }
    Ok(Arc::new(node))
}

/// Sends (or refreshes) the RootAdvise interest for a root.
fn send_root_advise(
    root: &mut Root,
    actions: &mut ActionTable,
    config: &EngineConfig,
    now: Micros,
    transport: &mut dyn Transport,
) {
    if let Some(existing) = actions.find_kind(&root.actions, ActionKind::RootAdvise) {
        // don't override the existing interest unless the root has changed
        if root.current_hash.is_none() || root.current_hash == root.last_local_sent {
            return;
        }
        actions.deactivate(existing);
    }

    let name = command_prefix(&root.config.topo_prefix, Verb::RootAdvise, &root.slice_hash)
        .appended(crate::wire::hash_to_component(root.current_hash.as_ref()));
    let mut interest = Interest::new(name.clone(), config.root_advise_lifetime);
    interest.exclusions = exclusions_from_remote_seen(root, config);

    let id = actions.create(
        root.id,
        ActionKind::RootAdvise,
        name,
        root.current_hash,
        0,
        now,
    );
    root.actions.push(id);
    root.advise_need = root.advise_need.saturating_sub(1);
    root.last_advise = now;
    root.last_local_sent = root.current_hash;
    root.stats.root_advise_sent += 1;
    debug!(root = root.id, hash = ?root.current_hash, "root advise sent");
    transport.express_interest(id, interest);
}

/// Builds the sorted exclusion list: our own root plus every covered remote
/// root, within the configured byte budget.
fn exclusions_from_remote_seen(root: &Root, config: &EngineConfig) -> Vec<NodeHash> {
    let mut exclusions = Vec::new();
    let mut budget = 0usize;
    if let Some(local) = root.current_hash {
        budget += 40;
        exclusions.push(local);
    }
    for seen in &root.remote_seen {
        let Some(entry) = root.cache.lookup(&seen.hash) else {
            continue;
        };
        if entry.state.remote && entry.state.covered {
            budget += 40;
            if budget > config.exclusion_limit {
                // list is getting too long; ignore earlier roots
                break;
            }
            exclusions.push(seen.hash);
        }
    }
    exclusions.sort_unstable();
    exclusions.dedup();
    exclusions
}

/// Reclaims cache memory not reachable from the current tree.
fn purge_old_entries(root: &mut Root, config: &EngineConfig, now: Micros) {
    let Some(current) = root.current_hash else {
        return;
    };
    root.cache.clear_marks();
    root.cache.mark_reachable(current, false);
    let outcome = root.cache.purge(now, config.cache_purge_trigger);
    if outcome.nodes_dropped > 0 || outcome.entries_evicted > 0 {
        debug!(
            root = root.id,
            dropped = outcome.nodes_dropped,
            evicted = outcome.entries_evicted,
            "cache purged"
        );
    }
}

//! In-memory collaborators and a two-peer router for engine tests.
//!
//! Everything here is deterministic: time is a plain microsecond counter
//! owned by the test, the network is a vector of pending interests, and
//! faults are explicit switches.

#![allow(dead_code)]

use std::collections::BTreeMap;

use eyre::Result;
use slicesync_engine::{
    ActionId, ContentObject, ContentStore, EngineConfig, EnumToken, Interest, Micros, Response,
    SyncEngine, Transport,
};
use slicesync_primitives::{Accession, Name, NodeHash, SliceConfig};

pub use slicesync_engine::wire;

/// One second, in engine time.
pub const SEC: Micros = 1_000_000;

/// Records outbound traffic; the router drains it.
#[derive(Debug, Default)]
pub struct MemTransport {
    pub sent: Vec<(ActionId, Interest)>,
    pub published: Vec<ContentObject>,
    pub filters: Vec<Name>,
}

impl Transport for MemTransport {
    fn express_interest(&mut self, action: ActionId, interest: Interest) {
        self.sent.push((action, interest));
    }

    fn set_interest_filter(&mut self, prefix: Name) {
        self.filters.push(prefix);
    }

    fn clear_interest_filter(&mut self, prefix: Name) {
        self.filters.retain(|f| *f != prefix);
    }

    fn put(&mut self, object: ContentObject) {
        self.published.push(object);
    }
}

/// Name-keyed object store with sequential accession numbers.
#[derive(Debug, Default)]
pub struct MemStore {
    pub objects: BTreeMap<Name, ContentObject>,
    next_accession: u64,
    next_enum: u64,
    pub enumerations: Vec<(EnumToken, Name)>,
    pub notified_after: Vec<u64>,
}

impl MemStore {
    /// Stores content as the host repository would, assigning an accession.
    pub fn insert_content(&mut self, name: Name, body: Vec<u8>) -> Accession {
        self.next_accession += 1;
        let item = Accession::new(self.next_accession).expect("nonzero");
        self.objects.insert(name.clone(), ContentObject::new(name, body));
        item
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.objects.contains_key(name)
    }

    /// Names stored under `prefix`, in lexicographic order.
    pub fn names_under(&self, prefix: &Name) -> Vec<Name> {
        self.objects
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl ContentStore for MemStore {
    fn enumerate(&mut self, prefix: &Name) -> Result<EnumToken> {
        self.next_enum += 1;
        let token = EnumToken(self.next_enum);
        self.enumerations.push((token, prefix.clone()));
        Ok(token)
    }

    fn lookup(&self, name: &Name) -> Option<ContentObject> {
        self.objects.get(name).cloned()
    }

    fn local_store(&mut self, object: ContentObject) -> Result<()> {
        self.objects.insert(object.name.clone(), object);
        Ok(())
    }

    fn upcall_store(&mut self, object: ContentObject) -> Result<Option<Accession>> {
        self.next_accession += 1;
        let item = Accession::new(self.next_accession);
        self.objects.insert(object.name.clone(), object);
        Ok(item)
    }

    fn notify_after(&mut self, high_water: u64) {
        self.notified_after.push(high_water);
    }
}

/// One repository: engine plus its collaborators.
pub struct Peer {
    pub engine: SyncEngine,
    pub transport: MemTransport,
    pub store: MemStore,
    pub slice_hash: NodeHash,
}

impl Peer {
    /// Builds a started peer subscribed to `slice`.
    pub fn new(config: EngineConfig, slice: SliceConfig, now: Micros) -> Self {
        let slice_hash = slice.slice_hash();
        let mut peer = Self {
            engine: SyncEngine::new(config),
            transport: MemTransport::default(),
            store: MemStore::default(),
            slice_hash,
        };
        peer.engine.start(now, &mut peer.store);
        peer.engine
            .create_slice(slice, now, &mut peer.transport)
            .expect("fresh slice");
        peer
    }

    pub fn heartbeat(&mut self, now: Micros) {
        self.engine
            .heartbeat(now, &mut self.transport, &mut self.store);
        self.complete_enumerations(now);
    }

    /// Replays any requested enumerations out of the store.
    fn complete_enumerations(&mut self, now: Micros) {
        let pending: Vec<_> = self.store.enumerations.drain(..).collect();
        for (token, prefix) in pending {
            for name in self.store.names_under(&prefix) {
                self.engine.add_name(&name, None, now);
            }
            self.engine.note_enum_complete(token);
        }
    }

    /// Stores new content locally and tells the engine about it.
    pub fn publish(&mut self, uri: &str, now: Micros) {
        let name = Name::parse_uri(uri);
        let body = format!("content of {uri}").into_bytes();
        let item = self.store.insert_content(name.clone(), body);
        self.engine.add_name(&name, Some(item), now);
    }

    pub fn current_hash(&self) -> Option<NodeHash> {
        self.engine
            .root_by_slice(&self.slice_hash)
            .and_then(|root| root.current_hash)
    }

    pub fn stats(&self) -> slicesync_engine::RootStats {
        self.engine
            .root_by_slice(&self.slice_hash)
            .map(|root| root.stats)
            .unwrap_or_default()
    }

    /// Serves an incoming interest: sync verbs through the engine,
    /// everything else from content storage.
    fn serve(&mut self, interest: &Interest, now: Micros) -> Option<ContentObject> {
        if self
            .engine
            .on_interest(interest, now, &mut self.transport)
        {
            let responses: Vec<_> = self.transport.published.drain(..).collect();
            return responses
                .into_iter()
                .find(|object| object.name.starts_with(&interest.name));
        }
        self.store.lookup(&interest.name)
    }

    fn on_response(&mut self, action: ActionId, response: Response, now: Micros) {
        self.engine
            .on_response(action, response, now, &mut self.transport, &mut self.store);
    }
}

struct PendingInterest {
    from: usize,
    action: ActionId,
    interest: Interest,
    expires: Micros,
}

/// Two peers and the interests in flight between them.
pub struct Net {
    pending: Vec<PendingInterest>,
    /// Peers that currently refuse to answer NodeFetch (fault injection).
    pub drop_node_fetch_at: [bool; 2],
    /// Content interests delivered, in order, per requester.
    pub content_fetch_log: [Vec<Name>; 2],
}

impl Net {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            drop_node_fetch_at: [false, false],
            content_fetch_log: [Vec::new(), Vec::new()],
        }
    }

    fn is_node_fetch(interest: &Interest) -> bool {
        interest
            .name
            .components()
            .iter()
            .any(|c| c.as_slice() == wire::CMD_NODE_FETCH)
    }

    fn is_sync_command(interest: &Interest) -> bool {
        interest.name.components().iter().any(|c| {
            matches!(
                c.as_slice(),
                wire::CMD_NODE_FETCH | wire::CMD_ROOT_ADVISE | wire::CMD_ROOT_STATS
            )
        })
    }

    /// Routes traffic until the network goes quiet at this instant.
    pub fn settle(&mut self, peers: &mut [Peer; 2], now: Micros) {
        loop {
            let mut traffic = false;

            for (ix, peer) in peers.iter_mut().enumerate() {
                for (action, interest) in peer.transport.sent.drain(..) {
                    let expires = now + interest.lifetime.max(SEC);
                    self.pending.push(PendingInterest {
                        from: ix,
                        action,
                        interest,
                        expires,
                    });
                    traffic = true;
                }
            }

            let mut still = Vec::new();
            for pending in self.pending.drain(..) {
                let responder = 1 - pending.from;
                let blocked = self.drop_node_fetch_at[responder]
                    && Self::is_node_fetch(&pending.interest);

                let response = if blocked {
                    None
                } else {
                    peers[responder].serve(&pending.interest, now)
                };

                match response {
                    Some(object) => {
                        if !Self::is_sync_command(&pending.interest) {
                            self.content_fetch_log[pending.from]
                                .push(pending.interest.name.clone());
                        }
                        peers[pending.from].on_response(
                            pending.action,
                            Response::Content(object),
                            now,
                        );
                        // the transport retires the closure after delivery
                        peers[pending.from].on_response(pending.action, Response::Final, now);
                        traffic = true;
                    }
                    None if now >= pending.expires => {
                        peers[pending.from].on_response(pending.action, Response::Timeout, now);
                        traffic = true;
                    }
                    None => still.push(pending),
                }
            }
            self.pending = still;

            if !traffic {
                break;
            }
        }
    }
}

/// Ticks both peers and the network forward to `until`, one second at a
/// time. Returns the first instant at which both peers hold the same
/// non-empty root hash, if any.
pub fn run_until_converged(
    peers: &mut [Peer; 2],
    net: &mut Net,
    mut now: Micros,
    until: Micros,
) -> Option<Micros> {
    while now <= until {
        for ix in 0..2 {
            peers[ix].heartbeat(now);
            net.settle(peers, now);
        }
        let a = peers[0].current_hash();
        if a.is_some() && a == peers[1].current_hash() {
            return Some(now);
        }
        now += SEC;
    }
    None
}

/// A slice over `/repo` scoped to the `/topo` routing prefix.
pub fn test_slice() -> SliceConfig {
    SliceConfig::new(Name::parse_uri("/topo"), Name::parse_uri("/repo"))
}

/// Engine config tuned so tests converge in a few simulated seconds.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        update_need_delta: SEC,
        root_advise_lifetime: 5 * SEC,
        fetch_lifetime: 2 * SEC,
        cache_clean_delta: 2 * SEC,
        stable_time_trig: 3 * SEC,
        compare_assume_bad: 8 * SEC,
        heartbeat_micros: SEC,
        ..EngineConfig::default()
    }
}

//! Tokio driver for the engine core.
//!
//! The engine itself is synchronous and clock-free; this service owns the
//! wall clock, the heartbeat interval, and the command channel through
//! which the host repository delivers transport upcalls and storage
//! notifications. All engine state stays on this one task.

use std::time::{Duration, Instant};

use slicesync_primitives::{Accession, Name, NodeHash, SliceConfig};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, warn};

use crate::actions::ActionId;
use crate::config::{EngineConfig, Micros};
use crate::deps::{ContentStore, EnumToken, Transport};
use crate::engine::SyncEngine;
use crate::events::SyncEvent;
use crate::wire::{ContentObject, Interest, Response};

/// Commands the host can send to a running service.
#[derive(Debug)]
pub enum Command {
    /// A new name was stored locally (or enumerated).
    AddName {
        name: Name,
        item: Option<Accession>,
    },
    /// A slice announcement or tombstone was observed.
    Slice(ContentObject),
    /// An interest arrived on a registered filter.
    Interest(Interest),
    /// A response upcall for an expressed interest.
    Response {
        action: ActionId,
        response: Response,
    },
    /// An enumeration finished.
    EnumComplete(EnumToken),
    /// Snapshot the stats text for a slice.
    Stats {
        slice_hash: NodeHash,
        reply: oneshot::Sender<Option<String>>,
    },
    /// Stop the service loop.
    Shutdown,
}

/// Handle used to talk to a running [`SyncService`].
#[derive(Clone, Debug)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Command>,
}

impl ServiceHandle {
    pub async fn send(&self, command: Command) -> bool {
        self.tx.send(command).await.is_ok()
    }
}

/// Owns a [`SyncEngine`] and its collaborators, pumping time and commands.
pub struct SyncService<T, S> {
    engine: SyncEngine,
    transport: T,
    store: S,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::Sender<Command>,
    epoch: Instant,
    events: mpsc::Sender<SyncEvent>,
}

impl<T: Transport, S: ContentStore> SyncService<T, S> {
    pub fn new(
        config: EngineConfig,
        transport: T,
        store: S,
        events: mpsc::Sender<SyncEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        Self {
            engine: SyncEngine::new(config),
            transport,
            store,
            rx,
            tx,
            epoch: Instant::now(),
            events,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            tx: self.tx.clone(),
        }
    }

    /// Creates a slice directly (host-initiated rather than announced).
    pub fn create_slice(&mut self, slice: SliceConfig) -> eyre::Result<()> {
        let now = self.now();
        self.engine
            .create_slice(slice, now, &mut self.transport)
            .map(|_| ())
            .map_err(Into::into)
    }

    fn now(&self) -> Micros {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    /// Runs the heartbeat and command loop until shutdown.
    pub async fn run(mut self) {
        let now = self.now();
        self.engine.start(now, &mut self.store);

        let heartbeat = Duration::from_micros(self.engine.config().heartbeat_micros);
        let short_delay = Duration::from_micros(self.engine.config().short_delay.max(1));
        let mut ticker = interval(heartbeat);

        loop {
            // when a state machine yielded mid-phase, poll again shortly
            // rather than waiting a whole heartbeat
            let idle = !self.engine.has_active_machines();

            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.now();
                    self.engine.heartbeat(now, &mut self.transport, &mut self.store);
                }
                _ = tokio::time::sleep(short_delay), if !idle => {
                    let now = self.now();
                    self.engine.heartbeat(now, &mut self.transport, &mut self.store);
                }
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.dispatch(command) {
                        break;
                    }
                }
            }

            for event in self.engine.drain_events() {
                debug!(?event, "sync event");
                // events are best-effort; a full channel drops them
                let _ = self.events.try_send(event);
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> bool {
        let now = self.now();
        match command {
            Command::AddName { name, item } => {
                self.engine.add_name(&name, item, now);
            }
            Command::Slice(object) => {
                if let Err(err) = self.engine.handle_slice(&object, now, &mut self.transport) {
                    warn!(%err, "slice announcement rejected");
                }
            }
            Command::Interest(interest) => {
                let _ = self
                    .engine
                    .on_interest(&interest, now, &mut self.transport);
            }
            Command::Response { action, response } => {
                self.engine
                    .on_response(action, response, now, &mut self.transport, &mut self.store);
            }
            Command::EnumComplete(token) => {
                self.engine.note_enum_complete(token);
            }
            Command::Stats { slice_hash, reply } => {
                let stats = self
                    .engine
                    .root_by_slice(&slice_hash)
                    .map(|root| root.format_stats(now));
                let _ = reply.send(stats);
            }
            Command::Shutdown => return false,
        }
        true
    }
}

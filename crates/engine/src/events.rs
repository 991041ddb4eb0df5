//! Observable engine events.
//!
//! The engine appends events to an internal queue as work completes; hosts
//! drain them for logging, metrics, or test assertions. Events are a
//! reporting surface only; nothing inside the engine reacts to them.

use serde::{Deserialize, Serialize};
use slicesync_primitives::NodeHash;

use crate::config::Micros;
use crate::root::RootId;

/// Something worth telling the host about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncEvent {
    pub root: RootId,
    pub at: Micros,
    pub kind: SyncEventKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SyncEventKind {
    SliceCreated {
        slice_hash: NodeHash,
    },
    SliceRemoved {
        slice_hash: NodeHash,
    },
    UpdateDone {
        root_hash: NodeHash,
        names_inserted: u64,
        micros: Micros,
    },
    CompareDone {
        remote_hash: NodeHash,
        names_fetched: u64,
        micros: Micros,
    },
    CompareAborted {
        remote_hash: NodeHash,
        reason: String,
    },
    StablePoint {
        value: u64,
    },
}

impl SyncEvent {
    pub fn new(root: RootId, at: Micros, kind: SyncEventKind) -> Self {
        Self { root, at, kind }
    }
}

//! The SliceSync engine: eventually-consistent replication of named-object
//! slices between cooperating repositories.
//!
//! Replicas exchange Merkle-style summary trees over an interest/response
//! protocol. Each slice gets a [`root::Root`] holding its current tree; the
//! [`update::Update`] machine folds newly stored names into the tree, the
//! [`compare::Compare`] machine reconciles it against peer trees, and a
//! single heartbeat ([`SyncEngine::heartbeat`]) drives everything.
//!
//! The core ([`SyncEngine`]) is deterministic and synchronous: callers
//! supply time and the transport/storage collaborators on every entry
//! point. [`service::SyncService`] wraps the core in a tokio task for
//! production hosts; tests drive the core directly with a manual clock.

pub mod actions;
pub mod compare;
pub mod config;
pub mod deps;
pub mod engine;
pub mod error;
pub mod events;
pub mod root;
pub mod service;
pub mod stats;
pub mod update;
pub mod wire;

pub use actions::{ActionId, ActionKind};
pub use config::{EngineConfig, Micros};
pub use deps::{ContentStore, EnumToken, Transport};
pub use engine::SyncEngine;
pub use error::EngineError;
pub use events::{SyncEvent, SyncEventKind};
pub use root::{Root, RootId};
pub use service::{Command, ServiceHandle, SyncService};
pub use stats::RootStats;
pub use wire::{ContentObject, Interest, Response};

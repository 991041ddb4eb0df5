//! Collaborator seams: the transport and storage interfaces the engine
//! drives.
//!
//! The engine is single-threaded and cooperative, so both traits are
//! synchronous: calls enqueue work and return. Inbound traffic (responses,
//! arriving interests, storage notifications) re-enters through the engine's
//! own methods.

use eyre::Result;
use slicesync_primitives::{Accession, Name};

use crate::actions::ActionId;
use crate::wire::{ContentObject, Interest};

/// Interest/response transport owned by the host repository.
pub trait Transport {
    /// Issues a request. The eventual [`crate::wire::Response`]s are handed
    /// back through `SyncEngine::on_response` with the same `action` id,
    /// ending with `Response::Final`.
    fn express_interest(&mut self, action: ActionId, interest: Interest);

    /// Registers the engine as responder for `prefix`; matching interests
    /// arrive via `SyncEngine::on_interest`.
    fn set_interest_filter(&mut self, prefix: Name);

    /// Withdraws a previously registered filter.
    fn clear_interest_filter(&mut self, prefix: Name);

    /// Publishes a response object.
    fn put(&mut self, object: ContentObject);
}

/// Token identifying an in-flight enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EnumToken(pub u64);

/// Content storage owned by the host repository.
pub trait ContentStore {
    /// Starts an asynchronous enumeration of stored names under `prefix`.
    /// Matches are fed back through `SyncEngine::add_name`; completion is
    /// signalled via `SyncEngine::note_enum_complete` with the returned
    /// token.
    fn enumerate(&mut self, prefix: &Name) -> Result<EnumToken>;

    /// Synchronous local lookup.
    fn lookup(&self, name: &Name) -> Option<ContentObject>;

    /// Commits a locally constructed object (tree nodes, stable points).
    fn local_store(&mut self, object: ContentObject) -> Result<()>;

    /// Commits an object fetched from a peer; returns the accession number
    /// the store assigned, if any.
    fn upcall_store(&mut self, object: ContentObject) -> Result<Option<Accession>>;

    /// Asks the store to notify the engine of items at or above the given
    /// high-water encoding (crash-recovery replay).
    fn notify_after(&mut self, high_water: u64);
}

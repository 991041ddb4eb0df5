//! Outstanding protocol actions.
//!
//! Every expressed interest gets one [`SyncAction`] record, stored in a
//! single table and referenced by handle from whichever queue currently owns
//! it: a root's sent list, or a Compare's error list awaiting retry. A
//! record whose kind is [`ActionKind::None`] is logically inactive (a newer
//! action superseded it) and its responses are ignored until the transport
//! reports `Final`.

use std::collections::HashMap;

use slicesync_primitives::{Name, NodeHash};

use crate::config::Micros;
use crate::root::RootId;

/// Handle to an outstanding action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub u64);

/// What an action is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    RootAdvise,
    NodeFetch,
    ContentFetch,
    /// Superseded; responses are ignored.
    None,
}

/// Which queue owns the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionState {
    /// Linked into the owning root's sent list.
    Sent,
    /// Linked into the owning Compare's error list, awaiting retry.
    Errored,
}

/// One outstanding interest.
#[derive(Clone, Debug)]
pub struct SyncAction {
    pub id: ActionId,
    pub root: RootId,
    pub kind: ActionKind,
    pub state: ActionState,
    /// Full interest name.
    pub name: Name,
    /// The node hash a NodeFetch is after, or the hash a RootAdvise
    /// advertised.
    pub hash: Option<NodeHash>,
    /// Compare generation that issued this action; stale generations must
    /// not touch a newer Compare's busy counters.
    pub compare_epoch: u64,
    pub start_time: Micros,
}

/// Allocation table for action records.
#[derive(Debug, Default)]
pub struct ActionTable {
    next: u64,
    actions: HashMap<ActionId, SyncAction>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Creates a record in the `Sent` state and returns its handle.
    pub fn create(
        &mut self,
        root: RootId,
        kind: ActionKind,
        name: Name,
        hash: Option<NodeHash>,
        compare_epoch: u64,
        now: Micros,
    ) -> ActionId {
        self.next += 1;
        let id = ActionId(self.next);
        self.actions.insert(
            id,
            SyncAction {
                id,
                root,
                kind,
                state: ActionState::Sent,
                name,
                hash,
                compare_epoch,
                start_time: now,
            },
        );
        id
    }

    pub fn get(&self, id: ActionId) -> Option<&SyncAction> {
        self.actions.get(&id)
    }

    pub fn get_mut(&mut self, id: ActionId) -> Option<&mut SyncAction> {
        self.actions.get_mut(&id)
    }

    pub fn remove(&mut self, id: ActionId) -> Option<SyncAction> {
        self.actions.remove(&id)
    }

    /// Marks an action inactive in place; the record lingers until `Final`.
    pub fn deactivate(&mut self, id: ActionId) {
        if let Some(action) = self.actions.get_mut(&id) {
            action.kind = ActionKind::None;
        }
    }

    /// First active action of `kind` among `ids`.
    pub fn find_kind(&self, ids: &[ActionId], kind: ActionKind) -> Option<ActionId> {
        ids.iter()
            .copied()
            .find(|id| self.get(*id).is_some_and(|action| action.kind == kind))
    }

    /// True when an active action of `kind` for `hash` is already pending.
    pub fn has_pending_fetch(&self, ids: &[ActionId], kind: ActionKind, hash: &NodeHash) -> bool {
        ids.iter().any(|id| {
            self.get(*id)
                .is_some_and(|action| action.kind == kind && action.hash.as_ref() == Some(hash))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> NodeHash {
        NodeHash::from_bytes([byte; 32])
    }

    #[test]
    fn create_and_deactivate() {
        let mut table = ActionTable::new();
        let id = table.create(
            0,
            ActionKind::RootAdvise,
            Name::parse_uri("/topo/ra"),
            None,
            0,
            100,
        );
        assert_eq!(table.get(id).unwrap().kind, ActionKind::RootAdvise);

        table.deactivate(id);
        assert_eq!(table.get(id).unwrap().kind, ActionKind::None);
        // record still present until Final
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pending_fetch_detection() {
        let mut table = ActionTable::new();
        let id = table.create(
            0,
            ActionKind::NodeFetch,
            Name::parse_uri("/topo/nf"),
            Some(hash(3)),
            1,
            0,
        );
        let ids = vec![id];
        assert!(table.has_pending_fetch(&ids, ActionKind::NodeFetch, &hash(3)));
        assert!(!table.has_pending_fetch(&ids, ActionKind::NodeFetch, &hash(4)));
        assert!(!table.has_pending_fetch(&ids, ActionKind::ContentFetch, &hash(3)));
    }
}

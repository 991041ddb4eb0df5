//! Content identities for tree nodes.
//!
//! A [`NodeHash`] names a tree node by content. It is produced by the
//! [`LongHash`] accumulator: SHA-256 digests of leaf names, XOR-folded into
//! a running register. XOR-folding makes the result independent of insertion
//! order, so two nodes covering the same set of names get the same identity
//! regardless of how the sets were built.

use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::name::Name;

/// Width of a node hash in bytes.
pub const HASH_BYTES: usize = 32;

/// A 32-byte content identity for a tree node.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct NodeHash([u8; HASH_BYTES]);

impl NodeHash {
    pub const fn from_bytes(bytes: [u8; HASH_BYTES]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }

    /// Digest of a single name, the leaf contribution to a long hash.
    pub fn of_name(name: &Name) -> Self {
        let mut hasher = Sha256::new();
        for component in name.components() {
            hasher.update(u32::try_from(component.len()).unwrap_or(u32::MAX).to_be_bytes());
            hasher.update(component);
        }
        Self(hasher.finalize().into())
    }

    /// Digest of an arbitrary byte string (slice configs, wire bodies).
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({}..)", hex::encode(&self.0[..4]))
    }
}

/// Order-independent hash accumulator.
///
/// Starts at zero; each folded item XORs its digest into the register.
/// Folding is commutative and associative, and folding the same item twice
/// cancels out; callers are responsible for feeding each member exactly
/// once.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct LongHash([u8; HASH_BYTES]);

impl LongHash {
    pub const fn new() -> Self {
        Self([0; HASH_BYTES])
    }

    /// Folds in the digest of a leaf name.
    pub fn fold_name(&mut self, name: &Name) {
        self.fold_hash(&NodeHash::of_name(name));
    }

    /// Folds in an already-computed subtree hash.
    pub fn fold_hash(&mut self, hash: &NodeHash) {
        for (register, byte) in self.0.iter_mut().zip(hash.as_bytes()) {
            *register ^= byte;
        }
    }

    pub fn finish(self) -> NodeHash {
        NodeHash(self.0)
    }
}

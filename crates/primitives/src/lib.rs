//! Core types shared across the SliceSync workspace.
//!
//! This crate is deliberately small and dependency-light: it defines the
//! vocabulary the tree and engine crates speak. Hierarchical [`Name`]s,
//! content identities ([`NodeHash`], [`LongHash`]), slice configurations
//! ([`SliceConfig`]), and the opaque per-repository ordering used for
//! stable-point bookkeeping ([`Accession`], [`HighWater`]).

pub mod accession;
pub mod hash;
pub mod name;
pub mod slice;

pub use accession::{Accession, HighWater};
pub use hash::{LongHash, NodeHash, HASH_BYTES};
pub use name::{Name, NameComponent};
pub use slice::{FilterClause, SliceConfig};

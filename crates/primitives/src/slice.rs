//! Slice configurations: the unit over which repositories reconcile.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::hash::NodeHash;
use crate::name::Name;

/// Wildcard component inside a filter pattern: matches any single component.
pub const CLAUSE_ANY: &[u8] = &[0xff];

/// Current slice configuration encoding version.
pub const SLICE_VERSION: u32 = 2;

/// An accept-clause over names.
///
/// A clause matches a name when its pattern is a component-wise prefix of
/// the name; a [`CLAUSE_ANY`] component in the pattern matches any single
/// component at that position.
#[derive(
    Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct FilterClause {
    pub pattern: Name,
}

impl FilterClause {
    pub fn new(pattern: Name) -> Self {
        Self { pattern }
    }

    pub fn matches(&self, name: &Name) -> bool {
        let pattern = self.pattern.components();
        if name.len() < pattern.len() {
            return false;
        }
        pattern
            .iter()
            .zip(name.components())
            .all(|(p, c)| p.as_slice() == CLAUSE_ANY || p == c)
    }
}

/// Configuration of one slice: a routing-visible topo prefix, the namespace
/// the slice's content lives under, and zero or more accept-clauses.
///
/// The borsh encoding of this struct is the canonical slice body carried in
/// slice-announcement objects; its SHA-256 digest is the slice hash used to
/// scope all Sync protocol traffic.
#[derive(
    Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct SliceConfig {
    pub version: u32,
    pub topo_prefix: Name,
    pub naming_prefix: Name,
    pub clauses: Vec<FilterClause>,
}

impl SliceConfig {
    pub fn new(topo_prefix: Name, naming_prefix: Name) -> Self {
        Self {
            version: SLICE_VERSION,
            topo_prefix,
            naming_prefix,
            clauses: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_clause(mut self, pattern: Name) -> Self {
        self.clauses.push(FilterClause::new(pattern));
        self
    }

    /// Digest of the canonical encoding; identifies the slice on the wire.
    pub fn slice_hash(&self) -> NodeHash {
        let bytes = borsh::to_vec(self).unwrap_or_default();
        NodeHash::of_bytes(&bytes)
    }

    /// True when `name` belongs to this slice.
    ///
    /// The name must live under the naming prefix; if any clauses are
    /// configured, at least one must also accept it.
    pub fn accepts(&self, name: &Name) -> bool {
        if !name.starts_with(&self.naming_prefix) {
            return false;
        }
        self.clauses.is_empty() || self.clauses.iter().any(|clause| clause.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SliceConfig {
        SliceConfig::new(Name::parse_uri("/topo"), Name::parse_uri("/repo"))
    }

    #[test]
    fn accepts_under_naming_prefix() {
        let slice = config();
        assert!(slice.accepts(&Name::parse_uri("/repo/a/1")));
        assert!(!slice.accepts(&Name::parse_uri("/other/a/1")));
    }

    #[test]
    fn clauses_narrow_the_slice() {
        let slice = config().with_clause(Name::parse_uri("/repo/photos"));
        assert!(slice.accepts(&Name::parse_uri("/repo/photos/1")));
        assert!(!slice.accepts(&Name::parse_uri("/repo/docs/1")));
    }

    #[test]
    fn wildcard_component_matches_any_single_component() {
        let pattern = Name::from_components(vec![
            b"repo".to_vec(),
            CLAUSE_ANY.to_vec(),
            b"img".to_vec(),
        ]);
        let slice = config().with_clause(pattern);

        assert!(slice.accepts(&Name::parse_uri("/repo/2025/img")));
        assert!(slice.accepts(&Name::parse_uri("/repo/2026/img/big")));
        assert!(!slice.accepts(&Name::parse_uri("/repo/2026/doc")));
    }

    #[test]
    fn slice_hash_tracks_content() {
        let a = config();
        let b = config().with_clause(Name::parse_uri("/repo/photos"));
        assert_eq!(a.slice_hash(), config().slice_hash());
        assert_ne!(a.slice_hash(), b.slice_hash());
    }
}

//! Hierarchical names: ordered sequences of opaque byte components.

use core::cmp::Ordering;
use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A single name component: an opaque byte string.
pub type NameComponent = Vec<u8>;

/// A hierarchical name.
///
/// Names are immutable once constructed and totally ordered: component by
/// component, lexicographically within a component, with a strict prefix
/// ordering before its extensions (`/a < /a/b < /b`).
#[derive(
    Clone, Default, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Name {
    components: Vec<NameComponent>,
}

impl Name {
    /// The empty name (zero components).
    pub const fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Builds a name from raw components.
    pub fn from_components(components: Vec<NameComponent>) -> Self {
        Self { components }
    }

    /// Convenience constructor from UTF-8 segments: `Name::from_segments(["a", "1"])`.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            components: segments
                .into_iter()
                .map(|s| s.as_ref().as_bytes().to_vec())
                .collect(),
        }
    }

    /// Parses a `/`-separated URI-ish string: `"/a/1"` → `["a", "1"]`.
    ///
    /// Empty segments are dropped, so `"/a//1"` equals `"/a/1"`.
    pub fn parse_uri(uri: &str) -> Self {
        Self {
            components: uri
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
                .collect(),
        }
    }

    pub fn components(&self) -> &[NameComponent] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Returns a new name with `component` appended.
    #[must_use]
    pub fn appended(&self, component: impl Into<NameComponent>) -> Self {
        let mut components = self.components.clone();
        components.push(component.into());
        Self { components }
    }

    /// Returns a new name with all of `other`'s components appended.
    #[must_use]
    pub fn joined(&self, other: &Name) -> Self {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Self { components }
    }

    /// Component at `index`, if present.
    pub fn component(&self, index: usize) -> Option<&[u8]> {
        self.components.get(index).map(Vec::as_slice)
    }

    /// True when `prefix`'s components are a leading subsequence of ours.
    pub fn starts_with(&self, prefix: &Name) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    /// Number of leading components equal between `self` and `other`.
    ///
    /// This is the "match depth" the level-split heuristic watches for
    /// decreases in.
    pub fn component_match(&self, other: &Name) -> usize {
        self.components
            .iter()
            .zip(other.components.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Total encoded payload length, used for node sizing estimates.
    pub fn byte_len(&self) -> usize {
        self.components.iter().map(|c| c.len() + 4).sum::<usize>() + 4
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/")?;
            for &byte in component {
                if byte.is_ascii_graphic() && byte != b'%' && byte != b'/' {
                    write!(f, "{}", byte as char)?;
                } else {
                    write!(f, "%{byte:02x}")?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_component_wise() {
        let a = Name::parse_uri("/a");
        let a1 = Name::parse_uri("/a/1");
        let a2 = Name::parse_uri("/a/2");
        let b = Name::parse_uri("/b");

        assert!(a < a1);
        assert!(a1 < a2);
        assert!(a2 < b);

        // component boundaries matter: "/ab" is not between "/a/1" and "/a/2"
        let ab = Name::parse_uri("/ab");
        assert!(a2 < ab);
    }

    #[test]
    fn prefix_and_match_depth() {
        let base = Name::parse_uri("/repo/photos");
        let deep = Name::parse_uri("/repo/photos/2026/img1");

        assert!(deep.starts_with(&base));
        assert!(!base.starts_with(&deep));
        assert_eq!(deep.component_match(&base), 2);
        assert_eq!(
            deep.component_match(&Name::parse_uri("/repo/photos/2026/img2")),
            3
        );
    }

    #[test]
    fn display_escapes_non_printable() {
        let name = Name::from_components(vec![b"ok".to_vec(), vec![0x00, 0xff]]);
        assert_eq!(name.to_string(), "/ok/%00%ff");
        assert_eq!(Name::root().to_string(), "/");
    }

    #[test]
    fn parse_uri_drops_empty_segments() {
        assert_eq!(Name::parse_uri("/a//b/"), Name::parse_uri("/a/b"));
    }
}

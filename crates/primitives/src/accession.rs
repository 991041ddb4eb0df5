//! Opaque ordering over per-repository sequence numbers.
//!
//! The host repository assigns each stored item an accession number; the
//! engine only ever treats these as a totally-ordered monotonic counter with
//! a distinguished null. The high-water mark over accessions is what gets
//! persisted as the stable point.

use core::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A single item's sequence number. Zero is reserved (never assigned).
#[derive(
    Clone,
    Copy,
    Debug,
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
pub struct Accession(u64);

impl Accession {
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Monotonic high-water mark over accession numbers, with null as the
/// starting state.
#[derive(
    Clone,
    Copy,
    Default,
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
pub struct HighWater(u64);

impl HighWater {
    /// The null mark: below every accession.
    pub const NULL: HighWater = HighWater(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raises the mark to cover `item`.
    #[must_use]
    pub fn update(self, item: Accession) -> Self {
        Self(self.0.max(item.get()))
    }

    /// Join of two marks.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    /// Wire/persistence form. Null encodes as zero.
    pub const fn encode(self) -> u64 {
        self.0
    }

    pub const fn decode(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Debug for HighWater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "HighWater(null)")
        } else {
            write!(f, "HighWater({})", self.0)
        }
    }
}

impl fmt::Display for HighWater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

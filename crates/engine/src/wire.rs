//! On-wire naming and bodies for the Sync protocol verbs.
//!
//! Every exchange rides the host repository's interest/response primitive.
//! A request is a [`Interest`] whose name starts with the slice's topo
//! prefix followed by a command marker and the slice hash; a response is a
//! [`ContentObject`] published at (an extension of) the interest name.

use slicesync_primitives::{Name, NodeHash, SliceConfig};

use crate::config::Micros;
use crate::error::EngineError;

/// Command marker for RootAdvise.
pub const CMD_ROOT_ADVISE: &[u8] = b"ra";
/// Command marker for NodeFetch.
pub const CMD_NODE_FETCH: &[u8] = b"nf";
/// Command marker for RootStats.
pub const CMD_ROOT_STATS: &[u8] = b"rs";
/// Command marker for slice announcements (under the local host prefix).
pub const CMD_SLICE: &[u8] = b"cs";
/// Trailing component of the persisted stable-point object.
pub const STABLE_SUFFIX: &[u8] = b"SyncStable";

/// A request expressed into the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interest {
    pub name: Name,
    /// Lexicographically sorted hashes the sender does not want back.
    pub exclusions: Vec<NodeHash>,
    pub lifetime: Micros,
}

impl Interest {
    pub fn new(name: Name, lifetime: Micros) -> Self {
        Self {
            name,
            exclusions: Vec::new(),
            lifetime,
        }
    }

    /// True when `hash` is shut out by the exclusion list.
    pub fn excludes(&self, hash: &NodeHash) -> bool {
        self.exclusions.binary_search(hash).is_ok()
    }
}

/// A response (or stored object) at a name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentObject {
    pub name: Name,
    pub body: Vec<u8>,
    /// Tombstone marker; a gone object deletes what it names.
    pub gone: bool,
}

impl ContentObject {
    pub fn new(name: Name, body: Vec<u8>) -> Self {
        Self {
            name,
            body,
            gone: false,
        }
    }

    pub fn tombstone(name: Name) -> Self {
        Self {
            name,
            body: Vec::new(),
            gone: true,
        }
    }
}

/// What comes back for an expressed interest.
#[derive(Clone, Debug)]
pub enum Response {
    /// Verified content.
    Content(ContentObject),
    /// Content whose signature could not be verified. Treated as success;
    /// a stricter verification policy belongs to the transport layer.
    Unverified(ContentObject),
    /// Content whose signing key is unavailable.
    KeyMissing(ContentObject),
    /// The interest expired unanswered.
    Timeout,
    /// The transport is done with this interest; the action slot is dead.
    Final,
}

impl Response {
    /// The delivered object, for the kinds that carry one.
    pub fn content(self) -> Option<ContentObject> {
        match self {
            Response::Content(co) | Response::Unverified(co) | Response::KeyMissing(co) => {
                Some(co)
            }
            Response::Timeout | Response::Final => None,
        }
    }
}

/// The protocol verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    RootAdvise,
    NodeFetch,
    RootStats,
}

impl Verb {
    pub const fn marker(self) -> &'static [u8] {
        match self {
            Verb::RootAdvise => CMD_ROOT_ADVISE,
            Verb::NodeFetch => CMD_NODE_FETCH,
            Verb::RootStats => CMD_ROOT_STATS,
        }
    }
}

/// Builds `topo / marker / slice_hash`, the filter prefix for a verb.
pub fn command_prefix(topo: &Name, verb: Verb, slice_hash: &NodeHash) -> Name {
    topo.appended(verb.marker().to_vec())
        .appended(slice_hash.as_bytes().to_vec())
}

/// Builds `<local_host_prefix> / cs / <slice_hash>`, the announcement name
/// for a slice.
pub fn slice_name(local_host_prefix: &Name, slice_hash: &NodeHash) -> Name {
    local_host_prefix
        .appended(CMD_SLICE.to_vec())
        .appended(slice_hash.as_bytes().to_vec())
}

/// Builds the announcement object for a slice configuration.
pub fn slice_announcement(
    local_host_prefix: &Name,
    config: &SliceConfig,
) -> Result<ContentObject, EngineError> {
    let body = borsh::to_vec(config).map_err(|err| EngineError::BadEncoding(err.to_string()))?;
    Ok(ContentObject::new(
        slice_name(local_host_prefix, &config.slice_hash()),
        body,
    ))
}

/// Name of the persisted stable-point object.
pub fn stable_point_name(local_host_prefix: &Name) -> Name {
    local_host_prefix.appended(STABLE_SUFFIX.to_vec())
}

/// Renders the stable-point body: ASCII `stable <number>`.
pub fn encode_stable_point(value: u64) -> Vec<u8> {
    format!("stable {value}").into_bytes()
}

/// Parses a stable-point body.
pub fn decode_stable_point(body: &[u8]) -> Option<u64> {
    let text = core::str::from_utf8(body).ok()?;
    text.strip_prefix("stable ")?.trim().parse().ok()
}

/// Reads the hash carried in a name component, if well-formed.
pub fn hash_component(name: &Name, index: usize) -> Option<NodeHash> {
    let component = name.component(index)?;
    let bytes: [u8; 32] = component.try_into().ok()?;
    Some(NodeHash::from_bytes(bytes))
}

/// Reads a possibly-empty hash component: absent or zero-length means "no
/// hash yet".
pub fn optional_hash_component(name: &Name, index: usize) -> Option<Option<NodeHash>> {
    match name.component(index) {
        None => Some(None),
        Some([]) => Some(None),
        Some(component) => {
            let bytes: [u8; 32] = component.try_into().ok()?;
            Some(Some(NodeHash::from_bytes(bytes)))
        }
    }
}

/// Component encoding of a possibly-empty hash.
pub fn hash_to_component(hash: Option<&NodeHash>) -> Vec<u8> {
    hash.map(|h| h.as_bytes().to_vec()).unwrap_or_default()
}

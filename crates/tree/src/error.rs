use slicesync_primitives::NodeHash;
use thiserror::Error;

/// Errors raised by tree construction, decoding, and cache resolution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TreeError {
    #[error("bad node encoding: {0}")]
    BadEncoding(String),

    #[error("node entries out of order")]
    UnorderedEntries,

    #[error("node has no entries")]
    EmptyNode,

    #[error("no cache entry for hash {0}")]
    MissingEntry(NodeHash),

    #[error("cache entry {0} has no decoded node")]
    NodeNotDecoded(NodeHash),

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

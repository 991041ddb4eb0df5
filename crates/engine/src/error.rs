use slicesync_primitives::NodeHash;
use slicesync_tree::TreeError;
use thiserror::Error;

/// Engine-internal error kinds.
///
/// Most failures are absorbed locally (retries, stats, peer-hash removal);
/// these surface only where an operation has to report why it stopped.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("unknown slice {0}")]
    UnknownSlice(NodeHash),

    #[error("slice {0} already exists")]
    SliceExists(NodeHash),

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

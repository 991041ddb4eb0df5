//! Composite tree nodes and their canonical encoding.

use borsh::{BorshDeserialize, BorshSerialize};
use slicesync_primitives::{LongHash, Name, NodeHash};

use crate::error::TreeError;

/// One entry of a composite node: an inline leaf name, or a reference to a
/// child subtree by hash.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum NodeEntry {
    Leaf(Name),
    Node(NodeHash),
}

impl NodeEntry {
    pub const fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf(_))
    }
}

/// Result of comparing a name against a node's `[min_name, max_name]` span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanCmp {
    /// Name sorts before `min_name`.
    Before,
    /// Name equals `min_name`.
    Min,
    /// Strictly between the bounds.
    Inside,
    /// Name equals `max_name`.
    Max,
    /// Name sorts after `max_name`.
    After,
}

/// A leaf-bearing interior node of a sync tree.
///
/// Entries are strictly ordered by name (the inline name for leaves, the
/// subtree's min name for child references). The summary fields describe the
/// whole subtree; `hash` is the order-independent long-hash identity, which
/// every decoder recomputes and checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeNode {
    entries: Vec<NodeEntry>,
    min_name: Name,
    max_name: Name,
    leaf_count: u64,
    depth: u32,
    byte_count: u64,
    hash: NodeHash,
}

/// Wire form: every field explicit so the decoder can cross-check.
#[derive(BorshSerialize, BorshDeserialize)]
struct WireNode {
    entries: Vec<NodeEntry>,
    min_name: Name,
    max_name: Name,
    leaf_count: u64,
    depth: u32,
    byte_count: u64,
    hash: NodeHash,
}

impl TreeNode {
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn entry(&self, pos: usize) -> Option<&NodeEntry> {
        self.entries.get(pos)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn min_name(&self) -> &Name {
        &self.min_name
    }

    pub fn max_name(&self) -> &Name {
        &self.max_name
    }

    /// Leaves in the whole subtree.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Levels below this node, counting this node as one.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Encoded bytes of the subtree below this node (excluding this node's
    /// own encoding).
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn hash(&self) -> NodeHash {
        self.hash
    }

    /// Canonical byte encoding for transmission and durable storage.
    pub fn encode(&self) -> Vec<u8> {
        let wire = WireNode {
            entries: self.entries.clone(),
            min_name: self.min_name.clone(),
            max_name: self.max_name.clone(),
            leaf_count: self.leaf_count,
            depth: self.depth,
            byte_count: self.byte_count,
            hash: self.hash,
        };
        borsh::to_vec(&wire).unwrap_or_default()
    }

    /// Size of `encode()` without materializing it.
    pub fn encoded_size(&self) -> usize {
        encoded_size_of(&self.entries)
            + self.min_name.byte_len()
            + self.max_name.byte_len()
            + 8
            + 4
            + 8
            + 32
    }

    /// Decodes and validates a node received off the wire.
    ///
    /// Checks the length frame, the adjacent-leaf ordering invariant, the
    /// min/max summary where it is locally derivable, and recomputes the
    /// long-hash identity.
    pub fn decode(bytes: &[u8]) -> Result<Self, TreeError> {
        let wire = WireNode::try_from_slice(bytes)
            .map_err(|err| TreeError::BadEncoding(err.to_string()))?;
        if wire.entries.is_empty() {
            return Err(TreeError::EmptyNode);
        }

        let mut long = LongHash::new();
        let mut prev_leaf: Option<&Name> = None;
        for entry in &wire.entries {
            match entry {
                NodeEntry::Leaf(name) => {
                    if let Some(prev) = prev_leaf {
                        if prev >= name {
                            return Err(TreeError::UnorderedEntries);
                        }
                    }
                    prev_leaf = Some(name);
                    long.fold_name(name);
                }
                NodeEntry::Node(hash) => {
                    prev_leaf = None;
                    long.fold_hash(hash);
                }
            }
        }
        if long.finish() != wire.hash {
            return Err(TreeError::BadEncoding("long-hash mismatch".into()));
        }

        if let Some(NodeEntry::Leaf(first)) = wire.entries.first() {
            if *first != wire.min_name {
                return Err(TreeError::BadEncoding("min_name mismatch".into()));
            }
        }
        if let Some(NodeEntry::Leaf(last)) = wire.entries.last() {
            if *last != wire.max_name {
                return Err(TreeError::BadEncoding("max_name mismatch".into()));
            }
        }
        let all_leaves = wire.entries.iter().all(NodeEntry::is_leaf);
        if all_leaves
            && (wire.leaf_count != wire.entries.len() as u64 || wire.depth != 1)
        {
            return Err(TreeError::BadEncoding("leaf summary mismatch".into()));
        }

        Ok(Self {
            entries: wire.entries,
            min_name: wire.min_name,
            max_name: wire.max_name,
            leaf_count: wire.leaf_count,
            depth: wire.depth,
            byte_count: wire.byte_count,
            hash: wire.hash,
        })
    }

    /// Compares `name` against this subtree's `[min_name, max_name]` span.
    pub fn compare_span(&self, name: &Name) -> SpanCmp {
        if name < &self.min_name {
            SpanCmp::Before
        } else if name == &self.min_name {
            SpanCmp::Min
        } else if name < &self.max_name {
            SpanCmp::Inside
        } else if name == &self.max_name {
            SpanCmp::Max
        } else {
            SpanCmp::After
        }
    }
}

fn encoded_size_of(entries: &[NodeEntry]) -> usize {
    4 + entries
        .iter()
        .map(|entry| match entry {
            NodeEntry::Leaf(name) => 1 + name.byte_len(),
            NodeEntry::Node(_) => 1 + 32,
        })
        .sum::<usize>()
}

/// In-order builder for composite nodes.
///
/// Appends must arrive in strictly increasing name order; the builder keeps
/// the summary fields and the long-hash register current as it goes.
#[derive(Debug, Default)]
pub struct NodeBuilder {
    entries: Vec<NodeEntry>,
    long: LongHash,
    min_name: Option<Name>,
    max_name: Option<Name>,
    leaf_count: u64,
    child_depth: u32,
    byte_count: u64,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Appends an inline leaf. `name` must sort after everything added so
    /// far.
    pub fn push_leaf(&mut self, name: Name) -> Result<(), TreeError> {
        if let Some(max) = &self.max_name {
            if *max >= name {
                return Err(TreeError::UnorderedEntries);
            }
        }
        self.long.fold_name(&name);
        self.min_name.get_or_insert_with(|| name.clone());
        self.max_name = Some(name.clone());
        self.leaf_count += 1;
        self.entries.push(NodeEntry::Leaf(name));
        Ok(())
    }

    /// Appends a reference to `child`. The child subtree must lie entirely
    /// after everything added so far.
    pub fn push_node(&mut self, child: &TreeNode) -> Result<(), TreeError> {
        if let Some(max) = &self.max_name {
            if max >= child.min_name() {
                return Err(TreeError::UnorderedEntries);
            }
        }
        self.long.fold_hash(&child.hash());
        self.min_name
            .get_or_insert_with(|| child.min_name().clone());
        self.max_name = Some(child.max_name().clone());
        self.leaf_count += child.leaf_count();
        self.child_depth = self.child_depth.max(child.depth());
        self.byte_count += child.byte_count() + child.encoded_size() as u64;
        self.entries.push(NodeEntry::Node(child.hash()));
        Ok(())
    }

    pub fn finish(self) -> Result<TreeNode, TreeError> {
        let (Some(min_name), Some(max_name)) = (self.min_name, self.max_name) else {
            return Err(TreeError::EmptyNode);
        };
        Ok(TreeNode {
            hash: self.long.finish(),
            entries: self.entries,
            min_name,
            max_name,
            leaf_count: self.leaf_count,
            depth: self.child_depth + 1,
            byte_count: self.byte_count,
        })
    }
}

/// Builds a leaf-only node from an ordered run of names.
pub fn node_from_names<'a, I>(names: I) -> Result<TreeNode, TreeError>
where
    I: IntoIterator<Item = &'a Name>,
{
    let mut builder = NodeBuilder::new();
    for name in names {
        builder.push_leaf(name.clone())?;
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(uri: &str) -> Name {
        Name::parse_uri(uri)
    }

    fn leaf_node(uris: &[&str]) -> TreeNode {
        let names: Vec<Name> = uris.iter().map(|u| name(u)).collect();
        node_from_names(names.iter()).unwrap()
    }

    #[test]
    fn builder_tracks_summaries() {
        let node = leaf_node(&["/a/1", "/a/2", "/b"]);
        assert_eq!(node.entry_count(), 3);
        assert_eq!(node.leaf_count(), 3);
        assert_eq!(node.depth(), 1);
        assert_eq!(node.min_name(), &name("/a/1"));
        assert_eq!(node.max_name(), &name("/b"));
    }

    #[test]
    fn builder_rejects_out_of_order_leaves() {
        let mut builder = NodeBuilder::new();
        builder.push_leaf(name("/b")).unwrap();
        assert!(matches!(
            builder.push_leaf(name("/a")),
            Err(TreeError::UnorderedEntries)
        ));
        assert!(matches!(
            builder.push_leaf(name("/b")),
            Err(TreeError::UnorderedEntries)
        ));
    }

    #[test]
    fn parent_summaries_cover_children() {
        let left = leaf_node(&["/a/1", "/a/2"]);
        let right = leaf_node(&["/b/1", "/b/2"]);

        let mut builder = NodeBuilder::new();
        builder.push_node(&left).unwrap();
        builder.push_node(&right).unwrap();
        let parent = builder.finish().unwrap();

        assert_eq!(parent.leaf_count(), 4);
        assert_eq!(parent.depth(), 2);
        assert_eq!(parent.min_name(), &name("/a/1"));
        assert_eq!(parent.max_name(), &name("/b/2"));

        // parent identity equals the flat long-hash of all leaves
        let flat = leaf_node(&["/a/1", "/a/2", "/b/1", "/b/2"]);
        assert_eq!(parent.hash(), flat.hash());
    }

    #[test]
    fn overlapping_children_are_rejected() {
        let left = leaf_node(&["/a", "/c"]);
        let right = leaf_node(&["/b", "/d"]);

        let mut builder = NodeBuilder::new();
        builder.push_node(&left).unwrap();
        assert!(matches!(
            builder.push_node(&right),
            Err(TreeError::UnorderedEntries)
        ));
    }

    #[test]
    fn encode_decode_round_trip() {
        let node = leaf_node(&["/a/1", "/a/2", "/b"]);
        let bytes = node.encode();
        let decoded = TreeNode::decode(&bytes).unwrap();
        assert_eq!(decoded, node);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn decode_rejects_tampered_hash() {
        let node = leaf_node(&["/a", "/b"]);
        let mut bytes = node.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01; // flips a byte of the trailing hash
        assert!(matches!(
            TreeNode::decode(&bytes),
            Err(TreeError::BadEncoding(_))
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let node = leaf_node(&["/a", "/b"]);
        let bytes = node.encode();
        assert!(TreeNode::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn encoded_size_matches_encoding() {
        let leafy = leaf_node(&["/a/1", "/a/22", "/b"]);
        assert_eq!(leafy.encoded_size(), leafy.encode().len());

        let mut builder = NodeBuilder::new();
        builder.push_node(&leaf_node(&["/a"])).unwrap();
        builder.push_node(&leaf_node(&["/b"])).unwrap();
        let parent = builder.finish().unwrap();
        assert_eq!(parent.encoded_size(), parent.encode().len());
    }

    #[test]
    fn span_compare() {
        let node = leaf_node(&["/b", "/c", "/e"]);
        assert_eq!(node.compare_span(&name("/a")), SpanCmp::Before);
        assert_eq!(node.compare_span(&name("/b")), SpanCmp::Min);
        assert_eq!(node.compare_span(&name("/d")), SpanCmp::Inside);
        assert_eq!(node.compare_span(&name("/e")), SpanCmp::Max);
        assert_eq!(node.compare_span(&name("/f")), SpanCmp::After);
    }

    #[test]
    fn hash_is_insertion_order_independent_across_shapes() {
        // one flat node vs a two-level tree over the same set
        let flat = leaf_node(&["/a", "/b", "/c", "/d"]);

        let left = leaf_node(&["/a", "/b"]);
        let right = leaf_node(&["/c", "/d"]);
        let mut builder = NodeBuilder::new();
        builder.push_node(&left).unwrap();
        builder.push_node(&right).unwrap();
        let tree = builder.finish().unwrap();

        assert_eq!(flat.hash(), tree.hash());
    }
}

//! Cursor over a rooted tree.

use slicesync_primitives::NodeHash;

use crate::cache::HashCache;
use crate::node::{NodeEntry, TreeNode};

/// One level of a walk: which node, which entry position, and how many
/// additions were attributed to the subtree so far (used by the compare
/// engine's coverage accounting).
#[derive(Clone, Copy, Debug)]
pub struct WalkerFrame {
    pub hash: NodeHash,
    pub pos: usize,
    pub count: usize,
}

impl WalkerFrame {
    fn new(hash: NodeHash) -> Self {
        Self {
            hash,
            pos: 0,
            count: 0,
        }
    }
}

/// A stack of frames over a rooted tree, biased to either the local or the
/// remote decoded view of each cache entry.
///
/// Frames carry hashes, not entry references; each step resolves through the
/// cache, which keeps the walker safe across cache mutation between steps.
#[derive(Debug)]
pub struct TreeWalker {
    frames: Vec<WalkerFrame>,
    remote: bool,
}

impl TreeWalker {
    /// Creates a walker positioned at `root`; `None` yields an exhausted
    /// walker (the empty tree).
    pub fn new(root: Option<NodeHash>, remote: bool) -> Self {
        Self {
            frames: root.map(WalkerFrame::new).into_iter().collect(),
            remote,
        }
    }

    /// Restarts the walk at `root`.
    pub fn reset(&mut self, root: Option<NodeHash>) {
        self.frames.clear();
        if let Some(hash) = root {
            self.frames.push(WalkerFrame::new(hash));
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// True once the walk has consumed the whole tree.
    pub fn is_done(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn top(&self) -> Option<&WalkerFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut WalkerFrame> {
        self.frames.last_mut()
    }

    /// Decoded node under the walker's bias for the top frame.
    pub fn node<'a>(&self, cache: &'a HashCache) -> Option<&'a TreeNode> {
        let frame = self.top()?;
        cache
            .lookup(&frame.hash)?
            .node(self.remote)
            .map(|node| &**node)
    }

    /// Entry at the top frame's current position.
    pub fn current_entry<'a>(&self, cache: &'a HashCache) -> Option<&'a NodeEntry> {
        let frame = self.top()?;
        self.node(cache)?.entry(frame.pos)
    }

    /// Descends into `child` (the hash at the current position).
    pub fn push(&mut self, child: NodeHash) {
        self.frames.push(WalkerFrame::new(child));
    }

    /// Pops the top frame; on the exposed parent, steps past the child and
    /// folds the popped addition count upward. Returns the popped count.
    pub fn pop_and_advance(&mut self) -> Option<usize> {
        let popped = self.frames.pop()?;
        if let Some(parent) = self.frames.last_mut() {
            parent.pos += 1;
            parent.count += popped.count;
        }
        Some(popped.count)
    }

    /// Steps past the current entry.
    pub fn advance(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slicesync_primitives::Name;

    use super::*;
    use crate::cache::EntryState;
    use crate::node::{node_from_names, NodeBuilder};

    fn leaf_node(uris: &[&str]) -> TreeNode {
        let names: Vec<Name> = uris.iter().map(|u| Name::parse_uri(u)).collect();
        node_from_names(names.iter()).unwrap()
    }

    /// Collects every leaf name in walk order.
    fn walk_leaves(walker: &mut TreeWalker, cache: &HashCache) -> Vec<Name> {
        let mut leaves = Vec::new();
        while !walker.is_done() {
            match walker.current_entry(cache).cloned() {
                Some(NodeEntry::Leaf(name)) => {
                    leaves.push(name);
                    walker.advance();
                }
                Some(NodeEntry::Node(child)) => walker.push(child),
                None => {
                    walker.pop_and_advance();
                }
            }
        }
        leaves
    }

    #[test]
    fn empty_walker_is_done() {
        let walker = TreeWalker::new(None, false);
        assert!(walker.is_done());
    }

    #[test]
    fn walks_two_level_tree_in_name_order() {
        let mut cache = HashCache::new();
        let left = leaf_node(&["/a/1", "/a/2"]);
        let right = leaf_node(&["/b/1"]);
        let mut builder = NodeBuilder::new();
        builder.push_node(&left).unwrap();
        builder.push_node(&right).unwrap();
        let root = builder.finish().unwrap();

        for node in [&left, &right, &root] {
            cache
                .enter(node.hash(), EntryState::LOCAL, 0)
                .install_local(Arc::new(node.clone()), 0);
        }

        let mut walker = TreeWalker::new(Some(root.hash()), false);
        let leaves = walk_leaves(&mut walker, &cache);
        let expected: Vec<Name> = ["/a/1", "/a/2", "/b/1"]
            .iter()
            .map(|u| Name::parse_uri(u))
            .collect();
        assert_eq!(leaves, expected);
    }

    #[test]
    fn pop_propagates_count() {
        let mut cache = HashCache::new();
        let child = leaf_node(&["/x"]);
        let mut builder = NodeBuilder::new();
        builder.push_node(&child).unwrap();
        let root = builder.finish().unwrap();
        for node in [&child, &root] {
            cache
                .enter(node.hash(), EntryState::LOCAL, 0)
                .install_local(Arc::new(node.clone()), 0);
        }

        let mut walker = TreeWalker::new(Some(root.hash()), false);
        walker.push(child.hash());
        walker.top_mut().unwrap().count = 3;
        let popped = walker.pop_and_advance().unwrap();
        assert_eq!(popped, 3);

        let top = walker.top().unwrap();
        assert_eq!(top.pos, 1);
        assert_eq!(top.count, 3);
    }
}

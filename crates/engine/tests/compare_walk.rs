//! Direct dual-walk tests: a Compare over hand-built remote trees, no
//! network round trips.

mod common;

use std::sync::Arc;

use common::{test_config, test_slice, MemStore, MemTransport};
use slicesync_engine::actions::ActionTable;
use slicesync_engine::compare::{Compare, CompareStep};
use slicesync_engine::update::{Update, UpdateStep};
use slicesync_engine::Root;
use slicesync_primitives::{Name, NodeHash};
use slicesync_tree::{node_from_names, EntryState, NodeBuilder, TreeNode};

fn names(uris: &[&str]) -> Vec<Name> {
    uris.iter().map(|u| Name::parse_uri(u)).collect()
}

fn new_root() -> Root {
    Root::new(0, test_slice())
}

/// Builds the local tree through the real Update path.
fn build_local(root: &mut Root, uris: &[&str]) {
    for name in names(uris) {
        root.offer_name(&name, None);
    }
    if root.names_to_add.is_empty() {
        return;
    }
    let config = test_config();
    let mut update = Update::start(root, 0).expect("names pending");
    for _ in 0..100_000 {
        match update.step(root, &config, 0) {
            UpdateStep::Yield => {}
            UpdateStep::Done => return,
            UpdateStep::Failed => panic!("update failed"),
        }
    }
    panic!("update never finished");
}

/// Installs a node (and nothing else) as a fetched remote node.
fn install_remote(root: &mut Root, node: &TreeNode) {
    let entry = root.cache.enter(node.hash(), EntryState::REMOTE, 0);
    entry.install_remote(Arc::new(node.clone()), 0);
}

/// Builds a two-level remote tree over `chunks` and installs every node.
fn build_remote(root: &mut Root, chunks: &[&[&str]]) -> NodeHash {
    let mut children = Vec::new();
    for chunk in chunks {
        let child_names = names(chunk);
        let child = node_from_names(child_names.iter()).expect("ordered chunk");
        install_remote(root, &child);
        children.push(child);
    }
    if children.len() == 1 {
        return children[0].hash();
    }
    let mut builder = NodeBuilder::new();
    for child in &children {
        builder.push_node(child).expect("ordered children");
    }
    let top = builder.finish().expect("non-empty");
    install_remote(root, &top);
    top.hash()
}

/// Drives a Compare until it blocks or finishes.
fn drive(root: &mut Root, compare: &mut Compare) -> CompareStep {
    let config = test_config();
    let mut actions = ActionTable::new();
    let mut transport = MemTransport::default();
    let store = MemStore::default();
    for _ in 0..100_000 {
        match compare.step(root, &mut actions, &config, 1, &mut transport, &store) {
            CompareStep::Continue => {}
            other => return other,
        }
    }
    panic!("compare never settled");
}

fn fetch_list(root: &Root) -> Vec<Name> {
    root.names_to_fetch
        .iter()
        .map(|(name, _)| name.clone())
        .collect()
}

#[test]
fn empty_local_wants_every_remote_leaf() {
    let mut root = new_root();
    let remote = build_remote(&mut root, &[&["/repo/a", "/repo/b"], &["/repo/c"]]);

    let mut compare = Compare::start(&mut root, remote, 0);
    let step = drive(&mut root, &mut compare);

    // blocked on the content fetches it just issued
    assert_eq!(step, CompareStep::Wait);
    assert_eq!(fetch_list(&root), names(&["/repo/a", "/repo/b", "/repo/c"]));
}

#[test]
fn fetch_set_is_exactly_remote_minus_local() {
    let mut root = new_root();
    build_local(&mut root, &["/repo/a/1", "/repo/b", "/repo/d"]);
    let remote = build_remote(
        &mut root,
        &[
            &["/repo/a/1", "/repo/a/2"],
            &["/repo/b", "/repo/c"],
            &["/repo/e"],
        ],
    );

    let mut compare = Compare::start(&mut root, remote, 0);
    let step = drive(&mut root, &mut compare);

    assert_eq!(step, CompareStep::Wait);
    assert_eq!(
        fetch_list(&root),
        names(&["/repo/a/2", "/repo/c", "/repo/e"])
    );
}

#[test]
fn equal_sets_finish_covered_without_fetching() {
    let mut root = new_root();
    build_local(&mut root, &["/repo/a", "/repo/b", "/repo/c"]);
    // same set, differently chunked on the remote side
    let remote = build_remote(&mut root, &[&["/repo/a"], &["/repo/b", "/repo/c"]]);

    let mut compare = Compare::start(&mut root, remote, 0);
    let step = drive(&mut root, &mut compare);

    assert_eq!(step, CompareStep::Done);
    assert!(root.names_to_fetch.is_empty());
    let entry = root.cache.lookup(&remote).expect("remote entry");
    assert!(entry.is_covered(), "consumed remote root must be covered");
}

#[test]
fn covered_subtree_is_never_re_added() {
    let mut root = new_root();
    build_local(&mut root, &["/repo/a", "/repo/b", "/repo/c"]);
    let remote = build_remote(&mut root, &[&["/repo/a", "/repo/b"], &["/repo/c"]]);

    let mut compare = Compare::start(&mut root, remote, 0);
    assert_eq!(drive(&mut root, &mut compare), CompareStep::Done);

    // second compare against the same (now covered) remote root
    let mut again = Compare::start(&mut root, remote, 1);
    assert_eq!(drive(&mut root, &mut again), CompareStep::Done);
    assert!(root.names_to_fetch.is_empty());
}

#[test]
fn remote_subset_of_local_is_covered() {
    let mut root = new_root();
    build_local(&mut root, &["/repo/a", "/repo/b", "/repo/c", "/repo/d"]);
    let remote = build_remote(&mut root, &[&["/repo/b", "/repo/c"]]);

    let mut compare = Compare::start(&mut root, remote, 0);
    assert_eq!(drive(&mut root, &mut compare), CompareStep::Done);
    assert!(root.names_to_fetch.is_empty());
    assert!(root.cache.lookup(&remote).expect("entry").is_covered());
}

#[test]
fn shared_subtree_hash_prunes_the_walk() {
    let mut root = new_root();
    build_local(&mut root, &["/repo/a", "/repo/b"]);
    let local_top = root.current_hash.expect("local tree built");

    // the remote root references our exact local node as one child
    let local_node = root.cache.fetch_local(&local_top).expect("decoded");
    let extra = node_from_names(names(&["/repo/x"]).iter()).expect("ordered");
    install_remote(&mut root, &extra);
    let mut builder = NodeBuilder::new();
    builder.push_node(&local_node).expect("ordered");
    builder.push_node(&extra).expect("ordered");
    let top = builder.finish().expect("non-empty");
    install_remote(&mut root, &top);
    // the shared child is known remotely and locally at once
    root.cache.enter(local_top, EntryState::REMOTE, 0);

    let mut compare = Compare::start(&mut root, top.hash(), 0);
    let step = drive(&mut root, &mut compare);

    assert_eq!(step, CompareStep::Wait);
    // only the unshared leaf is missing; the shared subtree was skipped
    assert_eq!(fetch_list(&root), names(&["/repo/x"]));
}

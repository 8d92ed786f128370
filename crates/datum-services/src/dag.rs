//! Node arena addressed by hash.
//!
//! Nodes never point at each other; a parent's payload lists child hashes
//! and the arena resolves them. Parent links are kept only so diagnostics
//! can say where a node sits in the tree.

use std::collections::HashMap;

use datum_core::merkle::{Datum, Hash, Node, EMPTY_ROOT};

struct Entry {
    node: Node,
    /// Most recent parent to list this node. Diagnostics only.
    parent: Option<Hash>,
}

/// A set of nodes plus the hash advertised as root.
#[derive(Default)]
pub struct Dag {
    nodes: HashMap<Hash, Entry>,
    root: Option<Hash>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node whose children are already present. Returns its hash.
    pub fn insert(&mut self, node: Node) -> Hash {
        let hash = node.hash();
        let children: Vec<Hash> = match &node {
            Node::Chunk(_) => Vec::new(),
            Node::BigFile(children) => children.clone(),
            Node::Directory(entries) => entries.iter().map(|e| e.hash).collect(),
        };
        for child in children {
            if let Some(entry) = self.nodes.get_mut(&child) {
                entry.parent = Some(hash);
            }
        }
        self.nodes
            .entry(hash)
            .or_insert(Entry { node, parent: None });
        hash
    }

    pub fn get(&self, hash: &Hash) -> Option<&Node> {
        self.nodes.get(hash).map(|e| &e.node)
    }

    /// The Datum reply body for `hash`, if we hold that node.
    pub fn datum(&self, hash: &Hash) -> Option<Datum> {
        self.get(hash).map(|node| Datum {
            hash: *hash,
            node: node.clone(),
        })
    }

    pub fn set_root(&mut self, hash: Hash) {
        self.root = Some(hash);
    }

    pub fn root(&self) -> Option<Hash> {
        self.root
    }

    /// The hash to advertise in RootReply: 32 zero bytes when empty.
    pub fn root_hash(&self) -> Hash {
        self.root.unwrap_or(EMPTY_ROOT)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn parent(&self, hash: &Hash) -> Option<Hash> {
        self.nodes.get(hash).and_then(|e| e.parent)
    }

    /// Distance from `hash` to the topmost ancestor reachable via parent links.
    pub fn depth(&self, hash: &Hash) -> usize {
        let mut depth = 0;
        let mut current = *hash;
        while let Some(parent) = self.parent(&current) {
            depth += 1;
            current = parent;
            if depth > self.nodes.len() {
                break;
            }
        }
        depth
    }

    /// Reassemble the bytes of a Chunk/BigFile subtree held locally.
    /// None if a node is missing or the subtree contains a Directory.
    pub fn assemble(&self, hash: &Hash) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut stack = vec![*hash];
        while let Some(next) = stack.pop() {
            match self.get(&next)? {
                Node::Chunk(data) => out.extend_from_slice(data),
                Node::BigFile(children) => stack.extend(children.iter().rev()),
                Node::Directory(_) => return None,
            }
        }
        Some(out)
    }
}

//! Merkle-DAG model — node kinds, hashing rule, and the Datum body codec.
//!
//! A node is identified by the SHA-256 of its encoded payload, where the
//! encoded payload is the Kind byte followed by the kind-specific bytes:
//!
//! ```text
//! Chunk      0 ‖ raw data (≤128 bytes)
//! BigFile    1 ‖ child hash × 1..=32
//! Directory  2 ‖ (32-byte zero-padded name ‖ child hash) × 0..=16
//! ```
//!
//! A Datum reply body is `hash ‖ encoded payload`, so a receiver checks
//! `SHA256(body[32..]) == body[..32]` before trusting anything else.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::{hash, Hasher};

/// Node identity: SHA-256 of the encoded payload.
pub type Hash = [u8; 32];

pub const HASH_LEN: usize = 32;

/// Maximum bytes of raw data in one Chunk.
pub const CHUNK_SIZE: usize = 128;

/// Maximum children of one BigFile.
pub const MAX_BIGFILE_CHILDREN: usize = 32;

/// Maximum entries in one Directory.
pub const MAX_DIRECTORY_ENTRIES: usize = 16;

/// Width of the zero-padded name field in a Directory entry.
pub const NAME_LEN: usize = 32;

const ENTRY_LEN: usize = NAME_LEN + HASH_LEN;

/// The root advertised when nothing is exported.
pub const EMPTY_ROOT: Hash = [0u8; 32];

// ── Kinds ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Chunk = 0,
    BigFile = 1,
    Directory = 2,
}

impl TryFrom<u8> for NodeKind {
    type Error = MerkleError;

    fn try_from(value: u8) -> Result<Self, MerkleError> {
        match value {
            0 => Ok(NodeKind::Chunk),
            1 => Ok(NodeKind::BigFile),
            2 => Ok(NodeKind::Directory),
            other => Err(MerkleError::UnknownKind(other)),
        }
    }
}

// ── Directory entries ─────────────────────────────────────────────────────────

/// One named child of a Directory.
#[derive(Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// UTF-8 name, zero-padded to 32 bytes.
    pub name: [u8; NAME_LEN],
    pub hash: Hash,
}

impl DirEntry {
    pub fn new(name: &str, hash: Hash) -> Result<Self, MerkleError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_LEN || bytes.contains(&0) {
            return Err(MerkleError::BadName(name.to_string()));
        }
        let mut padded = [0u8; NAME_LEN];
        padded[..bytes.len()].copy_from_slice(bytes);
        Ok(Self { name: padded, hash })
    }

    /// The name with trailing zero padding removed.
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

impl fmt::Debug for DirEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirEntry")
            .field("name", &self.name())
            .field("hash", &hex::encode(self.hash))
            .finish()
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// One Merkle-DAG node. Parents hold only child hashes, never child content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Chunk(Bytes),
    BigFile(Vec<Hash>),
    Directory(Vec<DirEntry>),
}

impl Node {
    /// Build a Chunk, enforcing the size limit.
    pub fn chunk(data: impl Into<Bytes>) -> Result<Self, MerkleError> {
        let data = data.into();
        if data.len() > CHUNK_SIZE {
            return Err(MerkleError::ChunkTooLarge(data.len()));
        }
        Ok(Node::Chunk(data))
    }

    /// Build a BigFile, enforcing the fan-out limit.
    pub fn big_file(children: Vec<Hash>) -> Result<Self, MerkleError> {
        if children.is_empty() || children.len() > MAX_BIGFILE_CHILDREN {
            return Err(MerkleError::TooManyChildren {
                kind: NodeKind::BigFile,
                count: children.len(),
            });
        }
        Ok(Node::BigFile(children))
    }

    /// Build a Directory, enforcing the entry limit.
    pub fn directory(entries: Vec<DirEntry>) -> Result<Self, MerkleError> {
        if entries.len() > MAX_DIRECTORY_ENTRIES {
            return Err(MerkleError::TooManyChildren {
                kind: NodeKind::Directory,
                count: entries.len(),
            });
        }
        Ok(Node::Directory(entries))
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Chunk(_) => NodeKind::Chunk,
            Node::BigFile(_) => NodeKind::BigFile,
            Node::Directory(_) => NodeKind::Directory,
        }
    }

    /// Kind byte followed by the kind-specific payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.payload_len());
        out.put_u8(self.kind() as u8);
        match self {
            Node::Chunk(data) => out.put_slice(data),
            Node::BigFile(children) => {
                for child in children {
                    out.put_slice(child);
                }
            }
            Node::Directory(entries) => {
                for entry in entries {
                    out.put_slice(&entry.name);
                    out.put_slice(&entry.hash);
                }
            }
        }
        out.freeze()
    }

    fn payload_len(&self) -> usize {
        match self {
            Node::Chunk(data) => data.len(),
            Node::BigFile(children) => children.len() * HASH_LEN,
            Node::Directory(entries) => entries.len() * ENTRY_LEN,
        }
    }

    /// SHA-256 over the encoded payload.
    pub fn hash(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(&[self.kind() as u8]);
        match self {
            Node::Chunk(data) => hasher.update(data),
            Node::BigFile(children) => {
                for child in children {
                    hasher.update(child);
                }
            }
            Node::Directory(entries) => {
                for entry in entries {
                    hasher.update(&entry.name);
                    hasher.update(&entry.hash);
                }
            }
        }
        hasher.finalize()
    }

    /// Parse an encoded payload (Kind byte first), enforcing all limits.
    pub fn decode(encoded: &[u8]) -> Result<Self, MerkleError> {
        let (&kind, payload) = encoded.split_first().ok_or(MerkleError::Truncated(0))?;
        match NodeKind::try_from(kind)? {
            NodeKind::Chunk => Node::chunk(Bytes::copy_from_slice(payload)),
            NodeKind::BigFile => {
                if payload.len() % HASH_LEN != 0 {
                    return Err(MerkleError::Misaligned {
                        kind: NodeKind::BigFile,
                        len: payload.len(),
                    });
                }
                let children = payload
                    .chunks_exact(HASH_LEN)
                    .map(|c| {
                        let mut h = [0u8; HASH_LEN];
                        h.copy_from_slice(c);
                        h
                    })
                    .collect();
                Node::big_file(children)
            }
            NodeKind::Directory => {
                if payload.len() % ENTRY_LEN != 0 {
                    return Err(MerkleError::Misaligned {
                        kind: NodeKind::Directory,
                        len: payload.len(),
                    });
                }
                let entries = payload
                    .chunks_exact(ENTRY_LEN)
                    .map(|e| {
                        let mut name = [0u8; NAME_LEN];
                        let mut hash = [0u8; HASH_LEN];
                        name.copy_from_slice(&e[..NAME_LEN]);
                        hash.copy_from_slice(&e[NAME_LEN..]);
                        DirEntry { name, hash }
                    })
                    .collect();
                Node::directory(entries)
            }
        }
    }
}

// ── Datum ─────────────────────────────────────────────────────────────────────

/// Body of a Datum(131) reply: the hash a node claims, and the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datum {
    pub hash: Hash,
    pub node: Node,
}

impl Datum {
    pub fn new(node: Node) -> Self {
        Self {
            hash: node.hash(),
            node,
        }
    }

    /// `hash ‖ kind ‖ payload`
    pub fn encode(&self) -> Bytes {
        let encoded = self.node.encode();
        let mut out = BytesMut::with_capacity(HASH_LEN + encoded.len());
        out.put_slice(&self.hash);
        out.put_slice(&encoded);
        out.freeze()
    }

    /// Parse a Datum body. Content whose hash does not match is rejected
    /// before its payload is interpreted.
    pub fn parse(body: &[u8]) -> Result<Self, MerkleError> {
        if body.len() < HASH_LEN + 1 {
            return Err(MerkleError::Truncated(body.len()));
        }
        let mut claimed = [0u8; HASH_LEN];
        claimed.copy_from_slice(&body[..HASH_LEN]);
        let actual = hash(&body[HASH_LEN..]);
        if actual != claimed {
            return Err(MerkleError::Integrity {
                expected: claimed,
                actual,
            });
        }
        Ok(Self {
            hash: claimed,
            node: Node::decode(&body[HASH_LEN..])?,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MerkleError {
    #[error("node payload truncated: {0} bytes")]
    Truncated(usize),

    #[error("unknown node kind: {0}")]
    UnknownKind(u8),

    #[error("hash mismatch: expected {}, content hashes to {}", hex::encode(expected), hex::encode(actual))]
    Integrity { expected: Hash, actual: Hash },

    #[error("chunk of {0} bytes exceeds maximum {}", CHUNK_SIZE)]
    ChunkTooLarge(usize),

    #[error("{kind:?} with {count} children is outside the allowed range")]
    TooManyChildren { kind: NodeKind, count: usize },

    #[error("{kind:?} payload of {len} bytes is not a whole number of entries")]
    Misaligned { kind: NodeKind, len: usize },

    #[error("invalid entry name: {0:?}")]
    BadName(String),
}

impl MerkleError {
    /// True for oversized chunks, fan-outs and directories.
    pub fn is_resource_limit(&self) -> bool {
        matches!(
            self,
            MerkleError::ChunkTooLarge(_) | MerkleError::TooManyChildren { .. }
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

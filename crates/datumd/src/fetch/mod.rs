//! Retrieval — fetch nodes by hash, verify them, and rebuild files and trees.
//!
//! Every node is requested with its own fresh Id. A reply whose content
//! does not hash to the requested value is never used; the identical request
//! is retried up to `integrity_retries` more times before giving up.
//! Traversal keeps an explicit stack, so deep trees cannot overflow.

pub mod browse;

pub use browse::Browser;

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use datum_core::merkle::{Datum, DirEntry, Hash, MerkleError, Node};
use datum_core::wire::{Message, MessageId, MessageType};
use datum_services::Sink;

use crate::transport::{Reply, Resend, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no reply for datum {}", hex::encode(.0))]
    Timeout(Hash),

    #[error("peer refused datum {}: {reason}", hex::encode(hash))]
    Remote { hash: Hash, reason: String },

    #[error("expected Datum for {}, got {kind:?}", hex::encode(hash))]
    Unexpected { hash: Hash, kind: MessageType },

    #[error("datum {} failed verification after {attempts} attempts: {last}", hex::encode(hash))]
    Integrity {
        hash: Hash,
        attempts: u32,
        last: MerkleError,
    },

    #[error("{} is a directory where file content was expected", hex::encode(.0))]
    NotAFile(Hash),

    #[error("refusing unsafe entry name {0:?}")]
    BadName(String),

    #[error("no entry {index}; directory has {len}")]
    NoSuchEntry { index: usize, len: usize },

    #[error("failed to write {path}: {source}")]
    Sink { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FetchError {
    pub fn is_integrity(&self) -> bool {
        matches!(self, FetchError::Integrity { .. })
    }
}

/// Counts for one reconstruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub dirs: usize,
    pub files: usize,
    pub bytes: usize,
}

/// Fetches and verifies nodes over a handshaken transport.
pub struct Fetcher<'a> {
    transport: &'a mut Transport,
    integrity_retries: u32,
}

impl<'a> Fetcher<'a> {
    pub fn new(transport: &'a mut Transport, integrity_retries: u32) -> Self {
        Self {
            transport,
            integrity_retries,
        }
    }

    /// Fetch the node for `hash`, verified against it.
    pub async fn get_datum(&mut self, hash: &Hash) -> Result<Node, FetchError> {
        let request = Message::new(
            MessageId::random(),
            MessageType::GetDatum,
            Bytes::copy_from_slice(hash),
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            let reply = match self.transport.request(&request, Resend::Yes).await? {
                Reply::Answer(reply) => reply,
                Reply::Timeout { .. } => return Err(FetchError::Timeout(*hash)),
            };
            match reply.kind {
                MessageType::Datum => {}
                MessageType::Error => {
                    return Err(FetchError::Remote {
                        hash: *hash,
                        reason: reply.reason(),
                    })
                }
                kind => return Err(FetchError::Unexpected { hash: *hash, kind }),
            }

            match verify(hash, &reply.body) {
                Ok(node) => return Ok(node),
                Err(last) if attempts > self.integrity_retries => {
                    return Err(FetchError::Integrity {
                        hash: *hash,
                        attempts,
                        last,
                    })
                }
                Err(e) => tracing::warn!(
                    hash = hex::encode(hash),
                    attempt = attempts,
                    error = %e,
                    "datum failed verification, retrying"
                ),
            }
        }
    }

    /// Fetch and concatenate the file rooted at `hash`.
    pub async fn reconstruct_file(&mut self, hash: &Hash) -> Result<Vec<u8>, FetchError> {
        let node = self.get_datum(hash).await?;
        self.collect_file(*hash, node).await
    }

    /// Concatenate the Chunk leaves under an already-fetched file node,
    /// left to right.
    pub async fn collect_file(&mut self, hash: Hash, node: Node) -> Result<Vec<u8>, FetchError> {
        let mut out = Vec::new();
        let mut next = Some((hash, node));
        let mut stack: Vec<Hash> = Vec::new();

        loop {
            let (hash, node) = match next.take() {
                Some(pair) => pair,
                None => match stack.pop() {
                    Some(child) => (child, self.get_datum(&child).await?),
                    None => break,
                },
            };
            match node {
                Node::Chunk(data) => out.extend_from_slice(&data),
                Node::BigFile(children) => stack.extend(children.iter().rev()),
                Node::Directory(_) => return Err(FetchError::NotAFile(hash)),
            }
        }
        Ok(out)
    }

    /// Rebuild the tree rooted at `hash` under `path` in `sink`.
    pub async fn reconstruct_tree(
        &mut self,
        hash: &Hash,
        path: &Path,
        sink: &mut dyn Sink,
    ) -> Result<TreeStats, FetchError> {
        let node = self.get_datum(hash).await?;
        self.write_node(*hash, node, path, sink).await
    }

    /// Like [`Fetcher::reconstruct_tree`] for a node already in hand.
    pub async fn write_node(
        &mut self,
        hash: Hash,
        node: Node,
        path: &Path,
        sink: &mut dyn Sink,
    ) -> Result<TreeStats, FetchError> {
        let mut stats = TreeStats::default();
        let mut stack: Vec<(Hash, Option<Node>, PathBuf)> = vec![(hash, Some(node), path.to_path_buf())];

        while let Some((hash, node, path)) = stack.pop() {
            let node = match node {
                Some(node) => node,
                None => self.get_datum(&hash).await?,
            };
            match node {
                Node::Directory(entries) => {
                    sink.create_dir(&path).map_err(|source| FetchError::Sink {
                        path: path.clone(),
                        source,
                    })?;
                    stats.dirs += 1;
                    for entry in entries.iter().rev() {
                        let name = safe_name(entry)?;
                        stack.push((entry.hash, None, path.join(name)));
                    }
                }
                file => {
                    let data = self.collect_file(hash, file).await?;
                    sink.write_file(&path, &data).map_err(|source| FetchError::Sink {
                        path: path.clone(),
                        source,
                    })?;
                    stats.files += 1;
                    stats.bytes += data.len();
                }
            }
        }
        tracing::info!(
            path = %path.display(),
            dirs = stats.dirs,
            files = stats.files,
            bytes = stats.bytes,
            "tree reconstructed"
        );
        Ok(stats)
    }
}

/// Check a Datum body: integrity first, then that it answers `requested`.
fn verify(requested: &Hash, body: &[u8]) -> Result<Node, MerkleError> {
    let datum = Datum::parse(body)?;
    if &datum.hash != requested {
        return Err(MerkleError::Integrity {
            expected: *requested,
            actual: datum.hash,
        });
    }
    Ok(datum.node)
}

/// An entry name that is safe to use as one path component.
pub fn safe_name(entry: &DirEntry) -> Result<String, FetchError> {
    let name = entry.name();
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(FetchError::BadName(name));
    }
    Ok(name)
}

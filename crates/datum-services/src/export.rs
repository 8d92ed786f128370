//! Export — build the Merkle-DAG a peer serves from a filesystem tree.
//!
//! Files are cut into 128-byte chunks. A file of at most one chunk is a
//! single Chunk node. Longer files are grouped bottom-up: chunk hashes 32
//! at a time into BigFile nodes, then those BigFiles 32 at a time, until
//! one BigFile remains. Every hash is computed after its children exist.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use datum_core::merkle::{
    DirEntry, Hash, Node, CHUNK_SIZE, MAX_BIGFILE_CHILDREN, MAX_DIRECTORY_ENTRIES,
};

use crate::dag::Dag;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} has {count} entries, maximum is {}", MAX_DIRECTORY_ENTRIES)]
    TooManyEntries { path: PathBuf, count: usize },

    #[error("{0}: name is not UTF-8 or longer than 32 bytes")]
    BadName(PathBuf),
}

impl ExportError {
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, ExportError::TooManyEntries { .. })
    }
}

/// Build a DAG whose root is the Directory for `path`.
pub fn export_dir(path: &Path) -> Result<Dag, ExportError> {
    let mut dag = Dag::new();
    let root = add_dir(&mut dag, path)?;
    dag.set_root(root);
    tracing::info!(
        path = %path.display(),
        root = hex::encode(root),
        nodes = dag.len(),
        "export tree built"
    );
    Ok(dag)
}

/// Build a DAG whose root is the file node for `data`.
pub fn export_bytes(data: &[u8]) -> Dag {
    let mut dag = Dag::new();
    let root = add_file(&mut dag, data);
    dag.set_root(root);
    dag
}

/// Insert the nodes for one file's contents. Returns the file's hash.
pub fn add_file(dag: &mut Dag, data: &[u8]) -> Hash {
    if data.len() <= CHUNK_SIZE {
        return dag.insert(Node::Chunk(Bytes::copy_from_slice(data)));
    }

    let mut level: Vec<Hash> = data
        .chunks(CHUNK_SIZE)
        .map(|chunk| dag.insert(Node::Chunk(Bytes::copy_from_slice(chunk))))
        .collect();

    loop {
        let parents: Vec<Hash> = level
            .chunks(MAX_BIGFILE_CHILDREN)
            .map(|group| dag.insert(Node::BigFile(group.to_vec())))
            .collect();
        if let [top] = parents[..] {
            return top;
        }
        level = parents;
    }
}

fn add_dir(dag: &mut Dag, path: &Path) -> Result<Hash, ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut children = std::fs::read_dir(path)
        .map_err(io_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    if children.len() > MAX_DIRECTORY_ENTRIES {
        return Err(ExportError::TooManyEntries {
            path: path.to_path_buf(),
            count: children.len(),
        });
    }
    children.sort_by_key(|entry| entry.file_name());

    let mut entries = Vec::with_capacity(children.len());
    for child in children {
        let child_path = child.path();
        let name = child
            .file_name()
            .into_string()
            .map_err(|_| ExportError::BadName(child_path.clone()))?;

        let file_type = child.file_type().map_err(|source| ExportError::Io {
            path: child_path.clone(),
            source,
        })?;
        let hash = if file_type.is_symlink() {
            tracing::warn!(path = %child_path.display(), "skipping symlink");
            continue;
        } else if file_type.is_dir() {
            add_dir(dag, &child_path)?
        } else if file_type.is_file() {
            let data = std::fs::read(&child_path).map_err(|source| ExportError::Io {
                path: child_path.clone(),
                source,
            })?;
            add_file(dag, &data)
        } else {
            tracing::warn!(path = %child_path.display(), "skipping special file");
            continue;
        };

        let entry = DirEntry::new(&name, hash).map_err(|_| ExportError::BadName(child_path))?;
        entries.push(entry);
    }

    let hash = dag.insert(Node::Directory(entries));
    tracing::debug!(path = %path.display(), hash = hex::encode(hash), "directory exported");
    Ok(hash)
}

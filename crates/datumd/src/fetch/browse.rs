//! Interactive browsing of a remote tree, one directory level at a time.

use std::path::{Path, PathBuf};

use datum_core::merkle::{DirEntry, Hash, Node};
use datum_services::Sink;

use super::{safe_name, FetchError, Fetcher, TreeStats};

/// A cursor over a remote tree. Only the current node is held locally.
pub struct Browser<'a> {
    fetcher: Fetcher<'a>,
    path: PathBuf,
    hash: Hash,
    node: Node,
}

impl<'a> Browser<'a> {
    /// Fetch `root` and position the cursor on it. `path` names it locally.
    pub async fn open(
        mut fetcher: Fetcher<'a>,
        root: Hash,
        path: impl Into<PathBuf>,
    ) -> Result<Self, FetchError> {
        let node = fetcher.get_datum(&root).await?;
        Ok(Self {
            fetcher,
            path: path.into(),
            hash: root,
            node,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.node, Node::Directory(_))
    }

    /// Entries of the current directory; empty for files.
    pub fn entries(&self) -> &[DirEntry] {
        match &self.node {
            Node::Directory(entries) => entries,
            _ => &[],
        }
    }

    /// Move the cursor onto entry `index` of the current directory.
    pub async fn descend(&mut self, index: usize) -> Result<(), FetchError> {
        let entry = self
            .entries()
            .get(index)
            .cloned()
            .ok_or(FetchError::NoSuchEntry {
                index,
                len: self.entries().len(),
            })?;
        let name = safe_name(&entry)?;
        self.node = self.fetcher.get_datum(&entry.hash).await?;
        self.hash = entry.hash;
        self.path.push(name);
        tracing::debug!(path = %self.path.display(), hash = hex::encode(self.hash), "descended");
        Ok(())
    }

    /// Reconstruct everything under the cursor into `sink`.
    pub async fn download(&mut self, sink: &mut dyn Sink) -> Result<TreeStats, FetchError> {
        let node = self.node.clone();
        self.fetcher.write_node(self.hash, node, &self.path, sink).await
    }
}

//! Output sinks for reconstructed trees.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

/// Receives directories and files as a remote tree is reconstructed.
/// Paths are relative to the download root.
pub trait Sink {
    fn create_dir(&mut self, path: &Path) -> io::Result<()>;
    fn write_file(&mut self, path: &Path, data: &[u8]) -> io::Result<()>;
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub dirs: BTreeSet<PathBuf>,
    pub files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for MemorySink {
    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        self.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.files.insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }
}

/// Writes under a base directory on the local filesystem.
pub struct FsSink {
    base: PathBuf,
}

impl FsSink {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

impl Sink for FsSink {
    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(self.base.join(path))
    }

    fn write_file(&mut self, path: &Path, data: &[u8]) -> io::Result<()> {
        let target = self.base.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, data)?;
        tracing::info!(path = %target.display(), bytes = data.len(), "file written");
        Ok(())
    }
}

//! datum-services — the local side of the Merkle-DAG: the node arena,
//! building it from a filesystem tree, and sinks for reconstructed output.

pub mod dag;
pub mod export;
pub mod sink;

pub use dag::Dag;
pub use export::{export_bytes, export_dir, ExportError};
pub use sink::{FsSink, MemorySink, Sink};

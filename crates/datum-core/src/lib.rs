//! datum-core — wire format, signing, Merkle-DAG model, and configuration.
//! All other Datum crates depend on this one.

pub mod config;
pub mod crypto;
pub mod merkle;
pub mod wire;

pub use merkle::{Datum, DirEntry, Hash, Node, NodeKind};
pub use wire::{Message, MessageId, MessageType};

//! swarmsync-core: differential synchronization engine
//!
//! Chunking, change detection, binary deltas, block reconciliation and changeset
//! application for a directory tree, plus the documents and frames exchanged between
//! devices.

pub mod apply;
pub mod chunker;
pub mod config;
pub mod delta;
pub mod detect;
pub mod hash;
pub mod manifest;
pub mod model;
pub mod protocol;
pub mod reconcile;
pub mod scan;
pub mod snapshot;

pub use apply::{ApplyReport, Applier};
pub use chunker::{BlockManifest, Chunker};
pub use config::SyncConfig;
pub use delta::{Delta, DeltaComputer};
pub use detect::detect;
pub use hash::ContentHash;
pub use manifest::Manifest;
pub use model::{Block, ChangeKind, ChangeSet, File, Modifications, Patch};
pub use protocol::Message;
pub use reconcile::reconcile;
pub use scan::Scanner;
pub use snapshot::Snapshot;

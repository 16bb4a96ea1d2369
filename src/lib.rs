//! # Archival STM
//! Replicated metadata for partition segments offloaded to object storage.
//!
//! Each partition replica runs one [`ArchivalMetadataStm`](stm::ArchivalMetadataStm).
//! It keeps a [`PartitionManifest`](manifest::PartitionManifest) of the
//! segments uploaded to remote storage identical on every replica by applying
//! the same committed commands in the same order, and persists it in
//! snapshots that survive restarts.
//!
//! # Modules
//! - [`manifest`]: segment metadata, the manifest and its replace / truncate
//!   bookkeeping
//! - [`stm`]: commands, snapshot formats, the consensus and snapshot store
//!   seams, and the state machine itself
//! - [`types`]: offset, term, revision and partition identifiers
//! - [`error`]: the crate error type
//! - [`telemetry`]: logging setup for embedding applications
//!
//! ## Getting started
//! ```rust,no_run
//! use std::sync::Arc;
//! use archival_stm::prelude::*;
//! use tokio::time::{Duration, Instant};
//!
//! #[tokio::main]
//! async fn main() -> ArchivalResult<()> {
//!     let ntp = Ntp::kafka("orders", 0);
//!     let object_store = Arc::new(object_store::memory::InMemory::new());
//!     let stm = ArchivalMetadataStm::start(
//!         ntp.clone(),
//!         RevisionId::new(1),
//!         StmConfig::default(),
//!         Arc::new(LocalConsensus::new(0)),
//!         Arc::new(ObjectStoreSnapshots::new(object_store, "archival/snapshots")),
//!     )
//!     .await?;
//!
//!     let mut delta = PartitionManifest::new(ntp, RevisionId::new(1));
//!     delta.add_segment(SegmentMeta::new(Offset::new(0), Offset::new(99), Term::new(1)))?;
//!     stm.add_segments(&delta, Instant::now() + Duration::from_secs(10)).await?;
//!     assert_eq!(stm.manifest().len(), 1);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod manifest;
pub mod stm;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for embedding the state machine.
    pub use crate::error::{ArchivalError, ArchivalResult};
    pub use crate::manifest::{PartitionManifest, SegmentKey, SegmentMeta, SegmentNameFormat};
    pub use crate::stm::{
        ArchivalMetadataStm, Consensus, LocalConsensus, ObjectStoreSnapshots, SnapshotStore,
        StateMachineStatus, StmConfig,
    };
    pub use crate::types::{Ntp, Offset, RevisionId, Term};

    pub use bytes;
}

//! Replicated archival metadata state machine.
//!
//! # Architecture
//!
//! ```text
//!   caller ──add_segments/truncate──► ArchivalMetadataStm
//!                                        │ encode ArchivalCommand
//!                                        ▼
//!                                   Consensus::replicate ──► committed log
//!                                                               │
//!          watch<Arc<PartitionManifest>> ◄── apply task ◄───────┘ subscribe()
//!                  │                            │ every N entries
//!          readers / waiters                    ▼
//!                                      snapshot worker ──► SnapshotStore
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use archival_stm::stm::{ArchivalMetadataStm, LocalConsensus, ObjectStoreSnapshots, StmConfig};
//! use archival_stm::types::{Ntp, RevisionId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StmConfig::from_env()?;
//!     let object_store: Arc<dyn object_store::ObjectStore> =
//!         Arc::new(object_store::memory::InMemory::new());
//!     let snapshots = Arc::new(ObjectStoreSnapshots::from_config(object_store, &config));
//!
//!     let stm = ArchivalMetadataStm::start(
//!         Ntp::kafka("orders", 0),
//!         RevisionId::new(1),
//!         config,
//!         Arc::new(LocalConsensus::new(0)),
//!         snapshots,
//!     )
//!     .await?;
//!     println!("start offset {}", stm.get_start_offset());
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod consensus;
pub mod snapshot;
pub mod snapshot_store;
pub mod state_machine;

pub use commands::{ArchivalCommand, CommandKind};
pub use config::StmConfig;
pub use consensus::{CommittedEntry, Consensus, LocalConsensus, ReplicateError};
pub use snapshot::{
    DecodedSnapshot, SnapshotFormat, decode_snapshot, encode_legacy_snapshot, encode_snapshot,
};
pub use snapshot_store::{ObjectStoreSnapshots, SnapshotStore};
pub use state_machine::{ArchivalMetadataStm, StateMachineStatus};

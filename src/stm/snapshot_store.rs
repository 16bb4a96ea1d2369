//! Snapshot persistence.
//!
//! The state machine writes whole snapshots through a [`SnapshotStore`] and
//! reads back only the latest one at startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tracing::{debug, error, info};

use super::config::StmConfig;
use crate::error::{ArchivalError, ArchivalResult};
use crate::types::Ntp;

/// Durable storage for one blob per partition.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the partition's snapshot with `blob`.
    ///
    /// Either the previous or the new blob must be readable after a crash at
    /// any point during the write.
    async fn write(&self, ntp: &Ntp, blob: Bytes) -> ArchivalResult<()>;

    /// Latest snapshot written for the partition, if any.
    async fn read_latest(&self, ntp: &Ntp) -> ArchivalResult<Option<Bytes>>;
}

/// [`SnapshotStore`] over any [`ObjectStore`].
///
/// Layout: `{prefix}/{namespace}/{topic}/{partition}/current.snapshot`.
///
/// # Atomicity
///
/// A write goes to a uniquely named temporary object first and is then
/// renamed over `current.snapshot`. Backends without rename fall back to
/// copy + delete. A crash before the rename leaves the previous snapshot in
/// place and an orphaned temporary object, which the next read removes.
pub struct ObjectStoreSnapshots {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    write_seq: AtomicU64,
}

impl ObjectStoreSnapshots {
    /// Create a store writing under `prefix` (e.g. "archival/snapshots").
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            object_store,
            prefix: prefix.trim_matches('/').to_string(),
            write_seq: AtomicU64::new(0),
        }
    }

    /// Create a store writing under [`StmConfig::snapshot_prefix`].
    pub fn from_config(object_store: Arc<dyn ObjectStore>, config: &StmConfig) -> Self {
        Self::new(object_store, &config.snapshot_prefix)
    }

    /// Directory holding one partition's snapshot objects.
    pub fn partition_dir(&self, ntp: &Ntp) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/{}/{}/{}",
            self.prefix,
            ntp.namespace(),
            ntp.topic(),
            ntp.partition()
        ))
    }

    /// Path of the committed snapshot of a partition.
    pub fn snapshot_path(&self, ntp: &Ntp) -> ObjectPath {
        self.partition_dir(ntp).child("current.snapshot")
    }

    fn temp_path(&self, ntp: &Ntp) -> ObjectPath {
        let seq = self.write_seq.fetch_add(1, Ordering::Relaxed);
        self.partition_dir(ntp)
            .child(format!("temp-{}-{}.snapshot", std::process::id(), seq))
    }

    /// Remove temporary objects left behind by crashed writes.
    async fn cleanup_temp_files(&self, ntp: &Ntp) {
        let prefix = self.partition_dir(ntp);
        let mut stream = self.object_store.list(Some(&prefix));

        let mut temp_files: Vec<ObjectPath> = Vec::new();
        while let Some(result) = stream.next().await {
            match result {
                Ok(meta) => {
                    if meta
                        .location
                        .filename()
                        .is_some_and(|name| name.starts_with("temp-") && name.ends_with(".snapshot"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Error listing files during temp cleanup");
                }
            }
        }

        for path in temp_files {
            match self.object_store.delete(&path).await {
                Ok(()) => {
                    info!(path = %path, "Cleaned up orphaned temp snapshot file");
                }
                Err(e) => {
                    debug!(error = %e, path = %path, "Failed to delete temp file (may already be gone)");
                }
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for ObjectStoreSnapshots {
    async fn write(&self, ntp: &Ntp, blob: Bytes) -> ArchivalResult<()> {
        let temp_path = self.temp_path(ntp);
        let final_path = self.snapshot_path(ntp);
        let size = blob.len();

        self.object_store
            .put(&temp_path, blob.into())
            .await
            .map_err(|e| {
                error!(error = %e, path = %temp_path, "Failed to write snapshot to temp path");
                ArchivalError::SnapshotStore(format!("write {}: {}", temp_path, e))
            })?;

        if let Err(e) = self.object_store.rename(&temp_path, &final_path).await {
            if let Err(copy_err) = self.object_store.copy(&temp_path, &final_path).await {
                error!(error = %copy_err, path = %final_path, "Failed to copy snapshot to final path");
                let _ = self.object_store.delete(&temp_path).await;
                return Err(ArchivalError::SnapshotStore(format!(
                    "commit {}: {}",
                    final_path, copy_err
                )));
            }
            let _ = self.object_store.delete(&temp_path).await;
            debug!(error = %e, "Used copy+delete fallback for snapshot (rename not supported)");
        }

        debug!(ntp = %ntp, path = %final_path, size, "Persisted snapshot");
        Ok(())
    }

    async fn read_latest(&self, ntp: &Ntp) -> ArchivalResult<Option<Bytes>> {
        self.cleanup_temp_files(ntp).await;

        let path = self.snapshot_path(ntp);
        let result = match self.object_store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match result.bytes().await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) => {
                error!(
                    error = %e,
                    path = %path,
                    "CORRUPTION: Snapshot file exists but failed to read bytes"
                );
                Err(ArchivalError::SnapshotStore(format!("read {}: {}", path, e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::PutPayload;
    use object_store::memory::InMemory;

    fn store() -> (Arc<InMemory>, ObjectStoreSnapshots) {
        let backend = Arc::new(InMemory::new());
        let snapshots = ObjectStoreSnapshots::new(backend.clone(), "/archival/snapshots/");
        (backend, snapshots)
    }

    #[test]
    fn test_paths() {
        let (_, snapshots) = store();
        let ntp = Ntp::kafka("orders", 4);
        assert_eq!(
            snapshots.snapshot_path(&ntp).to_string(),
            "archival/snapshots/kafka/orders/4/current.snapshot"
        );
    }

    #[test]
    fn test_from_config_uses_snapshot_prefix() {
        let config = StmConfig {
            snapshot_prefix: "cluster-a/archival/".to_string(),
            ..Default::default()
        };
        let snapshots = ObjectStoreSnapshots::from_config(Arc::new(InMemory::new()), &config);
        assert_eq!(
            snapshots.snapshot_path(&Ntp::kafka("orders", 4)).to_string(),
            "cluster-a/archival/kafka/orders/4/current.snapshot"
        );
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let (_, snapshots) = store();
        assert!(
            snapshots
                .read_latest(&Ntp::kafka("t", 0))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_write_replaces_previous() {
        let (_, snapshots) = store();
        let ntp = Ntp::kafka("t", 0);

        snapshots
            .write(&ntp, Bytes::from_static(b"first"))
            .await
            .unwrap();
        snapshots
            .write(&ntp, Bytes::from_static(b"second"))
            .await
            .unwrap();

        let latest = snapshots.read_latest(&ntp).await.unwrap().unwrap();
        assert_eq!(latest, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let (_, snapshots) = store();
        snapshots
            .write(&Ntp::kafka("t", 0), Bytes::from_static(b"p0"))
            .await
            .unwrap();
        assert!(
            snapshots
                .read_latest(&Ntp::kafka("t", 1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_read_removes_orphaned_temp_files() {
        let (backend, snapshots) = store();
        let ntp = Ntp::kafka("t", 0);
        snapshots
            .write(&ntp, Bytes::from_static(b"committed"))
            .await
            .unwrap();

        let orphan = snapshots.partition_dir(&ntp).child("temp-1-99.snapshot");
        backend
            .put(&orphan, PutPayload::from_static(b"half-written"))
            .await
            .unwrap();

        let latest = snapshots.read_latest(&ntp).await.unwrap().unwrap();
        assert_eq!(latest, Bytes::from_static(b"committed"));
        assert!(matches!(
            backend.head(&orphan).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }

    // ========================================================================
    // Local Filesystem Tests
    // ========================================================================

    #[tokio::test]
    async fn test_local_filesystem_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let backend =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(temp_dir.path()).unwrap());
        let snapshots = ObjectStoreSnapshots::new(backend, "archival/snapshots");
        let ntp = Ntp::kafka("orders", 2);

        snapshots
            .write(&ntp, Bytes::from_static(b"first"))
            .await
            .unwrap();
        snapshots
            .write(&ntp, Bytes::from_static(b"second"))
            .await
            .unwrap();

        let latest = snapshots.read_latest(&ntp).await.unwrap().unwrap();
        assert_eq!(latest, Bytes::from_static(b"second"));
        assert!(
            temp_dir
                .path()
                .join("archival/snapshots/kafka/orders/2/current.snapshot")
                .exists()
        );
    }
}

//! Replicated state machine owning one partition's manifest.
//!
//! # Apply path
//!
//! A single task consumes committed entries from [`Consensus::subscribe`] in
//! log order. Each entry is decoded and validated against the current
//! manifest before anything is mutated, then applied copy-on-write and
//! published through a `watch` channel. Readers clone the published
//! `Arc<PartitionManifest>` and never observe a half-applied command.
//!
//! # Waiting
//!
//! Writers replicate a command, learn the offset it committed at, and wait
//! on the same `watch` channel until the published insync offset reaches it.
//! The deadline only ends the wait. A command already handed to consensus
//! is not retracted and may still be applied.
//!
//! # Snapshots
//!
//! When the log suffix since the last snapshot reaches
//! [`StmConfig::snapshot_threshold`], the apply task pokes a background
//! worker. Requests arriving while a write is in flight coalesce into one
//! follow-up write. Snapshot writes never block apply.
//!
//! # Halting
//!
//! A decode failure or an invariant violation on the apply path stops the
//! apply task. The reason is published as [`StateMachineStatus::Halted`],
//! pending waiters fail with [`ArchivalError::Halted`], and so does every
//! later call. Recovery from a halt means restarting from a snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{Mutex, Notify, Semaphore, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{debug, error, info, warn};

use super::commands::ArchivalCommand;
use super::config::StmConfig;
use super::consensus::{CommittedEntry, Consensus};
use super::snapshot::{decode_snapshot, encode_snapshot};
use super::snapshot_store::SnapshotStore;
use crate::error::{ArchivalError, ArchivalResult};
use crate::manifest::{PartitionManifest, SegmentMeta};
use crate::types::{Ntp, Offset, RevisionId};

/// Lifecycle of a state machine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateMachineStatus {
    /// Replaying the log after the snapshot.
    Recovering,
    /// Accepting writes.
    Running,
    /// Apply stopped after a fatal error.
    Halted { reason: String },
    /// Shut down by [`ArchivalMetadataStm::stop`].
    Stopped,
}

impl StateMachineStatus {
    /// Whether the apply path has ended for good.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StateMachineStatus::Halted { .. } | StateMachineStatus::Stopped
        )
    }

    fn to_error(&self) -> ArchivalError {
        match self {
            StateMachineStatus::Halted { reason } => ArchivalError::Halted(reason.clone()),
            StateMachineStatus::Stopped => ArchivalError::Halted("state machine stopped".to_string()),
            StateMachineStatus::Recovering => {
                ArchivalError::Halted("state machine still recovering".to_string())
            }
            StateMachineStatus::Running => {
                ArchivalError::InvariantViolation("running state machine reported as failed".to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Published {
    manifest: Arc<PartitionManifest>,
    status: StateMachineStatus,
}

/// Decode an entry and check it can be applied to `manifest` in full.
///
/// Everything [`apply_command`] could reject is rejected here, before any
/// mutation.
pub(crate) fn prepare_entry(
    manifest: &PartitionManifest,
    entry: &CommittedEntry,
) -> ArchivalResult<ArchivalCommand> {
    if entry.offset <= manifest.insync_offset() {
        return Err(ArchivalError::InvariantViolation(format!(
            "entry at offset {} already applied (insync offset {})",
            entry.offset,
            manifest.insync_offset()
        )));
    }

    let command = ArchivalCommand::decode(&entry.data)?;

    if let ArchivalCommand::AddSegments { segments } = &command {
        for (key, meta) in segments {
            if key.base_offset != meta.base_offset {
                return Err(ArchivalError::InvariantViolation(format!(
                    "segment key {} does not match base offset {}",
                    key, meta.base_offset
                )));
            }
            meta.validate().map_err(|e| {
                ArchivalError::InvariantViolation(format!("segment {}: {}", key, e))
            })?;
        }
    }

    Ok(command)
}

/// Apply a prepared command committed at `offset`.
pub(crate) fn apply_command(
    manifest: &mut PartitionManifest,
    offset: Offset,
    command: ArchivalCommand,
) -> ArchivalResult<()> {
    match command {
        ArchivalCommand::AddSegments { segments } => {
            for (key, meta) in segments {
                manifest.add(key, meta)?;
            }
        }
        ArchivalCommand::Truncate { start_offset } => {
            manifest.advance_start_offset(start_offset);
        }
        ArchivalCommand::CleanupMetadata { segments } => {
            manifest.acknowledge_cleanup(&segments);
        }
    }
    manifest.advance_insync_offset(offset)
}

/// State shared between the handle, the apply task and the snapshot worker.
struct Shared {
    ntp: Ntp,
    config: StmConfig,
    consensus: Arc<dyn Consensus>,
    store: Arc<dyn SnapshotStore>,
    state: watch::Sender<Published>,
    snapshot_offset: AtomicI64,
    /// Serializes snapshot writes.
    snapshot_lock: Mutex<()>,
    snapshot_requested: Notify,
}

impl Shared {
    fn manifest(&self) -> Arc<PartitionManifest> {
        self.state.borrow().manifest.clone()
    }

    fn status(&self) -> StateMachineStatus {
        self.state.borrow().status.clone()
    }

    fn snapshot_offset(&self) -> Offset {
        Offset::new(self.snapshot_offset.load(Ordering::SeqCst))
    }

    fn apply(&self, entry: CommittedEntry) -> ArchivalResult<()> {
        let command = prepare_entry(&self.manifest(), &entry)?;
        let kind = command.kind();

        let mut outcome: ArchivalResult<()> = Ok(());
        self.state.send_modify(|published| {
            let manifest = Arc::make_mut(&mut published.manifest);
            outcome = apply_command(manifest, entry.offset, command);
        });
        outcome?;

        debug!(
            ntp = %self.ntp,
            offset = %entry.offset,
            command = kind.as_str(),
            "Applied archival command"
        );

        self.maybe_request_snapshot(entry.offset);
        Ok(())
    }

    fn maybe_request_snapshot(&self, applied: Offset) {
        let threshold = i64::try_from(self.config.snapshot_threshold).unwrap_or(i64::MAX);
        if applied.value() - self.snapshot_offset().value() >= threshold {
            self.snapshot_requested.notify_one();
        }
    }

    fn halt(&self, reason: String) {
        self.state.send_if_modified(|published| {
            if published.status.is_terminal() {
                return false;
            }
            published.status = StateMachineStatus::Halted { reason };
            true
        });
    }

    async fn write_snapshot(&self) -> ArchivalResult<Offset> {
        let _guard = self.snapshot_lock.lock().await;

        let manifest = self.manifest();
        let offset = manifest.insync_offset();
        let previous = self.snapshot_offset();
        if offset <= previous {
            return Ok(previous);
        }

        let blob = encode_snapshot(&manifest)?;
        let size = blob.len();
        self.store.write(&self.ntp, blob).await?;
        self.snapshot_offset.store(offset.value(), Ordering::SeqCst);
        self.consensus.release_prefix(offset).await;

        info!(
            ntp = %self.ntp,
            offset = %offset,
            segments = manifest.len(),
            size,
            "Persisted archival snapshot"
        );
        Ok(offset)
    }
}

async fn run_apply(shared: Arc<Shared>, mut entries: mpsc::UnboundedReceiver<CommittedEntry>) {
    while let Some(entry) = entries.recv().await {
        let offset = entry.offset;
        if let Err(e) = shared.apply(entry) {
            if matches!(e, ArchivalError::Decode(_)) {
                error!(
                    ntp = %shared.ntp,
                    offset = %offset,
                    error = %e,
                    error_kind = e.as_metric_label(),
                    "CORRUPTION: Failed to decode committed entry, halting apply"
                );
            } else {
                error!(
                    ntp = %shared.ntp,
                    offset = %offset,
                    error = %e,
                    error_kind = e.as_metric_label(),
                    "Failed to apply committed entry, halting apply"
                );
            }
            shared.halt(e.to_string());
            return;
        }
    }

    warn!(ntp = %shared.ntp, "Commit stream closed, halting apply");
    shared.halt("commit stream closed".to_string());
}

async fn run_snapshots(shared: Arc<Shared>) {
    loop {
        shared.snapshot_requested.notified().await;
        if shared.status() == StateMachineStatus::Stopped {
            return;
        }
        if let Err(e) = shared.write_snapshot().await {
            warn!(
                ntp = %shared.ntp,
                error = %e,
                error_kind = e.as_metric_label(),
                "Failed to persist archival snapshot"
            );
        }
    }
}

/// Archival metadata state machine for one partition replica.
pub struct ArchivalMetadataStm {
    shared: Arc<Shared>,
    write_slots: Semaphore,
    tasks: Vec<AbortHandle>,
}

impl ArchivalMetadataStm {
    /// Recover from the latest snapshot, replay the log suffix up to the
    /// commit offset observed at startup, and start accepting writes.
    ///
    /// Fails if the snapshot cannot be decoded or belongs to a different
    /// partition, or if replay does not finish within
    /// [`StmConfig::recovery_timeout`].
    pub async fn start(
        ntp: Ntp,
        revision: RevisionId,
        config: StmConfig,
        consensus: Arc<dyn Consensus>,
        store: Arc<dyn SnapshotStore>,
    ) -> ArchivalResult<Self> {
        config.ensure_valid()?;

        let (manifest, snapshot_offset) = match store.read_latest(&ntp).await? {
            Some(blob) => {
                let decoded = decode_snapshot(&blob, &ntp, revision).inspect_err(|e| {
                    error!(ntp = %ntp, error = %e, "CORRUPTION: Failed to decode archival snapshot");
                })?;
                if decoded.manifest.ntp() != &ntp || decoded.manifest.revision() != revision {
                    return Err(ArchivalError::Decode(format!(
                        "snapshot for {} revision {} loaded for {} revision {}",
                        decoded.manifest.ntp(),
                        decoded.manifest.revision(),
                        ntp,
                        revision
                    )));
                }
                info!(
                    ntp = %ntp,
                    offset = %decoded.offset,
                    format = ?decoded.format,
                    segments = decoded.manifest.len(),
                    "Loaded archival snapshot"
                );
                (decoded.manifest, decoded.offset)
            }
            None => {
                info!(ntp = %ntp, "No archival snapshot found, starting empty");
                (PartitionManifest::new(ntp.clone(), revision), Offset::NONE)
            }
        };

        let recovery_target = consensus.commit_offset();
        let entries = consensus.subscribe(snapshot_offset).await?;

        let (state, _) = watch::channel(Published {
            manifest: Arc::new(manifest),
            status: StateMachineStatus::Recovering,
        });
        let write_slots = Semaphore::new(config.max_pending_writes);
        let recovery_timeout = config.recovery_timeout;

        let shared = Arc::new(Shared {
            ntp,
            config,
            consensus,
            store,
            state,
            snapshot_offset: AtomicI64::new(snapshot_offset.value()),
            snapshot_lock: Mutex::new(()),
            snapshot_requested: Notify::new(),
        });

        let apply = tokio::spawn(run_apply(shared.clone(), entries));
        let snapshots = tokio::spawn(run_snapshots(shared.clone()));

        let stm = Self {
            shared,
            write_slots,
            tasks: vec![apply.abort_handle(), snapshots.abort_handle()],
        };

        let deadline = Instant::now() + recovery_timeout;
        if let Err(e) = stm.wait_applied(recovery_target, deadline, "recovery").await {
            error!(ntp = %stm.shared.ntp, error = %e, "Archival state machine recovery failed");
            stm.stop();
            return Err(e);
        }

        stm.shared.state.send_if_modified(|published| {
            if published.status != StateMachineStatus::Recovering {
                return false;
            }
            published.status = StateMachineStatus::Running;
            true
        });

        info!(
            ntp = %stm.shared.ntp,
            insync_offset = %stm.get_insync_offset(),
            "Archival state machine recovered"
        );
        Ok(stm)
    }

    /// Partition this state machine serves.
    pub fn ntp(&self) -> &Ntp {
        &self.shared.ntp
    }

    /// Current lifecycle status.
    pub fn status(&self) -> StateMachineStatus {
        self.shared.status()
    }

    /// Wait until the apply path ends and return why.
    pub async fn terminated(&self) -> StateMachineStatus {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|published| published.status.is_terminal()).await {
            Ok(published) => published.status.clone(),
            Err(_) => StateMachineStatus::Stopped,
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replicate every segment of `delta` and wait until it is applied here.
    ///
    /// On [`ArchivalError::Timeout`] the segments may still be added later.
    pub async fn add_segments(
        &self,
        delta: &PartitionManifest,
        deadline: Instant,
    ) -> ArchivalResult<()> {
        if delta.ntp() != self.ntp() {
            return Err(ArchivalError::InvalidSegment(format!(
                "segments of {} submitted to {}",
                delta.ntp(),
                self.ntp()
            )));
        }
        for (key, meta) in delta.iter() {
            meta.validate()
                .map_err(|e| ArchivalError::InvalidSegment(format!("segment {}: {}", key, e)))?;
        }

        self.replicate_and_wait(ArchivalCommand::add_segments(delta), deadline)
            .await
            .map(|_| ())
    }

    /// Replicate a start offset advance and wait until it is applied here.
    ///
    /// Segments evicted by the advance become visible through
    /// [`get_segments_to_cleanup`](Self::get_segments_to_cleanup).
    pub async fn truncate(&self, start_offset: Offset, deadline: Instant) -> ArchivalResult<()> {
        if !start_offset.is_valid() {
            return Err(ArchivalError::InvalidSegment(format!(
                "negative start offset {}",
                start_offset
            )));
        }
        self.replicate_and_wait(ArchivalCommand::Truncate { start_offset }, deadline)
            .await
            .map(|_| ())
    }

    /// Report segments whose remote objects are deleted so their entries can
    /// be dropped from the replaced list and the cleanup backlog.
    pub async fn acknowledge_cleanup(
        &self,
        segments: Vec<SegmentMeta>,
        deadline: Instant,
    ) -> ArchivalResult<()> {
        if segments.is_empty() {
            return Ok(());
        }
        self.replicate_and_wait(ArchivalCommand::CleanupMetadata { segments }, deadline)
            .await
            .map(|_| ())
    }

    async fn replicate_and_wait(
        &self,
        command: ArchivalCommand,
        deadline: Instant,
    ) -> ArchivalResult<Offset> {
        let operation = command.kind().as_str();
        self.check_accepting()?;

        let consensus = self.shared.consensus.clone();
        if !consensus.is_leader() {
            return Err(ArchivalError::NotLeader {
                leader_id: consensus.leader_id(),
            });
        }

        let data = command.encode()?;

        let _permit = match timeout_at(deadline, self.write_slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ArchivalError::Halted("state machine stopped".to_string()));
            }
            Err(_) => {
                warn!(
                    ntp = %self.shared.ntp,
                    command = operation,
                    max_pending_writes = self.shared.config.max_pending_writes,
                    "Write backpressure: deadline passed waiting for a slot"
                );
                return Err(ArchivalError::Timeout { operation });
            }
        };

        // Replication runs detached so that an expired deadline ends only the wait.
        let replication = tokio::spawn(async move { consensus.replicate(data).await });
        let offset = match timeout_at(deadline, replication).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                return Err(ArchivalError::ReplicationRejected(join_err.to_string()));
            }
            Err(_) => return Err(ArchivalError::Timeout { operation }),
        };

        debug!(
            ntp = %self.shared.ntp,
            offset = %offset,
            command = operation,
            "Archival command replicated"
        );

        self.wait_applied(offset, deadline, operation).await?;
        Ok(offset)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Wait until every command committed before this call is applied here.
    pub async fn sync(&self, timeout: Duration) -> ArchivalResult<()> {
        self.check_accepting()?;
        let consensus = &self.shared.consensus;
        if !consensus.is_leader() {
            return Err(ArchivalError::NotLeader {
                leader_id: consensus.leader_id(),
            });
        }
        let target = consensus.commit_offset();
        self.wait_applied(target, Instant::now() + timeout, "sync")
            .await
    }

    /// Segments evicted by truncation whose remote objects await deletion.
    pub fn get_segments_to_cleanup(&self) -> Vec<SegmentMeta> {
        self.shared.manifest().cleanup_backlog().to_vec()
    }

    /// The manifest as of the last applied command.
    pub fn manifest(&self) -> Arc<PartitionManifest> {
        self.shared.manifest()
    }

    /// Effective start offset of the manifest.
    pub fn get_start_offset(&self) -> Offset {
        self.shared.manifest().get_start_offset()
    }

    /// Log offset of the last applied command.
    pub fn get_insync_offset(&self) -> Offset {
        self.shared.manifest().insync_offset()
    }

    /// Log offset covered by the last persisted snapshot.
    pub fn snapshot_offset(&self) -> Offset {
        self.shared.snapshot_offset()
    }

    /// Number of writes currently holding a backpressure slot.
    pub fn pending_writes(&self) -> usize {
        self.shared.config.max_pending_writes - self.write_slots.available_permits()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Persist a snapshot of the current manifest now.
    ///
    /// Returns the offset the latest snapshot covers. Does nothing if
    /// nothing was applied since the previous snapshot.
    pub async fn make_snapshot(&self) -> ArchivalResult<Offset> {
        self.shared.write_snapshot().await
    }

    /// Stop applying entries and fail pending and later calls.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.write_slots.close();
        self.shared.state.send_if_modified(|published| {
            if published.status == StateMachineStatus::Stopped {
                return false;
            }
            published.status = StateMachineStatus::Stopped;
            true
        });
        debug!(ntp = %self.shared.ntp, "Archival state machine stopped");
    }

    fn check_accepting(&self) -> ArchivalResult<()> {
        match self.shared.status() {
            StateMachineStatus::Running => Ok(()),
            status => Err(status.to_error()),
        }
    }

    async fn wait_applied(
        &self,
        target: Offset,
        deadline: Instant,
        operation: &'static str,
    ) -> ArchivalResult<()> {
        let mut rx = self.shared.state.subscribe();
        let waited = timeout_at(
            deadline,
            rx.wait_for(|published| {
                published.manifest.insync_offset() >= target || published.status.is_terminal()
            }),
        )
        .await;

        match waited {
            Ok(Ok(published)) => {
                if published.manifest.insync_offset() >= target {
                    Ok(())
                } else {
                    Err(published.status.to_error())
                }
            }
            Ok(Err(_)) => Err(ArchivalError::Halted("state machine dropped".to_string())),
            Err(_) => Err(ArchivalError::Timeout { operation }),
        }
    }
}

impl Drop for ArchivalMetadataStm {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

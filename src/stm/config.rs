//! Configuration for the archival state machine.

use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{ArchivalError, ArchivalResult};

/// Configuration for one archival state machine instance.
#[derive(Debug, Clone)]
pub struct StmConfig {
    /// Snapshot policy: persist a snapshot after N applied log entries.
    pub snapshot_threshold: u64,

    /// How long recovery may take to replay the log up to the commit offset
    /// observed at startup.
    pub recovery_timeout: Duration,

    /// Object store prefix under which snapshots are written.
    ///
    /// Consumed by [`ObjectStoreSnapshots::from_config`](super::ObjectStoreSnapshots::from_config);
    /// the state machine itself only sees the [`SnapshotStore`](super::SnapshotStore)
    /// it is started with.
    pub snapshot_prefix: String,

    // ========================================================================
    // Backpressure settings
    // ========================================================================
    /// Maximum number of writes awaiting replication before new writes wait
    /// for a slot. A write that cannot get a slot before its deadline fails
    /// with a timeout.
    pub max_pending_writes: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 1_000,
            recovery_timeout: Duration::from_secs(30),
            snapshot_prefix: "archival/snapshots".to_string(),
            max_pending_writes: 1000,
        }
    }
}

impl StmConfig {
    /// Create config from environment variables.
    ///
    /// - `ARCHIVAL_SNAPSHOT_THRESHOLD`
    /// - `ARCHIVAL_RECOVERY_TIMEOUT_MS`
    /// - `ARCHIVAL_SNAPSHOT_PREFIX`
    /// - `ARCHIVAL_MAX_PENDING_WRITES`
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> ArchivalResult<Self> {
        let defaults = Self::default();

        let snapshot_threshold = match std::env::var("ARCHIVAL_SNAPSHOT_THRESHOLD") {
            Ok(v) => v.parse().map_err(|e| {
                ArchivalError::Config(format!("Invalid ARCHIVAL_SNAPSHOT_THRESHOLD: {}", e))
            })?,
            Err(_) => defaults.snapshot_threshold,
        };

        let recovery_timeout = match std::env::var("ARCHIVAL_RECOVERY_TIMEOUT_MS") {
            Ok(v) => Duration::from_millis(v.parse().map_err(|e| {
                ArchivalError::Config(format!("Invalid ARCHIVAL_RECOVERY_TIMEOUT_MS: {}", e))
            })?),
            Err(_) => defaults.recovery_timeout,
        };

        let max_pending_writes = match std::env::var("ARCHIVAL_MAX_PENDING_WRITES") {
            Ok(v) => v.parse().map_err(|e| {
                ArchivalError::Config(format!("Invalid ARCHIVAL_MAX_PENDING_WRITES: {}", e))
            })?,
            Err(_) => defaults.max_pending_writes,
        };

        let snapshot_prefix =
            std::env::var("ARCHIVAL_SNAPSHOT_PREFIX").unwrap_or(defaults.snapshot_prefix);

        Ok(Self {
            snapshot_threshold,
            recovery_timeout,
            snapshot_prefix,
            max_pending_writes,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.snapshot_threshold == 0 {
            errors.push("snapshot_threshold must be greater than 0".to_string());
        }

        if self.recovery_timeout.is_zero() {
            errors.push("recovery_timeout must be greater than 0".to_string());
        }

        if self.max_pending_writes == 0 {
            errors.push("max_pending_writes must be greater than 0".to_string());
        } else if self.max_pending_writes > Semaphore::MAX_PERMITS {
            errors.push(format!(
                "max_pending_writes ({}) must be at most {}",
                self.max_pending_writes,
                Semaphore::MAX_PERMITS
            ));
        }

        let prefix = self.snapshot_prefix.trim_matches('/');
        if prefix.is_empty() {
            errors.push("snapshot_prefix must not be empty".to_string());
        } else if prefix.split('/').any(|part| part.is_empty() || part == "..") {
            errors.push(format!(
                "snapshot_prefix ({}) must not contain empty or '..' segments",
                self.snapshot_prefix
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate, folding every problem into a single [`ArchivalError::Config`].
    pub fn ensure_valid(&self) -> ArchivalResult<()> {
        self.validate()
            .map_err(|errors| ArchivalError::Config(errors.join("; ")))
    }
}

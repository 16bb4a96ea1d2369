//! Consensus layer seam.
//!
//! The state machine does not implement replication. It hands encoded
//! commands to a [`Consensus`] implementation and consumes the committed
//! entries that implementation delivers back, in log order.
//!
//! # Available Implementations
//!
//! - [`LocalConsensus`]: a single-replica in-memory log. Every replicated
//!   entry commits immediately. Useful for embedding and for tests, with
//!   switches to simulate lost leadership and rejected proposals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{ArchivalError, ArchivalResult};
use crate::types::Offset;

/// A committed log entry delivered to the apply path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub offset: Offset,
    pub data: Bytes,
}

/// Reasons the consensus layer refuses a command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicateError {
    /// This replica does not lead the replication group.
    #[error("not the leader (current leader: {leader_id:?})")]
    NotLeader { leader_id: Option<u64> },

    /// Backpressure, disconnect or shutdown.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<ReplicateError> for ArchivalError {
    fn from(e: ReplicateError) -> Self {
        match e {
            ReplicateError::NotLeader { leader_id } => ArchivalError::NotLeader { leader_id },
            ReplicateError::Rejected(reason) => ArchivalError::ReplicationRejected(reason),
        }
    }
}

/// The replication layer underneath one partition's state machine.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Append `data` to the log and return the offset it was committed at.
    async fn replicate(&self, data: Bytes) -> Result<Offset, ReplicateError>;

    /// Highest committed offset, [`Offset::NONE`] for an empty log.
    fn commit_offset(&self) -> Offset;

    /// Whether this replica currently leads the replication group.
    fn is_leader(&self) -> bool;

    /// Node id of the current leader, if known.
    fn leader_id(&self) -> Option<u64>;

    /// Stream every committed entry with an offset greater than `after`, in
    /// log order, including entries committed after this call.
    ///
    /// Fails if entries after `after` are no longer retained.
    async fn subscribe(
        &self,
        after: Offset,
    ) -> ArchivalResult<mpsc::UnboundedReceiver<CommittedEntry>>;

    /// Entries through `offset` are covered by a persisted snapshot and are
    /// no longer needed for recovery.
    async fn release_prefix(&self, _offset: Offset) {}
}

struct LocalLog {
    entries: VecDeque<CommittedEntry>,
    /// Highest offset dropped by [`Consensus::release_prefix`].
    released_through: Offset,
    next_offset: Offset,
    subscribers: Vec<mpsc::UnboundedSender<CommittedEntry>>,
}

/// In-memory single-replica log.
pub struct LocalConsensus {
    node_id: u64,
    log: Mutex<LocalLog>,
    commit_offset: AtomicI64,
    leader: AtomicBool,
    rejection: Mutex<Option<String>>,
}

impl LocalConsensus {
    /// Create an empty log led by `node_id`.
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id,
            log: Mutex::new(LocalLog {
                entries: VecDeque::new(),
                released_through: Offset::NONE,
                next_offset: Offset::new(0),
                subscribers: Vec::new(),
            }),
            commit_offset: AtomicI64::new(Offset::NONE.value()),
            leader: AtomicBool::new(true),
            rejection: Mutex::new(None),
        }
    }

    /// Give up or regain leadership.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    /// Reject every proposal with `reason` until cleared with `None`.
    pub async fn set_rejection(&self, reason: Option<String>) {
        *self.rejection.lock().await = reason;
    }

    /// Commit `data` directly, bypassing leadership and rejection checks.
    ///
    /// Models an entry written by another leader and delivered to this
    /// replica through replication.
    pub async fn append_committed(&self, data: Bytes) -> Offset {
        let mut log = self.log.lock().await;
        let entry = CommittedEntry {
            offset: log.next_offset,
            data,
        };
        log.next_offset = entry.offset.next();
        log.entries.push_back(entry.clone());
        self.commit_offset
            .store(entry.offset.value(), Ordering::SeqCst);

        log.subscribers
            .retain(|subscriber| subscriber.send(entry.clone()).is_ok());
        entry.offset
    }

    /// Number of entries still retained.
    pub async fn retained_len(&self) -> usize {
        self.log.lock().await.entries.len()
    }

    /// Highest offset released to a snapshot.
    pub async fn released_through(&self) -> Offset {
        self.log.lock().await.released_through
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn replicate(&self, data: Bytes) -> Result<Offset, ReplicateError> {
        if !self.is_leader() {
            return Err(ReplicateError::NotLeader { leader_id: None });
        }
        if let Some(reason) = self.rejection.lock().await.clone() {
            return Err(ReplicateError::Rejected(reason));
        }
        Ok(self.append_committed(data).await)
    }

    fn commit_offset(&self) -> Offset {
        Offset::new(self.commit_offset.load(Ordering::SeqCst))
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_id(&self) -> Option<u64> {
        self.is_leader().then_some(self.node_id)
    }

    async fn subscribe(
        &self,
        after: Offset,
    ) -> ArchivalResult<mpsc::UnboundedReceiver<CommittedEntry>> {
        let mut log = self.log.lock().await;
        if after < log.released_through {
            return Err(ArchivalError::InvariantViolation(format!(
                "cannot replay after offset {}: log released through {}",
                after, log.released_through
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for entry in log.entries.iter().filter(|entry| entry.offset > after) {
            // The receiver is still held locally, so the send cannot fail.
            let _ = tx.send(entry.clone());
        }
        log.subscribers.push(tx);
        Ok(rx)
    }

    async fn release_prefix(&self, offset: Offset) {
        let mut log = self.log.lock().await;
        while log
            .entries
            .front()
            .is_some_and(|entry| entry.offset <= offset)
        {
            log.entries.pop_front();
        }
        if offset > log.released_through {
            log.released_through = offset;
            debug!(offset = %offset, "Released log prefix");
        }
    }
}

//! Replicated log abstraction.
//!
//! Consensus membership and replication are external; what the store
//! needs from them is a totally ordered write-ahead log whose entries
//! are acknowledged after they hit the local KV. [`LocalLog`] provides
//! that contract for a single replica (and for tests): proposals are
//! serialized through a channel and applied in order by one task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use super::{apply_entry, Kv, LogEntry, StoreError};

#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Appends one entry and resolves once it has been applied locally.
    async fn propose(&self, entry: LogEntry) -> Result<(), StoreError>;

    /// Whether this replica may currently propose.
    fn is_leader(&self) -> bool;
}

struct Proposal {
    entry: LogEntry,
    ack: oneshot::Sender<Result<(), StoreError>>,
}

/// Single-replica log: total order by construction.
pub struct LocalLog {
    tx: mpsc::UnboundedSender<Proposal>,
    leader: Arc<AtomicBool>,
}

impl LocalLog {
    /// Spawns the apply task over the given KV.
    pub fn spawn(kv: Arc<Kv>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Proposal>();
        tokio::spawn(async move {
            while let Some(proposal) = rx.recv().await {
                let result = apply_entry(&kv, &proposal.entry);
                if let Err(e) = &result {
                    error!(error = %e, "Log entry failed to apply");
                }
                let _ = proposal.ack.send(result);
            }
            debug!("Replicated log apply task stopped");
        });
        Self {
            tx,
            leader: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flips leadership; proposals on a non-leader fail with `NotLeader`.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn propose(&self, entry: LogEntry) -> Result<(), StoreError> {
        if !self.is_leader() {
            return Err(StoreError::NotLeader);
        }
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Proposal { entry, ack })
            .map_err(|_| StoreError::LogClosed)?;
        done.await.map_err(|_| StoreError::LogClosed)?
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

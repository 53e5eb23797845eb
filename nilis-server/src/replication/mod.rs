//! Asynchronous primary-to-replica propagation of committed writes.
//!
//! Each replica gets its own bounded FIFO queue drained by one worker task,
//! so mutations reach a replica in commit order. Replicas compare the
//! shipped commit sequence against the last one they applied per key and
//! skip anything older.
//!
//! A mutation that cannot be queued or delivered is not lost: its key is
//! parked in the replica's backlog and re-sent later from the engine's
//! current state, until the replica acknowledges it.

mod backlog;
mod stats;
mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nilis_storage::{CommitSeq, StorageEngine, StorageError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use stats::{ReplicationSnapshot, ReplicationStats};

use crate::topology::{Shard, ShardId};
use crate::transport::{ClusterTransport, TransportError};
use backlog::Backlog;
use worker::ReplicaWorker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedOp {
    Set(Bytes),
    Delete,
}

/// A committed write on its way to the replicas of its shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedMutation {
    pub shard_id: ShardId,
    pub seq: CommitSeq,
    pub key: String,
    pub op: ReplicatedOp,
}

impl ReplicatedMutation {
    pub fn to_proto(&self) -> nilis_pb::Mutation {
        let mut mutation = nilis_pb::Mutation {
            shard_id: self.shard_id,
            seq: self.seq,
            key: self.key.clone(),
            ..Default::default()
        };
        match &self.op {
            ReplicatedOp::Set(value) => {
                mutation.set_op(nilis_pb::MutationOp::Set);
                mutation.value = value.clone();
            }
            ReplicatedOp::Delete => {
                mutation.set_op(nilis_pb::MutationOp::Delete);
            }
        }
        mutation
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReplicationError {
    #[error(
        "replica {replica} missed seq {seq} after {attempts} attempts: {source}"
    )]
    Lag {
        replica: String,
        seq: CommitSeq,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("cannot read key for resync: {0}")]
    Read(#[from] StorageError),
    #[error("resync read task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Deadline of a single delivery attempt.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub initial_backoff: Duration,
    /// Cap on retry backoff. Parked keys are retried at this period too.
    pub max_backoff: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            max_attempts: 5,
            queue_capacity: 10_000,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Fans committed mutations of one shard out to its replicas.
pub struct ReplicationPropagator {
    shard_id: ShardId,
    replicas: Vec<ReplicaQueue>,
    stats: Arc<ReplicationStats>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct ReplicaQueue {
    address: String,
    tx: flume::Sender<ReplicatedMutation>,
    backlog: Arc<Backlog>,
}

impl ReplicaQueue {
    fn park(&self, key: &str) {
        self.backlog.park(key.to_owned());
    }
}

impl ReplicationPropagator {
    /// Spawn one worker per replica of `shard`. `engine` is the primary's
    /// storage, read back when a replica has to catch up. Must run inside a
    /// tokio runtime.
    pub fn start(
        shard: &Shard,
        engine: Arc<StorageEngine>,
        transport: Arc<dyn ClusterTransport>,
        config: ReplicationConfig,
    ) -> Self {
        let stats = Arc::new(ReplicationStats::default());
        let token = CancellationToken::new();
        let mut replicas = Vec::with_capacity(shard.replicas.len());
        let mut handles = Vec::with_capacity(shard.replicas.len());
        for replica in &shard.replicas {
            let (tx, rx) = flume::bounded(config.queue_capacity.max(1));
            let backlog = Arc::new(Backlog::default());
            let worker = ReplicaWorker {
                address: replica.address.clone(),
                shard_id: shard.id,
                rx,
                backlog: backlog.clone(),
                engine: engine.clone(),
                transport: transport.clone(),
                config: config.clone(),
                stats: stats.clone(),
                token: token.child_token(),
            };
            handles.push(tokio::spawn(worker.run()));
            replicas.push(ReplicaQueue {
                address: replica.address.clone(),
                tx,
                backlog,
            });
        }
        info!(
            shard = shard.id,
            replicas = replicas.len(),
            "replication propagator started"
        );
        Self {
            shard_id: shard.id,
            replicas,
            stats,
            token,
            handles: Mutex::new(handles),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Queue a committed mutation for every replica. Never blocks. When a
    /// replica's queue is full the mutation is dropped for that replica and
    /// its key parked for a resync.
    pub fn propagate(&self, mutation: ReplicatedMutation) {
        if self.token.is_cancelled() {
            if !self.replicas.is_empty() {
                warn!(shard = self.shard_id, seq = mutation.seq, key = %mutation.key, "replication stopped, mutation not shipped");
            }
            for replica in &self.replicas {
                self.stats.record_dropped();
                replica.park(&mutation.key);
            }
            return;
        }
        for replica in &self.replicas {
            match replica.tx.try_send(mutation.clone()) {
                Ok(()) => self.stats.record_enqueued(),
                Err(flume::TrySendError::Full(m)) => {
                    warn!(replica = %replica.address, seq = m.seq, key = %m.key, "replication queue full, key parked for resync");
                    self.stats.record_dropped();
                    replica.park(&m.key);
                }
                Err(flume::TrySendError::Disconnected(m)) => {
                    warn!(replica = %replica.address, seq = m.seq, key = %m.key, "replication worker gone, mutation dropped");
                    self.stats.record_dropped();
                    replica.park(&m.key);
                }
            }
        }
    }

    pub fn stats(&self) -> ReplicationSnapshot {
        let mut snap = self.stats.snapshot();
        snap.pending = self.replicas.iter().map(|r| r.backlog.len() as u64).sum();
        snap
    }

    /// Stop accepting mutations and give workers `grace` to flush what is
    /// queued or parked. Workers still running afterwards are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();
        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(shard = self.shard_id, "replication workers did not finish in time");
            for abort in aborts {
                abort.abort();
            }
        }
        info!(shard = self.shard_id, stats = ?self.stats(), "replication propagator stopped");
    }
}

impl Drop for ReplicationPropagator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nilis_storage::StorageEngine;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backlog::Backlog;
use super::{
    ReplicatedMutation, ReplicatedOp, ReplicationConfig, ReplicationError,
    ReplicationStats,
};
use crate::topology::ShardId;
use crate::transport::{ClusterTransport, TransportError};

const MIN_RESYNC_PERIOD: Duration = Duration::from_millis(1);

/// Delivers one replica's queue strictly in the order it was filled and
/// periodically re-sends keys parked in its backlog.
pub(super) struct ReplicaWorker {
    pub address: String,
    pub shard_id: ShardId,
    pub rx: flume::Receiver<ReplicatedMutation>,
    pub backlog: Arc<Backlog>,
    pub engine: Arc<StorageEngine>,
    pub transport: Arc<dyn ClusterTransport>,
    pub config: ReplicationConfig,
    pub stats: Arc<ReplicationStats>,
    pub token: CancellationToken,
}

impl ReplicaWorker {
    pub async fn run(self) {
        debug!(replica = %self.address, "start replication worker");
        let period = self.config.max_backoff.max(MIN_RESYNC_PERIOD);
        let mut resync_timer = tokio::time::interval(period);
        resync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                next = self.rx.recv_async() => match next {
                    Ok(mutation) => {
                        self.deliver(mutation, self.config.max_attempts).await
                    }
                    Err(_) => break,
                },
                _ = resync_timer.tick(), if !self.backlog.is_empty() => {
                    self.resync(self.config.max_attempts).await
                }
            }
        }

        // shutting down: one last try for whatever is already queued
        let queued: Vec<_> = self.rx.drain().collect();
        if !queued.is_empty() {
            info!(replica = %self.address, queued = queued.len(), "draining replication queue");
        }
        for mutation in queued {
            self.deliver(mutation, 1).await;
        }
        if !self.backlog.is_empty() {
            self.resync(1).await;
        }
        if !self.backlog.is_empty() {
            warn!(replica = %self.address, pending = self.backlog.len(), "replica stopped with keys still out of date");
        }
    }

    async fn deliver(&self, mutation: ReplicatedMutation, max_attempts: u32) {
        match self.send(&mutation, max_attempts).await {
            Ok(true) => self.stats.record_applied(),
            Ok(false) => {
                debug!(replica = %self.address, seq = mutation.seq, key = %mutation.key, "replica already newer");
                self.stats.record_stale();
            }
            Err((attempts, source)) => {
                let err = ReplicationError::Lag {
                    replica: self.address.clone(),
                    seq: mutation.seq,
                    attempts,
                    source,
                };
                error!(key = %mutation.key, error = %err, "replication lag");
                self.stats.record_failed();
                self.backlog.park(mutation.key);
            }
        }
    }

    /// Ship the current state of every parked key. Stops at the first
    /// delivery failure and leaves the rest parked for the next round.
    async fn resync(&self, max_attempts: u32) {
        let keys = self.backlog.keys().await;
        debug!(replica = %self.address, keys = keys.len(), "resyncing parked keys");
        for key in keys {
            if !self.backlog.unpark(&key) {
                continue;
            }
            let mutation = match self.current(&key).await {
                Ok(Some(mutation)) => mutation,
                Ok(None) => continue,
                Err(e) => {
                    error!(replica = %self.address, key = %key, error = %e, "failed to read parked key");
                    self.backlog.park(key);
                    continue;
                }
            };
            match self.send(&mutation, max_attempts).await {
                Ok(_) => self.stats.record_resynced(),
                Err((attempts, source)) => {
                    warn!(replica = %self.address, key = %key, attempts, error = %source, "replica still unreachable, resync postponed");
                    self.backlog.park(key);
                    return;
                }
            }
        }
        if self.backlog.is_empty() {
            info!(replica = %self.address, "replica caught up");
        }
    }

    /// Current value and commit sequence of `key` as a mutation, read in one
    /// snapshot. `None` when nothing was ever committed.
    async fn current(
        &self,
        key: &str,
    ) -> Result<Option<ReplicatedMutation>, ReplicationError> {
        let engine = self.engine.clone();
        let owned = key.to_owned();
        let (value, seq) =
            tokio::task::spawn_blocking(move || engine.get_with_seq(owned.as_bytes()))
                .await??;
        if seq == 0 {
            return Ok(None);
        }
        let op = match value {
            Some(v) => ReplicatedOp::Set(Bytes::from(v)),
            None => ReplicatedOp::Delete,
        };
        Ok(Some(ReplicatedMutation {
            shard_id: self.shard_id,
            seq,
            key: key.to_owned(),
            op,
        }))
    }

    /// `Ok(applied)` once the replica answered; the attempt count and last
    /// error when every attempt failed.
    async fn send(
        &self,
        mutation: &ReplicatedMutation,
        max_attempts: u32,
    ) -> Result<bool, (u32, TransportError)> {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let source = match self
                .transport
                .apply(&self.address, mutation.to_proto(), self.config.timeout)
                .await
            {
                Ok(applied) => return Ok(applied),
                Err(e) => e,
            };

            if attempt >= max_attempts || self.token.is_cancelled() {
                return Err((attempt, source));
            }
            debug!(replica = %self.address, seq = mutation.seq, attempt, error = %source, "replication attempt failed, retrying");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.token.cancelled() => return Err((attempt, source)),
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

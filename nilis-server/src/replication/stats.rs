use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters describing how far replicas trail their primary.
#[derive(Debug, Default)]
pub struct ReplicationStats {
    enqueued: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    resynced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub enqueued: u64,
    pub applied: u64,
    pub stale: u64,
    /// Queued mutations whose delivery ran out of attempts.
    pub failed: u64,
    /// Mutations that never made it into a replica queue.
    pub dropped: u64,
    /// Keys re-sent from current storage state after a failure or drop.
    pub resynced: u64,
    /// Keys currently parked for a resync, summed over replicas.
    pub pending: u64,
}

impl ReplicationSnapshot {
    /// Keys some replica is known to be missing right now.
    pub fn lagging(&self) -> u64 {
        self.pending
    }

    /// Mutations queued but not yet resolved either way.
    pub fn in_flight(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.applied + self.stale + self.failed)
    }
}

impl ReplicationStats {
    #[inline]
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resynced(&self) {
        self.resynced.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values; `pending` is left at zero for the caller to fill.
    pub fn snapshot(&self) -> ReplicationSnapshot {
        ReplicationSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            resynced: self.resynced.load(Ordering::Relaxed),
            pending: 0,
        }
    }
}

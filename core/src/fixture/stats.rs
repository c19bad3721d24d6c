use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use super::rules::FaultBehavior;

/// Shared atomic counters for one fixture.
#[derive(Default)]
pub struct FixtureStats {
    accepted: AtomicU64,
    active: AtomicU32,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    delayed: AtomicU64,
    fixed_status: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

/// Point-in-time copy of [`FixtureStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureStatsSnapshot {
    /// Connections accepted since the fixture started.
    pub accepted: u64,
    /// Connections currently being handled.
    pub active: u32,
    /// Requests relayed to the target (including delayed ones).
    pub forwarded: u64,
    pub dropped: u64,
    pub delayed: u64,
    pub fixed_status: u64,
    /// Bytes sent from clients to the target.
    pub bytes_upstream: u64,
    /// Bytes sent from the target back to clients.
    pub bytes_downstream: u64,
}

impl FixtureStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FixtureStatsSnapshot {
        FixtureStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            fixed_status: self.fixed_status.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }

    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_behavior(&self, behavior: &FaultBehavior) {
        let counter = match behavior {
            FaultBehavior::PassThrough => &self.forwarded,
            FaultBehavior::DropConnection => &self.dropped,
            FaultBehavior::Delay { .. } => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                &self.delayed
            }
            FaultBehavior::FixedStatus { .. } => &self.fixed_status,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, upstream: u64, downstream: u64) {
        self.bytes_upstream.fetch_add(upstream, Ordering::Relaxed);
        self.bytes_downstream.fetch_add(downstream, Ordering::Relaxed);
    }
}

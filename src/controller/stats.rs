use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Pipeline counters shared by both workers. Cumulative over restarts.
#[derive(Debug, Default)]
pub struct SimulationStats {
    published: AtomicU64,
    skipped: AtomicU64,
    publish_failures: AtomicU64,
    persisted: AtomicU64,
    rejected: AtomicU64,
    persist_failures: AtomicU64,
}

/// Point-in-time copy of [`SimulationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Readings handed to the broker
    pub published: u64,
    /// Producer ticks dropped by validation
    pub skipped: u64,
    pub publish_failures: u64,
    /// Records appended to the store
    pub persisted: u64,
    /// Messages dropped as malformed or out of range
    pub rejected: u64,
    pub persist_failures: u64,
}

impl SimulationStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

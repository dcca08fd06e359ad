use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative pool counters, updated without taking the pool lock.
#[derive(Debug, Default)]
pub struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    stale_conns: AtomicU64,
    dials: AtomicU64,
    dial_errors: AtomicU64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale(&self, count: u64) {
        self.stale_conns.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dial(&self, ok: bool) {
        self.dials.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.dial_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counter values combined with the caller-supplied gauges.
    pub fn snapshot(&self, gauges: PoolGauges) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_conns: gauges.total_conns,
            idle_conns: gauges.idle_conns,
            pool_size: gauges.pool_size,
            stale_conns: self.stale_conns.load(Ordering::Relaxed),
            dials: self.dials.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
            last_access_ms_ago: gauges.last_access_ms_ago,
        }
    }
}

/// Point-in-time sizes read under the pool lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolGauges {
    pub total_conns: usize,
    pub idle_conns: usize,
    pub pool_size: usize,
    pub last_access_ms_ago: Option<u64>,
}

/// Immutable view of pool usage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Checkouts served from the idle set.
    pub hits: u64,
    /// Checkouts that had to dial.
    pub misses: u64,
    /// `get` calls that gave up waiting for an admission slot.
    pub timeouts: u64,
    /// Live connections: idle, checked out and overflow.
    pub total_conns: usize,
    pub idle_conns: usize,
    /// Connections counted against capacity.
    pub pool_size: usize,
    /// Connections evicted for being idle too long.
    pub stale_conns: u64,
    pub dials: u64,
    pub dial_errors: u64,
    /// Milliseconds since the last `get`/`put`, if any happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access_ms_ago: Option<u64>,
}

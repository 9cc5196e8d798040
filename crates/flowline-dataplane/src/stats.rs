//! Engine statistics.
//!
//! Per-core counter blocks mutated only by their owning worker; readers on
//! other cores take snapshots and sum.

use flowline_table::ShardSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-core packet counters (cache-line aligned).
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct CoreStats {
    /// Packets received by this worker.
    pub rx_packets: AtomicU64,
    /// Bytes received.
    pub rx_bytes: AtomicU64,
    /// Packets forwarded.
    pub tx_packets: AtomicU64,
    /// Bytes forwarded.
    pub tx_bytes: AtomicU64,
    /// Packets dropped by any stage.
    pub dropped: AtomicU64,
    /// Packets that matched an existing flow.
    pub flow_hits: AtomicU64,
    /// Packets that admitted a new flow.
    pub flow_misses: AtomicU64,
}

impl CoreStats {
    #[inline(always)]
    pub(crate) fn record_rx(&self, bytes: u64) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_tx(&self, bytes: u64) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_flow_hit(&self) {
        self.flow_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_flow_miss(&self) {
        self.flow_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flow_hits: self.flow_hits.load(Ordering::Relaxed),
            flow_misses: self.flow_misses.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic stats snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CoreSnapshot {
    /// Packets received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets forwarded.
    pub tx_packets: u64,
    /// Bytes forwarded.
    pub tx_bytes: u64,
    /// Packets dropped.
    pub dropped: u64,
    /// Existing-flow matches.
    pub flow_hits: u64,
    /// New-flow admissions.
    pub flow_misses: u64,
}

impl CoreSnapshot {
    /// Accumulate another core's snapshot into this one.
    pub fn add(&mut self, other: CoreSnapshot) {
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.dropped += other.dropped;
        self.flow_hits += other.flow_hits;
        self.flow_misses += other.flow_misses;
    }

    /// Fraction of classified packets that hit an existing flow.
    pub fn flow_hit_rate(&self) -> f64 {
        let total = self.flow_hits + self.flow_misses;
        if total == 0 {
            return 0.0;
        }
        self.flow_hits as f64 / total as f64
    }
}

/// Whole-engine observability snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Packet counters summed across workers.
    pub cores: CoreSnapshot,
    /// Flow-table counters summed across shards.
    pub flows: ShardSnapshot,
    /// Flows currently active across all shards.
    pub active_flows: u64,
    /// Configured flow capacity across all shards.
    pub flow_capacity: usize,
    /// Frames refused at the dispatcher (pool or queue exhaustion).
    pub ingress_drops: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = CoreStats::default();
        stats.record_rx(1500);
        stats.record_tx(1500);
        stats.record_flow_miss();
        stats.record_flow_hit();
        stats.record_flow_hit();

        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, 1500);
        assert_eq!(snap.flow_hits, 2);
        assert!((snap.flow_hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sum_across_cores() {
        let a = CoreStats::default();
        let b = CoreStats::default();
        a.record_rx(1000);
        b.record_rx(2000);
        b.record_drop();

        let mut total = CoreSnapshot::default();
        total.add(a.snapshot());
        total.add(b.snapshot());
        assert_eq!(total.rx_packets, 2);
        assert_eq!(total.rx_bytes, 3000);
        assert_eq!(total.dropped, 1);
    }
}

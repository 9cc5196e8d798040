//! Shard occupancy counters and cross-shard aggregation.
//!
//! Counters are mutated only by the owning core. Observability code on any
//! other core reads a snapshot and sums; it never reaches into a shard's
//! live structures.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-shard counter block (cache-line aligned).
#[derive(Debug, Default)]
#[repr(C, align(64))]
pub struct ShardCounters {
    /// Slots currently in the ACTIVE state.
    pub active: AtomicU64,
    /// Flows admitted since startup.
    pub created: AtomicU64,
    /// Flows expired by the maintainer since startup.
    pub expired: AtomicU64,
    /// Packets refused because the shard was at capacity.
    pub capacity_drops: AtomicU64,
}

impl ShardCounters {
    /// Consistent-enough point-in-time copy for cross-core readers.
    pub fn snapshot(&self) -> ShardSnapshot {
        ShardSnapshot {
            active: self.active.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            capacity_drops: self.capacity_drops.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic counter snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ShardSnapshot {
    /// Slots currently in the ACTIVE state.
    pub active: u64,
    /// Flows admitted since startup.
    pub created: u64,
    /// Flows expired since startup.
    pub expired: u64,
    /// Packets refused at capacity.
    pub capacity_drops: u64,
}

impl ShardSnapshot {
    fn add(&mut self, other: ShardSnapshot) {
        self.active += other.active;
        self.created += other.created;
        self.expired += other.expired;
        self.capacity_drops += other.capacity_drops;
    }
}

/// Read-only aggregation over every shard's counters.
#[derive(Debug, Default, Clone)]
pub struct TableStats {
    shards: Vec<Arc<ShardCounters>>,
    capacity: usize,
}

impl TableStats {
    /// Empty aggregation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one shard's counter block and its configured capacity.
    pub fn register(&mut self, counters: Arc<ShardCounters>, capacity: usize) {
        self.shards.push(counters);
        self.capacity += capacity;
    }

    /// Active flows summed across shards.
    pub fn total_active(&self) -> u64 {
        self.shards
            .iter()
            .map(|c| c.active.load(Ordering::Relaxed))
            .sum()
    }

    /// Configured capacity summed across shards.
    pub fn total_capacity(&self) -> usize {
        self.capacity
    }

    /// Summed snapshot across shards.
    pub fn snapshot(&self) -> ShardSnapshot {
        let mut total = ShardSnapshot::default();
        for shard in &self.shards {
            total.add(shard.snapshot());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation() {
        let a = Arc::new(ShardCounters::default());
        let b = Arc::new(ShardCounters::default());
        a.active.store(3, Ordering::Relaxed);
        b.active.store(4, Ordering::Relaxed);
        b.capacity_drops.store(1, Ordering::Relaxed);

        let mut stats = TableStats::new();
        stats.register(a, 1024);
        stats.register(b, 1024);

        assert_eq!(stats.total_active(), 7);
        assert_eq!(stats.total_capacity(), 2048);
        let snap = stats.snapshot();
        assert_eq!(snap.active, 7);
        assert_eq!(snap.capacity_drops, 1);
    }
}

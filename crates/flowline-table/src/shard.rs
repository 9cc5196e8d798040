//! Per-core flow shard: classification facade and maintainer.
//!
//! A shard owns its hash index, FCB arena, free-slot stack, timer wheel
//! and pending-release queue outright. Packet processing and maintenance
//! run on the same core and never concurrently, so every operation here is
//! single-writer and lock-free. The only externally visible state is the
//! [`ShardCounters`] block, read cross-core as snapshots.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fcb::{Fcb, FcbArena};
use crate::index::{HashIndex, IndexError, LinearProbeIndex, SLOT_NONE};
use crate::key::FlowKey;
use crate::slots::SlotStack;
use crate::stats::ShardCounters;
use crate::wheel::TimerWheel;
use crate::{Tick, DEFAULT_CAPACITY, DEFAULT_RECYCLE_INTERVAL_MS, DEFAULT_TIMEOUT_SECS};

const PENDING_EMPTY: u32 = u32::MAX;

/// Shard sizing and expiration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Requested flow capacity; rounded up to a power of two per shard.
    pub capacity: usize,
    /// Idle timeout after which a flow is reclaimed.
    pub timeout_secs: u32,
    /// Maintainer cadence; also sets the expiration epoch width.
    pub recycle_interval_ms: u32,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            recycle_interval_ms: DEFAULT_RECYCLE_INTERVAL_MS,
        }
    }
}

impl ShardConfig {
    /// Expiration epochs per second, derived from the recycle interval.
    pub fn epochs_per_sec(&self) -> u64 {
        (1000 / self.recycle_interval_ms.max(1)).max(1) as u64
    }

    /// Idle timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_secs as u64 * 1000
    }

    /// Idle timeout in epochs.
    pub fn timeout_epochs(&self) -> u64 {
        self.timeout_secs as u64 * self.epochs_per_sec()
    }
}

/// Errors surfaced by shard operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlowTableError {
    /// No free slot (or no index room) for a new flow; drop the packet.
    #[error("flow table at capacity")]
    CapacityExhausted,

    /// Backend index construction or sizing failure.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Result of classifying one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// Slot holding the flow's FCB.
    pub slot: u32,
    /// Whether this call admitted the flow.
    pub is_new: bool,
}

/// Liveness callbacks for protocol logic attached to flow state.
///
/// `new_flow` fires exactly once per admitted flow, before any packet of
/// that flow is seen by downstream logic, so reserved state can be
/// initialized without any knowledge of slot management.
pub trait FlowHandler {
    /// A flow was just admitted; its reserved region is zeroed.
    fn new_flow(&mut self, fcb: &mut Fcb);

    /// A packet arrived on an existing flow.
    fn flow(&mut self, fcb: &mut Fcb) {
        let _ = fcb;
    }

    /// The shard refused the key at capacity; the packet must be dropped.
    fn dropped(&mut self, key: &FlowKey) {
        let _ = key;
    }
}

/// One core's partition of the flow table.
pub struct FlowShard {
    index: Box<dyn HashIndex>,
    arena: FcbArena,
    free: SlotStack,
    wheel: TimerWheel,
    pending_next: Box<[u32]>,
    pending_head: u32,
    counters: Arc<ShardCounters>,

    capacity: usize,
    timeout_ms: u64,
    timeout_epochs: u64,
    epochs_per_sec: u64,

    scratch_slots: Vec<i32>,
    scratch_due: Vec<u32>,
    scratch_results: Vec<Result<Lookup, FlowTableError>>,
}

impl FlowShard {
    /// Build a shard around an injected hash index.
    ///
    /// The index must admit at least the shard's (power-of-two rounded)
    /// capacity, since every live slot needs an index entry.
    pub fn new(cfg: ShardConfig, index: Box<dyn HashIndex>) -> Result<Self, FlowTableError> {
        if cfg.capacity == 0 {
            return Err(IndexError::InvalidParams("capacity must be non-zero").into());
        }
        let capacity = cfg.capacity.next_power_of_two();
        if index.capacity() < capacity {
            return Err(IndexError::InvalidParams("index smaller than shard capacity").into());
        }

        Ok(Self {
            index,
            arena: FcbArena::new(capacity),
            free: SlotStack::new(capacity),
            wheel: TimerWheel::new(cfg.timeout_epochs(), capacity),
            pending_next: vec![PENDING_EMPTY; capacity].into_boxed_slice(),
            pending_head: PENDING_EMPTY,
            counters: Arc::new(ShardCounters::default()),
            capacity,
            timeout_ms: cfg.timeout_ms(),
            timeout_epochs: cfg.timeout_epochs(),
            epochs_per_sec: cfg.epochs_per_sec(),
            scratch_slots: Vec::new(),
            scratch_due: Vec::new(),
            scratch_results: Vec::new(),
        })
    }

    /// Build a shard with the bundled linear-probe index backend.
    pub fn with_linear_index(cfg: ShardConfig) -> Result<Self, FlowTableError> {
        if cfg.capacity == 0 {
            return Err(IndexError::InvalidParams("capacity must be non-zero").into());
        }
        let index = LinearProbeIndex::new(cfg.capacity.next_power_of_two())?;
        Self::new(cfg, Box::new(index))
    }

    /// Classify one key: existing flows are touched, unknown keys are
    /// admitted. `CapacityExhausted` means the caller drops the packet.
    pub fn lookup_or_create(
        &mut self,
        key: &FlowKey,
        now: Tick,
    ) -> Result<Lookup, FlowTableError> {
        if let Some(slot) = self.index.lookup(key) {
            self.arena.get_mut(slot).touch(now);
            return Ok(Lookup {
                slot,
                is_new: false,
            });
        }
        self.create_flow(key, now).map(|slot| Lookup {
            slot,
            is_new: true,
        })
    }

    /// Raw order-preserving bulk lookup; `out[i]` is the slot for
    /// `keys[i]` or [`SLOT_NONE`]. Unknown keys are *not* admitted.
    pub fn lookup_bulk(&self, keys: &[FlowKey], out: &mut [i32]) {
        self.index.lookup_bulk(keys, out);
    }

    /// Batch classification: one bulk index query, then per-position
    /// hit/miss resolution. Output order matches input order.
    pub fn lookup_or_create_bulk(
        &mut self,
        keys: &[FlowKey],
        now: Tick,
        out: &mut Vec<Result<Lookup, FlowTableError>>,
    ) {
        out.clear();
        self.scratch_slots.clear();
        self.scratch_slots.resize(keys.len(), SLOT_NONE);
        self.index.lookup_bulk(keys, &mut self.scratch_slots);

        for (i, key) in keys.iter().enumerate() {
            let found = self.scratch_slots[i];
            let result = if found >= 0 {
                let slot = found as u32;
                self.arena.get_mut(slot).touch(now);
                Ok(Lookup {
                    slot,
                    is_new: false,
                })
            } else {
                // An earlier packet in this batch may have admitted the
                // same flow; the bulk result is stale for it.
                match self.index.lookup(key) {
                    Some(slot) => {
                        self.arena.get_mut(slot).touch(now);
                        Ok(Lookup {
                            slot,
                            is_new: false,
                        })
                    }
                    None => self.create_flow(key, now).map(|slot| Lookup {
                        slot,
                        is_new: true,
                    }),
                }
            };
            out.push(result);
        }
    }

    /// Classify a batch and drive the liveness callbacks with each FCB.
    pub fn classify_batch(
        &mut self,
        keys: &[FlowKey],
        now: Tick,
        handler: &mut dyn FlowHandler,
    ) {
        let mut results = std::mem::take(&mut self.scratch_results);
        self.lookup_or_create_bulk(keys, now, &mut results);

        for (i, result) in results.iter().enumerate() {
            match result {
                Ok(lookup) => {
                    let fcb = self.arena.get_mut(lookup.slot);
                    if lookup.is_new {
                        handler.new_flow(fcb);
                    } else {
                        handler.flow(fcb);
                    }
                }
                Err(_) => handler.dropped(&keys[i]),
            }
        }

        results.clear();
        self.scratch_results = results;
    }

    fn create_flow(&mut self, key: &FlowKey, now: Tick) -> Result<u32, FlowTableError> {
        let Some(slot) = self.free.pop() else {
            self.counters.capacity_drops.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("flow admission refused: no free slot");
            return Err(FlowTableError::CapacityExhausted);
        };

        if let Err(err) = self.index.insert(key, slot) {
            self.free.push(slot);
            self.counters.capacity_drops.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(error = %err, "flow admission refused by index");
            return Err(FlowTableError::CapacityExhausted);
        }

        self.arena.reset(slot, *key, now);
        self.wheel.schedule_after(slot, self.timeout_epochs);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Borrow the FCB a previous lookup handed out.
    #[inline(always)]
    pub fn fcb(&self, slot: u32) -> &Fcb {
        self.arena.get(slot)
    }

    /// Mutably borrow the FCB a previous lookup handed out.
    #[inline(always)]
    pub fn fcb_mut(&mut self, slot: u32) -> &mut Fcb {
        self.arena.get_mut(slot)
    }

    /// Run one maintenance pass. Returns the number of flows expired.
    ///
    /// Order matters: the pending queue drains first so slots parked in
    /// the previous pass become allocatable before new expirations are
    /// queued; expired slots then wait in the pending queue for one more
    /// pass before reuse, which tolerates packet processing that still
    /// holds an FCB reference obtained in the tick the flow expired.
    pub fn maintain(&mut self, now: Tick) -> usize {
        self.drain_pending();

        let now_epoch = self.epoch(now);
        let mut due = std::mem::take(&mut self.scratch_due);
        due.clear();
        self.wheel.advance_and_collect(now_epoch, &mut due);

        if due.len() > self.capacity {
            tracing::error!(
                due = due.len(),
                capacity = self.capacity,
                "maintainer collected more entries than slots exist, aborting"
            );
            std::process::abort();
        }

        let mut expired = 0;
        for &slot in &due {
            let last_seen = self.arena.get(slot).last_seen();

            if last_seen > now {
                tracing::warn!(slot, "flow timestamp ahead of maintainer clock");
                self.wheel.schedule_after(slot, self.timeout_epochs);
                continue;
            }

            let idle_ms = now.since(last_seen);
            if idle_ms < self.timeout_ms {
                // Touched after it was scheduled; catch the wheel up to the
                // remaining idle budget instead of expiring.
                let remaining_ms = self.timeout_ms - idle_ms;
                let delay = (remaining_ms * self.epochs_per_sec).div_ceil(1000).max(1);
                self.wheel.schedule_after(slot, delay);
                continue;
            }

            let key = *self.arena.get(slot).key();
            if self.index.remove(&key).is_none() {
                // Bookkeeping disagreement between index and FCB. The slot
                // is recycled regardless: the intent is to free it.
                tracing::error!(slot, ?key, "expired flow was not in the hash index");
            }
            self.counters.active.fetch_sub(1, Ordering::Relaxed);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.pending_next[slot as usize] = self.pending_head;
            self.pending_head = slot;
            expired += 1;
        }

        due.clear();
        self.scratch_due = due;
        expired
    }

    fn drain_pending(&mut self) {
        while self.pending_head != PENDING_EMPTY {
            let slot = self.pending_head;
            self.pending_head = self.pending_next[slot as usize];
            self.pending_next[slot as usize] = PENDING_EMPTY;
            self.arena.zero_reserved(slot);
            self.free.push(slot);
        }
    }

    #[inline]
    fn epoch(&self, now: Tick) -> u64 {
        now.as_millis() * self.epochs_per_sec / 1000
    }

    /// Flows currently in the ACTIVE state.
    pub fn active(&self) -> u64 {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Configured (power-of-two) capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Shared handle to this shard's counters, for cross-core aggregation.
    pub fn counters(&self) -> Arc<ShardCounters> {
        Arc::clone(&self.counters)
    }

    /// Slots on the free stack.
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Slots waiting in the pending-release queue. O(queue length); meant
    /// for diagnostics and tests, not the packet path.
    pub fn pending_slots(&self) -> usize {
        let mut n = 0;
        let mut slot = self.pending_head;
        while slot != PENDING_EMPTY {
            n += 1;
            slot = self.pending_next[slot as usize];
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcb::{ReservedHandle, ReservedRegistry, ReservedState};

    fn key(n: u32) -> FlowKey {
        FlowKey::new(n, 0x08080808, 12345, 443, 6)
    }

    fn small_shard(capacity: usize) -> FlowShard {
        FlowShard::with_linear_index(ShardConfig {
            capacity,
            timeout_secs: 1,
            recycle_interval_ms: 100,
        })
        .unwrap()
    }

    fn assert_slot_invariant(shard: &FlowShard) {
        assert_eq!(
            shard.free_slots() + shard.active() as usize + shard.pending_slots(),
            shard.capacity(),
            "slot state accounting broken"
        );
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        let shard = small_shard(1000);
        assert_eq!(shard.capacity(), 1024);
    }

    #[test]
    fn test_stability_same_slot_same_fcb() {
        let mut shard = small_shard(16);

        let first = shard.lookup_or_create(&key(1), Tick(0)).unwrap();
        assert!(first.is_new);

        for t in [100u64, 200, 300] {
            let again = shard.lookup_or_create(&key(1), Tick(t)).unwrap();
            assert!(!again.is_new);
            assert_eq!(again.slot, first.slot);
            assert_eq!(shard.fcb(again.slot).key(), &key(1));
            assert_eq!(shard.fcb(again.slot).last_seen(), Tick(t));
        }
        assert_eq!(shard.active(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let mut shard = small_shard(4);

        let mut slots = Vec::new();
        for n in 1..=4 {
            let l = shard.lookup_or_create(&key(n), Tick(0)).unwrap();
            assert!(l.is_new);
            slots.push(l.slot);
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 4);

        assert_eq!(
            shard.lookup_or_create(&key(5), Tick(0)),
            Err(FlowTableError::CapacityExhausted)
        );
        assert_eq!(shard.active(), 4);
        assert_eq!(shard.counters().capacity_drops.load(Ordering::Relaxed), 1);
        assert_slot_invariant(&shard);

        // An existing flow still classifies at capacity.
        assert!(!shard.lookup_or_create(&key(4), Tick(1)).unwrap().is_new);
    }

    // Timeout 1000ms, epoch 100ms, recycle interval 100ms.
    #[test]
    fn test_expiration_and_slot_reuse() {
        let mut shard = small_shard(4);

        let k1 = shard.lookup_or_create(&key(1), Tick(0)).unwrap();
        assert_eq!(shard.active(), 1);

        // First pass past the idle deadline: removed from the index,
        // parked in the pending queue.
        let expired = shard.maintain(Tick(1100));
        assert_eq!(expired, 1);
        assert_eq!(shard.active(), 0);
        assert_eq!(shard.pending_slots(), 1);
        let mut out = [0i32; 1];
        shard.lookup_bulk(&[key(1)], &mut out);
        assert_eq!(out[0], SLOT_NONE);
        assert_slot_invariant(&shard);

        // Next pass recycles the slot.
        assert_eq!(shard.maintain(Tick(1200)), 0);
        assert_eq!(shard.pending_slots(), 0);
        assert_eq!(shard.free_slots(), 4);
        assert_slot_invariant(&shard);

        // A new flow may land in the recycled slot (LIFO keeps it on top).
        let k2 = shard.lookup_or_create(&key(2), Tick(1200)).unwrap();
        assert!(k2.is_new);
        assert_eq!(k2.slot, k1.slot);
        assert_eq!(shard.counters().expired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_touched_flow_survives_sweep() {
        let mut shard = small_shard(4);

        shard.lookup_or_create(&key(1), Tick(0)).unwrap();
        // Touch shortly before the original deadline.
        shard.lookup_or_create(&key(1), Tick(900)).unwrap();

        // The wheel fires at the original deadline but the flow was
        // touched: catch-up re-arm, not expiry.
        assert_eq!(shard.maintain(Tick(1100)), 0);
        assert_eq!(shard.active(), 1);

        // It expires once the full idle budget elapses from the touch.
        assert_eq!(shard.maintain(Tick(2000)), 1);
        assert_eq!(shard.active(), 0);
        assert_slot_invariant(&shard);
    }

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Scribble([u8; 16]);
    unsafe impl ReservedState for Scribble {}

    #[test]
    fn test_recycled_slot_presents_zeroed_state() {
        let mut reg = ReservedRegistry::new();
        let h: ReservedHandle<Scribble> = reg.claim().unwrap();

        let mut shard = small_shard(2);
        let l = shard.lookup_or_create(&key(1), Tick(0)).unwrap();
        h.get_mut(shard.fcb_mut(l.slot)).0 = [0xAB; 16];

        shard.maintain(Tick(1100));
        shard.maintain(Tick(1200));

        let reused = shard.lookup_or_create(&key(2), Tick(1200)).unwrap();
        assert_eq!(reused.slot, l.slot);
        assert_eq!(h.get(shard.fcb(reused.slot)).0, [0u8; 16]);
    }

    #[test]
    fn test_idle_maintenance_is_idempotent() {
        let mut shard = small_shard(8);
        shard.lookup_or_create(&key(1), Tick(0)).unwrap();

        let free_before = shard.free_slots();
        let active_before = shard.active();

        // Nothing due yet: only the wheel cursor moves forward.
        assert_eq!(shard.maintain(Tick(300)), 0);
        assert_eq!(shard.maintain(Tick(400)), 0);

        assert_eq!(shard.free_slots(), free_before);
        assert_eq!(shard.active(), active_before);
        assert_eq!(shard.pending_slots(), 0);
        assert_slot_invariant(&shard);
    }

    // A batch holding two known flows and one unknown key.
    #[test]
    fn test_bulk_preserves_order() {
        let mut shard = small_shard(8);
        let a = shard.lookup_or_create(&key(1), Tick(0)).unwrap();
        let b = shard.lookup_or_create(&key(2), Tick(0)).unwrap();

        let keys = [key(1), key(2), key(3)];
        let mut out = [0i32; 3];
        shard.lookup_bulk(&keys, &mut out);
        assert_eq!(out, [a.slot as i32, b.slot as i32, SLOT_NONE]);

        // Admitting the unknown key makes it a known flow on the next batch.
        let mut results = Vec::new();
        shard.lookup_or_create_bulk(&keys, Tick(10), &mut results);
        assert!(!results[0].as_ref().unwrap().is_new);
        assert!(!results[1].as_ref().unwrap().is_new);
        assert!(results[2].as_ref().unwrap().is_new);

        shard.lookup_bulk(&keys, &mut out);
        assert_eq!(out[2], results[2].as_ref().unwrap().slot as i32);
    }

    #[test]
    fn test_bulk_duplicate_new_key_single_admission() {
        let mut shard = small_shard(8);

        // Two packets of the same unseen flow in one batch.
        let keys = [key(7), key(7)];
        let mut results = Vec::new();
        shard.lookup_or_create_bulk(&keys, Tick(0), &mut results);

        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.slot, second.slot);
        assert_eq!(shard.active(), 1);
        assert_slot_invariant(&shard);
    }

    #[test]
    fn test_bulk_capacity_exhaustion_per_position() {
        let mut shard = small_shard(2);
        let keys = [key(1), key(2), key(3)];
        let mut results = Vec::new();
        shard.lookup_or_create_bulk(&keys, Tick(0), &mut results);

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert_eq!(results[2], Err(FlowTableError::CapacityExhausted));
        assert_eq!(shard.active(), 2);
    }

    struct CountingHandler {
        new_flows: usize,
        existing: usize,
        drops: usize,
    }

    impl FlowHandler for CountingHandler {
        fn new_flow(&mut self, fcb: &mut Fcb) {
            assert_eq!(fcb.reserved(), &[0u8; crate::FCB_RESERVE]);
            self.new_flows += 1;
        }
        fn flow(&mut self, _fcb: &mut Fcb) {
            self.existing += 1;
        }
        fn dropped(&mut self, _key: &FlowKey) {
            self.drops += 1;
        }
    }

    #[test]
    fn test_classify_batch_callbacks() {
        let mut shard = small_shard(2);
        let mut handler = CountingHandler {
            new_flows: 0,
            existing: 0,
            drops: 0,
        };

        shard.classify_batch(&[key(1), key(2), key(3)], Tick(0), &mut handler);
        assert_eq!(handler.new_flows, 2);
        assert_eq!(handler.drops, 1);

        shard.classify_batch(&[key(1), key(2)], Tick(5), &mut handler);
        assert_eq!(handler.new_flows, 2);
        assert_eq!(handler.existing, 2);
    }

    /// Index stub whose `remove` pretends the key was never there, to
    /// exercise the bookkeeping-disagreement path.
    struct AmnesiacIndex(LinearProbeIndex);

    impl HashIndex for AmnesiacIndex {
        fn lookup(&self, key: &FlowKey) -> Option<u32> {
            self.0.lookup(key)
        }
        fn insert(&mut self, key: &FlowKey, slot: u32) -> Result<(), IndexError> {
            self.0.insert(key, slot)
        }
        fn remove(&mut self, _key: &FlowKey) -> Option<u32> {
            None
        }
        fn len(&self) -> usize {
            self.0.len()
        }
        fn capacity(&self) -> usize {
            self.0.capacity()
        }
    }

    #[test]
    fn test_index_disagreement_still_recycles_slot() {
        let cfg = ShardConfig {
            capacity: 4,
            timeout_secs: 1,
            recycle_interval_ms: 100,
        };
        let index = AmnesiacIndex(LinearProbeIndex::new(4).unwrap());
        let mut shard = FlowShard::new(cfg, Box::new(index)).unwrap();

        shard.lookup_or_create(&key(1), Tick(0)).unwrap();
        assert_eq!(shard.maintain(Tick(1100)), 1);
        shard.maintain(Tick(1200));

        // The slot came back even though the index claimed NotFound.
        assert_eq!(shard.free_slots(), 4);
        assert_eq!(shard.active(), 0);
        assert_slot_invariant(&shard);
    }

    #[test]
    fn test_rejects_undersized_index() {
        let cfg = ShardConfig {
            capacity: 16,
            ..Default::default()
        };
        let index = LinearProbeIndex::new(4).unwrap();
        assert!(FlowShard::new(cfg, Box::new(index)).is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Packet(u32),
            Advance(u64),
            Maintain,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u32..24).prop_map(Op::Packet),
                (1u64..700).prop_map(Op::Advance),
                Just(Op::Maintain),
            ]
        }

        proptest! {
            // Whatever the packet/maintenance interleaving, every slot is
            // in exactly one of FREE / ACTIVE / PENDING-RELEASE.
            #[test]
            fn slot_states_partition_capacity(ops in proptest::collection::vec(op_strategy(), 1..200)) {
                let mut shard = small_shard(8);
                let mut now = Tick(0);

                for op in ops {
                    match op {
                        Op::Packet(n) => {
                            let _ = shard.lookup_or_create(&key(n), now);
                        }
                        Op::Advance(ms) => now = Tick(now.0 + ms),
                        Op::Maintain => {
                            shard.maintain(now);
                        }
                    }
                    assert_slot_invariant(&shard);
                    prop_assert!(shard.active() as usize <= shard.capacity());
                }
            }
        }
    }
}

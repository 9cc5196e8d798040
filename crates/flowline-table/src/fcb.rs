//! Flow control blocks and the reserved-state contract.
//!
//! The FCB array is a plain arena indexed by slot. Linked-list state for
//! the timer wheel and the pending-release queue lives *outside* the
//! record, in per-list index arrays, so one FCB can never be threaded into
//! two lists through the same field.

use crate::key::FlowKey;
use crate::Tick;

/// Bytes of per-flow state reserved for upstream protocol logic.
pub const FCB_RESERVE: usize = 64;

/// One flow's fixed-size state record.
///
/// The reserved region is the first field so it starts on the cache-line
/// boundary; sub-ranges are handed to collaborators through
/// [`ReservedRegistry`] and are opaque to the flow table itself.
#[derive(Debug)]
#[repr(C, align(64))]
pub struct Fcb {
    reserved: [u8; FCB_RESERVE],
    key: FlowKey,
    last_seen: Tick,
}

impl Fcb {
    const fn zeroed() -> Self {
        Self {
            reserved: [0; FCB_RESERVE],
            key: FlowKey::new(0, 0, 0, 0, 0),
            last_seen: Tick(0),
        }
    }

    /// The flow's key, kept to unbind the hash index entry on expiry.
    #[inline(always)]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Timestamp of the most recent packet on this flow.
    #[inline(always)]
    pub fn last_seen(&self) -> Tick {
        self.last_seen
    }

    /// Stamp packet arrival.
    #[inline(always)]
    pub fn touch(&mut self, now: Tick) {
        self.last_seen = now;
    }

    /// Raw view of the reserved region.
    #[inline(always)]
    pub fn reserved(&self) -> &[u8; FCB_RESERVE] {
        &self.reserved
    }
}

/// Per-shard arena of FCBs, one per slot.
pub struct FcbArena {
    fcbs: Box<[Fcb]>,
}

impl FcbArena {
    /// Allocate a zeroed arena of `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let mut fcbs = Vec::with_capacity(capacity);
        fcbs.resize_with(capacity, Fcb::zeroed);
        Self {
            fcbs: fcbs.into_boxed_slice(),
        }
    }

    /// Borrow the FCB at `slot`.
    #[inline(always)]
    pub fn get(&self, slot: u32) -> &Fcb {
        &self.fcbs[slot as usize]
    }

    /// Mutably borrow the FCB at `slot`.
    #[inline(always)]
    pub fn get_mut(&mut self, slot: u32) -> &mut Fcb {
        &mut self.fcbs[slot as usize]
    }

    /// Initialize `slot` for a newly admitted flow: zero the reserved
    /// region, bind the key, stamp the admission time.
    #[inline]
    pub fn reset(&mut self, slot: u32, key: FlowKey, now: Tick) {
        let fcb = &mut self.fcbs[slot as usize];
        fcb.reserved = [0; FCB_RESERVE];
        fcb.key = key;
        fcb.last_seen = now;
    }

    /// Zero the reserved region when a slot returns to the free stack, so
    /// the next flow admitted into it observes no prior state.
    #[inline]
    pub fn zero_reserved(&mut self, slot: u32) {
        self.fcbs[slot as usize].reserved = [0; FCB_RESERVE];
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.fcbs.len()
    }

    /// Whether the arena has no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fcbs.is_empty()
    }
}

/// Marker for types that may live in the FCB reserved region.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding-sensitive or
/// pointer-holding fields, and treat the all-zero bit pattern as a valid
/// initial value (a recycled slot is zeroed before reuse).
pub unsafe trait ReservedState: Copy + 'static {}

/// Layout errors from [`ReservedRegistry`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReservedError {
    /// The requested state does not fit in the remaining reserved bytes.
    #[error("reserved region exhausted: need {need} bytes at offset {offset}, have {have}")]
    Exhausted {
        /// Bytes requested.
        need: usize,
        /// Aligned offset the claim would start at.
        offset: usize,
        /// Total reserved bytes available.
        have: usize,
    },
}

/// Hands out non-overlapping typed sub-ranges of the reserved region.
///
/// Collaborators claim their state at pipeline build time; the registry is
/// the single owner of the offset/size contract, so two elements can never
/// alias each other's bytes.
#[derive(Debug, Default)]
pub struct ReservedRegistry {
    used: usize,
}

impl ReservedRegistry {
    /// Fresh registry with the whole region unclaimed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim space for a `T`, returning the typed accessor.
    pub fn claim<T: ReservedState>(&mut self) -> Result<ReservedHandle<T>, ReservedError> {
        let align = core::mem::align_of::<T>();
        let size = core::mem::size_of::<T>();
        let offset = (self.used + align - 1) & !(align - 1);

        if offset + size > FCB_RESERVE {
            return Err(ReservedError::Exhausted {
                need: size,
                offset,
                have: FCB_RESERVE,
            });
        }

        self.used = offset + size;
        Ok(ReservedHandle {
            offset,
            _marker: core::marker::PhantomData,
        })
    }

    /// Bytes claimed so far.
    pub fn used(&self) -> usize {
        self.used
    }
}

/// Typed window into one claimed sub-range of an FCB's reserved region.
#[derive(Debug, Clone, Copy)]
pub struct ReservedHandle<T: ReservedState> {
    offset: usize,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T: ReservedState> ReservedHandle<T> {
    /// View this element's state in `fcb`.
    #[inline(always)]
    pub fn get<'a>(&self, fcb: &'a Fcb) -> &'a T {
        // The registry guaranteed offset alignment and bounds; the region
        // itself starts on a 64-byte boundary.
        unsafe { &*(fcb.reserved.as_ptr().add(self.offset) as *const T) }
    }

    /// Mutable view of this element's state in `fcb`.
    #[inline(always)]
    pub fn get_mut<'a>(&self, fcb: &'a mut Fcb) -> &'a mut T {
        unsafe { &mut *(fcb.reserved.as_mut_ptr().add(self.offset) as *mut T) }
    }

    /// Byte offset within the reserved region.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Counters {
        packets: u64,
        bytes: u64,
    }
    unsafe impl ReservedState for Counters {}

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Flag(u8);
    unsafe impl ReservedState for Flag {}

    #[test]
    fn test_claim_layout() {
        let mut reg = ReservedRegistry::new();
        let flag: ReservedHandle<Flag> = reg.claim().unwrap();
        let counters: ReservedHandle<Counters> = reg.claim().unwrap();

        assert_eq!(flag.offset(), 0);
        // Aligned up to the u64 boundary.
        assert_eq!(counters.offset(), 8);
        assert_eq!(reg.used(), 24);
    }

    #[test]
    fn test_claim_exhausted() {
        #[derive(Clone, Copy)]
        #[repr(C)]
        struct Big([u8; FCB_RESERVE]);
        unsafe impl ReservedState for Big {}

        let mut reg = ReservedRegistry::new();
        let _big: ReservedHandle<Big> = reg.claim().unwrap();
        assert!(matches!(
            reg.claim::<Flag>(),
            Err(ReservedError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_state_roundtrip_and_reset() {
        let mut reg = ReservedRegistry::new();
        let h: ReservedHandle<Counters> = reg.claim().unwrap();

        let mut arena = FcbArena::new(2);
        let key = FlowKey::new(1, 2, 3, 4, 6);
        arena.reset(0, key, Tick(10));

        {
            let state = h.get_mut(arena.get_mut(0));
            state.packets = 7;
            state.bytes = 4200;
        }
        assert_eq!(h.get(arena.get(0)).packets, 7);
        assert_eq!(h.get(arena.get(0)).bytes, 4200);

        // A recycled slot presents zeroed state to the next flow.
        arena.zero_reserved(0);
        arena.reset(0, key.reverse(), Tick(20));
        assert_eq!(h.get(arena.get(0)).packets, 0);
        assert_eq!(h.get(arena.get(0)).bytes, 0);
        assert_eq!(arena.get(0).last_seen(), Tick(20));
    }
}

//! Exact-match key→slot hash index.
//!
//! The flow table consumes this as an injected capability: the shard never
//! computes bucket positions itself, it only forwards keys. One backend
//! ships here; alternative backends (cuckoo, vendored NIC tables) plug in
//! behind the same trait.

use crate::key::FlowKey;

/// Negative sentinel for "key not present" in bulk lookups.
pub const SLOT_NONE: i32 = -1;

/// Errors surfaced by a hash index backend.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    /// The index is at capacity; no key can be admitted.
    #[error("hash index full")]
    Full,

    /// Backend rejected its construction parameters.
    #[error("invalid index parameters: {0}")]
    InvalidParams(&'static str),
}

/// Exact-match mapping from a [`FlowKey`] to an integer slot handle.
///
/// Single-writer: the owning shard serializes all mutation. Implementations
/// must not lock.
pub trait HashIndex: Send {
    /// Look up a single key.
    fn lookup(&self, key: &FlowKey) -> Option<u32>;

    /// Bulk lookup. `out[i]` receives the slot for `keys[i]`, or
    /// [`SLOT_NONE`]; output order matches input order so callers can zip
    /// positions back to packets.
    fn lookup_bulk(&self, keys: &[FlowKey], out: &mut [i32]) {
        debug_assert!(out.len() >= keys.len());
        for (i, key) in keys.iter().enumerate() {
            out[i] = match self.lookup(key) {
                Some(slot) => slot as i32,
                None => SLOT_NONE,
            };
        }
    }

    /// Bind `key` to `slot`. The slot index is the stored value; the caller
    /// (the shard's allocator) is the slot authority.
    fn insert(&mut self, key: &FlowKey, slot: u32) -> Result<(), IndexError>;

    /// Remove a key, returning the slot it was bound to.
    fn remove(&mut self, key: &FlowKey) -> Option<u32>;

    /// Number of keys currently present.
    fn len(&self) -> usize;

    /// Whether the index holds no keys.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of keys the index admits.
    fn capacity(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum EntryState {
    Empty = 0,
    Occupied = 1,
    Deleted = 2,
}

/// Index entry. The full key is kept inline so probes never chase pointers.
#[derive(Clone)]
struct Entry {
    state: EntryState,
    hash: u64,
    key: FlowKey,
    slot: u32,
}

impl Entry {
    const fn empty() -> Self {
        Self {
            state: EntryState::Empty,
            hash: 0,
            key: FlowKey::new(0, 0, 0, 0, 0),
            slot: 0,
        }
    }
}

/// Open-addressing hash index with linear probing and tombstones.
///
/// The entry array is sized at twice the admitted capacity (rounded up to
/// a power of two) so the table stays fast even when every slot is live.
pub struct LinearProbeIndex {
    entries: Vec<Entry>,
    mask: usize,
    capacity: usize,
    count: usize,
}

impl LinearProbeIndex {
    /// Create an index admitting up to `capacity` keys.
    pub fn new(capacity: usize) -> Result<Self, IndexError> {
        if capacity == 0 {
            return Err(IndexError::InvalidParams("capacity must be non-zero"));
        }
        let size = (capacity * 2).next_power_of_two();
        Ok(Self {
            entries: vec![Entry::empty(); size],
            mask: size - 1,
            capacity,
            count: 0,
        })
    }

    /// Probe for `key`. Returns the entry position on a match.
    #[inline]
    fn probe(&self, key: &FlowKey, hash: u64) -> Option<usize> {
        let mut idx = (hash as usize) & self.mask;
        for _ in 0..self.entries.len() {
            let entry = &self.entries[idx];
            match entry.state {
                EntryState::Empty => return None,
                EntryState::Occupied if entry.hash == hash && entry.key == *key => {
                    return Some(idx);
                }
                _ => {}
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }
}

impl HashIndex for LinearProbeIndex {
    #[inline]
    fn lookup(&self, key: &FlowKey) -> Option<u32> {
        self.probe(key, key.hash())
            .map(|idx| self.entries[idx].slot)
    }

    fn insert(&mut self, key: &FlowKey, slot: u32) -> Result<(), IndexError> {
        if self.count >= self.capacity {
            return Err(IndexError::Full);
        }

        let hash = key.hash();
        let mut idx = (hash as usize) & self.mask;
        for _ in 0..self.entries.len() {
            let entry = &mut self.entries[idx];
            match entry.state {
                EntryState::Empty | EntryState::Deleted => {
                    *entry = Entry {
                        state: EntryState::Occupied,
                        hash,
                        key: *key,
                        slot,
                    };
                    self.count += 1;
                    return Ok(());
                }
                EntryState::Occupied if entry.hash == hash && entry.key == *key => {
                    // Re-binding an existing key keeps the table consistent
                    // if the caller retries an insert.
                    entry.slot = slot;
                    return Ok(());
                }
                EntryState::Occupied => {}
            }
            idx = (idx + 1) & self.mask;
        }

        Err(IndexError::Full)
    }

    fn remove(&mut self, key: &FlowKey) -> Option<u32> {
        let idx = self.probe(key, key.hash())?;
        let entry = &mut self.entries[idx];
        entry.state = EntryState::Deleted;
        self.count -= 1;
        Some(entry.slot)
    }

    #[inline]
    fn len(&self) -> usize {
        self.count
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }
}

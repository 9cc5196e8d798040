//! Flowline Flow-State Table
//!
//! Per-core sharded key→state index for line-rate flow tracking.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        FlowShard (one per core)              │
//! │                                                              │
//! │   keys ──▶ ┌────────────┐  slot  ┌───────────────────────┐   │
//! │            │ HashIndex  │ ─────▶ │ FCB arena             │   │
//! │            │ (injected) │        │ [Fcb; capacity]       │   │
//! │            └────────────┘        │  align(64), reserved  │   │
//! │                 ▲                └───────────────────────┘   │
//! │                 │ insert/remove       ▲            ▲         │
//! │            ┌────┴───────┐        ┌────┴─────┐ ┌────┴──────┐  │
//! │            │ SlotStack  │ ◀───── │ pending  │ │ TimerWheel│  │
//! │            │ (LIFO)     │  drain │ release  │ │ (epochs)  │  │
//! │            └────────────┘        └──────────┘ └───────────┘  │
//! │                                       ▲            │         │
//! │                                       └── expire ──┘         │
//! │                                         (maintainer)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each shard is exclusively owned by one worker thread: admission, lookup
//! and expiration are all single-writer, so the hot path takes no locks.
//! Only the per-shard counter block is shared (read-only snapshots) for
//! cross-core observability.
//!
//! A slot is always in exactly one of three states:
//!
//! - **FREE**: on the [`SlotStack`], reserved region zeroed
//! - **ACTIVE**: key present in the [`HashIndex`], owned by a live flow
//! - **PENDING-RELEASE**: expired, unlinked from the index, waiting one
//!   maintainer tick before the slot is handed back to the stack
//!
//! The deferred release tolerates packet processing that still holds an
//! FCB reference obtained in the same tick the flow expired.

#![warn(missing_docs)]

pub mod fcb;
pub mod index;
pub mod key;
pub mod shard;
pub mod slots;
pub mod stats;
pub mod wheel;

pub use fcb::{
    Fcb, FcbArena, ReservedError, ReservedHandle, ReservedRegistry, ReservedState, FCB_RESERVE,
};
pub use index::{HashIndex, IndexError, LinearProbeIndex, SLOT_NONE};
pub use key::{FlowKey, KEY_LEN};
pub use shard::{FlowHandler, FlowShard, FlowTableError, Lookup, ShardConfig};
pub use slots::SlotStack;
pub use stats::{ShardCounters, ShardSnapshot, TableStats};
pub use wheel::TimerWheel;

use std::sync::OnceLock;
use std::time::Instant;

/// Default per-shard flow capacity.
pub const DEFAULT_CAPACITY: usize = 65536;

/// Default idle timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 60;

/// Default maintainer recycle interval in milliseconds.
pub const DEFAULT_RECYCLE_INTERVAL_MS: u32 = 100;

/// Millisecond timestamp on the process-local monotonic clock.
///
/// All table operations take an explicit `Tick` so the caller stamps time
/// once per batch and tests can drive the clock synthetically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Tick(pub u64);

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

impl Tick {
    /// Current monotonic time.
    #[inline]
    pub fn now() -> Self {
        let base = CLOCK_BASE.get_or_init(Instant::now);
        Tick(base.elapsed().as_millis() as u64)
    }

    /// Milliseconds since `earlier`, zero if `earlier` is in the future.
    #[inline]
    pub fn since(self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Raw millisecond value.
    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let a = Tick::now();
        let b = Tick::now();
        assert!(b >= a);
    }

    #[test]
    fn tick_since_saturates() {
        assert_eq!(Tick(5).since(Tick(10)), 0);
        assert_eq!(Tick(10).since(Tick(5)), 5);
    }
}

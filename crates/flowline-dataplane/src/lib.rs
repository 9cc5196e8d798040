//! Flowline Dataplane
//!
//! Run-to-completion packet pipeline built on the per-core flow-state
//! table from `flowline-table`.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Engine                                │
//! │                                                                │
//! │  dispatch(frame) ──▶ steer by FlowKey hash ──▶ bounded channel │
//! │                                                                │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │  Worker 0    │   │  Worker 1    │   │  Worker N    │        │
//! │  │              │   │              │   │              │        │
//! │  │ Parse        │   │ Parse        │   │ Parse        │        │
//! │  │   ▼          │   │   ▼          │   │   ▼          │        │
//! │  │ FlowShard    │   │ FlowShard    │   │ FlowShard    │        │
//! │  │ (exclusive)  │   │ (exclusive)  │   │ (exclusive)  │        │
//! │  │   ▼          │   │   ▼          │   │   ▼          │        │
//! │  │ FlowElements │   │ FlowElements │   │ FlowElements │        │
//! │  │ (counter,    │   │              │   │              │        │
//! │  │  rate limit) │   │              │   │              │        │
//! │  └──────────────┘   └──────────────┘   └──────────────┘        │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A flow's packets always land on the same worker (stable hash of the
//! key), so each worker's shard, buffers and element state are exclusively
//! owned and the whole per-packet path is lock-free. The maintainer runs
//! inside each worker's loop between batches, never concurrently with
//! packet processing on that shard.

#![warn(missing_docs)]

pub mod buffer;
pub mod elements;
pub mod engine;
pub mod pipeline;
pub mod stats;

pub use buffer::{BufferPool, PacketBuffer, BUFFER_SIZE};
pub use elements::{FlowCounter, FlowElement, FlowRateLimiter, RateLimitConfig};
pub use engine::{Engine, EngineConfig, EngineError};
pub use pipeline::{parse_flow_key, Action, PacketContext, Parse, Pipeline, PipelineBuilder};
pub use stats::{CoreStats, CoreSnapshot, EngineSnapshot};

/// Packets processed per worker iteration.
pub const BATCH_SIZE: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(BATCH_SIZE, 64);
        assert!(BUFFER_SIZE >= 1514);
    }
}

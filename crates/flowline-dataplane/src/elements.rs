//! Flow-state pipeline elements.
//!
//! Each element keeps its per-flow state inside the FCB reserved region,
//! claimed through the pipeline builder's registry. Elements never see
//! slot management: they get a zeroed region via `new_flow` and the same
//! bytes back on every later packet of the flow.

use flowline_table::{Fcb, ReservedError, ReservedHandle, ReservedRegistry, ReservedState};
use serde::{Deserialize, Serialize};

use crate::buffer::PacketBuffer;
use crate::pipeline::{Action, PacketContext};

/// A stage that runs with the packet's FCB in hand.
pub trait FlowElement: Send {
    /// Called once when a flow is admitted; the element's reserved state
    /// is zeroed at this point.
    fn new_flow(&mut self, fcb: &mut Fcb, ctx: &PacketContext) {
        let _ = (fcb, ctx);
    }

    /// Process one packet of an established flow.
    fn process(&mut self, fcb: &mut Fcb, buf: &mut PacketBuffer, ctx: &mut PacketContext)
        -> Action;

    /// Stage name for logs and handlers.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct CounterState {
    packets: u64,
    bytes: u64,
}
unsafe impl ReservedState for CounterState {}

/// Per-flow packet and byte counters.
pub struct FlowCounter {
    handle: ReservedHandle<CounterState>,
}

impl FlowCounter {
    /// Claim counter space in the reserved region.
    pub fn new(registry: &mut ReservedRegistry) -> Result<Self, ReservedError> {
        Ok(Self {
            handle: registry.claim()?,
        })
    }

    /// Read a flow's (packets, bytes) totals.
    pub fn totals(&self, fcb: &Fcb) -> (u64, u64) {
        let state = self.handle.get(fcb);
        (state.packets, state.bytes)
    }
}

impl FlowElement for FlowCounter {
    fn process(
        &mut self,
        fcb: &mut Fcb,
        buf: &mut PacketBuffer,
        _ctx: &mut PacketContext,
    ) -> Action {
        let state = self.handle.get_mut(fcb);
        state.packets += 1;
        state.bytes += buf.len() as u64;
        Action::Continue
    }

    fn name(&self) -> &'static str {
        "flow_counter"
    }
}

/// Rate limiter parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained packets per second per flow.
    pub rate_pps: u64,
    /// Burst allowance in packets.
    pub burst: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_pps: 10_000,
            burst: 64,
        }
    }
}

/// Token-bucket state in milli-tokens, so sub-millisecond refill does not
/// truncate away at low rates.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct BucketState {
    tokens_milli: u64,
    last_refill_ms: u64,
}
unsafe impl ReservedState for BucketState {}

/// Per-flow token-bucket rate limiter.
///
/// Packets beyond the configured rate are dropped; conforming packets
/// spend one token each. The bucket starts full so a flow's initial burst
/// passes.
pub struct FlowRateLimiter {
    handle: ReservedHandle<BucketState>,
    cfg: RateLimitConfig,
}

impl FlowRateLimiter {
    /// Claim bucket space in the reserved region.
    pub fn new(
        registry: &mut ReservedRegistry,
        cfg: RateLimitConfig,
    ) -> Result<Self, ReservedError> {
        Ok(Self {
            handle: registry.claim()?,
            cfg,
        })
    }
}

const MILLI: u64 = 1000;

impl FlowElement for FlowRateLimiter {
    fn new_flow(&mut self, fcb: &mut Fcb, ctx: &PacketContext) {
        let state = self.handle.get_mut(fcb);
        state.tokens_milli = self.cfg.burst * MILLI;
        state.last_refill_ms = ctx.now.as_millis();
    }

    fn process(
        &mut self,
        fcb: &mut Fcb,
        _buf: &mut PacketBuffer,
        ctx: &mut PacketContext,
    ) -> Action {
        let state = self.handle.get_mut(fcb);

        let now_ms = ctx.now.as_millis();
        let elapsed = now_ms.saturating_sub(state.last_refill_ms);
        if elapsed > 0 {
            let refill = elapsed.saturating_mul(self.cfg.rate_pps);
            state.tokens_milli = (state.tokens_milli + refill).min(self.cfg.burst * MILLI);
            state.last_refill_ms = now_ms;
        }

        if state.tokens_milli >= MILLI {
            state.tokens_milli -= MILLI;
            Action::Continue
        } else {
            Action::Drop
        }
    }

    fn name(&self) -> &'static str {
        "flow_rate_limiter"
    }
}

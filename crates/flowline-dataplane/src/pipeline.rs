//! Composable per-packet processing stages.
//!
//! Stages split in two: stateless [`Element`]s run before classification
//! (header parsing), flow-state elements run after it with the packet's
//! FCB in hand. The pipeline is built once per worker; elements claim
//! their reserved FCB space from the builder's registry, so every worker
//! ends up with the identical layout.

use flowline_table::{FlowKey, ReservedRegistry, Tick};

use crate::buffer::PacketBuffer;
use crate::elements::FlowElement;

/// Stage verdict for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Hand the packet to the next stage.
    Continue,
    /// Drop the packet.
    Drop,
}

/// Per-packet scratch shared along the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketContext {
    /// Batch timestamp, stamped once by the worker.
    pub now: Tick,
    /// Parsed 5-tuple, absent for non-IPv4 traffic.
    pub flow_key: Option<FlowKey>,
    /// Offset of the IPv4 header.
    pub l3_offset: u16,
    /// Offset of the L4 header.
    pub l4_offset: u16,
}

/// A stateless pipeline stage.
pub trait Element: Send {
    /// Process one packet.
    fn process(&mut self, buf: &mut PacketBuffer, ctx: &mut PacketContext) -> Action;

    /// Stage name for logs and handlers.
    fn name(&self) -> &'static str;
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETH_HDR: usize = 14;

/// Extract the canonical 5-tuple from an Ethernet frame.
///
/// Shared by the [`Parse`] stage and the engine's dispatcher, which only
/// needs the key hash to steer the frame to its worker.
pub fn parse_flow_key(data: &[u8]) -> Option<FlowKey> {
    if data.len() < ETH_HDR + 20 {
        return None;
    }
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    let ihl = ((data[ETH_HDR] & 0x0F) as usize) * 4;
    if ihl < 20 || data.len() < ETH_HDR + ihl {
        return None;
    }

    let src_ip = u32::from_be_bytes([data[26], data[27], data[28], data[29]]);
    let dst_ip = u32::from_be_bytes([data[30], data[31], data[32], data[33]]);
    let protocol = data[23];

    let l4 = ETH_HDR + ihl;
    let (src_port, dst_port) = if data.len() >= l4 + 4 {
        (
            u16::from_be_bytes([data[l4], data[l4 + 1]]),
            u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]),
        )
    } else {
        (0, 0)
    };

    Some(FlowKey::new(src_ip, dst_ip, src_port, dst_port, protocol))
}

/// Ethernet/IPv4/L4 header extraction.
///
/// Non-IPv4 frames pass through without a flow key; runt frames drop.
#[derive(Debug, Default)]
pub struct Parse;

impl Element for Parse {
    fn process(&mut self, buf: &mut PacketBuffer, ctx: &mut PacketContext) -> Action {
        let data = buf.data();
        if data.len() < ETH_HDR {
            return Action::Drop;
        }

        let ethertype = u16::from_be_bytes([data[12], data[13]]);
        if ethertype != ETHERTYPE_IPV4 {
            return Action::Continue;
        }
        if data.len() < ETH_HDR + 20 {
            return Action::Drop;
        }

        let ihl = ((data[ETH_HDR] & 0x0F) as u16) * 4;
        ctx.l3_offset = ETH_HDR as u16;
        ctx.l4_offset = ETH_HDR as u16 + ihl;
        ctx.flow_key = parse_flow_key(data);
        Action::Continue
    }

    fn name(&self) -> &'static str {
        "parse"
    }
}

/// One worker's stage chain.
pub struct Pipeline {
    stages: Vec<Box<dyn Element>>,
    flow_stages: Vec<Box<dyn FlowElement>>,
}

impl Pipeline {
    /// Run the stateless stages.
    #[inline]
    pub fn process(&mut self, buf: &mut PacketBuffer, ctx: &mut PacketContext) -> Action {
        for stage in &mut self.stages {
            if stage.process(buf, ctx) == Action::Drop {
                return Action::Drop;
            }
        }
        Action::Continue
    }

    /// Initialize flow-state for a freshly admitted flow.
    #[inline]
    pub fn new_flow(&mut self, fcb: &mut flowline_table::Fcb, ctx: &PacketContext) {
        for stage in &mut self.flow_stages {
            stage.new_flow(fcb, ctx);
        }
    }

    /// Run the flow-state stages with the packet's FCB.
    #[inline]
    pub fn process_flow(
        &mut self,
        fcb: &mut flowline_table::Fcb,
        buf: &mut PacketBuffer,
        ctx: &mut PacketContext,
    ) -> Action {
        for stage in &mut self.flow_stages {
            if stage.process(fcb, buf, ctx) == Action::Drop {
                return Action::Drop;
            }
        }
        Action::Continue
    }

    /// Number of stages (stateless + flow-state).
    pub fn stage_count(&self) -> usize {
        self.stages.len() + self.flow_stages.len()
    }
}

/// Assembles a [`Pipeline`] and owns the reserved-layout registry while
/// elements claim their FCB space.
pub struct PipelineBuilder {
    registry: ReservedRegistry,
    stages: Vec<Box<dyn Element>>,
    flow_stages: Vec<Box<dyn FlowElement>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Empty pipeline, whole reserved region unclaimed.
    pub fn new() -> Self {
        Self {
            registry: ReservedRegistry::new(),
            stages: Vec::new(),
            flow_stages: Vec::new(),
        }
    }

    /// Registry for element constructors to claim reserved space from.
    pub fn registry_mut(&mut self) -> &mut ReservedRegistry {
        &mut self.registry
    }

    /// Append a stateless stage.
    pub fn add_stage(&mut self, stage: Box<dyn Element>) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Append a flow-state stage.
    pub fn add_flow_stage(&mut self, stage: Box<dyn FlowElement>) -> &mut Self {
        self.flow_stages.push(stage);
        self
    }

    /// Finish the pipeline.
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            flow_stages: self.flow_stages,
        }
    }
}

#[cfg(test)]
pub(crate) fn make_udp_frame(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut frame = vec![0u8; 60];
    frame[12] = 0x08;
    frame[13] = 0x00; // IPv4
    frame[14] = 0x45; // version 4, IHL 5
    frame[23] = 17; // UDP
    frame[26..30].copy_from_slice(&src_ip.to_be_bytes());
    frame[30..34].copy_from_slice(&dst_ip.to_be_bytes());
    frame[34..36].copy_from_slice(&src_port.to_be_bytes());
    frame[36..38].copy_from_slice(&dst_port.to_be_bytes());
    frame
}

//! Run-to-completion engine.
//!
//! One worker thread per core; each worker exclusively owns its flow
//! shard, pipeline and element state. The dispatcher steers every frame
//! to the worker that owns its flow (stable hash of the 5-tuple), so no
//! two cores ever touch the same shard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use flowline_table::{
    FlowShard, FlowTableError, Lookup, ReservedError, ShardConfig, TableStats, Tick,
};

use crate::buffer::{BufferPool, PacketBuffer};
use crate::elements::{FlowCounter, FlowRateLimiter, RateLimitConfig};
use crate::pipeline::{parse_flow_key, Action, PacketContext, Parse, Pipeline, PipelineBuilder};
use crate::stats::{CoreStats, EngineSnapshot};
use crate::BATCH_SIZE;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker threads (= flow shards).
    pub workers: usize,
    /// Total flow capacity, divided across workers and rounded up to a
    /// power of two per shard.
    pub flow_capacity: usize,
    /// Flow idle timeout.
    pub timeout_secs: u32,
    /// Maintainer cadence per shard.
    pub recycle_interval_ms: u32,
    /// Packet buffers pre-allocated at the dispatcher.
    pub pool_size: usize,
    /// Per-worker ingress queue depth.
    pub channel_depth: usize,
    /// Optional per-flow rate limiting stage.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus(),
            flow_capacity: 1 << 20,
            timeout_secs: flowline_table::DEFAULT_TIMEOUT_SECS,
            recycle_interval_ms: flowline_table::DEFAULT_RECYCLE_INTERVAL_MS,
            pool_size: 8192,
            channel_depth: 1024,
            rate_limit: None,
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl EngineConfig {
    fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            capacity: (self.flow_capacity / self.workers.max(1)).max(1),
            timeout_secs: self.timeout_secs,
            recycle_interval_ms: self.recycle_interval_ms,
        }
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start` called twice.
    #[error("engine already running")]
    AlreadyRunning,

    /// Worker thread could not be spawned.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Shard construction failed; the engine cannot run.
    #[error(transparent)]
    Table(#[from] FlowTableError),

    /// The configured elements overflow the FCB reserved region.
    #[error(transparent)]
    Reserved(#[from] ReservedError),

    /// Configuration rejected.
    #[error("configuration error: {0}")]
    Config(&'static str),
}

struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    core_id: usize,
}

/// Multi-core packet engine.
pub struct Engine {
    config: EngineConfig,
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    senders: Vec<Sender<Box<PacketBuffer>>>,
    recycle_rx: Option<Receiver<Box<PacketBuffer>>>,
    pool: BufferPool,
    core_stats: Vec<Arc<CoreStats>>,
    table_stats: TableStats,
    ingress_drops: u64,
    round_robin: u64,
}

impl Engine {
    /// Create an engine; workers are spawned by [`Engine::start`].
    pub fn new(config: EngineConfig) -> Self {
        let pool = BufferPool::new(config.pool_size);
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            senders: Vec::new(),
            recycle_rx: None,
            pool,
            core_stats: Vec::new(),
            table_stats: TableStats::new(),
            ingress_drops: 0,
            round_robin: 0,
        }
    }

    /// Spawn the workers. Shard construction failure here is fatal to the
    /// engine: the error propagates and nothing starts.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning);
        }
        if self.config.workers == 0 {
            return Err(EngineError::Config("workers must be non-zero"));
        }

        // Build every shard and pipeline before spawning anything: shard
        // construction failure is fatal and must leave nothing running.
        let mut built = Vec::with_capacity(self.config.workers);
        for _ in 0..self.config.workers {
            let shard = FlowShard::with_linear_index(self.config.shard_config())?;
            let pipeline = build_pipeline(&self.config)?;
            built.push((shard, pipeline));
        }

        self.running.store(true, Ordering::Release);
        self.pool = BufferPool::new(self.config.pool_size);
        self.core_stats.clear();
        self.table_stats = TableStats::new();

        let (recycle_tx, recycle_rx) = bounded(self.config.pool_size);
        self.recycle_rx = Some(recycle_rx);

        for (core_id, (shard, pipeline)) in built.into_iter().enumerate() {
            self.table_stats.register(shard.counters(), shard.capacity());
            let stats = Arc::new(CoreStats::default());
            self.core_stats.push(Arc::clone(&stats));

            let (tx, rx) = bounded(self.config.channel_depth);
            self.senders.push(tx);

            let worker = Worker {
                core_id,
                shard,
                pipeline,
                rx,
                recycle: recycle_tx.clone(),
                running: Arc::clone(&self.running),
                stats,
                recycle_interval_ms: self.config.recycle_interval_ms as u64,
                keys: Vec::with_capacity(BATCH_SIZE),
                staged: Vec::with_capacity(BATCH_SIZE),
                results: Vec::with_capacity(BATCH_SIZE),
            };

            let handle = match thread::Builder::new()
                .name(format!("flowline-worker-{}", core_id))
                .spawn(move || worker.run())
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.stop();
                    return Err(EngineError::SpawnFailed(e.to_string()));
                }
            };

            self.workers.push(WorkerHandle {
                thread: Some(handle),
                core_id,
            });
        }

        tracing::info!(workers = self.config.workers, "engine started");
        Ok(())
    }

    /// Stop and join every worker.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        // Disconnect the ingress channels so blocked workers wake up.
        self.senders.clear();

        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
            tracing::debug!(core = worker.core_id, "worker joined");
        }
        self.workers.clear();
        self.recycle_rx = None;
        tracing::info!("engine stopped");
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Hand one frame to the engine. Returns `false` when the frame was
    /// dropped at ingress (engine stopped, pool empty, or queue full);
    /// such drops are indistinguishable downstream from any other drop
    /// and only observable through [`Engine::snapshot`].
    pub fn dispatch(&mut self, frame: &[u8]) -> bool {
        if self.senders.is_empty() {
            self.ingress_drops += 1;
            return false;
        }

        // Reclaim buffers the workers finished with.
        if let Some(rx) = &self.recycle_rx {
            while let Ok(buf) = rx.try_recv() {
                self.pool.free(buf);
            }
        }

        let Some(mut buf) = self.pool.alloc() else {
            self.ingress_drops += 1;
            tracing::debug!("ingress drop: buffer pool exhausted");
            return false;
        };
        if buf.fill(frame).is_none() {
            self.pool.free(buf);
            self.ingress_drops += 1;
            return false;
        }

        // A flow's packets must all land on the shard that owns it.
        let worker = match parse_flow_key(frame) {
            Some(key) => (key.hash() % self.senders.len() as u64) as usize,
            None => {
                self.round_robin = self.round_robin.wrapping_add(1);
                (self.round_robin % self.senders.len() as u64) as usize
            }
        };

        match self.senders[worker].try_send(buf) {
            Ok(()) => true,
            Err(TrySendError::Full(buf)) | Err(TrySendError::Disconnected(buf)) => {
                self.pool.free(buf);
                self.ingress_drops += 1;
                false
            }
        }
    }

    /// Aggregate engine observability snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        let mut cores = crate::stats::CoreSnapshot::default();
        for core in &self.core_stats {
            cores.add(core.snapshot());
        }
        EngineSnapshot {
            cores,
            flows: self.table_stats.snapshot(),
            active_flows: self.table_stats.total_active(),
            flow_capacity: self.table_stats.total_capacity(),
            ingress_drops: self.ingress_drops,
        }
    }

    /// Number of configured workers.
    pub fn worker_count(&self) -> usize {
        self.config.workers
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_pipeline(config: &EngineConfig) -> Result<Pipeline, EngineError> {
    let mut builder = PipelineBuilder::new();
    builder.add_stage(Box::new(Parse));

    let counter = FlowCounter::new(builder.registry_mut())?;
    builder.add_flow_stage(Box::new(counter));

    if let Some(rl) = config.rate_limit {
        let limiter = FlowRateLimiter::new(builder.registry_mut(), rl)?;
        builder.add_flow_stage(Box::new(limiter));
    }

    Ok(builder.build())
}

struct Worker {
    core_id: usize,
    shard: FlowShard,
    pipeline: Pipeline,
    rx: Receiver<Box<PacketBuffer>>,
    recycle: Sender<Box<PacketBuffer>>,
    running: Arc<AtomicBool>,
    stats: Arc<CoreStats>,
    recycle_interval_ms: u64,

    keys: Vec<flowline_table::FlowKey>,
    staged: Vec<(Box<PacketBuffer>, PacketContext)>,
    results: Vec<Result<Lookup, FlowTableError>>,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!(core = self.core_id, "worker starting");

        let poll = Duration::from_millis(self.recycle_interval_ms.clamp(1, 10));
        let mut batch: Vec<Box<PacketBuffer>> = Vec::with_capacity(BATCH_SIZE);
        let mut last_maintain = Tick::now();

        while self.running.load(Ordering::Relaxed) {
            batch.clear();
            match self.rx.recv_timeout(poll) {
                Ok(buf) => {
                    batch.push(buf);
                    while batch.len() < BATCH_SIZE {
                        match self.rx.try_recv() {
                            Ok(buf) => batch.push(buf),
                            Err(_) => break,
                        }
                    }
                    self.process_batch(&mut batch);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Tick::now();
            if now.since(last_maintain) >= self.recycle_interval_ms {
                self.shard.maintain(now);
                last_maintain = now;
            }
        }

        tracing::debug!(core = self.core_id, "worker stopped");
    }

    fn process_batch(&mut self, batch: &mut Vec<Box<PacketBuffer>>) {
        let now = Tick::now();

        // Phase 1: stateless stages; collect keys for one bulk lookup.
        self.keys.clear();
        self.staged.clear();
        for mut buf in batch.drain(..) {
            self.stats.record_rx(buf.len() as u64);
            let mut ctx = PacketContext {
                now,
                ..Default::default()
            };
            if self.pipeline.process(&mut buf, &mut ctx) == Action::Drop {
                self.stats.record_drop();
                let _ = self.recycle.send(buf);
                continue;
            }
            if let Some(key) = ctx.flow_key {
                self.keys.push(key);
            }
            self.staged.push((buf, ctx));
        }

        // Phase 2: classify the whole batch against the shard.
        let mut results = std::mem::take(&mut self.results);
        self.shard.lookup_or_create_bulk(&self.keys, now, &mut results);

        // Phase 3: flow-state stages; results line up with keyed packets
        // in order.
        let mut next = 0;
        for (mut buf, mut ctx) in self.staged.drain(..) {
            let action = if ctx.flow_key.is_some() {
                let result = &results[next];
                next += 1;
                match result {
                    Ok(lookup) => {
                        let lookup = *lookup;
                        if lookup.is_new {
                            self.stats.record_flow_miss();
                            self.pipeline.new_flow(self.shard.fcb_mut(lookup.slot), &ctx);
                        } else {
                            self.stats.record_flow_hit();
                        }
                        self.pipeline
                            .process_flow(self.shard.fcb_mut(lookup.slot), &mut buf, &mut ctx)
                    }
                    Err(_) => Action::Drop,
                }
            } else {
                // No flow state for non-IPv4 traffic; pass through.
                Action::Continue
            };

            match action {
                Action::Continue => self.stats.record_tx(buf.len() as u64),
                Action::Drop => self.stats.record_drop(),
            }
            let _ = self.recycle.send(buf);
        }

        results.clear();
        self.results = results;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::make_udp_frame;

    fn test_config(workers: usize) -> EngineConfig {
        EngineConfig {
            workers,
            flow_capacity: 1024,
            timeout_secs: 60,
            recycle_interval_ms: 10,
            pool_size: 256,
            channel_depth: 256,
            rate_limit: None,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached within timeout");
    }

    #[test]
    fn test_lifecycle() {
        let mut engine = Engine::new(test_config(2));
        assert!(!engine.is_running());

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));

        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_dispatch_requires_running() {
        let mut engine = Engine::new(test_config(1));
        let frame = make_udp_frame(1, 2, 3, 4);
        assert!(!engine.dispatch(&frame));
        assert_eq!(engine.snapshot().ingress_drops, 1);
    }

    #[test]
    fn test_traffic_counted_per_flow() {
        let mut engine = Engine::new(test_config(2));
        engine.start().unwrap();

        let flow_a = make_udp_frame(0x0A000001, 0x0A000002, 1000, 2000);
        let flow_b = make_udp_frame(0x0A000003, 0x0A000004, 3000, 4000);
        for _ in 0..5 {
            assert!(engine.dispatch(&flow_a));
            assert!(engine.dispatch(&flow_b));
        }

        wait_until(|| {
            let cores = engine.snapshot().cores;
            cores.tx_packets + cores.dropped == 10
        });

        let snap = engine.snapshot();
        assert_eq!(snap.cores.rx_packets, 10);
        assert_eq!(snap.cores.tx_packets, 10);
        assert_eq!(snap.cores.flow_misses, 2);
        assert_eq!(snap.cores.flow_hits, 8);
        assert_eq!(snap.active_flows, 2);
        assert!(snap.flow_capacity >= 1024);

        engine.stop();
    }

    #[test]
    fn test_rate_limit_drops_excess() {
        let mut config = test_config(1);
        config.rate_limit = Some(RateLimitConfig {
            rate_pps: 1,
            burst: 2,
        });
        let mut engine = Engine::new(config);
        engine.start().unwrap();

        let frame = make_udp_frame(1, 2, 3, 4);
        for _ in 0..6 {
            assert!(engine.dispatch(&frame));
        }

        wait_until(|| {
            let cores = engine.snapshot().cores;
            cores.tx_packets + cores.dropped == 6
        });
        let snap = engine.snapshot();
        // Two-packet burst passes; the rest of the back-to-back packets
        // exceed 1 pps.
        assert!(snap.cores.tx_packets >= 2);
        assert!(snap.cores.dropped >= 3);

        engine.stop();
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = test_config(4);
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workers, 4);
        assert_eq!(back.flow_capacity, 1024);
    }
}

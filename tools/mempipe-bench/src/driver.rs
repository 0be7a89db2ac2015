// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Benchmark driver.
//!
//! Sets up the chosen transport, forks, and streams `count` messages from
//! the parent (producer) to the child (consumer) through the generic
//! [`WriteBuffers`]/[`ReadBuffers`] interface.

use crate::harness::{self, CpuPair, Side};
use mempipe::shm::RingMetricsSnapshot;
use mempipe::{
    Consumer, ExtentConfig, ExtentPipes, ExtentReceiver, ExtentSender, Producer, ReadBuffers, Ring, RingConfig, RingMetrics, SharedRegion, SpinWait, WaitStrategy,
    WriteBuffers,
};
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

type BoxResult<T> = Result<T, Box<dyn Error>>;

/// Transport under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    RingSpin,
    RingFutex,
    ExtentPipe,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ring-spin" | "spin" => Ok(Transport::RingSpin),
            "ring-futex" | "futex" => Ok(Transport::RingFutex),
            "extent-pipe" | "extent" => Ok(Transport::ExtentPipe),
            _ => Err(format!("Unknown transport: {}", s)),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::RingSpin => "mempipe_spin_thr",
            Transport::RingFutex => "mempipe_futex_thr",
            Transport::ExtentPipe => "shmem_pipe_thr",
        })
    }
}

/// How the producer fills each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    /// Write byte `i` straight into the transport buffer
    InPlace,
    /// Fill a local buffer with byte `i`, then copy it in
    External,
    /// Copy an untouched (zeroed) local buffer
    NoData,
}

impl DataMode {
    /// Byte every payload of message `i` carries
    fn pattern(self, i: u64) -> u8 {
        match self {
            DataMode::InPlace | DataMode::External => i as u8,
            DataMode::NoData => 0,
        }
    }
}

impl FromStr for DataMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-place" | "inplace" => Ok(DataMode::InPlace),
            "external" | "ext" => Ok(DataMode::External),
            "no-data" | "none" => Ok(DataMode::NoData),
            _ => Err(format!("Unknown data mode: {}", s)),
        }
    }
}

/// Run parameters shared by both sides
#[derive(Debug, Clone)]
pub struct BenchParams {
    pub transport: Transport,
    pub size: usize,
    pub count: u64,
    pub mode: DataMode,
    pub verify: bool,
    pub per_iter: bool,
    pub numa_node: Option<u32>,
    pub deferred_batch: u32,
    /// Spin polls between scheduler yields (ring-spin only)
    pub spin_yield: Option<u32>,
}

/// Producer-side result of one run
#[derive(Debug)]
pub struct Report {
    /// First send to final acknowledgement
    pub elapsed: Duration,
    /// Per-message nanoseconds, if requested
    pub per_iter_ns: Vec<f64>,
    pub metrics: RingMetricsSnapshot,
}

/// Sending end as the driver sees it
trait Sink: WriteBuffers {
    fn connect(&mut self) {}
    fn finish_stream(&mut self) -> mempipe::Result<()>;
    fn counters(&self) -> &RingMetrics;
}

/// Receiving end as the driver sees it
trait Source: ReadBuffers {
    fn connect(&mut self) {}
}

impl<W: WaitStrategy> Sink for Producer<W> {
    fn connect(&mut self) {
        self.handshake();
    }

    fn finish_stream(&mut self) -> mempipe::Result<()> {
        self.finish()
    }

    fn counters(&self) -> &RingMetrics {
        self.metrics()
    }
}

impl<W: WaitStrategy> Source for Consumer<W> {
    fn connect(&mut self) {
        self.handshake();
    }
}

impl Sink for ExtentSender {
    fn finish_stream(&mut self) -> mempipe::Result<()> {
        let drained = self.finish()?;
        log::debug!("[BENCH] Reclaimed {drained} extents after end-of-stream");
        Ok(())
    }

    fn counters(&self) -> &RingMetrics {
        self.metrics()
    }
}

impl Source for ExtentReceiver {}

/// Run one benchmark; returns the producer's report.
pub fn run(params: &BenchParams, cpus: CpuPair) -> BoxResult<Report> {
    match params.transport {
        Transport::RingSpin => {
            let interval = params.spin_yield;
            run_ring(params, cpus, move |_| SpinWait::with_yield_interval(interval))
        }
        Transport::RingFutex => run_ring(params, cpus, RingConfig::futex_wait),
        Transport::ExtentPipe => run_extent(params, cpus),
    }
}

fn run_ring<W, F>(params: &BenchParams, cpus: CpuPair, make_wait: F) -> BoxResult<Report>
where
    W: WaitStrategy,
    F: Fn(&RingConfig) -> W,
{
    let cfg = RingConfig::from_env()?
        .with_message_size(params.size)
        .with_numa_node(params.numa_node)
        .with_deferred_batch(params.deferred_batch);
    let ring = cfg.establish()?;
    log::debug!("[BENCH] {} over {ring:?}", params.transport);

    match harness::fork_pinned(cpus)? {
        Side::Child => harness::exit_child(|| {
            let mut rx = Consumer::new(ring, make_wait(&cfg)).with_expected_size(params.size);
            consume(&mut rx, params)
        }),
        Side::Parent(child) => {
            let mut tx = Producer::new(ring, make_wait(&cfg));
            supervise(child, || produce(&mut tx, params))
        }
    }
}

fn run_extent(params: &BenchParams, cpus: CpuPair) -> BoxResult<Report> {
    let cfg = ExtentConfig::from_env()?
        .with_message_size(params.size)
        .with_numa_node(params.numa_node);
    cfg.validate()?;
    let region = SharedRegion::establish(cfg.pages(), cfg.numa_node)?;
    let ring = Ring::new(Arc::new(region))?;
    let pipes = ExtentPipes::new()?;
    log::debug!("[BENCH] {} over {ring:?}", params.transport);

    match harness::fork_pinned(cpus)? {
        Side::Child => harness::exit_child(|| {
            let mut rx = pipes.into_receiver(ring)?;
            consume(&mut rx, params)
        }),
        Side::Parent(child) => {
            let mut tx = pipes.into_sender(ring)?;
            supervise(child, || produce(&mut tx, params))
        }
    }
}

/// Run the parent's side, then reap the child; kill it if the parent failed.
fn supervise<F>(child: harness::ChildProcess, work: F) -> BoxResult<Report>
where
    F: FnOnce() -> BoxResult<Report>,
{
    match work() {
        Ok(report) => {
            child.wait()?;
            Ok(report)
        }
        Err(e) => {
            child.abort();
            Err(e)
        }
    }
}

fn produce<S: Sink>(tx: &mut S, params: &BenchParams) -> BoxResult<Report> {
    let size = params.size;
    let mut local = vec![0u8; size];
    let mut per_iter_ns = Vec::with_capacity(if params.per_iter {
        params.count as usize
    } else {
        0
    });

    tx.connect();
    let start = Instant::now();
    for i in 0..params.count {
        let t0 = Instant::now();
        let byte = params.mode.pattern(i);
        {
            let mut segs = tx.get_write_buffer(size)?;
            match params.mode {
                DataMode::InPlace => segs.fill(byte),
                DataMode::External => {
                    local.fill(byte);
                    segs.copy_from_slice(&local);
                }
                DataMode::NoData => segs.copy_from_slice(&local),
            }
        }
        tx.release_write_buffer(size)?;
        if params.per_iter {
            per_iter_ns.push(t0.elapsed().as_nanos() as f64);
        }
    }
    tx.finish_stream()?;
    let elapsed = start.elapsed();

    let metrics = tx.counters().snapshot();
    log::debug!("[BENCH] Producer {metrics}");
    Ok(Report {
        elapsed,
        per_iter_ns,
        metrics,
    })
}

fn consume<S: Source>(rx: &mut S, params: &BenchParams) -> BoxResult<()> {
    let size = params.size;
    let mut local = vec![0u8; size];

    rx.connect();
    let mut received = 0u64;
    while let Some(segs) = rx.get_read_buffer(size)? {
        segs.copy_to_slice(&mut local);
        if params.verify {
            let expected = params.mode.pattern(received);
            if let Some(pos) = local.iter().position(|&b| b != expected) {
                return Err(format!(
                    "message {received}: byte {pos} is {:#04x}, expected {expected:#04x}",
                    local[pos]
                )
                .into());
            }
        }
        rx.release_read_buffer()?;
        received += 1;
    }

    if received != params.count {
        return Err(format!("received {received} messages, expected {}", params.count).into());
    }
    Ok(())
}

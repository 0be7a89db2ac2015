// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::uninlined_format_args)] // Bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Bench parameters
#![allow(clippy::missing_panics_doc)] // Benches panic on failure

//! Ring and extent transport throughput
//!
//! Each sample streams `iters` messages from a producer thread to a
//! consumer thread and times the whole transfer:
//! - ring with spin waiting
//! - ring with futex waiting (deferred header writes)
//! - extent-over-pipe

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mempipe::{
    channel, ExtentConfig, ExtentPipes, FutexWait, Received, Ring, RingConfig, SharedRegion,
    SpinWait, WaitStrategy,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const MESSAGE_SIZES: [usize; 3] = [64, 256, 1024];

fn ring_for(size: usize) -> Ring {
    RingConfig::default()
        .with_pages(8)
        .with_message_size(size)
        .establish()
        .expect("establish")
}

fn stream_ring<W>(size: usize, iters: u64) -> Duration
where
    W: WaitStrategy + Default + 'static,
{
    let (mut tx, mut rx) = channel::<W>(ring_for(size));
    let consumer = thread::spawn(move || {
        rx.handshake();
        let mut buf = Vec::with_capacity(size);
        while let Received::Message(len) = rx.recv(&mut buf).expect("recv") {
            black_box(len);
        }
    });

    tx.handshake();
    let payload = vec![0x5a; size];
    let start = Instant::now();
    for _ in 0..iters {
        tx.send(&payload).expect("send");
    }
    tx.finish().expect("finish");
    consumer.join().expect("consumer panicked");
    start.elapsed()
}

fn stream_extent(size: usize, iters: u64) -> Duration {
    let cfg = ExtentConfig {
        order: 3,
        ..Default::default()
    };
    let region = SharedRegion::establish(cfg.pages(), None).expect("establish");
    let ring = Ring::new(Arc::new(region)).expect("ring");
    let (mut tx, mut rx) = ExtentPipes::new()
        .expect("pipes")
        .split(ring)
        .expect("split");

    let receiver = thread::spawn(move || {
        let mut buf = Vec::with_capacity(size);
        while let Some(len) = rx.recv(&mut buf).expect("recv") {
            black_box(len);
        }
    });

    let payload = vec![0x5a; size];
    let start = Instant::now();
    for _ in 0..iters {
        tx.send(&payload).expect("send");
    }
    tx.finish().expect("finish");
    receiver.join().expect("receiver panicked");
    start.elapsed()
}

fn bench_ring_spin(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_spin");
    for size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| stream_ring::<SpinWait>(size, iters));
        });
    }
    group.finish();
}

fn bench_ring_futex(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_futex");
    for size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| stream_ring::<FutexWait>(size, iters));
        });
    }
    group.finish();
}

fn bench_extent_pipe(c: &mut Criterion) {
    let mut group = c.benchmark_group("extent_pipe");
    for size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| stream_extent(size, iters));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ring_spin, bench_ring_futex, bench_extent_pipe);
criterion_main!(benches);

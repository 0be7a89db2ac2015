// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::uninlined_format_args)] // Test readability

//! Ring transport integration tests
//!
//! Producer and consumer run on separate threads (and, for one test, in
//! separate processes) over the same shared region.

use mempipe::shm::PAGE_SIZE;
use mempipe::{
    channel, Consumer, FutexWait, Producer, ReadBuffers, Received, Ring, RingConfig,
    SharedRegion, SpinWait, WaitStrategy, WriteBuffers,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Payload for iteration `i`: the iteration number, then a byte pattern
fn fill_pattern(buf: &mut [u8], i: u64) {
    buf[..8].copy_from_slice(&i.to_le_bytes());
    for (j, b) in buf[8..].iter_mut().enumerate() {
        *b = (i as u8).wrapping_add(j as u8);
    }
}

fn check_pattern(buf: &[u8], i: u64) -> bool {
    buf[..8] == i.to_le_bytes()
        && buf[8..]
            .iter()
            .enumerate()
            .all(|(j, &b)| b == (i as u8).wrapping_add(j as u8))
}

/// Stream `count` tagged messages through `ring`; returns messages received
fn run_stream<W>(ring: Ring, size: usize, count: u64) -> u64
where
    W: WaitStrategy + Default + 'static,
{
    let (mut tx, rx) = channel::<W>(ring);
    let mut rx = rx.with_expected_size(size);

    let producer = thread::spawn(move || {
        tx.handshake();
        let mut payload = vec![0u8; size];
        for i in 0..count {
            fill_pattern(&mut payload, i);
            tx.send(&payload).expect("send");
        }
        tx.finish().expect("finish");
    });

    rx.handshake();
    let mut buf = Vec::with_capacity(size);
    let mut received = 0;
    loop {
        match rx.recv(&mut buf).expect("recv") {
            Received::Message(len) => {
                assert_eq!(len, size);
                assert!(check_pattern(&buf, received), "corrupt message {received}");
                received += 1;
            }
            Received::Stop => break,
        }
    }
    producer.join().expect("producer panicked");
    received
}

fn small_ring(ring_size: usize) -> Ring {
    let region = Arc::new(SharedRegion::establish(1, None).expect("establish failed"));
    Ring::with_size(region, ring_size).expect("ring")
}

#[test]
fn test_round_trip_integrity_spin() {
    let ring = RingConfig::default()
        .with_pages(1)
        .establish()
        .expect("establish");
    let count = (ring.size() * 4 / 128) as u64;
    assert_eq!(run_stream::<SpinWait>(ring, 128, count), count);
}

#[test]
fn test_round_trip_integrity_futex() {
    let ring = RingConfig::default()
        .with_pages(1)
        .establish()
        .expect("establish");
    let count = (ring.size() * 4 / 128) as u64;
    assert_eq!(run_stream::<FutexWait>(ring, 128, count), count);
}

#[test]
fn test_end_to_end_8_pages_spin() {
    let ring = RingConfig::default()
        .with_pages(8)
        .with_message_size(128)
        .establish()
        .expect("establish");
    assert_eq!(run_stream::<SpinWait>(ring, 128, 10_000), 10_000);
}

#[test]
fn test_end_to_end_8_pages_futex() {
    let ring = RingConfig::default()
        .with_pages(8)
        .with_message_size(128)
        .establish()
        .expect("establish");
    assert_eq!(run_stream::<FutexWait>(ring, 128, 10_000), 10_000);
}

#[test]
fn test_futex_without_deferral() {
    let ring = RingConfig::default()
        .with_pages(1)
        .establish()
        .expect("establish");
    let (mut tx, mut rx) = (
        Producer::new(ring.clone(), FutexWait::with_batch(0)),
        Consumer::new(ring, FutexWait::with_batch(0)),
    );
    let producer = thread::spawn(move || {
        tx.handshake();
        for i in 0..2000u32 {
            tx.send(&i.to_le_bytes()).expect("send");
        }
        tx.finish().expect("finish");
    });
    rx.handshake();
    let mut buf = Vec::new();
    let mut n = 0u32;
    while let Received::Message(len) = rx.recv(&mut buf).expect("recv") {
        assert_eq!(len, 64, "payload padded to a cache line");
        assert_eq!(buf[..4], n.to_le_bytes());
        n += 1;
    }
    assert_eq!(n, 2000);
    producer.join().expect("producer panicked");
}

#[test]
fn test_wrapping_payloads_zero_copy() {
    // 320-byte payloads in a 4096-byte ring: slots of 384 bytes do not
    // divide the ring, so payloads regularly straddle the end.
    let ring = small_ring(4096);
    let (mut tx, mut rx) = channel::<SpinWait>(ring);
    const SIZE: usize = 320;
    const COUNT: u64 = 2000;

    let producer = thread::spawn(move || {
        tx.handshake();
        for i in 0..COUNT {
            let mut segs = tx.get_write_buffer(SIZE).expect("get_write_buffer");
            let mut payload = [0u8; SIZE];
            fill_pattern(&mut payload, i);
            segs.copy_from_slice(&payload);
            tx.release_write_buffer(SIZE).expect("release_write_buffer");
        }
        tx.finish().expect("finish");
    });

    rx.handshake();
    let mut split = 0;
    let mut received = 0;
    let mut payload = [0u8; SIZE];
    while let Some(segs) = rx.get_read_buffer(SIZE).expect("get_read_buffer") {
        if segs.count() == 2 {
            split += 1;
        }
        segs.copy_to_slice(&mut payload);
        assert!(check_pattern(&payload, received), "corrupt message {received}");
        rx.release_read_buffer().expect("release_read_buffer");
        received += 1;
    }
    producer.join().expect("producer panicked");
    assert_eq!(received, COUNT);
    assert!(split > 0, "no payload wrapped");
}

#[test]
fn test_futex_liveness() {
    let ring = RingConfig::default()
        .with_pages(8)
        .establish()
        .expect("establish");
    let (mut tx, mut rx) = channel::<FutexWait>(ring);
    let (done_tx, done_rx) = mpsc::channel();

    let consumer = thread::spawn(move || {
        rx.handshake();
        let mut buf = Vec::new();
        while let Received::Message(_) = rx.recv(&mut buf).expect("recv") {
            done_tx.send(buf[0]).expect("report");
        }
    });

    tx.handshake();
    for i in 0..100u8 {
        // Give the consumer time to block in the kernel
        thread::sleep(Duration::from_millis(2));
        tx.send(&[i; 64]).expect("send");
        tx.flush().expect("flush");
        let got = done_rx
            .recv_timeout(Duration::from_secs(1))
            .unwrap_or_else(|_| panic!("wakeup {i} lost"));
        assert_eq!(got, i);
    }
    tx.finish().expect("finish");
    consumer.join().expect("consumer panicked");
    assert!(tx.metrics().wake_calls() > 0, "consumer never slept");
}

#[test]
fn test_backpressure_boundary() {
    // Exactly four slots of (64 header + 64 payload)
    const SIZE: usize = 64;
    let ring = small_ring(4 * (64 + SIZE));
    let (mut tx, mut rx) = channel::<SpinWait>(ring);
    let (sent_tx, sent_rx) = mpsc::channel();

    let producer = thread::spawn(move || {
        tx.handshake();
        for i in 0..4u8 {
            tx.send(&[i; SIZE]).expect("send");
            sent_tx.send(i).expect("report");
        }
        tx.finish().expect("finish");
    });

    rx.handshake();
    for i in 0..3u8 {
        assert_eq!(
            sent_rx.recv_timeout(Duration::from_secs(1)).expect("fits"),
            i
        );
    }
    // The fourth needs the first slot back
    assert!(sent_rx.recv_timeout(Duration::from_millis(100)).is_err());

    let mut buf = Vec::new();
    assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Message(SIZE));
    assert_eq!(buf[0], 0);
    assert_eq!(
        sent_rx.recv_timeout(Duration::from_secs(1)).expect("unblocked"),
        3
    );

    for i in 1..4u8 {
        assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Message(SIZE));
        assert_eq!(buf[0], i);
    }
    assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Stop);
    producer.join().expect("producer panicked");
}

#[test]
fn test_ring_order_sizes() {
    let cfg = RingConfig::default().with_order(2).expect("order");
    assert_eq!(cfg.ring_size(), 4 * PAGE_SIZE);
    let ring = cfg.establish().expect("establish");
    assert_eq!(ring.size(), 4 * PAGE_SIZE);
}

#[test]
#[cfg(target_os = "linux")]
fn test_cross_process_stream() {
    const SIZE: usize = 128;
    const COUNT: u64 = 5000;

    let ring = RingConfig::default()
        .with_pages(8)
        .establish()
        .expect("establish");
    let (mut tx, mut rx) = channel::<FutexWait>(ring);

    // SAFETY: the child only touches the inherited mapping and calls _exit
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        rx.handshake();
        let mut received = 0u64;
        let mut payload = [0u8; SIZE];
        let ok = loop {
            match rx.get_read_buffer(SIZE) {
                Ok(Some(segs)) => segs.copy_to_slice(&mut payload),
                Ok(None) => break received == COUNT,
                Err(_) => break false,
            }
            if !check_pattern(&payload, received) || rx.release_read_buffer().is_err() {
                break false;
            }
            received += 1;
        };
        // SAFETY: terminate the child without running the test harness
        unsafe { libc::_exit(if ok { 0 } else { 1 }) };
    }

    tx.handshake();
    let mut payload = [0u8; SIZE];
    for i in 0..COUNT {
        fill_pattern(&mut payload, i);
        tx.send(&payload).expect("send");
    }
    tx.finish().expect("finish");

    let mut status = 0;
    // SAFETY: pid is our direct child
    let rv = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rv, pid);
    assert!(libc::WIFEXITED(status), "child killed");
    assert_eq!(libc::WEXITSTATUS(status), 0, "child saw a bad stream");
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring endpoint metrics
//!
//! Atomic counters describing how an endpoint spent its time. Each process
//! keeps its own instance (the counters live in private memory, not in the
//! shared region), so the producer and the consumer report separately.
//!
//! # Tracked Metrics
//!
//! - `messages`: Messages sent (producer) or received (consumer)
//! - `backpressure_waits`: Producer waits for ring space or a returned extent
//! - `wait_calls`: Futex wait syscalls
//! - `wake_calls`: Futex wake syscalls
//! - `yields`: Scheduler yields taken while spinning
//! - `deferred_flushes`: Batched header writes flushed

use std::sync::atomic::{AtomicU64, Ordering};

/// Ring endpoint metrics with atomic counters.
///
/// All counters use `Relaxed` ordering; values are only meaningful once the
/// endpoint has stopped.
#[derive(Debug, Default)]
pub struct RingMetrics {
    messages: AtomicU64,
    backpressure_waits: AtomicU64,
    wait_calls: AtomicU64,
    wake_calls: AtomicU64,
    yields: AtomicU64,
    deferred_flushes: AtomicU64,
}

impl RingMetrics {
    /// Create new metrics instance with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            backpressure_waits: AtomicU64::new(0),
            wait_calls: AtomicU64::new(0),
            wake_calls: AtomicU64::new(0),
            yields: AtomicU64::new(0),
            deferred_flushes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_messages(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_backpressure_waits(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_wait_calls(&self) {
        self.wait_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_wake_calls(&self) {
        self.wake_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_yields(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_deferred_flushes(&self) {
        self.deferred_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages sent or received.
    #[inline]
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Futex wait syscalls.
    #[inline]
    #[must_use]
    pub fn wait_calls(&self) -> u64 {
        self.wait_calls.load(Ordering::Relaxed)
    }

    /// Futex wake syscalls.
    #[inline]
    #[must_use]
    pub fn wake_calls(&self) -> u64 {
        self.wake_calls.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> RingMetricsSnapshot {
        RingMetricsSnapshot {
            messages: self.messages(),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            wait_calls: self.wait_calls(),
            wake_calls: self.wake_calls(),
            yields: self.yields.load(Ordering::Relaxed),
            deferred_flushes: self.deferred_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of ring metrics (non-atomic, for reporting).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingMetricsSnapshot {
    pub messages: u64,
    pub backpressure_waits: u64,
    pub wait_calls: u64,
    pub wake_calls: u64,
    pub yields: u64,
    pub deferred_flushes: u64,
}

impl RingMetricsSnapshot {
    /// Futex waits per message.
    ///
    /// Near zero when the peer keeps up; near one when every message blocks.
    #[must_use]
    pub fn waits_per_message(&self) -> f64 {
        if self.messages == 0 {
            0.0
        } else {
            self.wait_calls as f64 / self.messages as f64
        }
    }
}

impl std::fmt::Display for RingMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RING[messages={}, backpressure={}, wait={}, wake={}, yields={}, flushes={}]",
            self.messages,
            self.backpressure_waits,
            self.wait_calls,
            self.wake_calls,
            self.yields,
            self.deferred_flushes
        )
    }
}

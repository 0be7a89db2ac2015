// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Header wait strategies.
//!
//! The protocol engine is generic over how an endpoint waits for a header
//! to change and how it publishes one:
//!
//! - [`SpinWait`]: busy-poll, optionally yielding to the scheduler every few
//!   thousand spins; publishes with a plain Release store. Lowest latency,
//!   burns a core.
//! - [`FutexWait`]: announce the wait by setting `WAITING` in the header
//!   word, then sleep in the kernel. Publishers that observe `WAITING`
//!   issue a single wake.
//!
//! # Deferred Header Write
//!
//! To amortise wake syscalls, [`FutexWait`] holds back one header write:
//!
//! 1. The first `set_header` is recorded and nothing is written
//! 2. Each later `set_header` counts down and is stored directly
//! 3. When the count reaches zero, the held write is published with an
//!    exchange (waking the peer if it set `WAITING`)
//! 4. Any `wait_for_header` publishes the held write before blocking
//!
//! Direct stores cannot lose a `WAITING` bit: the peer consumes headers in
//! order, so while a write is held the peer can only be blocked on the held
//! header, never on a later one.

use super::futex::{futex_wait, futex_wake_one};
use super::header::{atomic_cmpxchg, atomic_xchg, HeaderState, FLAG_WAITING};
use super::metrics::RingMetrics;
use super::ring::Ring;
use super::Result;
use std::sync::atomic::Ordering;

/// Number of direct header writes after which a held write is flushed
pub const DEFAULT_DEFERRED_BATCH: u32 = 2;

/// Spin iterations between scheduler yields for [`SpinWait::new`]
pub const DEFAULT_SPIN_YIELD_INTERVAL: u32 = 1024;

/// How an endpoint waits for and publishes header words.
pub trait WaitStrategy: Send {
    /// Block until the header at `offset` is in state `desired`.
    ///
    /// Returns the observed header value.
    ///
    /// # Errors
    ///
    /// Returns error if the underlying wait primitive fails.
    fn wait_for_header(&mut self, ring: &Ring, offset: u64, desired: HeaderState) -> Result<u32>;

    /// Publish a new header value.
    ///
    /// # Errors
    ///
    /// Returns error if waking the peer fails.
    fn set_header(&mut self, ring: &Ring, offset: u64, value: u32) -> Result<()>;

    /// Make every held header write visible.
    ///
    /// # Errors
    ///
    /// Returns error if waking the peer fails.
    fn flush(&mut self, _ring: &Ring) -> Result<()> {
        Ok(())
    }

    /// Publish a terminal header value, flushing first and waking the peer
    /// if it is blocked on this word.
    ///
    /// # Errors
    ///
    /// Returns error if waking the peer fails.
    fn publish_final(&mut self, ring: &Ring, offset: u64, value: u32) -> Result<()>;

    /// Counters for this endpoint
    fn metrics(&self) -> &RingMetrics;
}

/// Busy-polling strategy.
///
/// With a yield interval set, every `interval` failed polls call
/// `sched_yield`. Without one the wait loop makes no syscalls at all.
#[derive(Debug)]
pub struct SpinWait {
    yield_interval: Option<u32>,
    metrics: RingMetrics,
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::with_yield_interval(Some(DEFAULT_SPIN_YIELD_INTERVAL))
    }
}

impl SpinWait {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spin strategy yielding every `interval` polls, or never for `None`.
    ///
    /// `Some(0)` is treated as `None`.
    #[must_use]
    pub fn with_yield_interval(interval: Option<u32>) -> Self {
        Self {
            yield_interval: interval.filter(|&n| n > 0),
            metrics: RingMetrics::new(),
        }
    }

    /// Polls between scheduler yields, if any
    #[must_use]
    pub fn yield_interval(&self) -> Option<u32> {
        self.yield_interval
    }
}

impl WaitStrategy for SpinWait {
    fn wait_for_header(&mut self, ring: &Ring, offset: u64, desired: HeaderState) -> Result<u32> {
        let word = ring.header(offset);
        let mut spins: u32 = 0;
        loop {
            let value = word.load(Ordering::Acquire);
            if desired.matches(value) {
                return Ok(value);
            }
            match self.yield_interval {
                Some(interval) => {
                    spins += 1;
                    if spins == interval {
                        spins = 0;
                        self.metrics.inc_yields();
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                None => std::hint::spin_loop(),
            }
        }
    }

    #[inline]
    fn set_header(&mut self, ring: &Ring, offset: u64, value: u32) -> Result<()> {
        ring.header(offset).store(value, Ordering::Release);
        Ok(())
    }

    fn publish_final(&mut self, ring: &Ring, offset: u64, value: u32) -> Result<()> {
        self.set_header(ring, offset, value)
    }

    fn metrics(&self) -> &RingMetrics {
        &self.metrics
    }
}

/// A header write held back by [`FutexWait`].
///
/// Identified by its logical ring offset, not by an address, so it stays
/// meaningful in whichever process owns the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredWrite {
    offset: u64,
    value: u32,
    remaining: u32,
}

impl DeferredWrite {
    /// Logical offset of the held header
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Value to be published
    #[must_use]
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Direct writes left before the held write is flushed
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

/// Futex-blocking strategy with one deferred header write.
#[derive(Debug)]
pub struct FutexWait {
    batch: u32,
    pending: Option<DeferredWrite>,
    metrics: RingMetrics,
}

impl Default for FutexWait {
    fn default() -> Self {
        Self::with_batch(DEFAULT_DEFERRED_BATCH)
    }
}

impl FutexWait {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold each deferred write for `batch` direct writes.
    ///
    /// A batch of 0 disables deferral: every write is published (and wakes
    /// the peer if needed) immediately.
    #[must_use]
    pub fn with_batch(batch: u32) -> Self {
        Self {
            batch,
            pending: None,
            metrics: RingMetrics::new(),
        }
    }

    /// The currently held write, if any
    #[must_use]
    pub fn pending(&self) -> Option<&DeferredWrite> {
        self.pending.as_ref()
    }

    /// Exchange `value` into the header and wake one waiter if the previous
    /// value carried `WAITING`.
    fn publish(&self, ring: &Ring, offset: u64, value: u32) -> Result<()> {
        let word = ring.header(offset);
        let prev = atomic_xchg(word, value);
        if prev & FLAG_WAITING != 0 {
            self.metrics.inc_wake_calls();
            futex_wake_one(word)?;
        }
        Ok(())
    }
}

impl WaitStrategy for FutexWait {
    fn wait_for_header(&mut self, ring: &Ring, offset: u64, desired: HeaderState) -> Result<u32> {
        // The peer may be blocked on the held header; never sleep on it
        self.flush(ring)?;

        let word = ring.header(offset);
        loop {
            let value = word.load(Ordering::Acquire);
            if desired.matches(value) {
                return Ok(value);
            }
            let waiting = value | FLAG_WAITING;
            if waiting == value || atomic_cmpxchg(word, value, waiting) == value {
                self.metrics.inc_wait_calls();
                futex_wait(word, waiting)?;
            }
        }
    }

    fn set_header(&mut self, ring: &Ring, offset: u64, value: u32) -> Result<()> {
        match self.pending.as_mut() {
            None if self.batch == 0 => self.publish(ring, offset, value),
            None => {
                self.pending = Some(DeferredWrite {
                    offset,
                    value,
                    remaining: self.batch,
                });
                Ok(())
            }
            Some(held) => {
                held.remaining -= 1;
                let due = held.remaining == 0;
                ring.header(offset).store(value, Ordering::Release);
                if due {
                    self.flush(ring)?;
                }
                Ok(())
            }
        }
    }

    fn flush(&mut self, ring: &Ring) -> Result<()> {
        if let Some(held) = self.pending.take() {
            self.metrics.inc_deferred_flushes();
            self.publish(ring, held.offset, held.value)?;
        }
        Ok(())
    }

    fn publish_final(&mut self, ring: &Ring, offset: u64, value: u32) -> Result<()> {
        self.flush(ring)?;
        self.publish(ring, offset, value)
    }

    fn metrics(&self) -> &RingMetrics {
        &self.metrics
    }
}

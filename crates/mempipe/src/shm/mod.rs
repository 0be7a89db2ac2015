// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory primitives for the inter-process message ring.
//!
//! This module owns everything that touches the mapped region directly:
//! the anonymous POSIX segment, the futex syscall wrapper, the cache-line
//! message header and its flag protocol, wraparound-aware framing, and the
//! two wait strategies (spin and futex) that the protocol engine is
//! parameterised over.
//!
//! # Architecture
//!
//! ```text
//! +------------------+              +------------------+
//! |  Parent process  |   Shared     |  Child process   |
//! |     Producer     |   Memory     |     Consumer     |
//! |        |         |   (mmap)     |        |         |
//! |        v         |              |        v         |
//! |  [hdr|payload]  -+--------------+-> [hdr|payload]  |
//! +------------------+   Futex      +------------------+
//!                     (wake one)
//! ```
//!
//! The region is established before `fork()`, so both processes map the
//! same object and no name ever needs to be exchanged.

mod futex;
mod header;
mod metrics;
mod ring;
mod segment;
mod wait;

pub use futex::{futex_wait, futex_wake_one};
pub use header::{
    atomic_cmpxchg, atomic_xchg, header_size_of, HeaderState, FLAGS_MASK, FLAG_READY, FLAG_STOP,
    FLAG_WAITING, HANDSHAKE_SENTINEL,
};
pub use metrics::{RingMetrics, RingMetricsSnapshot};
pub use ring::{IoSegments, Ring, RingSegments};
pub use segment::SharedRegion;
pub use wait::{
    DeferredWrite, FutexWait, SpinWait, WaitStrategy, DEFAULT_DEFERRED_BATCH,
    DEFAULT_SPIN_YIELD_INTERVAL,
};

use std::fmt;
use std::io;

/// Page granularity of the shared region
pub const PAGE_SIZE: usize = 4096;

/// Cache line size; headers and payload sizes are multiples of this
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of a message header (one cache line)
pub const HEADER_SIZE: usize = CACHE_LINE_SIZE;

/// Errors that can occur in shared memory ring operations
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory object creation failed
    SegmentCreate(io::Error),

    /// Memory mapping failed
    Mmap(io::Error),

    /// Binding the mapping to a NUMA node failed
    NumaBind { node: u32, source: io::Error },

    /// Unexpected futex syscall failure
    Futex(io::Error),

    /// Control pipe creation, read or write failed
    Pipe(io::Error),

    /// Ring size is not a power of two, not cache-line granular, or larger than the region
    InvalidRingSize(usize),

    /// Message size cannot be carried by the ring
    InvalidMessageSize { size: usize, ring_size: usize },

    /// Received payload size differs from the agreed message size
    SizeMismatch {
        expected: usize,
        actual: usize,
        offset: u64,
    },

    /// Header carries an impossible flag combination
    CorruptHeader { offset: u64, value: u32 },

    /// Released extent is outside the arena or not currently allocated
    BadExtent { offset: u64, size: u64 },

    /// Peer closed its end of the control channel mid-stream
    PeerClosed,

    /// Invalid configuration value
    InvalidConfig(String),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::NumaBind { node, source } => {
                write!(f, "Binding shared memory to NUMA node {node} failed: {source}")
            }
            Self::Futex(e) => write!(f, "Futex syscall failed: {e}"),
            Self::Pipe(e) => write!(f, "Control pipe I/O failed: {e}"),
            Self::InvalidRingSize(size) => write!(
                f,
                "Invalid ring size: {size} (must be a power of 2, a multiple of {CACHE_LINE_SIZE}, and fit the region)"
            ),
            Self::InvalidMessageSize { size, ring_size } => write!(
                f,
                "Invalid message size: {size} bytes cannot be carried by a {ring_size} byte ring"
            ),
            Self::SizeMismatch {
                expected,
                actual,
                offset,
            } => write!(
                f,
                "Payload size mismatch at offset {offset}: expected {expected}, got {actual}"
            ),
            Self::CorruptHeader { offset, value } => {
                write!(f, "Corrupt header at offset {offset}: {value:#010x}")
            }
            Self::BadExtent { offset, size } => {
                write!(f, "Bad extent release: offset {offset}, size {size}")
            }
            Self::PeerClosed => write!(f, "Peer closed the control channel"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::Mmap(e) | Self::Futex(e) | Self::Pipe(e) => Some(e),
            Self::NumaBind { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type for shared memory operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Round a payload size up to the next cache line multiple
#[must_use]
pub const fn round_to_cache_line(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

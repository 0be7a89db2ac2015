// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # mempipe - shared-memory message transport between two processes
//!
//! A single-producer/single-consumer ring in a `MAP_SHARED` region, with
//! either spin or futex-assisted waiting, plus an extent-over-pipe variant
//! that ships arena offsets through a pair of pipes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mempipe::{channel, FutexWait, Received, RingConfig, Result};
//!
//! fn main() -> Result<()> {
//!     // Establish before fork() so both processes map the same object
//!     let ring = RingConfig::default().with_pages(8).establish()?;
//!     let (_tx, mut rx) = channel::<FutexWait>(ring);
//!
//!     // Parent: tx.handshake(); tx.send(&[0u8; 128])?; tx.finish()?;
//!     // Child:
//!     rx.handshake();
//!     let mut buf = Vec::new();
//!     while let Received::Message(len) = rx.recv(&mut buf)? {
//!         println!("{len} bytes");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +----------------------------------------------------------------+
//! |  Producer / Consumer            ExtentSender / ExtentReceiver  |
//! |  (WriteBuffers / ReadBuffers)   (WriteBuffers / ReadBuffers)   |
//! +----------------------------------------------------------------+
//! |  WaitStrategy: SpinWait | FutexWait     FreeList + pipe codec  |
//! +----------------------------------------------------------------+
//! |  Ring (wraparound framing, header words)                       |
//! +----------------------------------------------------------------+
//! |  SharedRegion (shm_open + mmap, NUMA)   futex wait/wake        |
//! +----------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`shm`] - Region, futex, header protocol, framing, wait strategies
//! - [`channel`] - Ring producer/consumer protocol engine
//! - [`extent`] - Free-list allocator and extent-over-pipe transport
//! - [`config`] - Ring and extent configuration (environment overrides)
//! - [`buffers`] - Zero-copy buffer traits shared by the transports

/// Zero-copy buffer traits implemented by every transport.
pub mod buffers;
/// Ring producer/consumer protocol engine.
pub mod channel;
/// Ring and extent transport configuration.
pub mod config;
/// Free-list allocator and extent-over-pipe transport.
pub mod extent;
/// Shared memory primitives (region, futex, header protocol, wait strategies).
pub mod shm;

pub use buffers::{IoSegments, ReadBuffers, WriteBuffers};
pub use channel::{channel, Consumer, Producer, Received};
pub use config::{ExtentConfig, RingConfig};
pub use extent::{ExtentPipes, ExtentReceiver, ExtentSender, FreeList};
pub use shm::{
    FutexWait, Result, Ring, RingMetrics, RingMetricsSnapshot, SharedRegion, ShmError, SpinWait,
    WaitStrategy,
};

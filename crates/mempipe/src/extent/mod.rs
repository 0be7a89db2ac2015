// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Extent-over-pipe transport.
//!
//! Payloads live in a shared arena; only their location travels through a
//! pair of pipes. The sender carves extents out of the arena with a
//! [`FreeList`], writes the payload in place, and sends a fixed-size
//! [`ExtentRecord`] to the receiver. The receiver reads the payload in place
//! and echoes the extent back, at which point the sender may reuse it.
//!
//! ```text
//!  Sender (parent)                               Receiver (child)
//!  FreeList::allocate ─┐                     ┌─> validate, hand out
//!  write payload       │  to_child pipe      │   read payload
//!  record ─────────────┴────────────────────>┘   echo record
//!  FreeList::release <─────────────────────────  (unbounded out buffer)
//!                         to_parent pipe
//! ```
//!
//! The sender uses blocking pipe ends and only reads returns when the arena
//! is full. The receiver runs a `mio` poll loop over non-blocking ends and
//! queues echoes without bound, so it never stops reading and the two sides
//! cannot deadlock on full pipes.
//!
//! # Wire Format
//!
//! Every record is 12 bytes, little endian:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     base      (arena offset)
//! 4       4     size      (bytes, cache line multiple)
//! 8       4     sequence  (per-direction counter)
//! ```

mod arena;
mod freelist;
mod receiver;
mod sender;

pub use arena::{Arena, NodeId};
pub use freelist::{Extent, FreeList};
pub use receiver::ExtentReceiver;
pub use sender::ExtentSender;

use crate::shm::{Result, Ring, ShmError};
use mio::unix::pipe;
use std::io;

/// Encoded size of an [`ExtentRecord`]
pub const RECORD_SIZE: usize = 12;

/// First sequence number of the sender's records
pub const SENDER_SEQUENCE_START: u32 = 0;

/// First sequence number of the receiver's echoes
pub const ECHO_SEQUENCE_START: u32 = 0xf001_0000;

/// Location of one message in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRecord {
    pub base: u32,
    pub size: u32,
    pub sequence: u32,
}

impl ExtentRecord {
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.base.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            base: word(0),
            size: word(4),
            sequence: word(8),
        }
    }

    /// End offset of the extent
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }
}

/// Both pipes, created before `fork()`.
///
/// Each process converts this into its endpoint, which drops the other
/// side's ends; otherwise neither side would ever observe EOF.
pub struct ExtentPipes {
    to_child: (pipe::Sender, pipe::Receiver),
    to_parent: (pipe::Sender, pipe::Receiver),
}

impl ExtentPipes {
    /// Create the pipe pair.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::Pipe`] if either pipe cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            to_child: pipe::new().map_err(ShmError::Pipe)?,
            to_parent: pipe::new().map_err(ShmError::Pipe)?,
        })
    }

    /// Keep the parent ends and build the sender over `ring`.
    ///
    /// # Errors
    ///
    /// Returns error if the arena cannot be tracked or the ends cannot be
    /// switched to blocking mode.
    pub fn into_sender(self, ring: Ring) -> Result<ExtentSender> {
        let (tx, _) = self.to_child;
        let (_, rx) = self.to_parent;
        ExtentSender::new(ring, tx, rx)
    }

    /// Keep the child ends and build the receiver over `ring`.
    ///
    /// # Errors
    ///
    /// Returns error if the poll instance cannot be set up.
    pub fn into_receiver(self, ring: Ring) -> Result<ExtentReceiver> {
        let (_, rx) = self.to_child;
        let (tx, _) = self.to_parent;
        ExtentReceiver::new(ring, rx, tx)
    }

    /// Build both endpoints in one process (threads instead of `fork()`).
    ///
    /// # Errors
    ///
    /// Returns error if either endpoint cannot be set up.
    pub fn split(self, ring: Ring) -> Result<(ExtentSender, ExtentReceiver)> {
        let (parent_tx, child_rx) = self.to_child;
        let (child_tx, parent_rx) = self.to_parent;
        let sender = ExtentSender::new(ring.clone(), parent_tx, parent_rx)?;
        let receiver = ExtentReceiver::new(ring, child_rx, child_tx)?;
        Ok((sender, receiver))
    }
}

fn protocol_error(msg: String) -> ShmError {
    ShmError::Pipe(io::Error::new(io::ErrorKind::InvalidData, msg))
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Zero-copy buffer interface shared by every transport.
//!
//! A sender asks for a write buffer, fills it in place, then releases it
//! (which publishes the message). A receiver asks for the next read buffer,
//! inspects it in place, then releases it (which returns the space to the
//! sender). Buffers are handed out as [`IoSegments`]: one or two slices,
//! borrowed from the endpoint until the matching release.

pub use crate::shm::IoSegments;
use crate::shm::Result;

/// Sending side of a transport.
pub trait WriteBuffers {
    /// Reserve `len` bytes for the next message, blocking until space is
    /// available.
    ///
    /// # Errors
    ///
    /// Returns error if `len` can never fit or the transport failed.
    fn get_write_buffer(&mut self, len: usize) -> Result<IoSegments<'_>>;

    /// Publish the message previously reserved with `get_write_buffer`.
    ///
    /// # Errors
    ///
    /// Returns error if publishing fails.
    fn release_write_buffer(&mut self, len: usize) -> Result<()>;
}

/// Receiving side of a transport.
pub trait ReadBuffers {
    /// Block until the next message of `len` bytes is available.
    ///
    /// Returns `None` once the sender has ended the stream.
    ///
    /// # Errors
    ///
    /// Returns error on a size mismatch or a protocol violation.
    fn get_read_buffer(&mut self, len: usize) -> Result<Option<IoSegments<'_>>>;

    /// Hand the buffer returned by `get_read_buffer` back to the sender.
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgement cannot be delivered.
    fn release_read_buffer(&mut self) -> Result<()>;
}

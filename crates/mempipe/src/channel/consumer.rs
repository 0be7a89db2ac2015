// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer side of the ring protocol.

use super::handshake_consumer;
use crate::buffers::ReadBuffers;
use crate::shm::{
    header_size_of, round_to_cache_line, HeaderState, IoSegments, Result, Ring, RingMetrics,
    ShmError, WaitStrategy, FLAG_READY, FLAG_STOP, HEADER_SIZE,
};

/// Outcome of a receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A message of this many bytes was delivered
    Message(usize),
    /// The producer ended the stream
    Stop,
}

/// Receiving end of the ring.
pub struct Consumer<W: WaitStrategy> {
    ring: Ring,
    wait: W,
    next_message_start: u64,
    /// Slot size every message must carry, if fixed
    expected_size: Option<usize>,
    /// Slot size of a buffer handed out by `get_read_buffer`
    current: Option<usize>,
    stopped: bool,
}

impl<W: WaitStrategy> Consumer<W> {
    #[must_use]
    pub fn new(ring: Ring, wait: W) -> Self {
        Self {
            ring,
            wait,
            next_message_start: 0,
            expected_size: None,
            current: None,
            stopped: false,
        }
    }

    /// Require every message to carry a payload of `size` bytes (padded to
    /// a cache line); anything else is a [`ShmError::SizeMismatch`].
    #[must_use]
    pub fn with_expected_size(mut self, size: usize) -> Self {
        self.expected_size = Some(round_to_cache_line(size));
        self
    }

    /// Announce readiness and wait for the producer (see module docs).
    pub fn handshake(&mut self) {
        handshake_consumer(&self.ring);
    }

    /// Receive the next message into `dst`, resizing it to the slot size.
    ///
    /// # Errors
    ///
    /// Returns error on a size mismatch, a corrupt header, or a wait failure.
    pub fn recv(&mut self, dst: &mut Vec<u8>) -> Result<Received> {
        let Some(size) = self.await_message(self.expected_size)? else {
            return Ok(Received::Stop);
        };
        dst.resize(size, 0);
        self.ring
            .copy_from(self.next_message_start + HEADER_SIZE as u64, dst);
        self.acknowledge(size)?;
        Ok(Received::Message(size))
    }

    /// Publish any acknowledgement the wait strategy is holding back.
    ///
    /// # Errors
    ///
    /// Returns error if waking the producer fails.
    pub fn flush(&mut self) -> Result<()> {
        self.wait.flush(&self.ring)
    }

    /// Whether end-of-stream has been observed
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Logical offset of the next header to consume
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.next_message_start
    }

    #[must_use]
    pub fn metrics(&self) -> &RingMetrics {
        self.wait.metrics()
    }

    /// Wait for the next header and validate it.
    ///
    /// Returns the slot size, or `None` on end-of-stream.
    fn await_message(&mut self, expected: Option<usize>) -> Result<Option<usize>> {
        if self.stopped {
            return Ok(None);
        }
        let offset = self.next_message_start;
        let value = self
            .wait
            .wait_for_header(&self.ring, offset, HeaderState::Ready)?;
        let size = header_size_of(value) as usize;

        if value & FLAG_STOP != 0 {
            if size != 0 || value & FLAG_READY == 0 {
                return Err(ShmError::CorruptHeader { offset, value });
            }
            self.stopped = true;
            log::debug!(
                "[RING] Consumer reached end-of-stream at offset {offset}: {}",
                self.wait.metrics().snapshot()
            );
            return Ok(None);
        }

        if size + 2 * HEADER_SIZE > self.ring.size() {
            return Err(ShmError::CorruptHeader { offset, value });
        }
        if let Some(expected) = expected {
            if size != expected {
                return Err(ShmError::SizeMismatch {
                    expected,
                    actual: size,
                    offset,
                });
            }
        }
        Ok(Some(size))
    }

    /// Hand the current slot back to the producer and advance.
    fn acknowledge(&mut self, size: usize) -> Result<()> {
        self.wait
            .set_header(&self.ring, self.next_message_start, size as u32)?;
        self.next_message_start += (HEADER_SIZE + size) as u64;
        self.wait.metrics().inc_messages();
        Ok(())
    }
}

impl<W: WaitStrategy> ReadBuffers for Consumer<W> {
    fn get_read_buffer(&mut self, len: usize) -> Result<Option<IoSegments<'_>>> {
        let Some(size) = self.await_message(Some(round_to_cache_line(len)))? else {
            return Ok(None);
        };
        self.current = Some(size);
        let offset = self.next_message_start + HEADER_SIZE as u64;
        // SAFETY: the header at next_message_start is READY, so the producer
        // will not touch [offset, offset + len) until release_read_buffer()
        // acknowledges it; the slices borrow self mutably until then.
        Ok(Some(unsafe { self.ring.io_segments(offset, len) }))
    }

    fn release_read_buffer(&mut self) -> Result<()> {
        let Some(size) = self.current.take() else {
            return Err(ShmError::InvalidConfig(
                "release without a current read buffer".to_string(),
            ));
        };
        self.acknowledge(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{SharedRegion, SpinWait};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn ring(size: usize) -> Ring {
        let region = Arc::new(SharedRegion::establish(1, None).expect("establish failed"));
        Ring::with_size(region, size).expect("ring")
    }

    fn publish(ring: &Ring, offset: u64, value: u32) {
        ring.header(offset).store(value, Ordering::Release);
    }

    #[test]
    fn test_recv_acknowledges_without_ready() {
        let r = ring(4096);
        r.fill(64, 128, 0x42);
        publish(&r, 0, 128 | FLAG_READY);

        let mut rx = Consumer::new(r.clone(), SpinWait::new());
        let mut buf = Vec::new();
        assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Message(128));
        assert_eq!(buf, vec![0x42; 128]);
        assert_eq!(r.header(0).load(Ordering::Acquire), 128);
        assert_eq!(rx.next_offset(), 192);
    }

    #[test]
    fn test_stop_terminates() {
        let r = ring(4096);
        publish(&r, 0, FLAG_READY | FLAG_STOP);
        let mut rx = Consumer::new(r, SpinWait::new());
        let mut buf = Vec::new();
        assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Stop);
        assert!(rx.is_stopped());
        assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Stop);
    }

    #[test]
    fn test_stop_with_size_is_corrupt() {
        let r = ring(4096);
        publish(&r, 0, 64 | FLAG_READY | FLAG_STOP);
        let mut rx = Consumer::new(r, SpinWait::new());
        assert!(matches!(
            rx.recv(&mut Vec::new()),
            Err(ShmError::CorruptHeader {
                offset: 0,
                value
            }) if value == 64 | FLAG_READY | FLAG_STOP
        ));
    }

    #[test]
    fn test_stop_without_ready_is_corrupt() {
        let r = ring(4096);
        publish(&r, 0, FLAG_STOP);
        let mut rx = Consumer::new(r, SpinWait::new());
        assert!(matches!(
            rx.recv(&mut Vec::new()),
            Err(ShmError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_oversized_header_is_corrupt() {
        let r = ring(512);
        publish(&r, 0, 448 | FLAG_READY);
        let mut rx = Consumer::new(r, SpinWait::new());
        assert!(matches!(
            rx.recv(&mut Vec::new()),
            Err(ShmError::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_size_mismatch() {
        let r = ring(4096);
        publish(&r, 0, 64 | FLAG_READY);
        let mut rx = Consumer::new(r, SpinWait::new()).with_expected_size(128);
        assert!(matches!(
            rx.recv(&mut Vec::new()),
            Err(ShmError::SizeMismatch {
                expected: 128,
                actual: 64,
                offset: 0
            })
        ));
    }

    #[test]
    fn test_read_buffer_in_place() {
        let r = ring(512);
        // Message header at 384, payload wraps: [448, 512) + [0, 64)
        r.fill(448, 128, 0x77);
        publish(&r, 384, 128 | FLAG_READY);

        let mut rx = Consumer::new(r.clone(), SpinWait::new());
        rx.next_message_start = 384;
        {
            let segs = rx.get_read_buffer(128).expect("get").expect("message");
            assert_eq!(segs.count(), 2);
            assert!(segs.iter().flatten().all(|&b| b == 0x77));
        }
        rx.release_read_buffer().expect("release");
        assert_eq!(r.header(384).load(Ordering::Acquire), 128);
        assert_eq!(rx.next_offset(), 576);
        assert!(rx.release_read_buffer().is_err());
    }
}

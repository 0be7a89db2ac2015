// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer side of the ring protocol.

use super::{handshake_producer, slot_size};
use crate::buffers::WriteBuffers;
use crate::shm::{
    header_size_of, HeaderState, IoSegments, Result, Ring, RingMetrics, ShmError, WaitStrategy,
    FLAG_READY, FLAG_STOP, HEADER_SIZE,
};
use std::sync::atomic::Ordering;

/// Sending end of the ring.
///
/// # Cursors
///
/// - `next_tx`: logical offset of the next header to publish
/// - `first_unacked`: logical offset of the oldest header not yet
///   acknowledged by the consumer
///
/// `next_tx - first_unacked` never exceeds `ring_size - HEADER_SIZE`.
pub struct Producer<W: WaitStrategy> {
    ring: Ring,
    wait: W,
    next_tx: u64,
    first_unacked: u64,
    /// Slot size of a buffer handed out by `get_write_buffer`
    reserved: Option<usize>,
    finished: bool,
}

impl<W: WaitStrategy> Producer<W> {
    #[must_use]
    pub fn new(ring: Ring, wait: W) -> Self {
        Self {
            ring,
            wait,
            next_tx: 0,
            first_unacked: 0,
            reserved: None,
            finished: false,
        }
    }

    /// Wait for the consumer to come up (see module docs).
    pub fn handshake(&mut self) {
        handshake_producer(&self.ring);
    }

    /// Send one message, copying `payload` into the ring.
    ///
    /// Blocks while the ring is full. The slot is padded to a cache line
    /// multiple; the consumer sees the padded size.
    ///
    /// # Errors
    ///
    /// Returns error if the payload can never fit or waiting fails.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let offset = self.reserve(payload.len())?;
        self.ring.copy_into(offset, payload);
        self.commit()
    }

    /// Send one message of `len` bytes filled with `byte`, written in place.
    ///
    /// # Errors
    ///
    /// Returns error if the payload can never fit or waiting fails.
    pub fn send_filled(&mut self, len: usize, byte: u8) -> Result<()> {
        let offset = self.reserve(len)?;
        self.ring.fill(offset, len, byte);
        self.commit()
    }

    /// Publish any header write the wait strategy is holding back.
    ///
    /// # Errors
    ///
    /// Returns error if waking the consumer fails.
    pub fn flush(&mut self) -> Result<()> {
        self.wait.flush(&self.ring)
    }

    /// Wait for every outstanding acknowledgement, then publish end-of-stream.
    ///
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if waiting or waking fails.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        while self.first_unacked < self.next_tx {
            self.reclaim_one()?;
        }
        self.wait
            .publish_final(&self.ring, self.next_tx, FLAG_READY | FLAG_STOP)?;
        self.finished = true;
        log::debug!(
            "[RING] Producer finished at offset {}: {}",
            self.next_tx,
            self.wait.metrics().snapshot()
        );
        Ok(())
    }

    /// Bytes published but not yet acknowledged, headers included
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.next_tx - self.first_unacked
    }

    /// Logical offset of the next header to publish
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.next_tx
    }

    #[must_use]
    pub fn metrics(&self) -> &RingMetrics {
        self.wait.metrics()
    }

    #[must_use]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Wait for space for a `len` byte payload and clear the header after it.
    ///
    /// Returns the logical offset of the payload.
    fn reserve(&mut self, len: usize) -> Result<u64> {
        if self.finished {
            return Err(ShmError::InvalidConfig(
                "send after end-of-stream".to_string(),
            ));
        }
        let size = slot_size(&self.ring, len)?;
        let ring_size = self.ring.size() as u64;

        let eom = self.next_tx + (size + 2 * HEADER_SIZE) as u64;
        while eom - self.first_unacked > ring_size {
            self.reclaim_one()?;
        }

        let next = self.next_tx + (HEADER_SIZE + size) as u64;
        // The consumer never waits past the current header, so a plain
        // store cannot drop a WAITING bit here.
        self.ring.header(next).store(0, Ordering::Release);

        self.reserved = Some(size);
        Ok(self.next_tx + HEADER_SIZE as u64)
    }

    /// Publish the reserved slot and advance.
    fn commit(&mut self) -> Result<()> {
        let Some(size) = self.reserved.take() else {
            return Err(ShmError::InvalidConfig(
                "release without a reserved buffer".to_string(),
            ));
        };
        self.wait
            .set_header(&self.ring, self.next_tx, size as u32 | FLAG_READY)?;
        self.next_tx += (HEADER_SIZE + size) as u64;
        self.wait.metrics().inc_messages();
        Ok(())
    }

    /// Wait for the oldest outstanding message to be acknowledged.
    fn reclaim_one(&mut self) -> Result<()> {
        self.wait.metrics().inc_backpressure_waits();
        let value = self
            .wait
            .wait_for_header(&self.ring, self.first_unacked, HeaderState::Free)?;
        let size = header_size_of(value) as usize;
        if size + HEADER_SIZE > (self.next_tx - self.first_unacked) as usize {
            return Err(ShmError::CorruptHeader {
                offset: self.first_unacked,
                value,
            });
        }
        self.first_unacked += (HEADER_SIZE + size) as u64;
        Ok(())
    }
}

impl<W: WaitStrategy> WriteBuffers for Producer<W> {
    fn get_write_buffer(&mut self, len: usize) -> Result<IoSegments<'_>> {
        let offset = self.reserve(len)?;
        // SAFETY: [offset, offset + len) lies between next_tx and the cleared
        // next header; the consumer will not read it until commit() publishes
        // READY, and the returned slices borrow self mutably until then.
        Ok(unsafe { self.ring.io_segments(offset, len) })
    }

    fn release_write_buffer(&mut self, len: usize) -> Result<()> {
        match self.reserved {
            Some(size) if slot_size(&self.ring, len)? == size => self.commit(),
            Some(size) => Err(ShmError::SizeMismatch {
                expected: size,
                actual: len,
                offset: self.next_tx,
            }),
            None => self.commit(),
        }
    }
}

impl<W: WaitStrategy> Drop for Producer<W> {
    fn drop(&mut self) {
        if !self.finished && self.next_tx > 0 {
            log::warn!(
                "[RING] Producer dropped without end-of-stream ({} bytes in flight)",
                self.in_flight()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{FutexWait, SharedRegion, SpinWait};
    use std::sync::Arc;

    fn ring(size: usize) -> Ring {
        let region = Arc::new(SharedRegion::establish(1, None).expect("establish failed"));
        Ring::with_size(region, size).expect("ring")
    }

    fn load(ring: &Ring, offset: u64) -> u32 {
        ring.header(offset).load(Ordering::Acquire)
    }

    #[test]
    fn test_send_publishes_and_clears_next() {
        let r = ring(4096);
        r.header(192).store(0xdead_beef & !7, Ordering::Release);
        let mut tx = Producer::new(r.clone(), SpinWait::new());

        tx.send(&[1u8; 100]).expect("send");
        assert_eq!(load(&r, 0), 128 | FLAG_READY);
        assert_eq!(load(&r, 192), 0, "next header must be cleared");
        assert_eq!(tx.next_offset(), 192);
        assert_eq!(tx.in_flight(), 192);

        let mut payload = [0u8; 100];
        r.copy_from(64, &mut payload);
        assert!(payload.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_reclaims_acknowledged_space() {
        let r = ring(512);
        let mut tx = Producer::new(r.clone(), SpinWait::new());
        for _ in 0..3 {
            tx.send_filled(64, 0xAA).expect("send");
        }
        assert_eq!(tx.in_flight(), 384);

        // Consumer acknowledges the first message
        r.header(0).store(64, Ordering::Release);
        tx.send_filled(64, 0xBB).expect("send");
        assert_eq!(tx.in_flight(), 384);
        assert_eq!(load(&r, 384), 64 | FLAG_READY);
    }

    #[test]
    fn test_finish_publishes_stop() {
        let r = ring(4096);
        let mut tx = Producer::new(r.clone(), FutexWait::new());
        tx.send(&[3u8; 64]).expect("send");
        // Held by the deferred write until the drain flushes it
        assert_eq!(load(&r, 0), 0);

        // Acknowledge once it becomes visible; the producer may be
        // futex-blocked on the header, so the ack must wake it
        let r2 = r.clone();
        let acker = std::thread::spawn(move || {
            let mut w = FutexWait::with_batch(0);
            w.wait_for_header(&r2, 0, HeaderState::Ready).expect("wait");
            w.set_header(&r2, 0, 64).expect("ack");
        });

        tx.finish().expect("finish");
        acker.join().expect("Thread panicked");
        assert_eq!(load(&r, 128), FLAG_READY | FLAG_STOP);
        tx.finish().expect("finish is idempotent");
        assert!(tx.send(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut tx = Producer::new(ring(512), SpinWait::new());
        assert!(matches!(
            tx.send(&[0u8; 400]),
            Err(ShmError::InvalidMessageSize { .. })
        ));
    }

    #[test]
    fn test_write_buffer_wraps() {
        let r = ring(512);
        let mut tx = Producer::new(r.clone(), SpinWait::new());
        tx.send_filled(256, 0).expect("send");
        r.header(0).store(256, Ordering::Release);

        // Second payload starts at 384 and runs past the end of the ring
        let mut segs = tx.get_write_buffer(192).expect("buffer");
        assert_eq!(segs.count(), 2);
        segs.fill(0x11);
        tx.release_write_buffer(192).expect("release");
        assert_eq!(load(&r, 320), 192 | FLAG_READY);

        let mut out = [0u8; 192];
        r.copy_from(384, &mut out);
        assert!(out.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_release_size_mismatch() {
        let mut tx = Producer::new(ring(4096), SpinWait::new());
        let _ = tx.get_write_buffer(64).expect("buffer");
        assert!(matches!(
            tx.release_write_buffer(256),
            Err(ShmError::SizeMismatch { .. })
        ));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sending side of the extent transport.

use super::{
    protocol_error, ExtentRecord, FreeList, ECHO_SEQUENCE_START, RECORD_SIZE, SENDER_SEQUENCE_START,
};
use crate::buffers::WriteBuffers;
use crate::shm::{round_to_cache_line, IoSegments, Result, Ring, RingMetrics, ShmError};
use mio::unix::pipe;
use std::io::{self, Read, Write};

/// Parent endpoint: owns the arena allocator and the blocking pipe ends.
pub struct ExtentSender {
    ring: Ring,
    freelist: FreeList,
    /// Closed by `finish()` to signal end-of-stream
    tx: Option<pipe::Sender>,
    rx: pipe::Receiver,
    sequence: u32,
    expected_echo: u32,
    /// Extent handed out by `get_write_buffer` (base, slot size)
    reserved: Option<(u64, u64)>,
    metrics: RingMetrics,
}

impl ExtentSender {
    pub(super) fn new(ring: Ring, tx: pipe::Sender, rx: pipe::Receiver) -> Result<Self> {
        tx.set_nonblocking(false).map_err(ShmError::Pipe)?;
        rx.set_nonblocking(false).map_err(ShmError::Pipe)?;
        let freelist = FreeList::new(ring.size() as u64)?;
        Ok(Self {
            ring,
            freelist,
            tx: Some(tx),
            rx,
            sequence: SENDER_SEQUENCE_START,
            expected_echo: ECHO_SEQUENCE_START,
            reserved: None,
            metrics: RingMetrics::new(),
        })
    }

    /// Send one message, copying `payload` into the arena.
    ///
    /// # Errors
    ///
    /// Returns error if the payload can never fit or the pipes fail.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.get_write_buffer(payload.len())?.copy_from_slice(payload);
        self.release_write_buffer(payload.len())
    }

    /// Close the outgoing pipe and release every extent the receiver
    /// returns until it closes its side.
    ///
    /// Returns the number of extents reclaimed while draining.
    ///
    /// # Errors
    ///
    /// Returns error on a malformed return record.
    pub fn finish(&mut self) -> Result<usize> {
        drop(self.tx.take());
        let mut drained = 0;
        while self.reclaim_one()? {
            drained += 1;
        }
        if self.freelist.node_count() != 1 {
            log::warn!(
                "[EXTENT] Stream ended with extents outstanding: {:?}",
                self.freelist
            );
        }
        log::debug!(
            "[EXTENT] Sender finished, drained {drained}: {}",
            self.metrics.snapshot()
        );
        Ok(drained)
    }

    #[must_use]
    pub fn freelist(&self) -> &FreeList {
        &self.freelist
    }

    #[must_use]
    pub fn metrics(&self) -> &RingMetrics {
        &self.metrics
    }

    /// Block for one returned extent and release it.
    ///
    /// Returns `false` on a clean EOF.
    fn reclaim_one(&mut self) -> Result<bool> {
        let mut buf = [0u8; RECORD_SIZE];
        match self.rx.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return if self.tx.is_none() {
                    Ok(false)
                } else {
                    Err(ShmError::PeerClosed)
                };
            }
            Err(e) => return Err(ShmError::Pipe(e)),
        }

        let rec = ExtentRecord::decode(&buf);
        if rec.sequence != self.expected_echo {
            return Err(protocol_error(format!(
                "return sequence {:#x}, expected {:#x}",
                rec.sequence, self.expected_echo
            )));
        }
        self.expected_echo = self.expected_echo.wrapping_add(1);
        self.freelist
            .release(u64::from(rec.base), u64::from(rec.size))?;
        Ok(true)
    }
}

impl WriteBuffers for ExtentSender {
    fn get_write_buffer(&mut self, len: usize) -> Result<IoSegments<'_>> {
        if self.tx.is_none() {
            return Err(ShmError::InvalidConfig(
                "send after end-of-stream".to_string(),
            ));
        }
        let size = round_to_cache_line(len) as u64;
        if len == 0 || size > self.freelist.size() {
            return Err(ShmError::InvalidMessageSize {
                size: len,
                ring_size: self.ring.size(),
            });
        }

        let base = loop {
            if let Some(base) = self.freelist.allocate(size) {
                break base;
            }
            // Arena full: block until the receiver hands an extent back
            self.metrics.inc_backpressure_waits();
            if !self.reclaim_one()? {
                return Err(ShmError::PeerClosed);
            }
        };
        self.reserved = Some((base, size));

        let start = base as usize;
        // SAFETY: the free list handed out [base, base + size) exclusively;
        // the receiver only learns about it after release_write_buffer(), and
        // the slice borrows self mutably until then.
        Ok(unsafe { self.ring.io_range(start..start + len) })
    }

    fn release_write_buffer(&mut self, len: usize) -> Result<()> {
        let Some((base, size)) = self.reserved.take() else {
            return Err(ShmError::InvalidConfig(
                "release without a reserved buffer".to_string(),
            ));
        };
        if round_to_cache_line(len) as u64 != size {
            return Err(ShmError::SizeMismatch {
                expected: size as usize,
                actual: len,
                offset: base,
            });
        }
        let rec = ExtentRecord {
            base: base as u32,
            size: size as u32,
            sequence: self.sequence,
        };
        let tx = self.tx.as_mut().ok_or(ShmError::PeerClosed)?;
        tx.write_all(&rec.encode()).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe => ShmError::PeerClosed,
            _ => ShmError::Pipe(e),
        })?;
        self.sequence = self.sequence.wrapping_add(1);
        self.metrics.inc_messages();
        Ok(())
    }
}

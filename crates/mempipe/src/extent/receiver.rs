// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receiving side of the extent transport.
//!
//! Single-threaded `mio` loop. Each turn tries to read, then tries to
//! write; the loop only sleeps in `poll` once a turn made no progress in
//! either direction. Both registrations are edge-triggered, which is safe
//! because a turn only reports "no progress" after seeing `WouldBlock`.

use super::{
    protocol_error, ExtentRecord, ECHO_SEQUENCE_START, RECORD_SIZE, SENDER_SEQUENCE_START,
};
use crate::buffers::ReadBuffers;
use crate::shm::{round_to_cache_line, IoSegments, Result, Ring, RingMetrics, ShmError};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

const INCOMING: Token = Token(0);
const OUTGOING: Token = Token(1);

/// Bytes read from the pipe per `read` call
const READ_CHUNK: usize = 4096;

/// Child endpoint: validates incoming extents and echoes them back.
pub struct ExtentReceiver {
    ring: Ring,
    poll: Poll,
    events: Events,
    rx: pipe::Receiver,
    /// Closed once end-of-stream has been echoed
    tx: Option<pipe::Sender>,
    /// Bytes of a partially received record
    partial: Vec<u8>,
    incoming: VecDeque<ExtentRecord>,
    /// Encoded echoes not yet accepted by the pipe
    outgoing: VecDeque<u8>,
    expected_sequence: u32,
    echo_sequence: u32,
    current: Option<ExtentRecord>,
    eof: bool,
    metrics: RingMetrics,
}

impl ExtentReceiver {
    pub(super) fn new(ring: Ring, mut rx: pipe::Receiver, mut tx: pipe::Sender) -> Result<Self> {
        let poll = Poll::new().map_err(ShmError::Pipe)?;
        poll.registry()
            .register(&mut rx, INCOMING, Interest::READABLE)
            .map_err(ShmError::Pipe)?;
        poll.registry()
            .register(&mut tx, OUTGOING, Interest::WRITABLE)
            .map_err(ShmError::Pipe)?;
        Ok(Self {
            ring,
            poll,
            events: Events::with_capacity(8),
            rx,
            tx: Some(tx),
            partial: Vec::with_capacity(RECORD_SIZE),
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
            expected_sequence: SENDER_SEQUENCE_START,
            echo_sequence: ECHO_SEQUENCE_START,
            current: None,
            eof: false,
            metrics: RingMetrics::new(),
        })
    }

    /// Receive the next message into `dst`, resizing it to the extent size.
    ///
    /// Returns `None` once the sender closed its pipe.
    ///
    /// # Errors
    ///
    /// Returns error on a malformed record or pipe failure.
    pub fn recv(&mut self, dst: &mut Vec<u8>) -> Result<Option<usize>> {
        let Some(rec) = self.next_record(None)? else {
            return Ok(None);
        };
        let size = rec.size as usize;
        dst.resize(size, 0);
        // SAFETY: the extent is owned by this side until it is echoed below
        let segs = unsafe { self.ring.io_range(rec.base as usize..rec.end() as usize) };
        segs.copy_to_slice(dst);
        self.current = Some(rec);
        self.release_read_buffer()?;
        Ok(Some(size))
    }

    #[must_use]
    pub fn metrics(&self) -> &RingMetrics {
        &self.metrics
    }

    /// Echoes queued but not yet written
    #[must_use]
    pub fn pending_echo_bytes(&self) -> usize {
        self.outgoing.len()
    }

    /// Wait for the next record and validate it against the arena.
    fn next_record(&mut self, expected_size: Option<u64>) -> Result<Option<ExtentRecord>> {
        loop {
            if let Some(rec) = self.incoming.pop_front() {
                self.validate(&rec, expected_size)?;
                return Ok(Some(rec));
            }
            if self.eof {
                self.flush()?;
                self.close_echo_pipe();
                log::debug!(
                    "[EXTENT] Receiver reached end-of-stream: {}",
                    self.metrics.snapshot()
                );
                return Ok(None);
            }
            let read = self.try_read()?;
            let wrote = self.try_write()?;
            if !read && !wrote {
                self.wait()?;
            }
        }
    }

    fn validate(&mut self, rec: &ExtentRecord, expected_size: Option<u64>) -> Result<()> {
        if rec.sequence != self.expected_sequence {
            return Err(protocol_error(format!(
                "extent sequence {:#x}, expected {:#x}",
                rec.sequence, self.expected_sequence
            )));
        }
        self.expected_sequence = self.expected_sequence.wrapping_add(1);

        if rec.size == 0 || rec.end() > self.ring.size() as u64 {
            return Err(ShmError::BadExtent {
                offset: u64::from(rec.base),
                size: u64::from(rec.size),
            });
        }
        if let Some(expected) = expected_size {
            if u64::from(rec.size) != expected {
                return Err(ShmError::SizeMismatch {
                    expected: expected as usize,
                    actual: rec.size as usize,
                    offset: u64::from(rec.base),
                });
            }
        }
        Ok(())
    }

    /// Drain the incoming pipe until it would block.
    ///
    /// Returns whether any bytes (or EOF) arrived.
    fn try_read(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut progressed = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.rx.read(&mut chunk) {
                Ok(0) => {
                    if !self.partial.is_empty() {
                        return Err(ShmError::PeerClosed);
                    }
                    self.eof = true;
                    // Nothing more will arrive; keep poll quiet
                    self.poll
                        .registry()
                        .deregister(&mut self.rx)
                        .map_err(ShmError::Pipe)?;
                    return Ok(true);
                }
                Ok(n) => {
                    progressed = true;
                    self.push_bytes(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progressed),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ShmError::Pipe(e)),
            }
        }
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let take = (RECORD_SIZE - self.partial.len()).min(bytes.len());
            self.partial.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if let Ok(buf) = <[u8; RECORD_SIZE]>::try_from(self.partial.as_slice()) {
                self.incoming.push_back(ExtentRecord::decode(&buf));
                self.partial.clear();
            }
        }
    }

    /// Write queued echoes until the pipe would block.
    ///
    /// Returns whether any bytes were written.
    fn try_write(&mut self) -> Result<bool> {
        let mut progressed = false;
        while !self.outgoing.is_empty() {
            let Some(tx) = self.tx.as_mut() else {
                return Err(ShmError::PeerClosed);
            };
            let (head, _) = self.outgoing.as_slices();
            match tx.write(head) {
                Ok(0) => return Err(ShmError::PeerClosed),
                Ok(n) => {
                    progressed = true;
                    self.outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(ShmError::PeerClosed)
                }
                Err(e) => return Err(ShmError::Pipe(e)),
            }
        }
        Ok(progressed)
    }

    /// Block until every queued echo has been written.
    fn flush(&mut self) -> Result<()> {
        while !self.outgoing.is_empty() {
            if !self.try_write()? {
                self.wait()?;
            }
        }
        Ok(())
    }

    /// Let the sender's drain observe EOF
    fn close_echo_pipe(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            if let Err(e) = self.poll.registry().deregister(&mut tx) {
                log::warn!("[EXTENT] Failed to deregister echo pipe: {e}");
            }
        }
    }

    fn wait(&mut self) -> Result<()> {
        self.metrics.inc_wait_calls();
        match self.poll.poll(&mut self.events, None) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(ShmError::Pipe(e)),
        }
    }
}

impl ReadBuffers for ExtentReceiver {
    fn get_read_buffer(&mut self, len: usize) -> Result<Option<IoSegments<'_>>> {
        let expected = round_to_cache_line(len) as u64;
        let Some(rec) = self.next_record(Some(expected))? else {
            return Ok(None);
        };
        self.current = Some(rec);
        let start = rec.base as usize;
        // SAFETY: the sender does not reuse the extent until it is echoed by
        // release_read_buffer(); the slice borrows self mutably until then.
        Ok(Some(unsafe { self.ring.io_range(start..start + len) }))
    }

    fn release_read_buffer(&mut self) -> Result<()> {
        let Some(rec) = self.current.take() else {
            return Err(ShmError::InvalidConfig(
                "release without a current read buffer".to_string(),
            ));
        };
        let echo = ExtentRecord {
            sequence: self.echo_sequence,
            ..rec
        };
        self.echo_sequence = self.echo_sequence.wrapping_add(1);
        self.outgoing.extend(echo.encode());
        self.metrics.inc_messages();
        self.try_write()?;
        Ok(())
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-producer/single-consumer protocol engine over a [`Ring`].
//!
//! # Message Flow
//!
//! ```text
//! Producer                                   Consumer
//!   |  await space (header @ first_unacked)     |
//!   |  clear next header                        |
//!   |  write payload                            |
//!   |  set header = size | READY  ------------> |  await READY
//!   |                                           |  read payload
//!   |  <------------------------------------   |  set header = size (ack)
//!   |  ...                                      |
//!   |  await all acks                           |
//!   |  set header = READY | STOP  ------------> |  terminal
//! ```
//!
//! Both ends are generic over a [`WaitStrategy`]; the same engine drives
//! the spin and the futex variants.
//!
//! # Handshake
//!
//! Before the first message the consumer writes [`HANDSHAKE_SENTINEL`] into
//! header 0 and spins until it changes; the producer spins until it sees
//! the sentinel, then clears header 0. After this rendezvous both processes
//! are known to be running with the ring mapped.

mod consumer;
mod producer;

pub use consumer::{Consumer, Received};
pub use producer::Producer;

use crate::shm::{
    round_to_cache_line, Result, Ring, ShmError, WaitStrategy, HANDSHAKE_SENTINEL, HEADER_SIZE,
};
use std::sync::atomic::{AtomicU32, Ordering};

/// Spin iterations between scheduler yields during the handshake
const HANDSHAKE_YIELD_INTERVAL: u32 = 1024;

/// Create both ends of a channel over `ring`.
///
/// Intended to be called before `fork()`; each process then keeps the end
/// it needs and drops the other.
pub fn channel<W: WaitStrategy + Default>(ring: Ring) -> (Producer<W>, Consumer<W>) {
    let consumer = Consumer::new(ring.clone(), W::default());
    let producer = Producer::new(ring, W::default());
    (producer, consumer)
}

/// Bytes a payload of `len` occupies in the ring, checked against the ring.
///
/// A message must leave room for its own header plus the cleared header
/// that follows it.
pub(crate) fn slot_size(ring: &Ring, len: usize) -> Result<usize> {
    let size = round_to_cache_line(len);
    if size + 2 * HEADER_SIZE > ring.size() {
        return Err(ShmError::InvalidMessageSize {
            size: len,
            ring_size: ring.size(),
        });
    }
    Ok(size)
}

/// Spin (with periodic yields) until `done` accepts the header word
fn spin_until(word: &AtomicU32, done: impl Fn(u32) -> bool) {
    let mut spins: u32 = 0;
    while !done(word.load(Ordering::Acquire)) {
        spins = spins.wrapping_add(1);
        if spins % HANDSHAKE_YIELD_INTERVAL == 0 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Consumer half of the rendezvous
pub(crate) fn handshake_consumer(ring: &Ring) {
    let word = ring.header(0);
    word.store(HANDSHAKE_SENTINEL, Ordering::Release);
    spin_until(word, |v| v != HANDSHAKE_SENTINEL);
    log::debug!("[RING] Consumer handshake complete");
}

/// Producer half of the rendezvous
pub(crate) fn handshake_producer(ring: &Ring) {
    let word = ring.header(0);
    spin_until(word, |v| v == HANDSHAKE_SENTINEL);
    word.store(0, Ordering::Release);
    log::debug!("[RING] Producer handshake complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{SharedRegion, SpinWait};
    use std::sync::Arc;
    use std::thread;

    fn ring(size: usize) -> Ring {
        let region = Arc::new(SharedRegion::establish(1, None).expect("establish failed"));
        Ring::with_size(region, size).expect("ring")
    }

    #[test]
    fn test_slot_size_limits() {
        let r = ring(512);
        assert_eq!(slot_size(&r, 1).expect("fits"), 64);
        assert_eq!(slot_size(&r, 384).expect("fits"), 384);
        assert!(matches!(
            slot_size(&r, 385),
            Err(ShmError::InvalidMessageSize {
                size: 385,
                ring_size: 512
            })
        ));
    }

    #[test]
    fn test_handshake_rendezvous() {
        let r = ring(4096);
        let r2 = r.clone();
        let handle = thread::spawn(move || handshake_consumer(&r2));
        handshake_producer(&r);
        handle.join().expect("Thread panicked");
        assert_eq!(r.header(0).load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_channel_pair_shares_ring() {
        let (mut tx, mut rx) = channel::<SpinWait>(ring(4096));
        let handle = thread::spawn(move || {
            tx.handshake();
            tx.send(&[7u8; 64]).expect("send");
            tx.finish().expect("finish");
        });
        rx.handshake();
        let mut buf = Vec::new();
        assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Message(64));
        assert!(buf.iter().all(|&b| b == 7));
        assert_eq!(rx.recv(&mut buf).expect("recv"), Received::Stop);
        handle.join().expect("Thread panicked");
    }
}

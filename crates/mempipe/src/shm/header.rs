// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message header word and flag protocol.
//!
//! Every message in the ring is preceded by a cache-line sized header. Only
//! the first 32-bit word carries meaning; the remaining 60 bytes keep the
//! next payload off the header's cache line.
//!
//! # Memory Layout
//!
//! ```text
//! Offset  Size   Field
//! 0       4      size_and_flags (AtomicU32)
//! 4       60     padding
//! 64      size   payload (multiple of 64, may wrap)
//! ```
//!
//! # Flag Encoding
//!
//! Payload sizes are multiples of 64, so the low bits are free for flags:
//!
//! - `READY`   (bit 0): payload is valid and unread
//! - `STOP`    (bit 1): end-of-stream marker, no payload
//! - `WAITING` (bit 2): somebody is futex-blocked on this word
//!
//! A consumer acknowledges a message by writing the size back without
//! `READY`; the producer reads that size to advance its unacked cursor.
//!
//! # Memory Ordering Strategy
//!
//! - **Release** on every header store: payload bytes written before the
//!   store are visible to whoever observes the new header value.
//! - **Acquire** on every header load: payload reads cannot be hoisted above
//!   the load that proved the payload valid.
//! - `AcqRel` on exchange/CAS, since they both publish and observe.

use std::sync::atomic::{AtomicU32, Ordering};

/// Payload is valid and unread
pub const FLAG_READY: u32 = 1;

/// End-of-stream marker
pub const FLAG_STOP: u32 = 2;

/// A thread is futex-blocked on this word
pub const FLAG_WAITING: u32 = 4;

/// All flag bits
pub const FLAGS_MASK: u32 = FLAG_READY | FLAG_STOP | FLAG_WAITING;

/// Rendezvous value written into the first header by the consumer.
///
/// `0xf008` has `READY` clear and is not a multiple of 64, so it can never be
/// mistaken for a message or an acknowledgement.
pub const HANDSHAKE_SENTINEL: u32 = 0xf008;

/// Which value of the `READY` bit a waiter is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// Wait for the producer to publish (consumer side).
    ///
    /// Any header carrying `STOP` also ends the wait, so that a malformed
    /// `STOP` without `READY` is reported instead of blocking forever.
    Ready,
    /// Wait for the consumer to acknowledge (producer side)
    Free,
}

impl HeaderState {
    /// Whether a header value is in this state
    #[inline]
    #[must_use]
    pub fn matches(self, value: u32) -> bool {
        match self {
            Self::Ready => value & (FLAG_READY | FLAG_STOP) != 0,
            Self::Free => value & FLAG_READY == 0,
        }
    }
}

/// Compare-and-swap on a header word.
///
/// Returns the value observed before the operation; the swap happened iff
/// the returned value equals `old`.
#[inline]
pub fn atomic_cmpxchg(word: &AtomicU32, old: u32, new: u32) -> u32 {
    match word.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(prev) | Err(prev) => prev,
    }
}

/// Unconditional exchange on a header word, returning the previous value.
///
/// Used to publish a header and learn, in the same atomic step, whether a
/// waiter announced itself with `WAITING` in between.
#[inline]
pub fn atomic_xchg(word: &AtomicU32, new: u32) -> u32 {
    word.swap(new, Ordering::AcqRel)
}

/// Payload size encoded in a header value
#[inline]
#[must_use]
pub const fn header_size_of(value: u32) -> u32 {
    value & !FLAGS_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_disjoint_from_sizes() {
        for size in (0..16u32).map(|n| n * 64) {
            assert_eq!(size & FLAGS_MASK, 0);
            assert_eq!(header_size_of(size | FLAG_READY | FLAG_WAITING), size);
        }
    }

    #[test]
    fn test_sentinel_is_not_a_message() {
        assert!(HeaderState::Free.matches(HANDSHAKE_SENTINEL));
        assert_ne!(header_size_of(HANDSHAKE_SENTINEL) % 64, 0);
    }

    #[test]
    fn test_header_state_matches() {
        assert!(HeaderState::Ready.matches(128 | FLAG_READY));
        assert!(HeaderState::Ready.matches(FLAG_READY | FLAG_STOP));
        assert!(!HeaderState::Ready.matches(128 | FLAG_WAITING));
        assert!(HeaderState::Ready.matches(FLAG_STOP | FLAG_WAITING));
        assert!(HeaderState::Free.matches(128));
        assert!(HeaderState::Free.matches(0));
        assert!(!HeaderState::Free.matches(128 | FLAG_READY | FLAG_WAITING));
    }

    #[test]
    fn test_cmpxchg() {
        let word = AtomicU32::new(128);
        assert_eq!(atomic_cmpxchg(&word, 128, 128 | FLAG_WAITING), 128);
        assert_eq!(word.load(Ordering::Relaxed), 128 | FLAG_WAITING);

        // Stale expectation: no swap, current value returned
        assert_eq!(atomic_cmpxchg(&word, 128, 0), 128 | FLAG_WAITING);
        assert_eq!(word.load(Ordering::Relaxed), 128 | FLAG_WAITING);
    }

    #[test]
    fn test_xchg_reports_waiter() {
        let word = AtomicU32::new(FLAG_WAITING);
        let prev = atomic_xchg(&word, 64 | FLAG_READY);
        assert_ne!(prev & FLAG_WAITING, 0);
        assert_eq!(word.load(Ordering::Relaxed), 64 | FLAG_READY);
    }
}

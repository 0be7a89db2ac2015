// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper for inter-process header waits.
//!
//! # CRITICAL: SHARED vs PRIVATE
//!
//! The header words live in a `MAP_SHARED` mapping that two processes see at
//! possibly different virtual addresses. Only the shared `FUTEX_WAIT` (0) and
//! `FUTEX_WAKE` (1) ops key on the physical page; the `_PRIVATE` variants
//! (128/129) would silently never wake the peer.

use super::{Result, ShmError};
use std::io;
use std::ptr;
use std::sync::atomic::AtomicU32;

/// Futex operation codes (SHARED, not PRIVATE!)
const FUTEX_WAIT: i32 = 0;
const FUTEX_WAKE: i32 = 1;

/// Block while the word at `addr` still holds `expected`.
///
/// Returns `Ok(())` on wake, on a spurious return, and when the value had
/// already changed before the kernel could queue us (`EAGAIN`). Callers must
/// re-check their condition in a loop: one return is not one state change.
///
/// # Errors
///
/// Any errno other than `EAGAIN`/`EINTR` is reported as [`ShmError::Futex`].
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32) -> Result<()> {
    // SAFETY:
    // - addr is a valid, 4-byte aligned AtomicU32 for the duration of the call
    // - timeout, uaddr2 and val3 are unused by FUTEX_WAIT with a null timeout
    // - Using FUTEX_WAIT (0), NOT FUTEX_WAIT_PRIVATE (128)
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {}
            _ => return Err(ShmError::Futex(err)),
        }
    }
    Ok(())
}

/// Wake at most one waiter blocked on `addr`.
///
/// Returns the number of waiters woken (0 or 1).
///
/// # Errors
///
/// Syscall failure is reported as [`ShmError::Futex`].
#[cfg(target_os = "linux")]
pub fn futex_wake_one(addr: &AtomicU32) -> Result<usize> {
    // SAFETY:
    // - addr is a valid AtomicU32; the kernel only uses it as a key
    // - Using FUTEX_WAKE (1), NOT FUTEX_WAKE_PRIVATE (129)
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            1i32,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        )
    };
    if ret < 0 {
        return Err(ShmError::Futex(io::Error::last_os_error()));
    }
    Ok(ret as usize)
}

// Non-Linux fallback (short sleep, for testing only)
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(addr: &AtomicU32, expected: u32) -> Result<()> {
    if addr.load(std::sync::atomic::Ordering::Acquire) == expected {
        std::thread::sleep(std::time::Duration::from_micros(50));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake_one(_addr: &AtomicU32) -> Result<usize> {
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_futex_wake_without_waiters() {
        let val = AtomicU32::new(0);
        let woken = futex_wake_one(&val).expect("wake failed");
        assert_eq!(woken, 0);
    }

    #[test]
    fn test_futex_wait_value_mismatch() {
        // Value already changed: must return immediately and successfully
        let val = AtomicU32::new(42);
        futex_wait(&val, 0).expect("EAGAIN must not be an error");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_futex_wake_waiter() {
        let val = Arc::new(AtomicU32::new(0));
        let val_clone = Arc::clone(&val);

        let handle = thread::spawn(move || {
            while val_clone.load(Ordering::Acquire) == 0 {
                futex_wait(&val_clone, 0).expect("wait failed");
            }
            val_clone.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));

        val.store(42, Ordering::Release);
        futex_wake_one(&val).expect("wake failed");

        let result = handle.join().expect("Thread panicked");
        assert_eq!(result, 42);
    }
}

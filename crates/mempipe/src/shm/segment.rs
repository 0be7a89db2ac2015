// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Anonymous POSIX shared memory region.
//!
//! Wraps `shm_open`, `ftruncate`, `mmap` and `shm_unlink` to produce a
//! page-aligned `MAP_SHARED` mapping whose name disappears from `/dev/shm`
//! before this function returns. The object is reclaimed by the kernel once
//! every process that inherited the mapping has unmapped it.
//!
//! # Segment Lifecycle
//!
//! 1. Parent calls [`SharedRegion::establish`] (optionally NUMA-bound)
//! 2. Parent forks; the child inherits the same mapping
//! 3. Each process unmaps its copy on drop
//!
//! Establishing after `fork()` gives each process a private object and the
//! two sides will never see each other's writes.

use super::{Result, ShmError, PAGE_SIZE};
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Disambiguates concurrent `establish` calls within one process
static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

const MPOL_BIND: libc::c_int = 2;
const MPOL_MF_STRICT: libc::c_uint = 1;
const MPOL_MF_MOVE: libc::c_uint = 2;

/// Process-shared memory region.
///
/// Automatically unmaps the memory region on drop. There is no name to
/// unlink: the backing object was unlinked at creation time.
pub struct SharedRegion {
    /// Pointer to mapped memory region (page aligned)
    ptr: *mut u8,
    /// Size of the mapping in bytes
    len: usize,
}

// SAFETY: SharedRegion points to shared memory that is accessed from
// multiple threads/processes. All cross-party state inside it is either an
// atomic header word or a byte range owned by exactly one side at a time
// under the header protocol.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Establish a shared region of `nr_pages * PAGE_SIZE` bytes.
    ///
    /// Must be called before `fork()`: both parent and child then map the
    /// same underlying object and observe each other's writes.
    ///
    /// # Arguments
    ///
    /// * `nr_pages` - Number of 4 KiB pages (must be non-zero)
    /// * `numa_node` - Optional NUMA node to bind the physical pages to
    ///
    /// # Errors
    ///
    /// Returns error if the object cannot be created, sized, mapped, or bound.
    /// The harness treats every one of these as fatal.
    pub fn establish(nr_pages: usize, numa_node: Option<u32>) -> Result<Self> {
        if nr_pages == 0 {
            return Err(ShmError::InvalidConfig(
                "shared region needs at least one page".to_string(),
            ));
        }
        let len = nr_pages
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| ShmError::InvalidConfig(format!("{nr_pages} pages overflow")))?;

        let name = format!(
            "/mempipe_{}_{}",
            std::process::id(),
            SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let c_name = CString::new(name.as_str())
            .map_err(|_| ShmError::InvalidConfig(format!("bad segment name {name}")))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - O_CREAT|O_EXCL|O_RDWR creates a fresh object or fails
        // - shm_open returns a valid fd on success or -1 on error (checked below)
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // Drop the name right away; the open fd keeps the object alive.
        // SAFETY: c_name is valid; unlinking only affects the namespace.
        unsafe { libc::shm_unlink(c_name.as_ptr()) };

        // SAFETY: fd is valid from the successful shm_open above
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and never used again
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        // SAFETY:
        // - Null hint lets the kernel choose a page-aligned address
        // - len matches the ftruncate'd object size
        // - MAP_SHARED makes writes visible to every process mapping the object
        // - mmap returns MAP_FAILED on error (checked below)
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        // Close fd (mapping keeps reference)
        // SAFETY: fd is valid; the mapping (if any) holds its own reference
        unsafe { libc::close(fd) };

        if addr == libc::MAP_FAILED {
            return Err(ShmError::Mmap(io::Error::last_os_error()));
        }

        // Freshly truncated shm pages read as zero, so headers start cleared.
        let region = Self {
            ptr: addr as *mut u8,
            len,
        };

        if let Some(node) = numa_node {
            region.bind_numa_node(node)?;
        }

        log::debug!(
            "[SHM] Established {} page region ({} bytes){}",
            nr_pages,
            len,
            numa_node.map_or(String::new(), |n| format!(" on NUMA node {n}"))
        );

        Ok(region)
    }

    #[cfg(target_os = "linux")]
    fn bind_numa_node(&self, node: u32) -> Result<()> {
        let (nodemask, maxnode) = numa_nodemask(node)?;

        // SAFETY:
        // - self.ptr/self.len describe a live mapping owned by self
        // - nodemask is a valid single-word bitmap; maxnode - 1 bits are read
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                self.ptr as *mut libc::c_void,
                self.len as libc::c_ulong,
                MPOL_BIND,
                &nodemask as *const libc::c_ulong,
                maxnode,
                MPOL_MF_STRICT | MPOL_MF_MOVE,
            )
        };
        if ret < 0 {
            return Err(ShmError::NumaBind {
                node,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn bind_numa_node(&self, node: u32) -> Result<()> {
        Err(ShmError::NumaBind {
            node,
            source: io::Error::from(io::ErrorKind::Unsupported),
        })
    }

    /// Get raw pointer to the mapped memory
    #[inline]
    #[must_use]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// A region always holds at least one page
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages in the mapping
    #[inline]
    #[must_use]
    pub fn pages(&self) -> usize {
        self.len / PAGE_SIZE
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - self.ptr/self.len come from the successful mmap in establish()
        // - Drop runs once, so the region is unmapped exactly once
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Single-word `mbind` node mask selecting `node`, and the matching
/// `maxnode` argument.
///
/// The kernel reads `maxnode - 1` bits, so a full word needs `BITS + 1`.
#[cfg(target_os = "linux")]
fn numa_nodemask(node: u32) -> Result<(libc::c_ulong, libc::c_ulong)> {
    let bits = libc::c_ulong::BITS;
    if node >= bits {
        return Err(ShmError::InvalidConfig(format!(
            "NUMA node {node} out of range (max {})",
            bits - 1
        )));
    }
    Ok((1 << node, libc::c_ulong::from(bits + 1)))
}

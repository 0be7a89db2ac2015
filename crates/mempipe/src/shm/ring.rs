// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wraparound-aware view of the shared region.
//!
//! Logical offsets grow without bound; the physical position of a logical
//! offset is `offset & (ring_size - 1)`. A byte range whose physical start
//! plus length runs past the end of the ring is split into exactly two
//! pieces:
//!
//! ```text
//!  0                                   phys          ring_size
//!  +-----------+-----------------------+-------------+
//!  | tail part |                       | head part   |
//!  +-----------+-----------------------+-------------+
//!   [0, phys + len - ring_size)         [phys, ring_size)
//! ```
//!
//! Headers are cache-line aligned inside a ring whose size is a multiple of
//! the cache line, so a header never straddles the boundary; only payloads
//! wrap.

use super::segment::SharedRegion;
use super::{Result, ShmError, CACHE_LINE_SIZE, HEADER_SIZE};
use std::ops::Range;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Physical byte ranges covered by a logical range (1 or 2 pieces)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSegments {
    /// Range starting at the physical position of the logical offset
    pub first: Range<usize>,
    /// Wrapped remainder starting at physical 0, if any
    pub second: Option<Range<usize>>,
}

impl RingSegments {
    /// Number of discontiguous pieces (1 or 2)
    #[must_use]
    pub fn count(&self) -> usize {
        1 + usize::from(self.second.is_some())
    }

    /// Total length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.first.len() + self.second.as_ref().map_or(0, Range::len)
    }

    /// Whether the range is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scatter/gather view of a message payload inside shared memory.
///
/// Always one or two contiguous slices; the second is empty unless the
/// payload straddles the ring boundary.
#[derive(Debug)]
pub struct IoSegments<'a> {
    first: &'a mut [u8],
    second: &'a mut [u8],
}

impl<'a> IoSegments<'a> {
    /// Wrap a single contiguous slice
    #[must_use]
    pub fn single(first: &'a mut [u8]) -> Self {
        Self {
            first,
            second: Default::default(),
        }
    }

    /// Number of discontiguous segments (1 or 2)
    #[must_use]
    pub fn count(&self) -> usize {
        if self.second.is_empty() {
            1
        } else {
            2
        }
    }

    /// Total length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    /// Whether there are no bytes at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the non-empty segments
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        [&*self.first, &*self.second]
            .into_iter()
            .filter(|s| !s.is_empty())
    }

    /// Iterate mutably over the non-empty segments
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        [&mut *self.first, &mut *self.second]
            .into_iter()
            .filter(|s| !s.is_empty())
    }

    /// Scatter `src` across the segments.
    ///
    /// # Panics
    ///
    /// Panics if `src.len()` differs from [`Self::len`].
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.len(), "source length mismatch");
        let (head, tail) = src.split_at(self.first.len());
        self.first.copy_from_slice(head);
        self.second.copy_from_slice(tail);
    }

    /// Gather the segments into `dst`.
    ///
    /// # Panics
    ///
    /// Panics if `dst.len()` differs from [`Self::len`].
    pub fn copy_to_slice(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.len(), "destination length mismatch");
        let (head, tail) = dst.split_at_mut(self.first.len());
        head.copy_from_slice(self.first);
        tail.copy_from_slice(self.second);
    }

    /// Fill every byte with `byte`
    pub fn fill(&mut self, byte: u8) {
        self.first.fill(byte);
        self.second.fill(byte);
    }
}

/// Circular buffer over a [`SharedRegion`].
///
/// Cheap to clone: clones share the same mapping.
#[derive(Clone)]
pub struct Ring {
    /// Backing shared memory (kept alive by every clone)
    region: Arc<SharedRegion>,
    /// Ring size in bytes (power of 2)
    size: usize,
    /// `size - 1`, for index masking
    mask: u64,
}

impl Ring {
    /// Use the whole region as the ring.
    ///
    /// # Errors
    ///
    /// Returns error if the region size is not a power of two.
    pub fn new(region: Arc<SharedRegion>) -> Result<Self> {
        let size = region.len();
        Self::with_size(region, size)
    }

    /// Use the first `size` bytes of the region as the ring.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidRingSize`] unless `size` is a power of two,
    /// a multiple of the cache line, large enough for two headers, and no
    /// larger than the region.
    pub fn with_size(region: Arc<SharedRegion>, size: usize) -> Result<Self> {
        if !size.is_power_of_two()
            || size % CACHE_LINE_SIZE != 0
            || size < 2 * HEADER_SIZE
            || size > region.len()
            || size > u32::MAX as usize
        {
            return Err(ShmError::InvalidRingSize(size));
        }
        Ok(Self {
            region,
            size,
            mask: (size - 1) as u64,
        })
    }

    /// Ring size in bytes
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Physical position of a logical offset
    #[inline]
    #[must_use]
    pub fn mask_index(&self, offset: u64) -> usize {
        (offset & self.mask) as usize
    }

    /// Header word of the slot starting at logical `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not cache-line aligned.
    #[inline]
    #[must_use]
    pub fn header(&self, offset: u64) -> &AtomicU32 {
        let phys = self.mask_index(offset);
        assert_eq!(phys % CACHE_LINE_SIZE, 0, "unaligned header offset {offset}");
        // SAFETY:
        // - phys < size <= region.len(), so the 4 bytes are inside the mapping
        // - phys is 64-byte aligned and the mapping is page aligned, so the
        //   AtomicU32 is properly aligned
        // - Header words are only ever accessed atomically
        // - The reference is tied to &self, which keeps the mapping alive
        unsafe { &*(self.region.as_ptr().add(phys) as *const AtomicU32) }
    }

    /// Split a logical byte range into its physical pieces.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the ring size.
    #[must_use]
    pub fn segments(&self, offset: u64, len: usize) -> RingSegments {
        assert!(len <= self.size, "range of {len} bytes exceeds ring");
        let phys = self.mask_index(offset);
        if phys + len <= self.size {
            RingSegments {
                first: phys..phys + len,
                second: None,
            }
        } else {
            RingSegments {
                first: phys..self.size,
                second: Some(0..phys + len - self.size),
            }
        }
    }

    /// Copy `src` into the ring at logical `offset`, wrapping if needed
    pub fn copy_into(&self, offset: u64, src: &[u8]) {
        let segs = self.segments(offset, src.len());
        let (head, tail) = src.split_at(segs.first.len());
        // SAFETY:
        // - Both ranges lie inside [0, size) and therefore inside the mapping
        // - The header protocol gives the caller exclusive ownership of these
        //   bytes until the covering header is published
        // - src is caller memory and cannot overlap the shared mapping
        unsafe {
            let base = self.region.as_ptr();
            ptr::copy_nonoverlapping(head.as_ptr(), base.add(segs.first.start), head.len());
            if let Some(second) = segs.second {
                ptr::copy_nonoverlapping(tail.as_ptr(), base.add(second.start), tail.len());
            }
        }
    }

    /// Copy out of the ring at logical `offset` into `dst`, wrapping if needed
    pub fn copy_from(&self, offset: u64, dst: &mut [u8]) {
        let segs = self.segments(offset, dst.len());
        let split = segs.first.len();
        let (head, tail) = dst.split_at_mut(split);
        // SAFETY:
        // - Both ranges lie inside [0, size) and therefore inside the mapping
        // - The caller observed the covering header as READY (Acquire), so
        //   the producer no longer writes these bytes
        // - dst is caller memory and cannot overlap the shared mapping
        unsafe {
            let base = self.region.as_ptr();
            ptr::copy_nonoverlapping(base.add(segs.first.start), head.as_mut_ptr(), head.len());
            if let Some(second) = segs.second {
                ptr::copy_nonoverlapping(base.add(second.start), tail.as_mut_ptr(), tail.len());
            }
        }
    }

    /// Fill `len` bytes at logical `offset` with `byte`, wrapping if needed
    pub fn fill(&self, offset: u64, len: usize, byte: u8) {
        let segs = self.segments(offset, len);
        // SAFETY: same ownership argument as copy_into()
        unsafe {
            let base = self.region.as_ptr();
            ptr::write_bytes(base.add(segs.first.start), byte, segs.first.len());
            if let Some(second) = segs.second {
                ptr::write_bytes(base.add(second.start), byte, second.len());
            }
        }
    }

    /// Borrow a logical range as scatter/gather slices.
    ///
    /// # Safety
    ///
    /// The caller must own the range under the header protocol for the whole
    /// lifetime of the returned slices, and must not create another view of
    /// any overlapping range in the meantime.
    pub(crate) unsafe fn io_segments(&self, offset: u64, len: usize) -> IoSegments<'_> {
        let segs = self.segments(offset, len);
        self.slices_for(segs)
    }

    /// Borrow an arbitrary physical range (no wraparound) as one slice.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::io_segments`]; `range` must lie inside the
    /// ring.
    pub(crate) unsafe fn io_range(&self, range: Range<usize>) -> IoSegments<'_> {
        assert!(range.end <= self.size, "range {range:?} exceeds ring");
        self.slices_for(RingSegments {
            first: range,
            second: None,
        })
    }

    unsafe fn slices_for(&self, segs: RingSegments) -> IoSegments<'_> {
        let base = self.region.as_ptr();
        let first = std::slice::from_raw_parts_mut(base.add(segs.first.start), segs.first.len());
        let second = match segs.second {
            Some(r) => std::slice::from_raw_parts_mut(base.add(r.start), r.len()),
            None => Default::default(),
        };
        IoSegments { first, second }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring").field("size", &self.size).finish()
    }
}

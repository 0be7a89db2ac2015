// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! First-fit extent allocator over a fixed arena.
//!
//! The arena `[0, size)` is covered by an ordered, doubly-linked list of
//! extents that alternate between free and allocated. Adjacent extents in
//! the same state are always merged, so the list is never longer than it
//! has to be.
//!
//! The sender releases extents in roughly the order it allocated them, so
//! the live allocations form one region sliding around the arena:
//!
//! ```text
//!  steady state          after wrapping to the front
//!  +----+======+-----+   +===+-----+=======+
//!  |free| used | free|   |use| free|  used |
//!  +----+======+-----+   +===+-----+=======+
//! ```
//!
//! Two cached handles make that pattern O(1):
//!
//! - `next_free_alloc`: the free extent the last allocation carved from
//! - `last_freed`: the free extent produced by the last release; the next
//!   FIFO release starts exactly at its end
//!
//! Anything else falls back to a linear scan from the head.
//!
//! Under FIFO release the list stays at most three extents long when the
//! allocation size divides the arena. Otherwise the unusable tail left by
//! the last fit acts as a second free hole while the front is reused, and
//! the list peaks at four:
//!
//! ```text
//!  +===+-----+=======+----+
//!  |use| free|  used |tail|
//!  +===+-----+=======+----+
//! ```

use super::arena::{Arena, NodeId};
use crate::shm::{Result, ShmError};

#[derive(Debug, Clone, Copy)]
struct Node {
    start: u64,
    end: u64,
    is_free: bool,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl Node {
    fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// One entry of the extent list, as reported by [`FreeList::extents`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub end: u64,
    pub is_free: bool,
}

/// Extent allocator (see module docs).
pub struct FreeList {
    nodes: Arena<Node>,
    head: NodeId,
    size: u64,
    next_free_alloc: Option<NodeId>,
    last_freed: Option<NodeId>,
}

impl FreeList {
    /// Create an allocator over `[0, size)`, entirely free.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidConfig`] for an empty arena.
    pub fn new(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(ShmError::InvalidConfig(
                "free list arena must not be empty".to_string(),
            ));
        }
        let mut nodes = Arena::new();
        let head = nodes.insert(Node {
            start: 0,
            end: size,
            is_free: true,
            prev: None,
            next: None,
        });
        log::debug!("[FREELIST] Created arena of {size} bytes");
        Ok(Self {
            nodes,
            head,
            size,
            next_free_alloc: Some(head),
            last_freed: None,
        })
    }

    /// Arena size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of extents in the list
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total free bytes
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.extents()
            .filter(|e| e.is_free)
            .map(|e| e.end - e.start)
            .sum()
    }

    /// Walk the list from the head
    pub fn extents(&self) -> impl Iterator<Item = Extent> + '_ {
        std::iter::successors(self.nodes.get(self.head), |n| {
            n.next.and_then(|id| self.nodes.get(id))
        })
        .map(|n| Extent {
            start: n.start,
            end: n.end,
            is_free: n.is_free,
        })
    }

    /// Allocate `size` bytes, first fit.
    ///
    /// Returns the offset of the extent, or `None` when no free extent is
    /// large enough (FULL).
    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        if size == 0 || size > self.size {
            return None;
        }

        let id = match self.cached_free(self.next_free_alloc) {
            Some(id) if self.node(id).len() >= size => id,
            _ => self.scan(|n| n.is_free && n.len() >= size)?,
        };

        let start = self.node(id).start;
        let used = self.mark(id, start, start + size, false);
        let remainder = self.node(used).next.filter(|&n| self.node(n).is_free);
        self.next_free_alloc = remainder;
        self.scrub_caches();
        Some(start)
    }

    /// Return `[offset, offset + size)` to the free pool.
    ///
    /// The range may be any sub-range of a single allocated extent.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::BadExtent`] if the range is empty, leaves the
    /// arena, or is not entirely inside one allocated extent.
    pub fn release(&mut self, offset: u64, size: u64) -> Result<()> {
        let bad = ShmError::BadExtent { offset, size };
        let end = match offset.checked_add(size) {
            Some(end) if size > 0 && end <= self.size => end,
            _ => return Err(bad),
        };

        let fast = self
            .cached_free(self.last_freed)
            .filter(|&id| self.node(id).end == offset)
            .and_then(|id| self.node(id).next);
        let id = match fast {
            Some(id) => id,
            None => self
                .scan(|n| n.start <= offset && offset < n.end)
                .ok_or(bad)?,
        };

        let node = self.node(id);
        if node.is_free || end > node.end {
            return Err(ShmError::BadExtent { offset, size });
        }

        let freed = self.mark(id, offset, end, true);
        self.last_freed = Some(freed);
        if self.cached_free(self.next_free_alloc).is_none() {
            self.next_free_alloc = Some(freed);
        }
        self.scrub_caches();
        Ok(())
    }

    /// Verify the structural invariants, describing the first violation.
    ///
    /// # Errors
    ///
    /// Returns a description of the broken invariant.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut expected_start = 0;
        let mut prev: Option<(NodeId, bool)> = None;
        let mut count = 0;
        let mut cursor = Some(self.head);

        while let Some(id) = cursor {
            let node = self
                .nodes
                .get(id)
                .ok_or_else(|| format!("dangling link {id:?}"))?;
            count += 1;
            if node.start != expected_start {
                return Err(format!("gap or overlap at {}", node.start));
            }
            if node.start >= node.end {
                return Err(format!("empty extent at {}", node.start));
            }
            if node.prev != prev.map(|(p, _)| p) {
                return Err(format!("broken back link at {}", node.start));
            }
            if let Some((_, prev_free)) = prev {
                if prev_free == node.is_free {
                    return Err(format!("unmerged neighbours at {}", node.start));
                }
            }
            expected_start = node.end;
            prev = Some((id, node.is_free));
            cursor = node.next;
        }

        if expected_start != self.size {
            return Err(format!("list ends at {expected_start}, arena is {}", self.size));
        }
        if count != self.nodes.len() {
            return Err(format!("{} nodes unreachable", self.nodes.len() - count));
        }
        for (name, cache) in [
            ("next_free_alloc", self.next_free_alloc),
            ("last_freed", self.last_freed),
        ] {
            if let Some(id) = cache {
                if self.cached_free(Some(id)).is_none() {
                    return Err(format!("{name} does not point at a free extent"));
                }
            }
        }
        Ok(())
    }

    fn node(&self, id: NodeId) -> Node {
        match self.nodes.get(id) {
            Some(node) => *node,
            None => unreachable!("free list link to a removed node"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(node) => node,
            None => unreachable!("free list link to a removed node"),
        }
    }

    /// A cached handle, if it still names a live free extent
    fn cached_free(&self, cache: Option<NodeId>) -> Option<NodeId> {
        cache.filter(|&id| self.nodes.get(id).is_some_and(|n| n.is_free))
    }

    fn scrub_caches(&mut self) {
        self.next_free_alloc = self.cached_free(self.next_free_alloc);
        self.last_freed = self.cached_free(self.last_freed);
    }

    fn scan(&self, pred: impl Fn(&Node) -> bool) -> Option<NodeId> {
        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            let node = self.node(id);
            if pred(&node) {
                return Some(id);
            }
            cursor = node.next;
        }
        None
    }

    /// Set `[start, end)`, which lies inside extent `id`, to `free`.
    ///
    /// Splits `id` where the range does not reach its edges, then merges
    /// the result with same-state neighbours. Returns the extent that now
    /// covers the range.
    fn mark(&mut self, id: NodeId, start: u64, end: u64, free: bool) -> NodeId {
        let node = self.node(id);
        debug_assert!(node.start <= start && end <= node.end && node.is_free != free);

        if node.start < start {
            let front = self.nodes.insert(Node {
                start: node.start,
                end: start,
                is_free: node.is_free,
                prev: node.prev,
                next: Some(id),
            });
            match node.prev {
                Some(p) => self.node_mut(p).next = Some(front),
                None => self.head = front,
            }
            let n = self.node_mut(id);
            n.prev = Some(front);
            n.start = start;
        }
        if end < node.end {
            let back = self.nodes.insert(Node {
                start: end,
                end: node.end,
                is_free: node.is_free,
                prev: Some(id),
                next: node.next,
            });
            if let Some(n) = node.next {
                self.node_mut(n).prev = Some(back);
            }
            let n = self.node_mut(id);
            n.next = Some(back);
            n.end = end;
        }
        self.node_mut(id).is_free = free;

        let id = self.merge_into_prev(id);
        self.absorb_next(id);
        id
    }

    /// Fold `id` into its predecessor if they share a state
    fn merge_into_prev(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id);
        let Some(prev) = node.prev else {
            return id;
        };
        if self.node(prev).is_free != node.is_free {
            return id;
        }
        let p = self.node_mut(prev);
        p.end = node.end;
        p.next = node.next;
        if let Some(n) = node.next {
            self.node_mut(n).prev = Some(prev);
        }
        self.nodes.remove(id);
        prev
    }

    /// Fold the successor of `id` into it if they share a state
    fn absorb_next(&mut self, id: NodeId) {
        let node = self.node(id);
        let Some(next) = node.next else {
            return;
        };
        let succ = self.node(next);
        if succ.is_free != node.is_free {
            return;
        }
        let n = self.node_mut(id);
        n.end = succ.end;
        n.next = succ.next;
        if let Some(after) = succ.next {
            self.node_mut(after).prev = Some(id);
        }
        self.nodes.remove(next);
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extents().map(|e| {
                format!(
                    "{}[{}, {})",
                    if e.is_free { "free" } else { "used" },
                    e.start,
                    e.end
                )
            }))
            .finish()
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring and extent transport configuration.
//!
//! Ring sizes can be overridden from the environment as a page order,
//! read once when the configuration is built:
//!
//! | Variable             | Transport   | Default | Ring size              |
//! |----------------------|-------------|---------|------------------------|
//! | `MEMPIPE_RING_ORDER` | ring        | 9       | `PAGE_SIZE << order`   |
//! | `SHMEM_RING_ORDER`   | extent pipe | 14      | `1 << (12 + order)`    |
//!
//! Both accept `0..=15`.

use crate::shm::{
    round_to_cache_line, FutexWait, Result, Ring, SharedRegion, ShmError, DEFAULT_DEFERRED_BATCH,
    HEADER_SIZE, PAGE_SIZE,
};
use std::sync::Arc;

/// Environment variable overriding the ring page order
pub const RING_ORDER_ENV: &str = "MEMPIPE_RING_ORDER";

/// Environment variable overriding the extent arena order
pub const EXTENT_ORDER_ENV: &str = "SHMEM_RING_ORDER";

/// Largest accepted order
pub const MAX_ORDER: u32 = 15;

/// Default ring page order (512 pages)
pub const DEFAULT_RING_ORDER: u32 = 9;

/// Default extent arena order (64 MiB)
pub const DEFAULT_EXTENT_ORDER: u32 = 14;

/// Default message size in bytes
pub const DEFAULT_MESSAGE_SIZE: usize = 64;

/// Parse an order override, falling back to `default` when unset.
///
/// # Errors
///
/// Returns [`ShmError::InvalidConfig`] for a non-numeric or out of range
/// value.
pub fn parse_order(var: &str, raw: Option<&str>, default: u32) -> Result<u32> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let order: u32 = raw
        .trim()
        .parse()
        .map_err(|_| ShmError::InvalidConfig(format!("{var}={raw:?} is not a number")))?;
    if order > MAX_ORDER {
        return Err(ShmError::InvalidConfig(format!(
            "{var}={order} out of range (0..={MAX_ORDER})"
        )));
    }
    Ok(order)
}

fn env_order(var: &str, default: u32) -> Result<u32> {
    let raw = std::env::var(var).ok();
    let order = parse_order(var, raw.as_deref(), default)?;
    if raw.is_some() {
        log::debug!("[SHM] {var} override: order {order}");
    }
    Ok(order)
}

fn check_message_size(message_size: usize, ring_size: usize) -> Result<()> {
    if message_size == 0 || round_to_cache_line(message_size) + 2 * HEADER_SIZE > ring_size {
        return Err(ShmError::InvalidMessageSize {
            size: message_size,
            ring_size,
        });
    }
    Ok(())
}

/// Shared-memory ring configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Ring size in pages (power of two)
    pub pages: usize,

    /// Fixed payload size of every message
    pub message_size: usize,

    /// NUMA node to bind the region to
    pub numa_node: Option<u32>,

    /// Deferred header write batch for the futex strategy
    pub deferred_batch: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            pages: 1 << DEFAULT_RING_ORDER,
            message_size: DEFAULT_MESSAGE_SIZE,
            numa_node: None,
            deferred_batch: DEFAULT_DEFERRED_BATCH,
        }
    }
}

impl RingConfig {
    /// Defaults, with the page order taken from `MEMPIPE_RING_ORDER`.
    ///
    /// # Errors
    ///
    /// Returns error if the variable is set to an invalid order.
    pub fn from_env() -> Result<Self> {
        let order = env_order(RING_ORDER_ENV, DEFAULT_RING_ORDER)?;
        Ok(Self {
            pages: 1 << order,
            ..Default::default()
        })
    }

    /// Set the ring size as a page order.
    ///
    /// # Errors
    ///
    /// Returns error if `order` exceeds [`MAX_ORDER`].
    pub fn with_order(mut self, order: u32) -> Result<Self> {
        if order > MAX_ORDER {
            return Err(ShmError::InvalidConfig(format!(
                "ring order {order} out of range (0..={MAX_ORDER})"
            )));
        }
        self.pages = 1 << order;
        Ok(self)
    }

    #[must_use]
    pub fn with_pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    #[must_use]
    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = size;
        self
    }

    #[must_use]
    pub fn with_numa_node(mut self, node: Option<u32>) -> Self {
        self.numa_node = node;
        self
    }

    #[must_use]
    pub fn with_deferred_batch(mut self, batch: u32) -> Self {
        self.deferred_batch = batch;
        self
    }

    /// Ring size in bytes
    #[must_use]
    pub fn ring_size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Futex strategy holding back `deferred_batch` header writes.
    ///
    /// Each endpoint needs its own; call once per side.
    #[must_use]
    pub fn futex_wait(&self) -> FutexWait {
        FutexWait::with_batch(self.deferred_batch)
    }

    /// Check that the pages form a ring and a message fits in it.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if !self.pages.is_power_of_two() {
            return Err(ShmError::InvalidConfig(format!(
                "ring of {} pages is not a power of two",
                self.pages
            )));
        }
        check_message_size(self.message_size, self.ring_size())
    }

    /// Validate, establish the shared region and wrap it as a ring.
    ///
    /// Call before `fork()`.
    ///
    /// # Errors
    ///
    /// Returns error on invalid configuration or setup failure.
    pub fn establish(&self) -> Result<Ring> {
        self.validate()?;
        let region = SharedRegion::establish(self.pages, self.numa_node)?;
        Ring::new(Arc::new(region))
    }
}

/// Extent-over-pipe transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentConfig {
    /// Arena size is `1 << (12 + order)` bytes
    pub order: u32,

    /// Fixed payload size of every message
    pub message_size: usize,

    /// NUMA node to bind the arena to
    pub numa_node: Option<u32>,
}

impl Default for ExtentConfig {
    fn default() -> Self {
        Self {
            order: DEFAULT_EXTENT_ORDER,
            message_size: DEFAULT_MESSAGE_SIZE,
            numa_node: None,
        }
    }
}

impl ExtentConfig {
    /// Defaults, with the order taken from `SHMEM_RING_ORDER`.
    ///
    /// # Errors
    ///
    /// Returns error if the variable is set to an invalid order.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            order: env_order(EXTENT_ORDER_ENV, DEFAULT_EXTENT_ORDER)?,
            ..Default::default()
        })
    }

    #[must_use]
    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = size;
        self
    }

    #[must_use]
    pub fn with_numa_node(mut self, node: Option<u32>) -> Self {
        self.numa_node = node;
        self
    }

    /// Arena size in bytes
    #[must_use]
    pub fn ring_size(&self) -> usize {
        1 << (12 + self.order)
    }

    /// Arena size in pages
    #[must_use]
    pub fn pages(&self) -> usize {
        self.ring_size() / PAGE_SIZE
    }

    /// Check the order and that a message fits in the arena.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.order > MAX_ORDER {
            return Err(ShmError::InvalidConfig(format!(
                "extent order {} out of range (0..={MAX_ORDER})",
                self.order
            )));
        }
        check_message_size(self.message_size, self.ring_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order_default() {
        assert_eq!(parse_order(RING_ORDER_ENV, None, 9).expect("default"), 9);
    }

    #[test]
    fn test_parse_order_valid() {
        assert_eq!(parse_order(RING_ORDER_ENV, Some("0"), 9).expect("0"), 0);
        assert_eq!(parse_order(RING_ORDER_ENV, Some(" 15 "), 9).expect("15"), 15);
    }

    #[test]
    fn test_parse_order_invalid() {
        assert!(matches!(
            parse_order(RING_ORDER_ENV, Some("16"), 9),
            Err(ShmError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_order(EXTENT_ORDER_ENV, Some("big"), 14),
            Err(ShmError::InvalidConfig(msg)) if msg.contains(EXTENT_ORDER_ENV)
        ));
        assert!(parse_order(RING_ORDER_ENV, Some("-1"), 9).is_err());
    }

    #[test]
    fn test_ring_config_defaults() {
        let cfg = RingConfig::default();
        assert_eq!(cfg.pages, 512);
        assert_eq!(cfg.ring_size(), 512 * PAGE_SIZE);
        assert_eq!(cfg.deferred_batch, DEFAULT_DEFERRED_BATCH);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_ring_config_builder() {
        let cfg = RingConfig::default()
            .with_order(3)
            .expect("order")
            .with_message_size(128)
            .with_deferred_batch(0);
        assert_eq!(cfg.pages, 8);
        assert_eq!(cfg.message_size, 128);
        assert_eq!(cfg.deferred_batch, 0);
        assert!(RingConfig::default().with_order(16).is_err());
    }

    #[test]
    fn test_futex_wait_follows_deferred_batch() {
        use crate::shm::{WaitStrategy, FLAG_READY};
        use std::sync::atomic::Ordering;

        let cfg = RingConfig::default().with_pages(1).with_deferred_batch(0);
        let ring = cfg.establish().expect("establish");
        let mut w = cfg.futex_wait();
        w.set_header(&ring, 0, 64 | FLAG_READY).expect("set");
        assert_eq!(ring.header(0).load(Ordering::Acquire), 64 | FLAG_READY);
        assert!(w.pending().is_none());

        let cfg = RingConfig::default().with_pages(1);
        let ring = cfg.establish().expect("establish");
        let mut w = cfg.futex_wait();
        w.set_header(&ring, 0, 64 | FLAG_READY).expect("set");
        assert_eq!(ring.header(0).load(Ordering::Acquire), 0);
        assert_eq!(
            w.pending().map(|held| held.remaining()),
            Some(DEFAULT_DEFERRED_BATCH)
        );
    }

    #[test]
    fn test_ring_config_validation() {
        assert!(RingConfig::default().with_pages(3).validate().is_err());
        assert!(matches!(
            RingConfig::default()
                .with_pages(1)
                .with_message_size(PAGE_SIZE)
                .validate(),
            Err(ShmError::InvalidMessageSize { .. })
        ));
        assert!(RingConfig::default().with_message_size(0).validate().is_err());
    }

    #[test]
    fn test_ring_config_establish() {
        let ring = RingConfig::default()
            .with_pages(2)
            .establish()
            .expect("establish");
        assert_eq!(ring.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn test_extent_config_sizes() {
        let cfg = ExtentConfig::default();
        assert_eq!(cfg.ring_size(), 1 << 26);
        assert_eq!(cfg.pages(), 1 << 14);

        let small = ExtentConfig {
            order: 0,
            ..Default::default()
        };
        assert_eq!(small.ring_size(), PAGE_SIZE);
        small.validate().expect("valid");

        let bad = ExtentConfig {
            order: 16,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}

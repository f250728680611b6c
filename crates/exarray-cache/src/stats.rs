//! Cache statistics
//!
//! Counters are plain atomics updated on the hot path; [`CacheStats`] is a
//! point-in-time copy for reporting and tests.

#![allow(clippy::cast_precision_loss)] // Ratios accept precision loss

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of cache activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Protects satisfied from a resident entry
    pub hits: u64,
    /// Protects that had to load from the store
    pub misses: u64,
    /// Newly created entries inserted
    pub inserts: u64,
    /// Images read from the store
    pub loads: u64,
    /// Images written back to the store
    pub writes: u64,
    /// Entries evicted from memory
    pub evictions: u64,
    /// Entries removed along with their image
    pub removals: u64,
    /// Loads rejected by the integrity check
    pub corruptions: u64,
    /// Currently resident entries
    pub resident: usize,
    /// Currently dirty entries
    pub dirty: usize,
    /// Current flush dependency edges
    pub dependencies: usize,
}

impl CacheStats {
    /// Fraction of protects served without a load
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Live counters behind [`CacheStats`]
#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    loads: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
    corruptions: AtomicU64,
}

impl CacheMetrics {
    #[inline]
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_corruption(&self) {
        self.corruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, resident: usize, dirty: usize, dependencies: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
            resident,
            dirty,
            dependencies,
        }
    }
}

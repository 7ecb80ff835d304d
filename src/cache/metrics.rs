//! Cache Metrics
//!
//! Cache-line aligned counters for one shard's connection cache.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Mutation Counters
// =============================================================================

/// Counters for registry mutations and lookups, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Inserts that created a new entry
    pub inserts: AtomicU64,
    /// Inserts that replaced an existing entry
    pub replacements: AtomicU64,
    /// Removes that erased an entry
    pub removes: AtomicU64,
    /// Removes of a node with no entry
    pub noop_removes: AtomicU64,
    /// Mutations rejected because the node belongs to another shard
    pub affinity_violations: AtomicU64,
    /// Completed drains
    pub drains: AtomicU64,
    /// Individual transport shutdowns that failed during drains
    pub stop_failures: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

/// Lookup counters and mutation slot occupancy
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct SlotStats {
    /// Lookups that found an entry
    pub hits: AtomicU64,
    /// Lookups that found nothing
    pub misses: AtomicU64,
    /// Mutations currently holding the slot
    pub in_flight: AtomicU64,
    /// Highest `in_flight` ever observed
    pub peak_in_flight: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<CacheStats>() <= CACHE_LINE_SIZE);
const _: () = assert!(std::mem::size_of::<SlotStats>() <= CACHE_LINE_SIZE);

impl CacheStats {
    #[inline]
    pub fn record_insert(&self, replaced: bool) {
        if replaced {
            self.replacements.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inserts.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    #[inline]
    pub fn record_remove(&self, existed: bool) {
        if existed {
            self.removes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.noop_removes.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    #[inline]
    pub fn record_affinity_violation(&self) {
        self.affinity_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_drain(&self, failures: u64) {
        self.drains.fetch_add(1, Ordering::Relaxed);
        self.stop_failures.fetch_add(failures, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }
}

impl SlotStats {
    #[inline]
    pub fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Mark a mutation as holding the slot
    #[inline]
    pub fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    /// Mark a mutation as having released the slot
    #[inline]
    pub fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time view of a shard's cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub shard: usize,
    pub entries: usize,
    pub inserts: u64,
    pub replacements: u64,
    pub removes: u64,
    pub noop_removes: u64,
    pub affinity_violations: u64,
    pub drains: u64,
    pub stop_failures: u64,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub in_flight_mutations: u64,
    pub peak_in_flight_mutations: u64,
    pub last_update_ms: u64,
}

impl CacheStatsSnapshot {
    pub fn capture(shard: usize, entries: usize, stats: &CacheStats, slot: &SlotStats) -> Self {
        Self {
            shard,
            entries,
            inserts: stats.inserts.load(Ordering::Relaxed),
            replacements: stats.replacements.load(Ordering::Relaxed),
            removes: stats.removes.load(Ordering::Relaxed),
            noop_removes: stats.noop_removes.load(Ordering::Relaxed),
            affinity_violations: stats.affinity_violations.load(Ordering::Relaxed),
            drains: stats.drains.load(Ordering::Relaxed),
            stop_failures: stats.stop_failures.load(Ordering::Relaxed),
            lookup_hits: slot.hits.load(Ordering::Relaxed),
            lookup_misses: slot.misses.load(Ordering::Relaxed),
            in_flight_mutations: slot.in_flight.load(Ordering::Acquire),
            peak_in_flight_mutations: slot.peak_in_flight.load(Ordering::Acquire),
            last_update_ms: stats.last_update_ms.load(Ordering::Acquire),
        }
    }

    /// Total mutations admitted through the slot
    pub fn total_mutations(&self) -> u64 {
        self.inserts + self.replacements + self.removes + self.noop_removes
    }

    /// Fraction of lookups that found an entry (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.lookup_hits + self.lookup_misses;
        if total == 0 {
            0.0
        } else {
            self.lookup_hits as f64 / total as f64
        }
    }
}

//! Remembered-set runtime context.
//!
//! The original design kept free-list heads, the from-card cache, and
//! process counters in globals. Here they are fields of one explicit
//! [`RemSetRuntime`] created at heap initialization and passed by
//! reference to every operation, so ownership and teardown are plain.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ConfigError, RemSetConfig};
use crate::region::HeapGeometry;
use crate::remset::arena::Arena;
use crate::remset::{CardBitmap, FineTable};
use crate::stats::RemSetStats;

// =============================================================================
// FromCardCache
// =============================================================================

/// Per-worker memo of the last card added to each region's remembered set.
///
/// Write barriers and evacuation tend to add the same card repeatedly in
/// bursts (consecutive stores into one object). One cached global card
/// index per (worker, owning-region) pair rejects those duplicates in
/// O(1) before any tier is touched.
///
/// Invalidated per owning region by `scrub`/`clear`, so a re-added card
/// is never silently dropped after its record was discarded.
pub struct FromCardCache {
    /// Flat `[workers × regions]` array of cached global card indices.
    entries: Box<[AtomicU64]>,
    regions: usize,
    workers: usize,
}

/// Empty cache slot.
const CACHE_EMPTY: u64 = u64::MAX;

impl FromCardCache {
    fn new(workers: usize, regions: usize) -> Self {
        let entries: Vec<AtomicU64> = (0..workers * regions)
            .map(|_| AtomicU64::new(CACHE_EMPTY))
            .collect();
        Self {
            entries: entries.into_boxed_slice(),
            regions,
            workers,
        }
    }

    /// Check whether `global_card` is the worker's cached card for `owner`;
    /// if not, cache it. Returns true on a hit.
    #[inline]
    pub fn contains_or_insert(&self, worker: usize, owner: u32, global_card: u64) -> bool {
        debug_assert!(worker < self.workers);
        let slot = &self.entries[worker * self.regions + owner as usize];
        if slot.load(Ordering::Relaxed) == global_card {
            return true;
        }
        slot.store(global_card, Ordering::Relaxed);
        false
    }

    /// Drop every worker's cached card for `owner`.
    pub fn invalidate_owner(&self, owner: u32) {
        for worker in 0..self.workers {
            self.entries[worker * self.regions + owner as usize]
                .store(CACHE_EMPTY, Ordering::Relaxed);
        }
    }

    /// Drop all cached cards.
    pub fn clear(&self) {
        for slot in self.entries.iter() {
            slot.store(CACHE_EMPTY, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// RemSetRuntime
// =============================================================================

/// Shared state for all remembered sets of one heap.
///
/// Owns the table arenas (with their lock-free free lists), the from-card
/// cache, and statistics. Created once at heap initialization; dropped at
/// heap shutdown, taking every parked table with it.
pub struct RemSetRuntime {
    config: RemSetConfig,
    geometry: HeapGeometry,
    /// Fine-table arena shared by every region's directory.
    pub(crate) fine_tables: Arena<FineTable>,
    /// Side-bitmap arena feeding fine-table expansions.
    pub(crate) side_bitmaps: Arena<CardBitmap>,
    /// Duplicate-add filter.
    pub(crate) from_card_cache: FromCardCache,
    stats: RemSetStats,
}

impl RemSetRuntime {
    /// Create the runtime for a heap starting at `heap_base`.
    pub fn new(config: RemSetConfig, heap_base: usize) -> Result<Self, ConfigError> {
        config.validate()?;
        let geometry = HeapGeometry::new(heap_base, &config);

        let cards_per_region = geometry.cards_per_region();
        let workers = config.workers;
        let fine_capacity = config.max_regions * config.fine_table_capacity();
        let side_capacity = fine_capacity * workers.saturating_sub(1);

        Ok(Self {
            fine_tables: Arena::new(fine_capacity, move || {
                FineTable::new(cards_per_region, workers)
            }),
            side_bitmaps: Arena::new(side_capacity.max(1), move || {
                CardBitmap::new(cards_per_region)
            }),
            from_card_cache: FromCardCache::new(workers, config.max_regions),
            geometry,
            stats: RemSetStats::new(),
            config,
        })
    }

    /// The configuration this runtime was built with.
    #[inline]
    pub fn config(&self) -> &RemSetConfig {
        &self.config
    }

    /// Region and card index arithmetic.
    #[inline]
    pub fn geometry(&self) -> &HeapGeometry {
        &self.geometry
    }

    /// Remembered-set statistics.
    #[inline]
    pub fn stats(&self) -> &RemSetStats {
        &self.stats
    }

    /// From-card duplicate filter.
    #[inline]
    pub fn from_card_cache(&self) -> &FromCardCache {
        &self.from_card_cache
    }

    /// Fine tables ever materialized (for sizing diagnostics).
    pub fn fine_tables_allocated(&self) -> usize {
        self.fine_tables.allocated()
    }
}

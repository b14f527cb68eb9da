//! Remembered-set statistics and metrics.
//!
//! Tracks reference-addition traffic, tier promotions, and structural
//! churn for monitoring and tuning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics about remembered-set activity.
#[derive(Debug)]
pub struct RemSetStats {
    // =========================================================================
    // Addition Traffic
    // =========================================================================
    /// Total add-reference calls.
    pub refs_added: AtomicU64,
    /// Adds rejected by the from-card cache.
    pub cache_hits: AtomicU64,
    /// Adds rejected because the from-region was already coarse.
    pub coarse_hits: AtomicU64,
    /// Adds landing in a fine table.
    pub fine_adds: AtomicU64,
    /// Adds landing in the sparse tier.
    pub sparse_adds: AtomicU64,

    // =========================================================================
    // Tier Transitions
    // =========================================================================
    /// Sparse entries promoted to fine tables.
    pub promotions: AtomicU64,
    /// Fine tables degraded to coarse bits.
    pub coarsenings: AtomicU64,

    // =========================================================================
    // Structural Churn
    // =========================================================================
    /// Fine tables allocated fresh from the arena.
    pub fine_allocs: AtomicU64,
    /// Fine tables reused from the free list or eviction.
    pub fine_recycles: AtomicU64,
    /// Side-table expansions of fine tables.
    pub expansions: AtomicU64,
    /// Contract passes merging side tables into base tables.
    pub contracts: AtomicU64,
    /// Fine tables dropped by scrub (dead or emptied).
    pub scrub_drops: AtomicU64,
}

impl RemSetStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            refs_added: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            coarse_hits: AtomicU64::new(0),
            fine_adds: AtomicU64::new(0),
            sparse_adds: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            coarsenings: AtomicU64::new(0),
            fine_allocs: AtomicU64::new(0),
            fine_recycles: AtomicU64::new(0),
            expansions: AtomicU64::new(0),
            contracts: AtomicU64::new(0),
            scrub_drops: AtomicU64::new(0),
        }
    }

    /// Record an add-reference call.
    #[inline]
    pub fn record_add(&self) {
        self.refs_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a from-card cache hit.
    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an add filtered by the coarse map.
    #[inline]
    pub fn record_coarse_hit(&self) {
        self.coarse_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an add delegated to a fine table.
    #[inline]
    pub fn record_fine_add(&self) {
        self.fine_adds.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an add stored in the sparse tier.
    #[inline]
    pub fn record_sparse_add(&self) {
        self.sparse_adds.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sparse→fine promotion.
    #[inline]
    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fine→coarse eviction.
    #[inline]
    pub fn record_coarsening(&self) {
        self.coarsenings.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fresh fine-table allocation.
    #[inline]
    pub fn record_fine_alloc(&self) {
        self.fine_allocs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recycled fine table.
    #[inline]
    pub fn record_fine_recycle(&self) {
        self.fine_recycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a side-table expansion.
    #[inline]
    pub fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a contract pass over one fine table.
    #[inline]
    pub fn record_contract(&self) {
        self.contracts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fine table dropped by scrub.
    #[inline]
    pub fn record_scrub_drop(&self) {
        self.scrub_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of adds filtered before touching any tier.
    pub fn filter_rate(&self) -> f64 {
        let total = self.refs_added.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let filtered = self.cache_hits.load(Ordering::Relaxed)
            + self.coarse_hits.load(Ordering::Relaxed);
        filtered as f64 / total as f64
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.refs_added.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.coarse_hits.store(0, Ordering::Relaxed);
        self.fine_adds.store(0, Ordering::Relaxed);
        self.sparse_adds.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.coarsenings.store(0, Ordering::Relaxed);
        self.fine_allocs.store(0, Ordering::Relaxed);
        self.fine_recycles.store(0, Ordering::Relaxed);
        self.expansions.store(0, Ordering::Relaxed);
        self.contracts.store(0, Ordering::Relaxed);
        self.scrub_drops.store(0, Ordering::Relaxed);
    }

    /// Print a summary of remembered-set statistics.
    pub fn print_summary(&self) {
        eprintln!("=== Remembered-Set Statistics ===");
        eprintln!(
            "Adds: {} total ({} cache-filtered, {} coarse-filtered)",
            self.refs_added.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.coarse_hits.load(Ordering::Relaxed)
        );
        eprintln!(
            "Stored: {} fine, {} sparse",
            self.fine_adds.load(Ordering::Relaxed),
            self.sparse_adds.load(Ordering::Relaxed)
        );
        eprintln!(
            "Transitions: {} promotions, {} coarsenings",
            self.promotions.load(Ordering::Relaxed),
            self.coarsenings.load(Ordering::Relaxed)
        );
        eprintln!(
            "Tables: {} allocated, {} recycled, {} expanded, {} contracted, {} scrub-dropped",
            self.fine_allocs.load(Ordering::Relaxed),
            self.fine_recycles.load(Ordering::Relaxed),
            self.expansions.load(Ordering::Relaxed),
            self.contracts.load(Ordering::Relaxed),
            self.scrub_drops.load(Ordering::Relaxed)
        );
    }
}

impl Default for RemSetStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for measuring remembered-set phases.
pub struct PhaseTimer {
    start: Instant,
    label: &'static str,
}

impl PhaseTimer {
    /// Start a new timer with the given label.
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Stop the timer and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        #[cfg(feature = "trace")]
        eprintln!("remset {}: {:?}", self.label, elapsed);
        let _ = self.label;
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_recording() {
        let stats = RemSetStats::new();

        stats.record_add();
        stats.record_add();
        stats.record_cache_hit();
        stats.record_fine_add();

        assert_eq!(stats.refs_added.load(Ordering::Relaxed), 2);
        assert_eq!(stats.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(stats.fine_adds.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_filter_rate() {
        let stats = RemSetStats::new();
        assert_eq!(stats.filter_rate(), 0.0);

        for _ in 0..4 {
            stats.record_add();
        }
        stats.record_cache_hit();
        stats.record_coarse_hit();
        assert!((stats.filter_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let stats = RemSetStats::new();
        stats.record_add();
        stats.record_promotion();
        stats.reset();
        assert_eq!(stats.refs_added.load(Ordering::Relaxed), 0);
        assert_eq!(stats.promotions.load(Ordering::Relaxed), 0);
    }
}

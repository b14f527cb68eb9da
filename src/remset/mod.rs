//! Remembered sets: per-region cross-region reference tracking.
//!
//! [`RegionRemSet`] is the per-region handle the collector holds. It wraps
//! the three-tier [`CrossRegionTable`], a bitmap of regions this region
//! forwards references into, and a claim flag that lets exactly one
//! parallel worker process the region's remembered set per phase.
//!
//! Additions arrive from write barriers and evacuation during a pause, or
//! from the refinement thread between pauses. Iteration happens during
//! remembered-set scanning, after [`RegionRemSet::contract_all`] has
//! merged per-worker side tables.

pub(crate) mod arena;
mod card_bitmap;

pub mod aggregate;
pub mod fine;
pub mod iter;
pub mod sparse;

pub use aggregate::CrossRegionTable;
pub use card_bitmap::CardBitmap;
pub use fine::{ExpansionState, FineTable};
pub use iter::RemSetIter;
pub use sparse::{SparseAddResult, SparseCardSet, SparseEntry};

use std::sync::atomic::{AtomicU8, Ordering};

use crate::region::RegionBitmap;
use crate::runtime::RemSetRuntime;
use crate::Tier;

// =============================================================================
// CardLiveness
// =============================================================================

/// Liveness oracle consumed by `scrub`.
///
/// Supplied by the region directory and the marking state: a region is
/// live while committed, a card is live while its from-region still has
/// live objects covering it.
pub trait CardLiveness {
    /// Whether a region is still live.
    fn region_live(&self, region: u32) -> bool;

    /// Whether a card of a live region still holds live data.
    fn card_live(&self, region: u32, card: u32) -> bool;
}

// =============================================================================
// ClaimState
// =============================================================================

/// Per-phase processing claim on a region's remembered set.
///
/// ```text
/// Unclaimed ──try_claim──► Claimed ──set_complete──► Complete
/// ```
///
/// Exactly one worker wins `try_claim` per phase; `reset_claim` reopens
/// the region for the next phase.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// No worker has taken this region yet.
    Unclaimed = 0,
    /// A worker is processing this region.
    Claimed = 1,
    /// Processing finished for this phase.
    Complete = 2,
}

// =============================================================================
// RegionRemSet
// =============================================================================

/// Public per-region remembered-set handle.
pub struct RegionRemSet {
    /// The owning region.
    owner: u32,
    /// Three-tier incoming-reference table.
    table: CrossRegionTable,
    /// Regions this owner holds references into. Maintained by the
    /// evacuation path; consulted when those regions die to tear down the
    /// matching incoming state.
    forwarded: RegionBitmap,
    /// Parallel-processing claim for the current phase.
    claim: AtomicU8,
}

impl RegionRemSet {
    /// Create an empty remembered set for `owner`.
    pub fn new(rt: &RemSetRuntime, owner: u32) -> Self {
        Self {
            owner,
            table: CrossRegionTable::new(rt, owner),
            forwarded: RegionBitmap::new(rt.config().max_regions),
            claim: AtomicU8::new(ClaimState::Unclaimed as u8),
        }
    }

    /// The owning region.
    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner
    }

    // =========================================================================
    // Addition & Queries
    // =========================================================================

    /// Record that the card containing `from_addr` references this region.
    #[inline]
    pub fn add_reference(&self, rt: &RemSetRuntime, from_addr: usize, worker: usize) {
        self.table.add_reference(rt, from_addr, worker);
    }

    /// Test whether the card containing `from_addr` is recorded.
    #[inline]
    pub fn contains_reference(&self, rt: &RemSetRuntime, from_addr: usize) -> bool {
        self.table.contains_reference(rt, from_addr)
    }

    /// Total cards represented across all tiers.
    #[inline]
    pub fn occupied(&self, rt: &RemSetRuntime) -> usize {
        self.table.occupied(rt)
    }

    /// Whether any cross-region reference is recorded.
    pub fn is_empty(&self, rt: &RemSetRuntime) -> bool {
        self.occupied(rt) == 0
    }

    /// The tier currently holding a from-region, if any.
    #[inline]
    pub fn tier_of(&self, rt: &RemSetRuntime, from_region: u32) -> Option<Tier> {
        self.table.tier_of(rt, from_region)
    }

    /// The underlying aggregate, for occupancy breakdowns.
    #[inline]
    pub fn aggregate(&self) -> &CrossRegionTable {
        &self.table
    }

    // =========================================================================
    // Forwarded Regions
    // =========================================================================

    /// Record that this region holds a reference into `to_region`.
    #[inline]
    pub fn record_forwarded(&self, to_region: u32) {
        self.forwarded.set(to_region);
    }

    /// Whether this region holds references into `to_region`.
    #[inline]
    pub fn forwards_into(&self, to_region: u32) -> bool {
        self.forwarded.contains(to_region)
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Attempt to claim this region's remembered set for processing.
    ///
    /// Exactly one caller per phase succeeds.
    pub fn try_claim(&self) -> bool {
        self.claim
            .compare_exchange(
                ClaimState::Unclaimed as u8,
                ClaimState::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark processing complete for this phase.
    pub fn set_complete(&self) {
        self.claim
            .store(ClaimState::Complete as u8, Ordering::Release);
    }

    /// Current claim state.
    pub fn claim_state(&self) -> ClaimState {
        match self.claim.load(Ordering::Acquire) {
            0 => ClaimState::Unclaimed,
            1 => ClaimState::Claimed,
            _ => ClaimState::Complete,
        }
    }

    /// Reopen the claim for the next phase.
    pub fn reset_claim(&self) {
        self.claim
            .store(ClaimState::Unclaimed as u8, Ordering::Release);
    }

    // =========================================================================
    // Phase Boundaries
    // =========================================================================

    /// Merge per-worker side tables; run between pauses, before any
    /// occupancy or iteration is trusted.
    #[inline]
    pub fn contract_all(&self, rt: &RemSetRuntime) {
        self.table.contract_all(rt);
    }

    /// Drop references whose from-region or from-card is dead.
    #[inline]
    pub fn scrub<L: CardLiveness>(&self, rt: &RemSetRuntime, live: &L) {
        self.table.scrub(rt, live);
    }

    /// Empty the remembered set and the forwarded map.
    pub fn clear(&self, rt: &RemSetRuntime) {
        self.table.clear(rt);
        self.forwarded.clear_all();
        self.reset_claim();
    }

    /// Iterate all recorded cards as global card indices.
    ///
    /// One-shot and lazy; see [`RemSetIter`]. Requires a prior
    /// [`Self::contract_all`] in this phase.
    pub fn iter<'a>(&'a self, rt: &'a RemSetRuntime) -> RemSetIter<'a> {
        RemSetIter::new(rt, &self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemSetConfig;

    const HEAP_BASE: usize = 0x4000_0000;

    fn runtime() -> RemSetRuntime {
        let config = RemSetConfig {
            max_regions: 64,
            ..Default::default()
        };
        RemSetRuntime::new(config, HEAP_BASE).expect("valid config")
    }

    fn addr(region: u32, card: u32) -> usize {
        HEAP_BASE + region as usize * 1024 * 1024 + card as usize * 512
    }

    #[test]
    fn test_facade_passthrough() {
        let rt = runtime();
        let remset = RegionRemSet::new(&rt, 0);

        assert!(remset.is_empty(&rt));
        remset.add_reference(&rt, addr(1, 0), 0);
        assert_eq!(remset.occupied(&rt), 1);
        assert!(remset.contains_reference(&rt, addr(1, 0)));
        assert_eq!(remset.tier_of(&rt, 1), Some(Tier::Sparse));

        remset.clear(&rt);
        assert!(remset.is_empty(&rt));
    }

    #[test]
    fn test_claim_exactly_once() {
        let rt = runtime();
        let remset = RegionRemSet::new(&rt, 0);

        assert_eq!(remset.claim_state(), ClaimState::Unclaimed);
        assert!(remset.try_claim());
        assert!(!remset.try_claim()); // second worker loses
        assert_eq!(remset.claim_state(), ClaimState::Claimed);

        remset.set_complete();
        assert_eq!(remset.claim_state(), ClaimState::Complete);
        assert!(!remset.try_claim()); // complete is not reclaimable

        remset.reset_claim();
        assert!(remset.try_claim());
    }

    #[test]
    fn test_claim_concurrent_single_winner() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let rt = Arc::new(runtime());
        let remset = Arc::new(RegionRemSet::new(&rt, 0));
        let winners = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let remset = Arc::clone(&remset);
            let winners = Arc::clone(&winners);
            handles.push(std::thread::spawn(move || {
                if remset.try_claim() {
                    winners.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_forwarded_regions() {
        let rt = runtime();
        let remset = RegionRemSet::new(&rt, 3);

        assert!(!remset.forwards_into(7));
        remset.record_forwarded(7);
        assert!(remset.forwards_into(7));

        remset.clear(&rt);
        assert!(!remset.forwards_into(7));
    }
}

//! Parallel-safe fine table.
//!
//! A fine table tracks one from-region's referencing cards as a bitmap,
//! and must accept concurrent additions from every collector worker
//! during a pause without locking. Worker 0 (and the refinement thread,
//! which shares its id) writes the base bitmap with atomic bit-sets; each
//! other worker writes a dedicated side table with plain bit-sets, so
//! workers never contend on a cache line, let alone a lock.
//!
//! Side tables are allocated once per table, on the first addition from a
//! worker above 0, through a single compare-and-swap on the expansion
//! state. Between pauses, [`FineTable::contract`] merges every side table
//! back into the base and returns them to the arena; the base bitmap's
//! occupancy must not be trusted before that runs.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::remset::arena::{ArenaSlot, NIL};
use crate::remset::card_bitmap::CardBitmap;
use crate::runtime::RemSetRuntime;

/// Side-table allocation state.
///
/// An explicit three-state tag set by a single-attempt CAS; the winner
/// allocates, losers spin until `Expanded` is published.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    /// No side tables; only the base bitmap exists.
    Unexpanded = 0,
    /// One thread is allocating side tables.
    Expanding = 1,
    /// Side tables are published and usable.
    Expanded = 2,
}

/// Fine-grained remembered-set table for one from-region.
pub struct FineTable {
    /// From-region this table tracks. `NIL` while on the free list.
    from_region: AtomicU32,
    /// Bucket-chain link while live, free-list link while parked.
    next: AtomicU32,
    /// Cached card count across base and side tables.
    ///
    /// Updated on every new bit set. Two workers setting the same card in
    /// different side tables each count it, so the value can over-report
    /// until the next `contract` recounts.
    occupied: AtomicUsize,
    /// Side-table allocation state.
    expansion: AtomicU8,
    /// Arena indices of per-worker side tables (worker k uses slot k-1).
    side: Box<[AtomicU32]>,
    /// The base bitmap.
    base: CardBitmap,
}

impl FineTable {
    /// Create a table for `num_cards` cards and `workers` collector threads.
    pub fn new(num_cards: usize, workers: usize) -> Self {
        let side: Vec<AtomicU32> = (0..workers.saturating_sub(1))
            .map(|_| AtomicU32::new(NIL))
            .collect();
        Self {
            from_region: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            occupied: AtomicUsize::new(0),
            expansion: AtomicU8::new(ExpansionState::Unexpanded as u8),
            side: side.into_boxed_slice(),
            base: CardBitmap::new(num_cards),
        }
    }

    /// From-region this table currently tracks.
    #[inline]
    pub fn from_region(&self) -> u32 {
        self.from_region.load(Ordering::Acquire)
    }

    /// Bucket-chain link.
    #[inline]
    pub fn next(&self) -> &AtomicU32 {
        &self.next
    }

    /// Cached card count. Exact only after `contract`.
    #[inline]
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    #[inline]
    fn state(&self) -> ExpansionState {
        match self.expansion.load(Ordering::Acquire) {
            0 => ExpansionState::Unexpanded,
            1 => ExpansionState::Expanding,
            _ => ExpansionState::Expanded,
        }
    }

    // =========================================================================
    // Addition
    // =========================================================================

    /// Record a card addition from `worker`. Lock-free.
    ///
    /// Returns whether the card was newly recorded in the table the worker
    /// writes (duplicates across workers are resolved by `contract`).
    pub fn add_card(&self, card: u32, worker: usize, rt: &RemSetRuntime) -> bool {
        let newly_set = if worker == 0 {
            // Worker 0 shares the base with the refinement thread.
            self.base.set_atomic(card)
        } else {
            self.ensure_expanded(rt);
            let side_id = self.side[worker - 1].load(Ordering::Acquire);
            rt.side_bitmaps.get(side_id).set_exclusive(card)
        };
        if newly_set {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        newly_set
    }

    /// Seed a card while holding the structural lock (promotion path).
    pub fn seed_card(&self, card: u32) {
        if self.base.set_exclusive(card) {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ensure_expanded(&self, rt: &RemSetRuntime) {
        if self.state() == ExpansionState::Expanded {
            return;
        }
        match self.expansion.compare_exchange(
            ExpansionState::Unexpanded as u8,
            ExpansionState::Expanding as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                for slot in self.side.iter() {
                    let id = rt.side_bitmaps.alloc();
                    rt.side_bitmaps.get(id).clear();
                    slot.store(id, Ordering::Release);
                }
                self.expansion
                    .store(ExpansionState::Expanded as u8, Ordering::Release);
                rt.stats().record_expansion();
            }
            Err(_) => {
                // Lost the race; the winner publishes shortly.
                while self.state() != ExpansionState::Expanded {
                    std::hint::spin_loop();
                }
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Test whether a card is recorded in the base or any side table.
    pub fn contains_card(&self, card: u32, rt: &RemSetRuntime) -> bool {
        if self.base.contains(card) {
            return true;
        }
        if self.state() == ExpansionState::Expanded {
            for slot in self.side.iter() {
                let id = slot.load(Ordering::Acquire);
                if id != NIL && rt.side_bitmaps.get(id).contains(card) {
                    return true;
                }
            }
        }
        false
    }

    /// The base bitmap, for the iterator's bit walk (post-contract).
    #[inline]
    pub(crate) fn base(&self) -> &CardBitmap {
        &self.base
    }

    // =========================================================================
    // Structural Operations (single-threaded, between pauses)
    // =========================================================================

    /// Merge side tables into the base and return them to the arena.
    ///
    /// Must run before the base bitmap's occupancy is trusted by code that
    /// is unaware of side tables (the iterator, scrub). Returns the exact
    /// occupancy after the merge.
    pub fn contract(&self, rt: &RemSetRuntime) -> usize {
        debug_assert!(
            self.state() != ExpansionState::Expanding,
            "contract raced an expansion"
        );
        if self.state() == ExpansionState::Expanded {
            for slot in self.side.iter() {
                let id = slot.swap(NIL, Ordering::Relaxed);
                if id != NIL {
                    let side = rt.side_bitmaps.get(id);
                    self.base.union_from(side);
                    side.clear();
                    rt.side_bitmaps.free(id);
                }
            }
            self.expansion
                .store(ExpansionState::Unexpanded as u8, Ordering::Release);
        }
        self.recount()
    }

    /// Recount occupancy from the base bitmap after a bulk operation.
    pub fn recount(&self) -> usize {
        debug_assert!(
            self.state() == ExpansionState::Unexpanded,
            "recount with live side tables"
        );
        let count = self.base.count();
        self.occupied.store(count, Ordering::Relaxed);
        count
    }

    /// Keep only cards for which `keep` returns true (scrub). Returns the
    /// new occupancy. Requires a prior `contract`.
    pub fn retain_cards<F>(&self, keep: F) -> usize
    where
        F: FnMut(u32) -> bool,
    {
        debug_assert!(
            self.state() == ExpansionState::Unexpanded,
            "scrub with live side tables"
        );
        self.base.retain(keep);
        self.recount()
    }

    /// Reinitialize a recycled table for a new from-region.
    ///
    /// Keeps already-expanded side tables (cleared) attached; the caller
    /// holds the structural lock.
    pub fn reset_for(&self, from_region: u32, rt: &RemSetRuntime) {
        self.base.clear();
        if self.state() == ExpansionState::Expanded {
            for slot in self.side.iter() {
                let id = slot.load(Ordering::Relaxed);
                if id != NIL {
                    rt.side_bitmaps.get(id).clear();
                }
            }
        }
        self.occupied.store(0, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
        self.from_region.store(from_region, Ordering::Release);
    }

    /// Tear down before returning to the arena free list: side tables go
    /// back to their arena, contents are cleared, identity is dropped.
    pub fn release(&self, rt: &RemSetRuntime) {
        if self.state() == ExpansionState::Expanded {
            for slot in self.side.iter() {
                let id = slot.swap(NIL, Ordering::Relaxed);
                if id != NIL {
                    let side = rt.side_bitmaps.get(id);
                    side.clear();
                    rt.side_bitmaps.free(id);
                }
            }
        }
        self.expansion
            .store(ExpansionState::Unexpanded as u8, Ordering::Relaxed);
        self.base.clear();
        self.occupied.store(0, Ordering::Relaxed);
        self.from_region.store(NIL, Ordering::Release);
    }
}

impl ArenaSlot for FineTable {
    #[inline]
    fn link(&self) -> &AtomicU32 {
        &self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemSetConfig;

    fn runtime(workers: usize) -> RemSetRuntime {
        let config = RemSetConfig {
            max_regions: 16,
            workers,
            ..Default::default()
        };
        RemSetRuntime::new(config, 0x1000_0000).expect("valid config")
    }

    #[test]
    fn test_worker_zero_adds_to_base() {
        let rt = runtime(4);
        let table = FineTable::new(2048, 4);
        table.reset_for(3, &rt);

        assert!(table.add_card(100, 0, &rt));
        assert!(!table.add_card(100, 0, &rt)); // duplicate
        assert_eq!(table.occupied(), 1);
        assert!(table.base().contains(100));
        assert_eq!(table.state(), ExpansionState::Unexpanded);
    }

    #[test]
    fn test_other_workers_expand_and_use_side_tables() {
        let rt = runtime(4);
        let table = FineTable::new(2048, 4);
        table.reset_for(3, &rt);

        assert!(table.add_card(7, 1, &rt));
        assert_eq!(table.state(), ExpansionState::Expanded);
        // The card is visible through contains but not yet in the base
        assert!(table.contains_card(7, &rt));
        assert!(!table.base().contains(7));

        assert!(table.add_card(9, 2, &rt));
        assert_eq!(table.occupied(), 2);
    }

    #[test]
    fn test_contract_merges_and_frees_side_tables() {
        let rt = runtime(3);
        let table = FineTable::new(2048, 3);
        table.reset_for(0, &rt);

        table.add_card(1, 0, &rt);
        table.add_card(2, 1, &rt);
        table.add_card(3, 2, &rt);
        // Same card from two workers: counted twice until contract
        table.add_card(2, 2, &rt);
        assert_eq!(table.occupied(), 4);

        let exact = table.contract(&rt);
        assert_eq!(exact, 3);
        assert_eq!(table.occupied(), 3);
        assert_eq!(table.state(), ExpansionState::Unexpanded);
        for card in [1, 2, 3] {
            assert!(table.base().contains(card));
        }
    }

    #[test]
    fn test_contract_unexpanded_is_recount() {
        let rt = runtime(1);
        let table = FineTable::new(512, 1);
        table.reset_for(0, &rt);
        table.add_card(10, 0, &rt);
        assert_eq!(table.contract(&rt), 1);
    }

    #[test]
    fn test_retain_cards() {
        let rt = runtime(2);
        let table = FineTable::new(2048, 2);
        table.reset_for(0, &rt);
        table.add_card(10, 1, &rt);
        table.add_card(11, 0, &rt);
        table.contract(&rt);

        let remaining = table.retain_cards(|c| c == 11);
        assert_eq!(remaining, 1);
        assert!(!table.base().contains(10));
    }

    #[test]
    fn test_release_returns_side_tables() {
        let rt = runtime(4);
        let before = rt.side_bitmaps.allocated();
        let table = FineTable::new(2048, 4);
        table.reset_for(5, &rt);
        table.add_card(1, 1, &rt);
        table.add_card(2, 3, &rt);

        table.release(&rt);
        assert_eq!(table.from_region(), NIL);
        assert_eq!(table.occupied(), 0);
        assert_eq!(table.state(), ExpansionState::Unexpanded);

        // Freed side tables are recycled by the next expansion
        let table2 = FineTable::new(2048, 4);
        table2.reset_for(6, &rt);
        table2.add_card(3, 1, &rt);
        assert_eq!(rt.side_bitmaps.allocated(), before + 3);
    }

    #[test]
    fn test_reset_for_keeps_expansion() {
        let rt = runtime(2);
        let table = FineTable::new(512, 2);
        table.reset_for(1, &rt);
        table.add_card(100, 1, &rt);
        assert_eq!(table.state(), ExpansionState::Expanded);

        table.reset_for(2, &rt);
        assert_eq!(table.state(), ExpansionState::Expanded);
        assert_eq!(table.occupied(), 0);
        assert!(!table.contains_card(100, &rt));
        assert_eq!(table.from_region(), 2);
    }

    #[test]
    fn test_concurrent_workers_disjoint_side_tables() {
        use std::sync::Arc;

        let workers = 4;
        let rt = Arc::new(runtime(workers));
        let table = Arc::new(FineTable::new(2048, workers));
        table.reset_for(0, &rt);

        let mut handles = Vec::new();
        for w in 0..workers {
            let rt = Arc::clone(&rt);
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..256u32 {
                    table.add_card(i * (w as u32 + 1) % 2048, w, &rt);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let exact = table.contract(&rt);
        assert!(exact > 0);
        assert_eq!(exact, table.base().count());
    }
}

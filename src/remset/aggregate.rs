//! Per-region three-tier aggregate.
//!
//! `CrossRegionTable` owns, for one owning region, everything that records
//! which other regions reference it: the sparse card set, the hash
//! directory of fine tables, and the coarse region bitmap.
//!
//! # Locking
//!
//! The common add path is lock-free: from-card cache, coarse-map test, and
//! the bucket-chain probe are plain atomic reads, and a found fine table
//! absorbs the card without any lock. One narrow mutex (which also guards
//! the sparse set) is taken only for structural mutation — sparse inserts,
//! promotion, eviction — and is never held across a bit-set or a scan of
//! another region.
//!
//! # Promotion and eviction
//!
//! A from-region's cards live in exactly one tier. Overflowing a sparse
//! entry promotes it to a fine table seeded with the overflowed cards.
//! When the directory is at capacity, the table with the most cards is
//! evicted: its from-region is marked in the coarse bitmap (a conservative
//! superset of the precise bits it replaces) and the table object is
//! re-seeded for the newcomer. The coarse bit is published before the
//! unlink, and the locked slow path re-checks the coarse map, so a racing
//! reader can never re-create precise state for a coarsened region.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::region::RegionBitmap;
use crate::remset::arena::NIL;
use crate::remset::sparse::{SparseAddResult, SparseCardSet};
use crate::remset::CardLiveness;
use crate::runtime::RemSetRuntime;
use crate::Tier;

/// Buckets probed per eviction in sampling mode.
const FINE_EVICTION_SAMPLE_SIZE: usize = 4;

/// Three-tier remembered-set aggregate for one owning region.
pub struct CrossRegionTable {
    /// The owning region.
    owner: u32,
    /// Fine-table directory: chain heads, indexed by from-region hash.
    buckets: Box<[AtomicU32]>,
    /// Live fine tables in the directory.
    fine_count: AtomicUsize,
    /// Sparse tier; its mutex doubles as the structural lock.
    sparse: Mutex<SparseCardSet>,
    /// From-regions degraded to all-cards-presumed tracking.
    coarse_map: RegionBitmap,
    /// Set bits in `coarse_map`.
    coarse_count: AtomicUsize,
    /// Rotor for sampled eviction scans.
    eviction_rotor: AtomicUsize,
}

impl CrossRegionTable {
    /// Create an empty aggregate for `owner`.
    pub fn new(rt: &RemSetRuntime, owner: u32) -> Self {
        let config = rt.config();
        let buckets: Vec<AtomicU32> = (0..config.bucket_count())
            .map(|_| AtomicU32::new(NIL))
            .collect();
        Self {
            owner,
            buckets: buckets.into_boxed_slice(),
            fine_count: AtomicUsize::new(0),
            sparse: Mutex::new(SparseCardSet::new(config.sparse_entry_cards)),
            coarse_map: RegionBitmap::new(config.max_regions),
            coarse_count: AtomicUsize::new(0),
            eviction_rotor: AtomicUsize::new(0),
        }
    }

    /// The owning region.
    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner
    }

    #[inline]
    fn bucket_of(&self, from_region: u32) -> usize {
        (from_region as usize) & (self.buckets.len() - 1)
    }

    /// Lock-free probe of a bucket chain for a from-region's fine table.
    fn find_fine(&self, rt: &RemSetRuntime, from_region: u32) -> Option<u32> {
        let mut index = self.buckets[self.bucket_of(from_region)].load(Ordering::Acquire);
        while index != NIL {
            let table = rt.fine_tables.get(index);
            if table.from_region() == from_region {
                return Some(index);
            }
            index = table.next().load(Ordering::Acquire);
        }
        None
    }

    // =========================================================================
    // Addition
    // =========================================================================

    /// Record that the card containing `from_addr` references the owner.
    ///
    /// `worker` identifies the calling collector thread (0 for the
    /// refinement thread). Lock-free unless the addition changes structure.
    pub fn add_reference(&self, rt: &RemSetRuntime, from_addr: usize, worker: usize) {
        debug_assert!(worker < rt.config().workers, "worker id out of range");
        let stats = rt.stats();
        stats.record_add();

        let geometry = rt.geometry();
        let from_region = geometry.region_index(from_addr);
        let card = geometry.card_within_region(from_addr);
        let global_card = geometry.global_card(from_region, card);

        // Fast path 1: the worker just added this exact card.
        if rt
            .from_card_cache
            .contains_or_insert(worker, self.owner, global_card as u64)
        {
            stats.record_cache_hit();
            return;
        }

        // Fast path 2: the from-region is already all-cards-presumed.
        if self.coarse_map.contains(from_region) {
            stats.record_coarse_hit();
            return;
        }

        // Fast path 3: an existing fine table absorbs the card lock-free.
        if let Some(index) = self.find_fine(rt, from_region) {
            rt.fine_tables.get(index).add_card(card, worker, rt);
            stats.record_fine_add();
            return;
        }

        let mut sparse = self.sparse.lock();

        // Another thread may have raced the structural change.
        if let Some(index) = self.find_fine(rt, from_region) {
            drop(sparse);
            rt.fine_tables.get(index).add_card(card, worker, rt);
            stats.record_fine_add();
            return;
        }
        if self.coarse_map.contains(from_region) {
            stats.record_coarse_hit();
            return;
        }

        if rt.config().sparse_enabled {
            match sparse.add_card(from_region, card) {
                SparseAddResult::Added => {
                    stats.record_sparse_add();
                    return;
                }
                SparseAddResult::Found => return,
                SparseAddResult::Overflow => {} // promote below
            }
        }

        // Promote: obtain a table, evicting if the directory is full.
        let index = if self.fine_count.load(Ordering::Relaxed) >= rt.config().fine_table_capacity()
        {
            let victim = self.evict_fine_table(rt);
            stats.record_fine_recycle();
            victim
        } else {
            let fresh = rt.fine_tables.alloc();
            stats.record_fine_alloc();
            fresh
        };

        let table = rt.fine_tables.get(index);
        table.reset_for(from_region, rt);
        if let Some(entry) = sparse.delete_entry(from_region) {
            for &seed in entry.cards() {
                table.seed_card(seed);
            }
        }
        table.seed_card(card);

        let bucket = &self.buckets[self.bucket_of(from_region)];
        table.next().store(bucket.load(Ordering::Relaxed), Ordering::Relaxed);
        bucket.store(index, Ordering::Release);
        self.fine_count.fetch_add(1, Ordering::Relaxed);
        stats.record_promotion();
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Pick, coarsen, and unlink the highest-occupancy fine table.
    ///
    /// Called with the structural lock held. Returns the victim's index
    /// for immediate reuse.
    fn evict_fine_table(&self, rt: &RemSetRuntime) -> u32 {
        let victim = if rt.config().eviction_sampling {
            let sampled = self.scan_for_victim_sampled(rt);
            // A sparse sample can miss every chain; fall back to the full scan.
            if sampled == NIL {
                self.scan_for_victim_full(rt)
            } else {
                sampled
            }
        } else {
            self.scan_for_victim_full(rt)
        };
        debug_assert!(victim != NIL, "eviction requested on an empty directory");

        let table = rt.fine_tables.get(victim);
        let from_region = table.from_region();

        // Coarsen first: readers that miss the unlinked table must observe
        // the coarse bit instead.
        if self.coarse_map.set(from_region) {
            self.coarse_count.fetch_add(1, Ordering::Relaxed);
        }
        rt.stats().record_coarsening();

        self.unlink(rt, victim, from_region);
        self.fine_count.fetch_sub(1, Ordering::Relaxed);
        victim
    }

    fn scan_for_victim_full(&self, rt: &RemSetRuntime) -> u32 {
        let mut victim = NIL;
        let mut victim_occupied = 0;
        for bucket in self.buckets.iter() {
            let mut index = bucket.load(Ordering::Relaxed);
            while index != NIL {
                let table = rt.fine_tables.get(index);
                if victim == NIL || table.occupied() > victim_occupied {
                    victim = index;
                    victim_occupied = table.occupied();
                }
                index = table.next().load(Ordering::Relaxed);
            }
        }
        victim
    }

    fn scan_for_victim_sampled(&self, rt: &RemSetRuntime) -> u32 {
        let num_buckets = self.buckets.len();
        let stride = (num_buckets / FINE_EVICTION_SAMPLE_SIZE).max(1);
        let start = self.eviction_rotor.fetch_add(1, Ordering::Relaxed);

        let mut victim = NIL;
        let mut victim_occupied = 0;
        for i in 0..FINE_EVICTION_SAMPLE_SIZE.min(num_buckets) {
            let bucket = &self.buckets[(start + i * stride) & (num_buckets - 1)];
            let mut index = bucket.load(Ordering::Relaxed);
            while index != NIL {
                let table = rt.fine_tables.get(index);
                if victim == NIL || table.occupied() > victim_occupied {
                    victim = index;
                    victim_occupied = table.occupied();
                }
                index = table.next().load(Ordering::Relaxed);
            }
        }
        victim
    }

    /// Unlink a table from its bucket chain. Structural lock held.
    fn unlink(&self, rt: &RemSetRuntime, index: u32, from_region: u32) {
        let bucket = &self.buckets[self.bucket_of(from_region)];
        let successor = rt.fine_tables.get(index).next().load(Ordering::Relaxed);

        let mut current = bucket.load(Ordering::Relaxed);
        if current == index {
            bucket.store(successor, Ordering::Release);
            return;
        }
        while current != NIL {
            let link = rt.fine_tables.get(current).next();
            let next = link.load(Ordering::Relaxed);
            if next == index {
                link.store(successor, Ordering::Release);
                return;
            }
            current = next;
        }
        debug_assert!(false, "table missing from its bucket chain");
    }

    // =========================================================================
    // Occupancy
    // =========================================================================

    /// Cards in the sparse tier.
    pub fn occ_sparse(&self) -> usize {
        self.sparse.lock().occupied()
    }

    /// Cards across all fine tables.
    pub fn occ_fine(&self, rt: &RemSetRuntime) -> usize {
        let mut total = 0;
        for bucket in self.buckets.iter() {
            let mut index = bucket.load(Ordering::Acquire);
            while index != NIL {
                let table = rt.fine_tables.get(index);
                total += table.occupied();
                index = table.next().load(Ordering::Acquire);
            }
        }
        total
    }

    /// Cards attributed to coarsened from-regions.
    ///
    /// An over-approximation by construction: every card of a coarsened
    /// region counts.
    pub fn occ_coarse(&self, rt: &RemSetRuntime) -> usize {
        self.coarse_count.load(Ordering::Relaxed) * rt.geometry().cards_per_region()
    }

    /// Total cards represented across all three tiers.
    pub fn occupied(&self, rt: &RemSetRuntime) -> usize {
        self.occ_sparse() + self.occ_fine(rt) + self.occ_coarse(rt)
    }

    /// Live fine tables in the directory.
    #[inline]
    pub fn fine_table_count(&self) -> usize {
        self.fine_count.load(Ordering::Relaxed)
    }

    /// Coarsened from-regions.
    #[inline]
    pub fn coarse_region_count(&self) -> usize {
        self.coarse_count.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Test whether the card containing `from_addr` is recorded.
    pub fn contains_reference(&self, rt: &RemSetRuntime, from_addr: usize) -> bool {
        let geometry = rt.geometry();
        let from_region = geometry.region_index(from_addr);
        if self.coarse_map.contains(from_region) {
            return true;
        }
        let card = geometry.card_within_region(from_addr);
        if let Some(index) = self.find_fine(rt, from_region) {
            return rt.fine_tables.get(index).contains_card(card, rt);
        }
        self.sparse.lock().contains_card(from_region, card)
    }

    /// The tier currently holding a from-region, if any.
    ///
    /// Exactly one tier claims a tracked from-region at any time.
    pub fn tier_of(&self, rt: &RemSetRuntime, from_region: u32) -> Option<Tier> {
        if self.coarse_map.contains(from_region) {
            return Some(Tier::Coarse);
        }
        if self.find_fine(rt, from_region).is_some() {
            return Some(Tier::Fine);
        }
        if self.sparse.lock().contains_entry(from_region) {
            return Some(Tier::Sparse);
        }
        None
    }

    /// The coarse bitmap, for the iterator's third phase.
    #[inline]
    pub(crate) fn coarse_map(&self) -> &RegionBitmap {
        &self.coarse_map
    }

    /// Bucket heads, for the iterator's fine phase.
    #[inline]
    pub(crate) fn buckets(&self) -> &[AtomicU32] {
        &self.buckets
    }

    /// Snapshot the sparse tier as global card indices.
    pub(crate) fn snapshot_sparse(&self, rt: &RemSetRuntime) -> Vec<usize> {
        let geometry = rt.geometry();
        let sparse = self.sparse.lock();
        let mut cards = Vec::with_capacity(sparse.occupied());
        sparse.for_each_card(|from, card| cards.push(geometry.global_card(from, card)));
        cards
    }

    // =========================================================================
    // Structural Operations (pause boundaries)
    // =========================================================================

    /// Merge every fine table's side tables into its base.
    ///
    /// Single-threaded, between pauses; must run before occupancies or
    /// iteration are trusted.
    pub fn contract_all(&self, rt: &RemSetRuntime) {
        for bucket in self.buckets.iter() {
            let mut index = bucket.load(Ordering::Relaxed);
            while index != NIL {
                let table = rt.fine_tables.get(index);
                table.contract(rt);
                rt.stats().record_contract();
                index = table.next().load(Ordering::Relaxed);
            }
        }
    }

    /// Drop references whose from-region or from-card is no longer live.
    ///
    /// Runs at a collection-phase boundary: intersects the coarse map with
    /// region liveness, drops or intersects fine tables, filters sparse
    /// entries, and invalidates the from-card cache for the owner.
    pub fn scrub<L: CardLiveness>(&self, rt: &RemSetRuntime, live: &L) {
        let mut sparse = self.sparse.lock();

        let coarse_remaining = self.coarse_map.retain(|region| live.region_live(region));
        self.coarse_count.store(coarse_remaining, Ordering::Relaxed);

        for bucket in self.buckets.iter() {
            // Rebuild the chain, keeping only surviving tables.
            let mut index = bucket.swap(NIL, Ordering::Relaxed);
            let mut kept = NIL;
            while index != NIL {
                let table = rt.fine_tables.get(index);
                let next = table.next().load(Ordering::Relaxed);
                let from_region = table.from_region();

                table.contract(rt);
                let survives = live.region_live(from_region)
                    && table.retain_cards(|card| live.card_live(from_region, card)) > 0;

                if survives {
                    table.next().store(kept, Ordering::Relaxed);
                    kept = index;
                } else {
                    table.release(rt);
                    rt.fine_tables.free(index);
                    self.fine_count.fetch_sub(1, Ordering::Relaxed);
                    rt.stats().record_scrub_drop();
                }
                index = next;
            }
            bucket.store(kept, Ordering::Release);
        }

        sparse.scrub(
            |region| live.region_live(region),
            |region, card| live.card_live(region, card),
        );

        rt.from_card_cache.invalidate_owner(self.owner);
    }

    /// Unconditionally empty all three tiers.
    pub fn clear(&self, rt: &RemSetRuntime) {
        let mut sparse = self.sparse.lock();
        sparse.clear();

        for bucket in self.buckets.iter() {
            let mut index = bucket.swap(NIL, Ordering::Relaxed);
            while index != NIL {
                let table = rt.fine_tables.get(index);
                let next = table.next().load(Ordering::Relaxed);
                table.release(rt);
                rt.fine_tables.free(index);
                index = next;
            }
        }
        self.fine_count.store(0, Ordering::Relaxed);

        self.coarse_map.clear_all();
        self.coarse_count.store(0, Ordering::Relaxed);

        rt.from_card_cache.invalidate_owner(self.owner);
    }
}

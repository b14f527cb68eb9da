//! Three-phase remembered-set iterator.
//!
//! Produces the lazy, finite, one-shot sequence of global card indices a
//! scanning worker walks during collection:
//!
//! 1. **Sparse** — the sparse tier's entries (snapshotted at
//!    initialization, so the structural lock is not held across the walk).
//! 2. **Fine** — every fine table's base bitmap, chain by chain.
//! 3. **Coarse** — every card of every coarsened from-region, in region
//!    order.
//!
//! Phase transitions are strictly forward; re-iterating requires a fresh
//! iterator from the facade. Ordering is representation order, not global
//! address order. Absent concurrent mutation, the number of values
//! yielded equals `occupied()` at initialization time (checked in
//! verification builds when the sequence is exhausted).
//!
//! Side tables must have been merged ([`contract_all`]) before iteration;
//! the fine phase reads base bitmaps only.
//!
//! [`contract_all`]: crate::remset::RegionRemSet::contract_all

use std::sync::atomic::Ordering;

use crate::remset::aggregate::CrossRegionTable;
use crate::remset::arena::NIL;
use crate::runtime::RemSetRuntime;

/// Iteration phase, advancing strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sparse,
    Fine,
    Coarse,
    Done,
}

/// Lazy one-shot iterator over a region's recorded cards.
///
/// Yields heap-global card indices. See the module docs for phase order
/// and guarantees.
pub struct RemSetIter<'a> {
    rt: &'a RemSetRuntime,
    table: &'a CrossRegionTable,
    phase: Phase,

    // Sparse phase
    sparse_cards: Vec<usize>,
    sparse_pos: usize,

    // Fine phase
    bucket: usize,
    fine_index: u32,
    fine_base_card: usize,
    word: usize,
    bits: u64,

    // Coarse phase
    coarse_word: usize,
    coarse_bits: u64,
    coarse_next_card: usize,
    coarse_cards_left: usize,

    // Completeness accounting
    expected: usize,
    yielded: usize,
}

impl<'a> RemSetIter<'a> {
    /// Initialize an iterator over `table`'s current contents.
    pub(crate) fn new(rt: &'a RemSetRuntime, table: &'a CrossRegionTable) -> Self {
        let sparse_cards = table.snapshot_sparse(rt);
        let expected = sparse_cards.len() + table.occ_fine(rt) + table.occ_coarse(rt);
        Self {
            rt,
            table,
            phase: Phase::Sparse,
            sparse_cards,
            sparse_pos: 0,
            bucket: 0,
            fine_index: NIL,
            fine_base_card: 0,
            word: 0,
            bits: 0,
            coarse_word: 0,
            coarse_bits: 0,
            coarse_next_card: 0,
            coarse_cards_left: 0,
            expected,
            yielded: 0,
        }
    }

    /// Number of cards this iterator will yield in total.
    #[inline]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Load the next fine table in chain/bucket order, if any.
    fn advance_fine_table(&mut self) -> bool {
        let geometry = self.rt.geometry();
        loop {
            let next = if self.fine_index == NIL {
                // Start of a bucket chain
                if self.bucket >= self.table.buckets().len() {
                    return false;
                }
                let head = self.table.buckets()[self.bucket].load(Ordering::Acquire);
                self.bucket += 1;
                head
            } else {
                self.rt
                    .fine_tables
                    .get(self.fine_index)
                    .next()
                    .load(Ordering::Acquire)
            };

            if next == NIL {
                self.fine_index = NIL;
                continue;
            }
            self.fine_index = next;
            let table = self.rt.fine_tables.get(next);
            self.fine_base_card = geometry.global_card(table.from_region(), 0);
            self.word = 0;
            self.bits = 0;
            return true;
        }
    }

    /// Produce the next fine-phase card, walking words and chains.
    fn next_fine(&mut self) -> Option<usize> {
        loop {
            if self.bits != 0 {
                let bit = self.bits.trailing_zeros() as usize;
                self.bits &= self.bits - 1;
                return Some(self.fine_base_card + (self.word - 1) * 64 + bit);
            }
            if self.fine_index != NIL {
                let words = self.rt.fine_tables.get(self.fine_index).base().words();
                if self.word < words.len() {
                    self.bits = words[self.word].load(Ordering::Relaxed);
                    self.word += 1;
                    continue;
                }
            }
            if !self.advance_fine_table() {
                return None;
            }
        }
    }

    /// Produce the next coarse-phase card: full card ranges per region.
    fn next_coarse(&mut self) -> Option<usize> {
        let cards_per_region = self.rt.geometry().cards_per_region();
        loop {
            if self.coarse_cards_left > 0 {
                self.coarse_cards_left -= 1;
                let card = self.coarse_next_card;
                self.coarse_next_card += 1;
                return Some(card);
            }
            if self.coarse_bits != 0 {
                let bit = self.coarse_bits.trailing_zeros() as usize;
                self.coarse_bits &= self.coarse_bits - 1;
                let region = (self.coarse_word - 1) * 64 + bit;
                self.coarse_next_card = region * cards_per_region;
                self.coarse_cards_left = cards_per_region;
                continue;
            }
            let words = self.table.coarse_map().words();
            if self.coarse_word >= words.len() {
                return None;
            }
            self.coarse_bits = words[self.coarse_word].load(Ordering::Relaxed);
            self.coarse_word += 1;
        }
    }
}

impl Iterator for RemSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            match self.phase {
                Phase::Sparse => {
                    if self.sparse_pos < self.sparse_cards.len() {
                        let card = self.sparse_cards[self.sparse_pos];
                        self.sparse_pos += 1;
                        self.yielded += 1;
                        return Some(card);
                    }
                    self.phase = Phase::Fine;
                }
                Phase::Fine => match self.next_fine() {
                    Some(card) => {
                        self.yielded += 1;
                        return Some(card);
                    }
                    None => self.phase = Phase::Coarse,
                },
                Phase::Coarse => match self.next_coarse() {
                    Some(card) => {
                        self.yielded += 1;
                        return Some(card);
                    }
                    None => {
                        self.phase = Phase::Done;
                        debug_assert_eq!(
                            self.yielded, self.expected,
                            "iterator yield count diverged from occupancy"
                        );
                    }
                },
                Phase::Done => return None,
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}

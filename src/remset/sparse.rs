//! Sparse tier: a few cards per from-region.
//!
//! Most from-regions reference an owning region through only a handful of
//! cards, so the first K cards are tracked in a compact hash map instead
//! of a full bitmap. When a from-region's entry overflows, the aggregate
//! promotes it to a fine table seeded with the overflowed cards.
//!
//! The set is always mutated under the aggregate's structural lock; it
//! needs no internal synchronization.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Inline card slots per entry; entries configured larger spill to the heap.
const SPARSE_INLINE_CARDS: usize = 8;

/// Outcome of a sparse add.
///
/// `Overflow` is expected control flow, not an error: it tells the
/// aggregate to promote the entry to a fine table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseAddResult {
    /// The card was inserted.
    Added,
    /// The card was already present.
    Found,
    /// The entry is at capacity; promote before retrying.
    Overflow,
}

/// Card slots for one from-region.
#[derive(Debug, Default)]
pub struct SparseEntry {
    cards: SmallVec<[u32; SPARSE_INLINE_CARDS]>,
}

impl SparseEntry {
    /// Cards recorded for this from-region.
    #[inline]
    pub fn cards(&self) -> &[u32] {
        &self.cards
    }
}

/// Mapping from from-region index to its sparse card slots.
pub struct SparseCardSet {
    entries: FxHashMap<u32, SparseEntry>,
    /// Card capacity per entry (K).
    cards_per_entry: usize,
    /// Running card total across all entries.
    total_cards: usize,
}

impl SparseCardSet {
    /// Create an empty set with `cards_per_entry` slots per from-region.
    pub fn new(cards_per_entry: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            cards_per_entry,
            total_cards: 0,
        }
    }

    /// Insert a card for a from-region.
    pub fn add_card(&mut self, from_region: u32, card: u32) -> SparseAddResult {
        let entry = self.entries.entry(from_region).or_default();
        if entry.cards.contains(&card) {
            return SparseAddResult::Found;
        }
        if entry.cards.len() >= self.cards_per_entry {
            return SparseAddResult::Overflow;
        }
        entry.cards.push(card);
        self.total_cards += 1;
        SparseAddResult::Added
    }

    /// Remove and return a from-region's entry (promotion seed).
    pub fn delete_entry(&mut self, from_region: u32) -> Option<SparseEntry> {
        let entry = self.entries.remove(&from_region)?;
        self.total_cards -= entry.cards.len();
        Some(entry)
    }

    /// Test whether a from-region has an entry.
    #[inline]
    pub fn contains_entry(&self, from_region: u32) -> bool {
        self.entries.contains_key(&from_region)
    }

    /// Test whether a specific card is recorded.
    pub fn contains_card(&self, from_region: u32, card: u32) -> bool {
        self.entries
            .get(&from_region)
            .is_some_and(|e| e.cards.contains(&card))
    }

    /// Total cards across all entries.
    #[inline]
    pub fn occupied(&self) -> usize {
        self.total_cards
    }

    /// Number of from-regions with an entry.
    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_cards = 0;
    }

    /// Drop dead regions and dead cards.
    pub fn scrub<F, G>(&mut self, mut region_live: F, mut card_live: G)
    where
        F: FnMut(u32) -> bool,
        G: FnMut(u32, u32) -> bool,
    {
        self.entries.retain(|&from, entry| {
            if !region_live(from) {
                return false;
            }
            entry.cards.retain(|&mut c| card_live(from, c));
            !entry.cards.is_empty()
        });
        self.total_cards = self.entries.values().map(|e| e.cards.len()).sum();
    }

    /// Call `f` with every (from-region, card) pair.
    pub fn for_each_card<F>(&self, mut f: F)
    where
        F: FnMut(u32, u32),
    {
        for (&from, entry) in &self.entries {
            for &card in &entry.cards {
                f(from, card);
            }
        }
    }
}

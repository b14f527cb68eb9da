//! End-to-end remembered-set and pause-budget scenarios.
//!
//! Exercises the public surface the collector orchestrator uses: barrier
//! additions across tier promotions, claiming plus iteration during
//! scanning, scrub/clear at phase boundaries, and pause admission control.

use vesper_gc::{
    CardLiveness, MmuTracker, RegionRemSet, RemSetConfig, RemSetRuntime, Tier,
};

const HEAP_BASE: usize = 0x4000_0000;
const REGION_SIZE: usize = 1024 * 1024;
const CARD_SIZE: usize = 512;

fn runtime(config: RemSetConfig) -> RemSetRuntime {
    RemSetRuntime::new(config, HEAP_BASE).expect("valid config")
}

fn addr(region: u32, card: u32) -> usize {
    HEAP_BASE + region as usize * REGION_SIZE + card as usize * CARD_SIZE
}

// =============================================================================
// Tier Lifecycle
// =============================================================================

#[test]
fn test_reference_lifecycle_through_all_tiers() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        sparse_entry_cards: 2,
        fine_directory_log2: 2,
        max_fine_tables: 2,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 0);

    // Two cards stay sparse
    remset.add_reference(&rt, addr(1, 0), 0);
    remset.add_reference(&rt, addr(1, 1), 0);
    assert_eq!(remset.tier_of(&rt, 1), Some(Tier::Sparse));

    // A third promotes to fine, carrying the sparse seeds
    remset.add_reference(&rt, addr(1, 2), 0);
    assert_eq!(remset.tier_of(&rt, 1), Some(Tier::Fine));
    assert_eq!(remset.occupied(&rt), 3);

    // Fill the directory, then overflow it to force coarsening
    for region in 2..4u32 {
        for card in 0..3 {
            remset.add_reference(&rt, addr(region, card), 0);
        }
    }
    assert!(remset.aggregate().coarse_region_count() > 0);

    // Whatever the tier, every added card is still visible
    for region in 1..4u32 {
        for card in 0..3 {
            assert!(remset.contains_reference(&rt, addr(region, card)));
        }
    }
}

#[test]
fn test_idempotent_adds_across_tiers() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        sparse_entry_cards: 2,
        fine_directory_log2: 2,
        max_fine_tables: 2,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 0);

    for region in 1..6u32 {
        for card in 0..4 {
            remset.add_reference(&rt, addr(region, card), 0);
        }
    }
    let first = remset.occupied(&rt);

    // Repeating every add changes nothing
    for region in 1..6u32 {
        for card in 0..4 {
            remset.add_reference(&rt, addr(region, card), 0);
        }
    }
    assert_eq!(remset.occupied(&rt), first);
}

#[test]
fn test_partition_invariant_under_churn() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        sparse_entry_cards: 2,
        fine_directory_log2: 2,
        max_fine_tables: 2,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 0);
    let agg = remset.aggregate();

    for region in 1..12u32 {
        for card in 0..(region % 5 + 1) {
            remset.add_reference(&rt, addr(region, card), 0);

            // The three tiers always partition the total
            assert_eq!(
                remset.occupied(&rt),
                agg.occ_sparse() + agg.occ_fine(&rt) + agg.occ_coarse(&rt)
            );
        }
    }
}

// =============================================================================
// Claim + Iterate (the scanning protocol)
// =============================================================================

#[test]
fn test_claimed_scan_sees_every_card() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        sparse_entry_cards: 2,
        fine_directory_log2: 2,
        max_fine_tables: 2,
        workers: 2,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 7);

    for region in 1..10u32 {
        for card in 0..(region % 4 + 1) {
            remset.add_reference(&rt, addr(region, card), (region % 2) as usize);
        }
    }

    // Pause boundary: merge side tables, then scan under a claim
    remset.contract_all(&rt);
    assert!(remset.try_claim());

    let expected = remset.occupied(&rt);
    let scanned: Vec<usize> = remset.iter(&rt).collect();
    assert_eq!(scanned.len(), expected);
    remset.set_complete();

    // The next phase reopens the claim
    remset.reset_claim();
    assert!(remset.try_claim());
}

#[test]
fn test_iterator_covers_coarse_ranges() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        fine_directory_log2: 2,
        max_fine_tables: 1,
        sparse_enabled: false,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 0);
    let cards_per_region = rt.geometry().cards_per_region();

    remset.add_reference(&rt, addr(1, 42), 0);
    remset.add_reference(&rt, addr(2, 7), 0); // evicts region 1 to coarse

    let cards: Vec<usize> = remset.iter(&rt).collect();
    assert_eq!(cards.len(), 1 + cards_per_region);
    // The precise card for region 2, plus region 1's full range
    assert!(cards.contains(&(2 * cards_per_region + 7)));
    assert!(cards.contains(&(cards_per_region + 42)));
    assert!(cards.contains(&(cards_per_region)));
    assert!(cards.contains(&(2 * cards_per_region - 1)));
}

// =============================================================================
// Scrub / Clear Boundaries
// =============================================================================

struct RegionsAlive(Vec<u32>);

impl CardLiveness for RegionsAlive {
    fn region_live(&self, region: u32) -> bool {
        self.0.contains(&region)
    }
    fn card_live(&self, _region: u32, _card: u32) -> bool {
        true
    }
}

#[test]
fn test_scrub_then_rescan() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        sparse_entry_cards: 2,
        fine_directory_log2: 2,
        max_fine_tables: 2,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 0);

    for region in 1..6u32 {
        for card in 0..3 {
            remset.add_reference(&rt, addr(region, card), 0);
        }
    }

    // Regions 2 and 4 die
    remset.scrub(&rt, &RegionsAlive(vec![1, 3, 5]));

    assert_eq!(remset.tier_of(&rt, 2), None);
    assert_eq!(remset.tier_of(&rt, 4), None);
    for region in [1u32, 3, 5] {
        assert!(remset.tier_of(&rt, region).is_some());
    }

    // Iterator agrees with the scrubbed occupancy
    let occupied = remset.occupied(&rt);
    assert_eq!(remset.iter(&rt).count(), occupied);

    // Scrub invalidated the cache: dead-region cards can be re-added
    remset.add_reference(&rt, addr(2, 0), 0);
    assert!(remset.contains_reference(&rt, addr(2, 0)));
}

#[test]
fn test_clear_resets_for_region_reuse() {
    let rt = runtime(RemSetConfig {
        max_regions: 64,
        ..Default::default()
    });
    let remset = RegionRemSet::new(&rt, 5);

    for region in 1..4u32 {
        remset.add_reference(&rt, addr(region, 0), 0);
    }
    remset.record_forwarded(9);
    remset.try_claim();

    remset.clear(&rt);
    assert!(remset.is_empty(&rt));
    assert!(!remset.forwards_into(9));
    assert_eq!(remset.iter(&rt).count(), 0);

    // The region is reusable immediately, including previously-seen cards
    remset.add_reference(&rt, addr(1, 0), 0);
    assert_eq!(remset.occupied(&rt), 1);
}

// =============================================================================
// Parallel Additions
// =============================================================================

#[test]
fn test_parallel_workers_then_scan() {
    use std::sync::Arc;

    let workers = 4;
    let rt = Arc::new(runtime(RemSetConfig {
        max_regions: 64,
        workers,
        ..Default::default()
    }));
    let remset = Arc::new(RegionRemSet::new(&rt, 0));

    let mut handles = Vec::new();
    for w in 0..workers {
        let rt = Arc::clone(&rt);
        let remset = Arc::clone(&remset);
        handles.push(std::thread::spawn(move || {
            // Workers overlap heavily on regions and cards
            for region in 1..5u32 {
                for card in 0..128u32 {
                    remset.add_reference(&rt, addr(region, (card + w as u32) % 128), w);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    remset.contract_all(&rt);
    assert_eq!(remset.occupied(&rt), 4 * 128);
    assert_eq!(remset.iter(&rt).count(), 4 * 128);
}

// =============================================================================
// Pause Budget
// =============================================================================

#[test]
fn test_orchestrator_pause_loop_respects_budget() {
    let tracker = MmuTracker::new(0.2, 0.05);
    let mut now = 0.0f64;

    for _ in 0..100 {
        let budget = tracker.longest_pause(now);
        if budget > 0.001 {
            // Take half the allowed pause
            let pause = budget / 2.0;
            tracker.add_pause(now, now + pause);
            now += pause;
        } else {
            // Ask when a 10ms pause could run, and skip ahead to it
            let delay = tracker.when_sec(now, 0.01);
            now += delay.max(0.005);
        }
        assert!(
            tracker.gc_time_in_window(now) <= tracker.max_gc_time() + 1.0e-5,
            "window overran at t={now}"
        );
    }
}

#[test]
fn test_tracker_from_config() {
    let config = RemSetConfig::default();
    let tracker = MmuTracker::from_config(&config);
    assert_eq!(tracker.time_slice(), config.mmu_time_slice);
    assert_eq!(tracker.max_gc_time(), config.mmu_max_gc_time);
}

//! Remembered-set configuration parameters.
//!
//! All sizes and thresholds are tunable for different heap shapes.
//! Default values match a mid-sized server heap.

use crate::mmu::OverflowPolicy;

/// Configuration for the remembered-set core.
///
/// # Example
///
/// ```ignore
/// use vesper_gc::RemSetConfig;
///
/// // Small directory for eviction-heavy workloads
/// let config = RemSetConfig {
///     fine_directory_log2: 4,
///     max_fine_tables: 8,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RemSetConfig {
    // =========================================================================
    // Heap Geometry
    // =========================================================================
    /// Size of each heap region in bytes (must be a power of two).
    ///
    /// Regions are the unit of collection; remembered sets are per region.
    ///
    /// Default: 1MB
    pub region_size: usize,

    /// Card granularity in bytes (must be a power of two, minimum 64).
    ///
    /// Cross-region references are tracked at card granularity. Smaller
    /// cards give more precise scanning at the cost of bitmap memory.
    ///
    /// Default: 512 bytes
    pub card_size: usize,

    /// Maximum number of regions in the heap.
    ///
    /// Sizes the coarse bitmap, the from-card cache, and the arena caps.
    ///
    /// Default: 1024
    pub max_regions: usize,

    // =========================================================================
    // Fine Directory
    // =========================================================================
    /// Log2 of the fine-table hash directory's bucket count.
    ///
    /// The directory is a power-of-two array of collision chains keyed by
    /// from-region index.
    ///
    /// Default: 6 (64 buckets)
    pub fine_directory_log2: u32,

    /// Maximum fine tables per region before eviction/coarsening.
    ///
    /// Set to 0 to derive as 4x the bucket count.
    ///
    /// Default: 0 (derived)
    pub max_fine_tables: usize,

    // =========================================================================
    // Sparse Tier
    // =========================================================================
    /// Track low-reference-count from-regions in the sparse tier.
    ///
    /// When disabled, the first reference from a new from-region allocates
    /// a fine table immediately.
    ///
    /// Default: true
    pub sparse_enabled: bool,

    /// Card slots per sparse entry before promotion to a fine table.
    ///
    /// Default: 8
    pub sparse_entry_cards: usize,

    // =========================================================================
    // Eviction
    // =========================================================================
    /// Sample a bounded number of buckets when choosing an eviction victim
    /// instead of scanning the whole directory.
    ///
    /// Bounded cost, slightly non-optimal victim choice. The deterministic
    /// full scan is the default; directory sizes are bounded and the scan
    /// is already amortized over promotions.
    ///
    /// Default: false
    pub eviction_sampling: bool,

    // =========================================================================
    // Workers
    // =========================================================================
    /// Number of collector worker threads.
    ///
    /// Determines the side-table fan-out of parallel-safe fine tables
    /// (workers beyond the first get a dedicated side table each) and the
    /// from-card cache width. Worker id 0 is also the refinement thread's
    /// id; it always takes the atomic path.
    ///
    /// Default: available parallelism
    pub workers: usize,

    // =========================================================================
    // Pause Budget (MMU)
    // =========================================================================
    /// Sliding-window length for the pause budget tracker, in seconds.
    ///
    /// Default: 0.2 (200ms)
    pub mmu_time_slice: f64,

    /// Maximum total GC time allowed inside any one window, in seconds.
    ///
    /// Default: 0.05 (50ms)
    pub mmu_max_gc_time: f64,

    /// Behavior when the pause queue overflows within one window.
    ///
    /// Default: [`OverflowPolicy::Strict`]
    pub mmu_overflow: OverflowPolicy,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Print remembered-set activity to stderr.
    ///
    /// Default: false
    pub trace: bool,

    /// Verify structural invariants after bulk operations.
    ///
    /// Expensive; useful when chasing remembered-set bugs.
    ///
    /// Default: false (enabled in debug builds)
    pub verify: bool,
}

impl Default for RemSetConfig {
    fn default() -> Self {
        Self {
            // Geometry
            region_size: 1024 * 1024, // 1MB
            card_size: 512,
            max_regions: 1024,

            // Fine directory
            fine_directory_log2: 6, // 64 buckets
            max_fine_tables: 0,     // derived

            // Sparse tier
            sparse_enabled: true,
            sparse_entry_cards: 8,

            // Eviction
            eviction_sampling: false,

            // Workers
            workers: num_cpus(),

            // Pause budget
            mmu_time_slice: 0.2,
            mmu_max_gc_time: 0.05,
            mmu_overflow: OverflowPolicy::Strict,

            // Debugging
            trace: false,
            verify: cfg!(debug_assertions),
        }
    }
}

impl RemSetConfig {
    /// Create a configuration optimized for small heaps.
    pub fn low_memory() -> Self {
        Self {
            region_size: 256 * 1024, // 256KB
            max_regions: 256,
            fine_directory_log2: 4, // 16 buckets
            sparse_entry_cards: 4,
            ..Default::default()
        }
    }

    /// Create a configuration optimized for large, reference-heavy heaps.
    pub fn throughput() -> Self {
        Self {
            region_size: 4 * 1024 * 1024, // 4MB
            fine_directory_log2: 8,       // 256 buckets
            sparse_entry_cards: 16,
            ..Default::default()
        }
    }

    /// Create a configuration that stresses promotion and eviction.
    ///
    /// Tiny directory, sampled victim selection, forgiving pause queue.
    /// Intended for collector stress testing, not production.
    pub fn stress() -> Self {
        Self {
            fine_directory_log2: 2, // 4 buckets
            max_fine_tables: 4,
            sparse_entry_cards: 2,
            eviction_sampling: true,
            mmu_overflow: OverflowPolicy::Forgiving,
            ..Default::default()
        }
    }

    /// Number of buckets in the fine-table directory.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        1 << self.fine_directory_log2
    }

    /// Fine-table capacity with the derived default applied.
    #[inline]
    pub fn fine_table_capacity(&self) -> usize {
        if self.max_fine_tables == 0 {
            self.bucket_count() * 4
        } else {
            self.max_fine_tables
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.region_size.is_power_of_two() || self.region_size < 64 * 1024 {
            return Err(ConfigError::InvalidRegionSize);
        }
        if self.card_size < 64
            || !self.card_size.is_power_of_two()
            || self.card_size >= self.region_size
        {
            return Err(ConfigError::InvalidCardSize);
        }
        if self.max_regions == 0 || self.max_regions > (u32::MAX as usize) {
            return Err(ConfigError::InvalidRegionCount);
        }
        if self.fine_directory_log2 == 0 || self.fine_directory_log2 > 20 {
            return Err(ConfigError::InvalidDirectorySize);
        }
        if self.sparse_enabled && self.sparse_entry_cards == 0 {
            return Err(ConfigError::InvalidSparseEntrySize);
        }
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        if self.mmu_time_slice <= 0.0
            || self.mmu_max_gc_time <= 0.0
            || self.mmu_max_gc_time > self.mmu_time_slice
        {
            return Err(ConfigError::InvalidMmuWindow);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Region size must be a power of two, minimum 64KB.
    InvalidRegionSize,
    /// Card size must be a power of two, minimum 64, smaller than a region.
    InvalidCardSize,
    /// Region count must be nonzero and fit in a u32 index.
    InvalidRegionCount,
    /// Directory log2 must be between 1 and 20.
    InvalidDirectorySize,
    /// Sparse entries must hold at least one card when the tier is enabled.
    InvalidSparseEntrySize,
    /// Worker count must be at least 1.
    InvalidWorkerCount,
    /// MMU window parameters must be positive, with max GC time within the slice.
    InvalidMmuWindow,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidRegionSize => {
                write!(f, "region size must be a power of two, minimum 64KB")
            }
            ConfigError::InvalidCardSize => write!(
                f,
                "card size must be a power of two, minimum 64, smaller than a region"
            ),
            ConfigError::InvalidRegionCount => {
                write!(f, "region count must be nonzero and fit in a u32 index")
            }
            ConfigError::InvalidDirectorySize => {
                write!(f, "fine directory log2 must be between 1 and 20")
            }
            ConfigError::InvalidSparseEntrySize => {
                write!(f, "sparse entries must hold at least one card")
            }
            ConfigError::InvalidWorkerCount => write!(f, "worker count must be at least 1"),
            ConfigError::InvalidMmuWindow => write!(
                f,
                "MMU parameters must be positive with max GC time within the time slice"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RemSetConfig::default().validate().is_ok());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(RemSetConfig::low_memory().validate().is_ok());
        assert!(RemSetConfig::throughput().validate().is_ok());
        assert!(RemSetConfig::stress().validate().is_ok());
    }

    #[test]
    fn test_invalid_card_size() {
        let config = RemSetConfig {
            card_size: 100, // not a power of two
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidCardSize));

        let config = RemSetConfig {
            card_size: 1024 * 1024, // card == region
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidCardSize));
    }

    #[test]
    fn test_invalid_mmu_window() {
        let config = RemSetConfig {
            mmu_max_gc_time: 0.5, // exceeds the 0.2s slice
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMmuWindow));
    }

    #[test]
    fn test_derived_fine_capacity() {
        let config = RemSetConfig::default();
        assert_eq!(config.fine_table_capacity(), config.bucket_count() * 4);

        let config = RemSetConfig {
            max_fine_tables: 7,
            ..Default::default()
        };
        assert_eq!(config.fine_table_capacity(), 7);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = RemSetConfig {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidWorkerCount));
    }
}

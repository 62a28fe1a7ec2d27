//! Centralized environment variable names and default values for shuffle merge tuning.

// Environment variable names
pub const ENV_SHUFFLE_MEMORY_BYTES: &str = "BJORN_SHUFFLE_MEMORY_BYTES";
pub const ENV_SHUFFLE_INPUT_BUFFER_FRACTION: &str = "BJORN_SHUFFLE_INPUT_BUFFER_FRACTION";
pub const ENV_SHUFFLE_MERGE_FRACTION: &str = "BJORN_SHUFFLE_MERGE_FRACTION";
pub const ENV_SHUFFLE_SEGMENT_FRACTION: &str = "BJORN_SHUFFLE_SEGMENT_FRACTION";
pub const ENV_MERGE_FACTOR: &str = "BJORN_MERGE_FACTOR";
pub const ENV_INMEM_MERGE_THRESHOLD: &str = "BJORN_INMEM_MERGE_THRESHOLD";
pub const ENV_SHUFFLE_SPILL_DIR: &str = "BJORN_SHUFFLE_SPILL_DIR";
pub const ENV_KEEP_INTERMEDIATES: &str = "BJORN_KEEP_INTERMEDIATES";

// Defaults (match the usual reduce-side shuffle tuning)
// Share of the reduce memory budget that may hold fetched segments at all
pub const DEFAULT_INPUT_BUFFER_FRACTION: f64 = 0.70;
// Share of usable memory that, once committed, kicks off the in-memory merge
pub const DEFAULT_MERGE_FRACTION: f64 = 0.66;
// Share of total memory above which a single segment goes straight to disk
pub const DEFAULT_SEGMENT_FRACTION: f64 = 0.25;
// Max fan-in for on-disk and final merges
pub const DEFAULT_MERGE_FACTOR: usize = 10;
// Pending in-memory segment count that also triggers a merge (0 disables)
pub const DEFAULT_INMEM_MERGE_THRESHOLD: usize = 1000;
/// Spill directory name under the system temp dir when `BJORN_SHUFFLE_SPILL_DIR` is not set
pub const DEFAULT_SPILL_DIR_NAME: &str = "bjorn_shuffle";

/// Buffer size for spill writers; merges stream large outputs through it.
pub const SPILL_WRITE_BUFFER_BYTES: usize = 4 * 1024 * 1024; // 4 MiB
/// Record header: two little-endian u32 lengths.
pub const RECORD_HEADER_BYTES: usize = 8;

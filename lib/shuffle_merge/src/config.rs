use crate::constants::*;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for one reduce task's shuffle merge.
///
/// The four memory inputs are required; everything else has a default.
/// Fractions are validated by [`MergeConfig::validate`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Total memory budget for shuffle buffering, in bytes.
    pub total_memory_bytes: u64,
    /// Fraction of the budget usable for fetched segments at all.
    pub usable_fraction: f64,
    /// Fraction of *usable* memory whose commitment triggers the in-memory merge.
    pub merge_trigger_fraction: f64,
    /// Fraction of *total* memory above which a single segment is spilled directly.
    pub single_segment_fraction: f64,
    #[serde(default = "default_merge_factor")]
    pub merge_factor: usize,
    #[serde(default = "default_inmem_threshold")]
    pub inmem_segment_threshold: usize,
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,
    #[serde(default)]
    pub keep_intermediates: bool,
}

fn default_merge_factor() -> usize { DEFAULT_MERGE_FACTOR }
fn default_inmem_threshold() -> usize { DEFAULT_INMEM_MERGE_THRESHOLD }
fn default_spill_dir() -> PathBuf { std::env::temp_dir().join(DEFAULT_SPILL_DIR_NAME) }

/// Byte thresholds derived once from a [`MergeConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryThresholds {
    pub capacity: u64,
    /// `capacity × usable_fraction`; the ledger never admits past this.
    pub usable: u64,
    /// `usable × merge_trigger_fraction`; committed bytes at or above it trigger a merge.
    pub merge_threshold: u64,
    /// Requests strictly larger than this bypass memory. Never above `usable`,
    /// so a request that could never fit is spilled rather than told to wait forever.
    pub max_single_segment: u64,
}

impl MergeConfig {
    pub fn new(total_memory_bytes: u64, usable_fraction: f64, merge_trigger_fraction: f64, single_segment_fraction: f64) -> Self {
        Self {
            total_memory_bytes,
            usable_fraction,
            merge_trigger_fraction,
            single_segment_fraction,
            merge_factor: DEFAULT_MERGE_FACTOR,
            inmem_segment_threshold: DEFAULT_INMEM_MERGE_THRESHOLD,
            spill_dir: default_spill_dir(),
            keep_intermediates: false,
        }
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self { self.spill_dir = dir.into(); self }

    pub fn with_merge_factor(mut self, factor: usize) -> Self { self.merge_factor = factor; self }

    pub fn with_inmem_segment_threshold(mut self, count: usize) -> Self { self.inmem_segment_threshold = count; self }

    pub fn with_keep_intermediates(mut self, keep: bool) -> Self { self.keep_intermediates = keep; self }

    /// Build a config from `BJORN_SHUFFLE_*` environment variables.
    /// `BJORN_SHUFFLE_MEMORY_BYTES` must be set; the rest fall back to defaults.
    pub fn from_env() -> Result<Self> {
        let total = std::env::var(ENV_SHUFFLE_MEMORY_BYTES)
            .with_context(|| format!("{} not set", ENV_SHUFFLE_MEMORY_BYTES))?
            .parse::<u64>()
            .with_context(|| format!("{} must be a byte count", ENV_SHUFFLE_MEMORY_BYTES))?;
        let mut cfg = Self::new(
            total,
            env_parse(ENV_SHUFFLE_INPUT_BUFFER_FRACTION).unwrap_or(DEFAULT_INPUT_BUFFER_FRACTION),
            env_parse(ENV_SHUFFLE_MERGE_FRACTION).unwrap_or(DEFAULT_MERGE_FRACTION),
            env_parse(ENV_SHUFFLE_SEGMENT_FRACTION).unwrap_or(DEFAULT_SEGMENT_FRACTION),
        );
        if let Some(f) = env_parse::<usize>(ENV_MERGE_FACTOR) { cfg.merge_factor = f; }
        if let Some(n) = env_parse::<usize>(ENV_INMEM_MERGE_THRESHOLD) { cfg.inmem_segment_threshold = n; }
        if let Ok(dir) = std::env::var(ENV_SHUFFLE_SPILL_DIR) { cfg.spill_dir = PathBuf::from(dir); }
        cfg.keep_intermediates = env_var_truthy(ENV_KEEP_INTERMEDIATES);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.total_memory_bytes == 0 { bail!("total_memory_bytes must be > 0"); }
        for (name, v) in [
            ("usable_fraction", self.usable_fraction),
            ("merge_trigger_fraction", self.merge_trigger_fraction),
            ("single_segment_fraction", self.single_segment_fraction),
        ] {
            if !(v > 0.0 && v <= 1.0) { bail!("{} must be in (0, 1], got {}", name, v); }
        }
        if self.merge_factor < 2 { bail!("merge_factor must be >= 2, got {}", self.merge_factor); }
        Ok(())
    }

    pub fn thresholds(&self) -> MemoryThresholds {
        let capacity = self.total_memory_bytes;
        let usable = (capacity as f64 * self.usable_fraction) as u64;
        MemoryThresholds {
            capacity,
            usable,
            merge_threshold: (usable as f64 * self.merge_trigger_fraction) as u64,
            max_single_segment: ((capacity as f64 * self.single_segment_fraction) as u64).min(usable),
        }
    }

    /// Pending on-disk segment count that triggers an on-disk merge.
    pub fn disk_merge_threshold(&self) -> usize { 2 * self.merge_factor - 1 }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

pub fn env_var_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes" || v == "on"
        }
        Err(_) => false,
    }
}

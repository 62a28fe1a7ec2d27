use crate::ledger::LedgerSnapshot;
use crate::worker::{MergeReport, Outcome, Tier, WorkerState};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default, Clone, Debug, Serialize)]
pub struct AdmissionStats {
    pub buffered: u64,
    pub spilled: u64,
    pub waits: u64,
    pub commits: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    pub state: WorkerState,
    pub pending: usize,
    pub merges: u64,
    pub failures: u64,
    pub inputs_merged: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub merge_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MergeStats {
    pub admissions: AdmissionStats,
    pub tiers: Vec<TierStats>,
    pub ledger: LedgerSnapshot,
}

impl MergeStats {
    pub fn tier(&self, tier: Tier) -> Option<&TierStats> { self.tiers.iter().find(|t| t.tier == tier) }

    /// Dump as pretty JSON, e.g. next to a task's other outputs.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let f = std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), self).with_context(|| format!("write {}", path.display()))
    }
}

#[derive(Default)]
pub(crate) struct TierCounters {
    merges: AtomicU64,
    failures: AtomicU64,
    inputs_merged: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    merge_ms: AtomicU64,
}

#[derive(Default)]
pub(crate) struct MergeCounters {
    pub buffered: AtomicU64,
    pub spilled: AtomicU64,
    pub waits: AtomicU64,
    pub commits: AtomicU64,
    tiers: [TierCounters; 3],
}

fn slot(tier: Tier) -> usize {
    match tier {
        Tier::Memory => 0,
        Tier::Disk => 1,
        Tier::Final => 2,
    }
}

impl MergeCounters {
    pub fn record(&self, report: &MergeReport) {
        let c = &self.tiers[slot(report.tier)];
        match report.outcome {
            Outcome::Merged => {
                c.merges.fetch_add(1, Ordering::Relaxed);
                c.inputs_merged.fetch_add(report.inputs as u64, Ordering::Relaxed);
                c.bytes_in.fetch_add(report.bytes_in, Ordering::Relaxed);
                if let Some(out) = &report.output { c.bytes_out.fetch_add(out.size(), Ordering::Relaxed); }
                c.merge_ms.fetch_add(report.wall_ms, Ordering::Relaxed);
            }
            Outcome::Failed => { c.failures.fetch_add(1, Ordering::Relaxed); }
            Outcome::Cancelled | Outcome::Skipped => {}
        }
    }

    pub fn failures(&self) -> u64 { self.tiers.iter().map(|c| c.failures.load(Ordering::Relaxed)).sum() }

    pub fn admissions(&self) -> AdmissionStats {
        AdmissionStats {
            buffered: self.buffered.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }

    pub fn tier_stats(&self, tier: Tier, state: WorkerState, pending: usize) -> TierStats {
        let c = &self.tiers[slot(tier)];
        TierStats {
            tier,
            state,
            pending,
            merges: c.merges.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            inputs_merged: c.inputs_merged.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            merge_ms: c.merge_ms.load(Ordering::Relaxed),
        }
    }
}

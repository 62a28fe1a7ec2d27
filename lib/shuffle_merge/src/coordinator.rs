//! Admission and merge triggering for one reduce task's shuffle.
//!
//! Fetchers call [`MergeCoordinator::reserve`] and then [`MergeCoordinator::commit`]
//! from any thread. Committed segments land in a tier queue; when a tier's trigger
//! fires and its worker is idle, the whole queue is swapped out and dispatched in
//! the same critical section, so every segment ends up in exactly one batch.
//!
//! Lock order: tier queues, then ledger. The ledger never calls back out.

use crate::config::{MemoryThresholds, MergeConfig};
use crate::failure::{FailureSink, TaskFailures};
use crate::io::SpillDir;
use crate::ledger::MemoryLedger;
use crate::merge::{CancelToken, FinalBatch, FinalMerger, InMemoryMerger, Merge, MergeContext, OnDiskMerger, RecordMerger};
use crate::segment::{BufferedSegment, MemoryReservation, Segment, SpilledSegment};
use crate::stats::{MergeCounters, MergeStats};
use crate::worker::{Batch, Handoff, MergeReport, MergeSync, MergeWorker, Tier, WorkerState};
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Answer to a reservation request.
#[derive(Debug)]
pub enum Admission {
    /// Write the map output into this segment, then hand it to `commit`.
    Granted(Segment),
    /// No memory right now; back off and retry.
    Wait,
}

impl Admission {
    pub fn is_wait(&self) -> bool { matches!(self, Admission::Wait) }

    pub fn segment(self) -> Option<Segment> {
        match self {
            Admission::Granted(seg) => Some(seg),
            Admission::Wait => None,
        }
    }
}

struct TierQueue<S> {
    tier: Tier,
    pending: Vec<S>,
    state: WorkerState,
    dispatch: Option<Sender<Vec<S>>>,
}

impl<S> TierQueue<S>
where
    Vec<S>: Batch,
{
    fn new(tier: Tier, dispatch: Sender<Vec<S>>) -> Self {
        Self { tier, pending: Vec::new(), state: WorkerState::Idle, dispatch: Some(dispatch) }
    }

    // Caller holds the tier lock: swap and send are one step as far as committers can tell.
    fn dispatch(&mut self) -> bool {
        if self.state == WorkerState::Merging || self.pending.is_empty() { return false; }
        let Some(tx) = self.dispatch.as_ref() else { return false };
        let batch = std::mem::take(&mut self.pending);
        let (inputs, bytes) = (batch.inputs(), batch.bytes());
        match tx.send(batch) {
            Ok(()) => {
                self.state = WorkerState::Merging;
                debug!(tier = %self.tier, inputs, bytes, "merge dispatched");
                true
            }
            Err(SendError(batch)) => {
                warn!(tier = %self.tier, inputs, "merge worker gone; batch stays pending");
                self.pending = batch;
                false
            }
        }
    }
}

struct Tiers {
    memory: TierQueue<BufferedSegment>,
    disk: TierQueue<SpilledSegment>,
    // Output of on-disk merges, waiting for the final pass.
    finished: Vec<SpilledSegment>,
    final_state: WorkerState,
    final_dispatch: Option<Sender<FinalBatch>>,
    closed: bool,
}

impl Tiers {
    fn state(&self, tier: Tier) -> WorkerState {
        match tier {
            Tier::Memory => self.memory.state,
            Tier::Disk => self.disk.state,
            Tier::Final => self.final_state,
        }
    }

    fn pending(&self, tier: Tier) -> usize {
        match tier {
            Tier::Memory => self.memory.pending.len(),
            Tier::Disk => self.disk.pending.len(),
            Tier::Final => self.finished.len(),
        }
    }

    fn drop_senders(&mut self) {
        self.memory.dispatch = None;
        self.disk.dispatch = None;
        self.final_dispatch = None;
    }
}

struct Shared {
    config: MergeConfig,
    thresholds: MemoryThresholds,
    ledger: Arc<MemoryLedger>,
    spill: SpillDir,
    tiers: Mutex<Tiers>,
    idle: Condvar,
    counters: MergeCounters,
    cancel: CancelToken,
    failures: Arc<dyn FailureSink>,
}

impl Shared {
    fn memory_triggered(&self, tiers: &Tiers) -> bool {
        let pending = tiers.memory.pending.len();
        if pending == 0 { return false; }
        let by_count = self.config.inmem_segment_threshold > 0 && pending >= self.config.inmem_segment_threshold;
        by_count || self.ledger.committed() >= self.thresholds.merge_threshold
    }

    fn disk_triggered(&self, tiers: &Tiers) -> bool {
        tiers.disk.pending.len() >= self.config.disk_merge_threshold()
    }

    /// Re-check both triggers. Called with the tier lock held after every change.
    fn evaluate(&self, tiers: &mut Tiers) {
        if tiers.closed || self.cancel.is_cancelled() { return; }
        if tiers.memory.state == WorkerState::Idle && self.memory_triggered(tiers) {
            tiers.memory.dispatch();
        }
        if tiers.disk.state == WorkerState::Idle && self.disk_triggered(tiers) {
            tiers.disk.dispatch();
        }
    }

    /// A refused request can sit below the merge threshold forever, since only a merge
    /// frees committed memory. Merge whatever is pending so the retry can succeed.
    fn unblock(&self, size: u64) {
        let mut tiers = self.tiers.lock();
        if tiers.closed || self.cancel.is_cancelled() || tiers.memory.state == WorkerState::Merging { return; }
        let pending = tiers.memory.pending.len();
        if pending > 0 && tiers.memory.dispatch() {
            debug!(size, pending, committed = self.ledger.committed(), "merge dispatched to make room for a waiting fetch");
        }
    }

    fn wait_until(&self, mut done: impl FnMut(&Tiers) -> bool) {
        let mut tiers = self.tiers.lock();
        while !done(&tiers) {
            self.idle.wait(&mut tiers);
        }
    }
}

impl Handoff for Shared {
    fn merge_finished(&self, report: MergeReport) {
        self.counters.record(&report);
        let MergeReport { tier, output, .. } = report;
        // Once aborted, merged output has nowhere to go; drop it outside the lock.
        let output = if self.cancel.is_cancelled() { drop(output); None } else { output };
        let mut tiers = self.tiers.lock();
        match tier {
            Tier::Memory => {
                tiers.memory.state = WorkerState::Idle;
                if let Some(seg) = output { tiers.disk.pending.push(seg); }
            }
            Tier::Disk => {
                tiers.disk.state = WorkerState::Idle;
                if let Some(seg) = output { tiers.finished.push(seg); }
            }
            Tier::Final => {
                tiers.final_state = WorkerState::Idle;
                if let Some(seg) = output { tiers.finished.push(seg); }
            }
        }
        self.evaluate(&mut tiers);
        self.idle.notify_all();
    }
}

/// Reduce-side shuffle merge coordinator. Share it between fetchers with `Arc`.
pub struct MergeCoordinator {
    shared: Arc<Shared>,
    workers: Mutex<Vec<MergeWorker>>,
    output: Receiver<SpilledSegment>,
}

pub struct MergeCoordinatorBuilder {
    config: MergeConfig,
    failure_sink: Option<Arc<dyn FailureSink>>,
    memory_merger: Option<Box<dyn Merge<Vec<BufferedSegment>>>>,
    disk_merger: Option<Box<dyn Merge<Vec<SpilledSegment>>>>,
    memory_sync: MergeSync,
    disk_sync: MergeSync,
    final_sync: MergeSync,
}

impl MergeCoordinatorBuilder {
    pub fn failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self { self.failure_sink = Some(sink); self }

    /// Replace the in-memory tier's merge pass.
    pub fn memory_merger(mut self, merger: impl Merge<Vec<BufferedSegment>>) -> Self {
        let merger: Box<dyn Merge<Vec<BufferedSegment>>> = Box::new(merger);
        self.memory_merger = Some(merger);
        self
    }

    /// Replace the on-disk tier's merge pass.
    pub fn disk_merger(mut self, merger: impl Merge<Vec<SpilledSegment>>) -> Self {
        let merger: Box<dyn Merge<Vec<SpilledSegment>>> = Box::new(merger);
        self.disk_merger = Some(merger);
        self
    }

    /// Install start/complete rendezvous on one tier's worker.
    pub fn merge_sync(mut self, tier: Tier, sync: MergeSync) -> Self {
        match tier {
            Tier::Memory => self.memory_sync = sync,
            Tier::Disk => self.disk_sync = sync,
            Tier::Final => self.final_sync = sync,
        }
        self
    }

    pub fn build(self) -> Result<MergeCoordinator> {
        let config = self.config;
        config.validate()?;
        let thresholds = config.thresholds();
        let spill = SpillDir::new(&config.spill_dir, config.keep_intermediates)?;
        let ledger = Arc::new(MemoryLedger::new(thresholds.capacity, thresholds.usable));
        let failures: Arc<dyn FailureSink> = match self.failure_sink {
            Some(sink) => sink,
            None => Arc::new(TaskFailures::new()),
        };
        let cancel = CancelToken::new();

        let (memory_tx, memory_rx) = unbounded();
        let (disk_tx, disk_rx) = unbounded();
        let (final_tx, final_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();

        let shared = Arc::new(Shared {
            thresholds,
            ledger,
            spill: spill.clone(),
            tiers: Mutex::new(Tiers {
                memory: TierQueue::new(Tier::Memory, memory_tx),
                disk: TierQueue::new(Tier::Disk, disk_tx),
                finished: Vec::new(),
                final_state: WorkerState::Idle,
                final_dispatch: Some(final_tx),
                closed: false,
            }),
            idle: Condvar::new(),
            counters: MergeCounters::default(),
            cancel: cancel.clone(),
            failures: failures.clone(),
            config,
        });
        // Built before spawning so a failed spawn tears down the workers already running.
        let coordinator = MergeCoordinator { shared: shared.clone(), workers: Mutex::new(Vec::with_capacity(3)), output: out_rx };

        let merge_factor = shared.config.merge_factor;
        let ctx = |tier| MergeContext { tier, spill: spill.clone(), cancel: cancel.clone(), merge_factor };
        let handoff: Arc<dyn Handoff> = shared.clone();
        let memory_merger: Box<dyn Merge<Vec<BufferedSegment>>> = match self.memory_merger {
            Some(m) => m,
            None => Box::new(InMemoryMerger),
        };
        let disk_merger: Box<dyn Merge<Vec<SpilledSegment>>> = match self.disk_merger {
            Some(m) => m,
            None => Box::new(OnDiskMerger),
        };
        let final_merger: Box<dyn Merge<FinalBatch>> = Box::new(FinalMerger::new(out_tx));
        {
            let mut workers = coordinator.workers.lock();
            workers.push(MergeWorker::spawn(memory_rx, memory_merger, ctx(Tier::Memory), self.memory_sync, failures.clone(), handoff.clone())?);
            workers.push(MergeWorker::spawn(disk_rx, disk_merger, ctx(Tier::Disk), self.disk_sync, failures.clone(), handoff.clone())?);
            workers.push(MergeWorker::spawn(final_rx, final_merger, ctx(Tier::Final), self.final_sync, failures, handoff)?);
        }

        info!(
            capacity = thresholds.capacity, usable = thresholds.usable, merge_threshold = thresholds.merge_threshold,
            max_single_segment = thresholds.max_single_segment, merge_factor, spill_dir = %spill.root().display(),
            "shuffle merge coordinator started"
        );
        Ok(coordinator)
    }
}

impl MergeCoordinator {
    pub fn new(config: MergeConfig) -> Result<Self> { Self::builder(config).build() }

    pub fn builder(config: MergeConfig) -> MergeCoordinatorBuilder {
        MergeCoordinatorBuilder {
            config,
            failure_sink: None,
            memory_merger: None,
            disk_merger: None,
            memory_sync: MergeSync::default(),
            disk_sync: MergeSync::default(),
            final_sync: MergeSync::default(),
        }
    }

    /// Decide where a fetched map output of `size` bytes goes. Never blocks.
    ///
    /// Oversized requests are spilled regardless of memory; the rest are buffered if
    /// the ledger has room, otherwise the caller is told to wait.
    pub fn reserve(&self, size: u64) -> Admission {
        let shared = &self.shared;
        if size > shared.thresholds.max_single_segment {
            shared.counters.spilled.fetch_add(1, Ordering::Relaxed);
            let path = shared.spill.next_path("fetch");
            debug!(size, max_single_segment = shared.thresholds.max_single_segment, path = %path.display(), "segment admitted to disk");
            return Admission::Granted(Segment::Spilled(SpilledSegment::for_fetch(path, size, shared.config.keep_intermediates)));
        }
        if shared.ledger.try_reserve(size) {
            shared.counters.buffered.fetch_add(1, Ordering::Relaxed);
            trace!(size, "segment admitted to memory");
            Admission::Granted(Segment::Buffered(BufferedSegment::new(MemoryReservation::granted(shared.ledger.clone(), size))))
        } else {
            shared.counters.waits.fetch_add(1, Ordering::Relaxed);
            trace!(size, in_use = shared.ledger.snapshot().in_use(), "segment told to wait");
            shared.unblock(size);
            Admission::Wait
        }
    }

    /// Seal a written segment, account for it, and queue it for merging.
    ///
    /// Fails if the coordinator is already closed or aborted; the segment is dropped.
    pub fn commit(&self, mut segment: Segment) -> Result<()> {
        segment.seal().with_context(|| format!("seal segment {}", segment.id()))?;
        self.shared.counters.commits.fetch_add(1, Ordering::Relaxed);
        match segment {
            Segment::Buffered(mut seg) => {
                seg.commit_memory();
                let mut tiers = self.shared.tiers.lock();
                if tiers.closed {
                    drop(tiers);
                    bail!("commit of segment {} after shuffle merge closed", seg.id());
                }
                trace!(segment = seg.id(), size = seg.size(), "buffered segment committed");
                tiers.memory.pending.push(seg);
                self.shared.evaluate(&mut tiers);
            }
            Segment::Spilled(seg) => {
                let mut tiers = self.shared.tiers.lock();
                if tiers.closed {
                    drop(tiers);
                    bail!("commit of segment {} after shuffle merge closed", seg.id());
                }
                trace!(segment = seg.id(), size = seg.size(), "spilled segment committed");
                tiers.disk.pending.push(seg);
                self.shared.evaluate(&mut tiers);
            }
        }
        Ok(())
    }

    pub fn ledger(&self) -> &MemoryLedger { &self.shared.ledger }

    pub fn thresholds(&self) -> MemoryThresholds { self.shared.thresholds }

    pub fn config(&self) -> &MergeConfig { &self.shared.config }

    /// The sink every merge worker reports to.
    pub fn failure_sink(&self) -> Arc<dyn FailureSink> { self.shared.failures.clone() }

    pub fn worker_state(&self, tier: Tier) -> WorkerState { self.shared.tiers.lock().state(tier) }

    pub fn pending(&self, tier: Tier) -> usize { self.shared.tiers.lock().pending(tier) }

    /// Block until no tier has a merge in flight.
    pub fn wait_for_merges(&self) {
        self.shared.wait_until(|t| [Tier::Memory, Tier::Disk, Tier::Final].iter().all(|&tier| t.state(tier) == WorkerState::Idle));
    }

    /// Stop accepting commits, let in-flight merges finish, and start the final merge.
    pub fn close(&self) -> Result<MergedOutput> {
        let mut tiers = self.shared.tiers.lock();
        if tiers.closed { bail!("shuffle merge already closed"); }
        tiers.closed = true;
        while tiers.memory.state == WorkerState::Merging || tiers.disk.state == WorkerState::Merging {
            self.shared.idle.wait(&mut tiers);
        }
        if self.shared.cancel.is_cancelled() { bail!("shuffle merge aborted"); }

        let mut spilled = std::mem::take(&mut tiers.disk.pending);
        spilled.append(&mut tiers.finished);
        let batch = FinalBatch { buffered: std::mem::take(&mut tiers.memory.pending), spilled };
        info!(buffered = batch.buffered.len(), spilled = batch.spilled.len(), bytes = batch.bytes(), "final merge dispatched");
        tiers.memory.dispatch = None;
        tiers.disk.dispatch = None;
        let tx = tiers.final_dispatch.take().context("final merge worker is gone")?;
        tx.send(batch).map_err(|_| anyhow!("final merge worker is gone"))?;
        tiers.final_state = WorkerState::Merging;
        drop(tiers);
        Ok(MergedOutput { rx: self.output.clone(), shared: self.shared.clone() })
    }

    /// Abort the task's shuffle: cancel merges, release every pending segment, join workers.
    pub fn abort(&self) {
        let first = self.shared.cancel.cancel();
        let (memory, disk, finished) = {
            let mut tiers = self.shared.tiers.lock();
            tiers.closed = true;
            tiers.drop_senders();
            (
                std::mem::take(&mut tiers.memory.pending),
                std::mem::take(&mut tiers.disk.pending),
                std::mem::take(&mut tiers.finished),
            )
        };
        let released: u64 = memory.iter().map(|s| s.size()).sum();
        drop((memory, disk, finished));
        self.join_workers();
        if first {
            let ledger = self.shared.ledger.snapshot();
            info!(released, reserved = ledger.reserved, committed = ledger.committed, "shuffle merge aborted");
        }
    }

    pub fn stats(&self) -> MergeStats {
        let counters = &self.shared.counters;
        let tiers = self.shared.tiers.lock();
        MergeStats {
            admissions: counters.admissions(),
            tiers: [Tier::Memory, Tier::Disk, Tier::Final]
                .into_iter()
                .map(|tier| counters.tier_stats(tier, tiers.state(tier), tiers.pending(tier)))
                .collect(),
            ledger: self.shared.ledger.snapshot(),
        }
    }

    fn join_workers(&self) {
        for w in self.workers.lock().iter_mut() { w.join(); }
    }
}

impl Drop for MergeCoordinator {
    fn drop(&mut self) {
        let clean = {
            let mut tiers = self.shared.tiers.lock();
            let clean = tiers.closed && !self.shared.cancel.is_cancelled();
            if clean { tiers.drop_senders(); }
            clean
        };
        if clean { self.join_workers(); } else { self.abort(); }
    }
}

/// Merged segments for the reduce-input reader, in the order the final merge delivers them.
///
/// Blocking pull: `next()` waits for the next segment and returns `None` once the final
/// merge is done.
pub struct MergedOutput {
    rx: Receiver<SpilledSegment>,
    shared: Arc<Shared>,
}

impl MergedOutput {
    /// Wait for the final merge to settle and report whether it failed.
    pub fn finish(&self) -> Result<()> {
        self.shared.wait_until(|t| t.final_state == WorkerState::Idle);
        if self.shared.cancel.is_cancelled() { bail!("shuffle merge aborted"); }
        let failures = self.shared.counters.failures();
        if failures > 0 { bail!("shuffle merge failed ({} merge failure(s) reported)", failures); }
        Ok(())
    }

    /// Collect every merged segment and k-way merge them into one record stream.
    pub fn into_records(self) -> Result<RecordMerger> {
        let segments: Vec<Segment> = self.rx.iter().map(Segment::Spilled).collect();
        self.finish()?;
        RecordMerger::new(segments)
    }
}

impl Iterator for MergedOutput {
    type Item = SpilledSegment;

    fn next(&mut self) -> Option<SpilledSegment> { self.rx.recv().ok() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::write_bin;
    use crate::segment::Origin;

    fn coordinator(dir: &std::path::Path) -> MergeCoordinator {
        MergeCoordinator::new(MergeConfig::new(10_000, 0.8, 0.9, 0.5).with_spill_dir(dir)).unwrap()
    }

    fn granted(c: &MergeCoordinator, size: u64) -> Segment {
        c.reserve(size).segment().expect("reservation granted")
    }

    #[test]
    fn oversized_request_spills_even_when_memory_is_full() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let held = granted(&c, 5_000);
        assert_eq!(held.origin(), Origin::Buffered);
        let _held2 = granted(&c, 3_000);
        assert!(c.reserve(1).is_wait());

        let big = granted(&c, 5_001);
        assert_eq!(big.origin(), Origin::Spilled);
        assert_eq!(c.ledger().reserved(), 8_000);

        let stats = c.stats();
        assert_eq!(stats.admissions.buffered, 2);
        assert_eq!(stats.admissions.spilled, 1);
        assert_eq!(stats.admissions.waits, 1);
    }

    #[test]
    fn dropping_an_uncommitted_reservation_returns_its_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let seg = granted(&c, 4_000);
        assert_eq!(c.ledger().reserved(), 4_000);
        drop(seg);
        assert_eq!(c.ledger().reserved(), 0);
        assert_eq!(c.ledger().committed(), 0);
    }

    #[test]
    fn commit_below_threshold_stays_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let mut seg = granted(&c, 3_600);
        let mut buf = Vec::new();
        write_bin(&mut buf, b"k", b"v");
        seg.write(&buf).unwrap();
        c.commit(seg).unwrap();

        assert_eq!(c.ledger().committed(), 3_600);
        assert_eq!(c.ledger().reserved(), 0);
        assert_eq!(c.pending(Tier::Memory), 1);
        assert_eq!(c.worker_state(Tier::Memory), WorkerState::Idle);
    }

    #[test]
    fn commit_after_close_fails_and_releases_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let seg = granted(&c, 1_000);
        let out = c.close().unwrap();
        assert!(c.commit(seg).is_err());
        assert_eq!(c.ledger().snapshot().in_use(), 0);
        assert_eq!(out.into_records().unwrap().count(), 0);
        assert!(c.close().is_err());
    }

    #[test]
    fn abort_releases_pending_memory_and_refuses_close() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        for _ in 0..3 {
            let seg = granted(&c, 1_000);
            c.commit(seg).unwrap();
        }
        let _unwritten = granted(&c, 500);
        assert_eq!(c.ledger().committed(), 3_000);
        c.abort();
        assert_eq!(c.ledger().committed(), 0);
        assert_eq!(c.pending(Tier::Memory), 0);
        assert!(c.close().is_err());
    }
}

use crate::error::MergeError;
use crate::failure::FailureSink;
use crate::merge::{FinalBatch, Merge, MergeContext};
use crate::segment::{BufferedSegment, SpilledSegment};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info};

/// A stage of merging with its own pending queue and worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Tier {
    Memory,
    Disk,
    Final,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Memory => write!(f, "memory"),
            Tier::Disk => write!(f, "disk"),
            Tier::Final => write!(f, "final"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Idle,
    Merging,
}

// ============== Test rendezvous ==============

/// A point a merge worker passes through; blocks until the other side arrives.
pub trait Rendezvous: Send + Sync {
    fn arrive(&self);
}

impl Rendezvous for std::sync::Barrier {
    fn arrive(&self) { self.wait(); }
}

/// Optional hooks at the start and end of every merge. Unset in production.
#[derive(Clone, Default)]
pub struct MergeSync {
    start: Option<Arc<dyn Rendezvous>>,
    complete: Option<Arc<dyn Rendezvous>>,
}

impl MergeSync {
    pub fn new(start: Arc<dyn Rendezvous>, complete: Arc<dyn Rendezvous>) -> Self {
        Self { start: Some(start), complete: Some(complete) }
    }

    pub fn on_start(mut self, hook: Arc<dyn Rendezvous>) -> Self { self.start = Some(hook); self }

    pub fn on_complete(mut self, hook: Arc<dyn Rendezvous>) -> Self { self.complete = Some(hook); self }

    fn started(&self) { if let Some(h) = &self.start { h.arrive(); } }

    fn completed(&self) { if let Some(h) = &self.complete { h.arrive(); } }
}

// ============== Batches ==============

/// What a tier dispatches to its worker in one go.
pub trait Batch: Send + 'static {
    fn inputs(&self) -> usize;
    fn bytes(&self) -> u64;
}

impl Batch for Vec<BufferedSegment> {
    fn inputs(&self) -> usize { self.len() }
    fn bytes(&self) -> u64 { self.iter().map(|s| s.size()).sum() }
}

impl Batch for Vec<SpilledSegment> {
    fn inputs(&self) -> usize { self.len() }
    fn bytes(&self) -> u64 { self.iter().map(|s| s.size()).sum() }
}

impl Batch for FinalBatch {
    fn inputs(&self) -> usize { self.len() }
    fn bytes(&self) -> u64 { FinalBatch::bytes(self) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Merged,
    Cancelled,
    Failed,
    Skipped,
}

/// Result of one dispatched batch, handed back to the coordinator.
#[derive(Debug)]
pub struct MergeReport {
    pub tier: Tier,
    pub inputs: usize,
    pub bytes_in: u64,
    pub output: Option<SpilledSegment>,
    pub outcome: Outcome,
    pub wall_ms: u64,
}

/// Receives finished merges. Implemented by the coordinator.
pub(crate) trait Handoff: Send + Sync + 'static {
    fn merge_finished(&self, report: MergeReport);
}

// ============== Worker ==============

/// Long-lived thread that merges whatever batch its tier dispatches.
///
/// Blocks while idle. Exits once every dispatch sender is gone.
pub struct MergeWorker {
    tier: Tier,
    handle: Option<thread::JoinHandle<()>>,
}

impl MergeWorker {
    pub(crate) fn spawn<B: Batch>(
        rx: Receiver<B>,
        mut merger: Box<dyn Merge<B>>,
        ctx: MergeContext,
        sync: MergeSync,
        failures: Arc<dyn FailureSink>,
        handoff: Arc<dyn Handoff>,
    ) -> Result<Self> {
        let tier = ctx.tier;
        let handle = thread::Builder::new()
            .name(format!("merge-{}", tier))
            .spawn(move || {
                for batch in rx.iter() {
                    let (inputs, bytes_in) = (batch.inputs(), batch.bytes());
                    if ctx.cancel.is_cancelled() {
                        drop(batch);
                        handoff.merge_finished(MergeReport { tier, inputs, bytes_in, output: None, outcome: Outcome::Skipped, wall_ms: 0 });
                        continue;
                    }
                    debug!(tier = %tier, inputs, bytes_in, "merge starting");
                    sync.started();
                    let start = Instant::now();
                    // A panicking pass still has to hand its tier back, so it becomes a failure.
                    let result = panic::catch_unwind(AssertUnwindSafe(|| merger.merge(batch, &ctx)))
                        .unwrap_or_else(|payload| Err(anyhow!("merge panicked: {}", panic_message(payload.as_ref()))));
                    let (output, outcome) = match result {
                        Ok(out) => (out, Outcome::Merged),
                        Err(e) if MergeError::is_cancelled(&e) => {
                            info!(tier = %tier, inputs, "merge cancelled");
                            (None, Outcome::Cancelled)
                        }
                        Err(e) => {
                            failures.report_exception(e.context(format!("{} merge of {} segments ({} bytes)", tier, inputs, bytes_in)));
                            (None, Outcome::Failed)
                        }
                    };
                    let wall_ms = start.elapsed().as_millis() as u64;
                    sync.completed();
                    handoff.merge_finished(MergeReport { tier, inputs, bytes_in, output, outcome, wall_ms });
                }
                debug!(tier = %tier, "merge worker exiting");
            })
            .with_context(|| format!("spawn merge-{} thread", tier))?;
        Ok(Self { tier, handle: Some(handle) })
    }

    pub fn tier(&self) -> Tier { self.tier }

    pub fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                error!(tier = %self.tier, "merge worker panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

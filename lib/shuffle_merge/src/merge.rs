//! K-way merge over sorted segments, and the per-tier merge passes built on it.
//!
//! Inputs are runs of binary records sorted by key bytes. Buffered inputs are read
//! in place; spilled inputs are memory-mapped. An input is dropped as soon as its
//! last record has been taken, which returns buffered memory to the ledger while the
//! rest of the merge is still running.

use crate::error::MergeError;
use crate::io::{read_bin_line, BinLine, SpillDir, SpillWriter};
use crate::segment::{BufferedSegment, Segment, SpilledSegment};
use crate::worker::Tier;
use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use memmap2::Mmap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Cooperative cancellation flag shared by the coordinator and its workers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self::default() }

    /// Returns true if this call flipped the flag.
    pub fn cancel(&self) -> bool { !self.0.swap(true, AtomicOrdering::SeqCst) }

    pub fn is_cancelled(&self) -> bool { self.0.load(AtomicOrdering::SeqCst) }
}

/// What a merge pass gets to work with besides its batch.
#[derive(Clone, Debug)]
pub struct MergeContext {
    pub tier: Tier,
    pub spill: SpillDir,
    pub cancel: CancelToken,
    pub merge_factor: usize,
}

/// A merge pass for one tier. `B` is the batch type that tier dispatches.
///
/// Returns the merged segment to hand to the next tier, or `None` if the pass
/// delivered its output elsewhere.
pub trait Merge<B>: Send + 'static {
    fn merge(&mut self, batch: B, ctx: &MergeContext) -> Result<Option<SpilledSegment>>;
}

impl<B, F> Merge<B> for F
where
    F: FnMut(B, &MergeContext) -> Result<Option<SpilledSegment>> + Send + 'static,
{
    fn merge(&mut self, batch: B, ctx: &MergeContext) -> Result<Option<SpilledSegment>> { self(batch, ctx) }
}

// ============== Record sources ==============

struct Cursor {
    segment: Option<Segment>,
    map: Option<Mmap>,
    off: usize,
}

impl Cursor {
    fn open(segment: Segment) -> Result<Self> {
        let map = match &segment {
            Segment::Buffered(_) => None,
            Segment::Spilled(s) => {
                let file = match std::fs::File::open(s.path()) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(MergeError::MissingSpill(s.path().to_path_buf()).into());
                    }
                    Err(e) => return Err(e).with_context(|| format!("open {}", s.path().display())),
                };
                let len = file.metadata().with_context(|| format!("stat {}", s.path().display()))?.len();
                // Zero-length files cannot be mapped on every platform.
                if len == 0 { None } else {
                    Some(unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", s.path().display()))?)
                }
            }
        };
        Ok(Self { segment: Some(segment), map, off: 0 })
    }

    fn bytes(&self) -> &[u8] {
        match (&self.map, &self.segment) {
            (Some(map), _) => &map[..],
            (None, Some(Segment::Buffered(s))) => s.data(),
            _ => &[],
        }
    }

    fn name(&self) -> String {
        match &self.segment {
            Some(Segment::Spilled(s)) => s.path().display().to_string(),
            Some(seg) => format!("{}#{}", seg.origin(), seg.id()),
            None => "<released>".to_string(),
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match read_bin_line(self.bytes(), self.off) {
            BinLine::Record { key, value, next } => {
                let rec = (key.to_vec(), value.to_vec());
                self.off = next;
                Ok(Some(rec))
            }
            BinLine::End => Ok(None),
            BinLine::Truncated => Err(MergeError::Corrupt { source_name: self.name(), offset: self.off, reason: "truncated record" }.into()),
        }
    }

    /// Release the input: unmap first, then drop the segment (and with it memory or file).
    fn release(&mut self) -> u64 {
        self.map = None;
        self.segment.take().map(|s| s.size()).unwrap_or(0)
    }
}

struct HeapItem {
    key: Vec<u8>,
    value: Vec<u8>,
    cursor: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for HeapItem {
    // Reversed so BinaryHeap pops the smallest key; ties go to the earlier input.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| other.cursor.cmp(&self.cursor))
    }
}

/// Streaming k-way merge over sorted segments.
pub struct RecordMerger {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<HeapItem>,
    cancel: Option<CancelToken>,
    released_bytes: u64,
    released_inputs: usize,
}

impl RecordMerger {
    pub fn new(inputs: Vec<Segment>) -> Result<Self> {
        Self::with_cancel(inputs, None)
    }

    /// Like `new`, but stops with `MergeError::Cancelled` at the next input boundary
    /// once `cancel` fires.
    pub fn with_cancel(inputs: Vec<Segment>, cancel: Option<CancelToken>) -> Result<Self> {
        let mut merger = Self { cursors: Vec::with_capacity(inputs.len()), heap: BinaryHeap::with_capacity(inputs.len()), cancel, released_bytes: 0, released_inputs: 0 };
        for seg in inputs {
            let idx = merger.cursors.len();
            merger.cursors.push(Cursor::open(seg)?);
            merger.prime(idx)?;
        }
        Ok(merger)
    }

    fn prime(&mut self, idx: usize) -> Result<()> {
        match self.cursors[idx].advance()? {
            Some((key, value)) => self.heap.push(HeapItem { key, value, cursor: idx }),
            None => self.exhausted(idx)?,
        }
        Ok(())
    }

    fn exhausted(&mut self, idx: usize) -> Result<()> {
        self.released_bytes += self.cursors[idx].release();
        self.released_inputs += 1;
        if self.cancel.as_ref().map_or(false, |c| c.is_cancelled()) {
            return Err(MergeError::Cancelled.into());
        }
        Ok(())
    }

    /// Next record in key order, or `None` once every input is drained.
    pub fn next_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(top) = self.heap.pop() else { return Ok(None) };
        self.prime(top.cursor)?;
        Ok(Some((top.key, top.value)))
    }

    /// Bytes of inputs already handed back (sum of their segment sizes).
    pub fn released_bytes(&self) -> u64 { self.released_bytes }

    pub fn inputs(&self) -> usize { self.cursors.len() }

    pub fn released_inputs(&self) -> usize { self.released_inputs }

    /// Drain every record into `out`. Returns the number of records written.
    pub fn merge_into(&mut self, out: &mut SpillWriter) -> Result<u64> {
        let mut records = 0u64;
        while let Some((k, v)) = self.next_record()? {
            out.write_record(&k, &v)?;
            records += 1;
        }
        Ok(records)
    }
}

impl Iterator for RecordMerger {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> { self.next_record().transpose() }
}

/// Merge `inputs` into one new spill file under `ctx.spill`.
pub fn merge_to_spill(inputs: Vec<Segment>, ctx: &MergeContext, prefix: &str) -> Result<SpilledSegment> {
    let start = Instant::now();
    let n = inputs.len();
    let bytes_in: u64 = inputs.iter().map(|s| s.size()).sum();
    let mut out = ctx.spill.create_writer(prefix)?;
    let mut merger = RecordMerger::with_cancel(inputs, Some(ctx.cancel.clone()))?;
    let records = merger.merge_into(&mut out)?;
    debug_assert_eq!(merger.released_inputs(), n);
    let seg = out.finish()?;
    info!(tier = %ctx.tier, inputs = n, bytes_in, bytes_out = seg.size(), records, wall_ms = start.elapsed().as_millis() as u64, "merge pass complete");
    Ok(seg)
}

// ============== Tier merges ==============

/// Merges a batch of buffered segments to disk, freeing their memory as each drains.
#[derive(Default)]
pub struct InMemoryMerger;

impl Merge<Vec<BufferedSegment>> for InMemoryMerger {
    fn merge(&mut self, batch: Vec<BufferedSegment>, ctx: &MergeContext) -> Result<Option<SpilledSegment>> {
        if batch.is_empty() { return Ok(None); }
        let inputs = batch.into_iter().map(Segment::Buffered).collect();
        merge_to_spill(inputs, ctx, "mem_merge").map(Some)
    }
}

/// Merges a batch of spilled segments into one larger spill.
#[derive(Default)]
pub struct OnDiskMerger;

impl Merge<Vec<SpilledSegment>> for OnDiskMerger {
    fn merge(&mut self, batch: Vec<SpilledSegment>, ctx: &MergeContext) -> Result<Option<SpilledSegment>> {
        if batch.is_empty() { return Ok(None); }
        let inputs = batch.into_iter().map(Segment::Spilled).collect();
        merge_to_spill(inputs, ctx, "disk_merge").map(Some)
    }
}

/// Everything left once fetching is done.
#[derive(Debug, Default)]
pub struct FinalBatch {
    pub buffered: Vec<BufferedSegment>,
    pub spilled: Vec<SpilledSegment>,
}

impl FinalBatch {
    pub fn len(&self) -> usize { self.buffered.len() + self.spilled.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn bytes(&self) -> u64 {
        self.buffered.iter().map(|s| s.size()).sum::<u64>() + self.spilled.iter().map(|s| s.size()).sum::<u64>()
    }
}

/// Reduces the leftovers to at most `merge_factor` runs and hands them to the reader.
///
/// One-shot: the output channel is closed after the first batch, successful or not.
pub struct FinalMerger {
    out: Option<Sender<SpilledSegment>>,
}

impl FinalMerger {
    pub fn new(out: Sender<SpilledSegment>) -> Self { Self { out: Some(out) } }
}

impl Merge<FinalBatch> for FinalMerger {
    fn merge(&mut self, batch: FinalBatch, ctx: &MergeContext) -> Result<Option<SpilledSegment>> {
        let out = self.out.take().context("final merge already ran")?;
        let mut runs = batch.spilled;
        if !batch.buffered.is_empty() {
            let inputs = batch.buffered.into_iter().map(Segment::Buffered).collect();
            runs.push(merge_to_spill(inputs, ctx, "final_mem")?);
        }
        let mut passes = 0u32;
        while runs.len() > ctx.merge_factor {
            // Smallest runs first: each pass removes merge_factor - 1 runs for the least I/O.
            runs.sort_by_key(|s| s.size());
            let rest = runs.split_off(ctx.merge_factor);
            let smallest = std::mem::replace(&mut runs, rest);
            runs.push(merge_to_spill(smallest.into_iter().map(Segment::Spilled).collect(), ctx, "final_pass")?);
            passes += 1;
        }
        debug!(runs = runs.len(), passes, "final merge delivering runs");
        for seg in runs {
            if out.send(seg).is_err() {
                debug!("merged output reader went away");
                break;
            }
        }
        Ok(None)
    }
}

//! Fetched map outputs, either buffered in memory or spilled to local disk.
//!
//! A segment is written by exactly one fetcher, sealed once by the coordinator's
//! `commit`, and then owned by whichever tier queue or merge holds it. Dropping a
//! segment gives its resources back: buffered memory to the ledger, spill files to
//! the filesystem.

use crate::error::SegmentError;
use crate::ledger::MemoryLedger;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 { NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed) }

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Origin {
    Buffered,
    Spilled,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Buffered => write!(f, "buffered"),
            Origin::Spilled => write!(f, "spilled"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Reserved,
    Committed,
}

/// Claim on ledger memory held by a buffered segment.
///
/// Released on drop: a reservation that was never committed is cancelled,
/// a committed one is unreserved. Either way it happens exactly once.
#[derive(Debug)]
pub struct MemoryReservation {
    ledger: Arc<MemoryLedger>,
    size: u64,
    phase: Phase,
}

impl MemoryReservation {
    /// Wrap bytes already granted by `ledger.try_reserve(size)`.
    pub(crate) fn granted(ledger: Arc<MemoryLedger>, size: u64) -> Self {
        Self { ledger, size, phase: Phase::Reserved }
    }

    pub fn size(&self) -> u64 { self.size }

    pub fn is_committed(&self) -> bool { self.phase == Phase::Committed }

    fn commit(&mut self) {
        assert_eq!(self.phase, Phase::Reserved, "reservation of {} bytes committed twice", self.size);
        self.ledger.commit(self.size);
        self.phase = Phase::Committed;
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        match self.phase {
            Phase::Reserved => self.ledger.cancel_reservation(self.size),
            Phase::Committed => self.ledger.unreserve(self.size),
        }
    }
}

/// Segment held in a fixed-capacity buffer sized to its reservation.
#[derive(Debug)]
pub struct BufferedSegment {
    id: u64,
    data: Vec<u8>,
    sealed: bool,
    reservation: MemoryReservation,
}

impl BufferedSegment {
    pub(crate) fn new(reservation: MemoryReservation) -> Self {
        let capacity = reservation.size() as usize;
        Self { id: next_id(), data: Vec::with_capacity(capacity), sealed: false, reservation }
    }

    pub fn id(&self) -> u64 { self.id }

    /// Reserved size; what the ledger accounts for this segment.
    pub fn size(&self) -> u64 { self.reservation.size() }

    pub fn capacity(&self) -> usize { self.reservation.size() as usize }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    pub fn remaining(&self) -> usize { self.capacity() - self.data.len() }

    pub fn is_sealed(&self) -> bool { self.sealed }

    pub fn data(&self) -> &[u8] { &self.data }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), SegmentError> {
        if self.sealed { return Err(SegmentError::Sealed(self.id)); }
        if bytes.len() > self.remaining() {
            return Err(SegmentError::Overflow { id: self.id, len: bytes.len(), written: self.data.len(), capacity: self.capacity() });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn seal(&mut self) {
        assert!(!self.sealed, "segment {} sealed twice", self.id);
        self.sealed = true;
    }

    /// Move the reserved bytes to committed. Called by the coordinator right after sealing.
    pub(crate) fn commit_memory(&mut self) {
        debug_assert!(self.sealed);
        self.reservation.commit();
    }
}

/// Segment whose bytes live in a file on local disk. Never touches the ledger.
#[derive(Debug)]
pub struct SpilledSegment {
    id: u64,
    path: PathBuf,
    size: u64,
    written: u64,
    sealed: bool,
    writer: Option<BufWriter<File>>,
    keep: bool,
}

impl SpilledSegment {
    /// Unsealed segment that the fetcher will stream `expected_size` bytes into.
    pub(crate) fn for_fetch(path: PathBuf, expected_size: u64, keep: bool) -> Self {
        Self { id: next_id(), path, size: expected_size, written: 0, sealed: false, writer: None, keep }
    }

    /// Already-complete file, e.g. the output of a merge.
    pub fn sealed_from_file(path: PathBuf, size: u64, keep: bool) -> Self {
        Self { id: next_id(), path, size, written: size, sealed: true, writer: None, keep }
    }

    pub fn id(&self) -> u64 { self.id }

    /// Expected size before sealing, bytes on disk after.
    pub fn size(&self) -> u64 { self.size }

    pub fn path(&self) -> &Path { &self.path }

    pub fn is_sealed(&self) -> bool { self.sealed }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.sealed { return Err(SegmentError::Sealed(self.id).into()); }
        if self.writer.is_none() {
            self.writer = Some(crate::io::open_writer(&self.path)?);
        }
        if let Some(w) = self.writer.as_mut() {
            w.write_all(bytes).with_context(|| format!("write {}", self.path.display()))?;
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Flush whatever the fetcher wrote and fix the size to the bytes on disk.
    pub fn seal(&mut self) -> Result<()> {
        assert!(!self.sealed, "segment {} sealed twice", self.id);
        match self.writer.take() {
            Some(mut w) => {
                w.flush().with_context(|| format!("flush {}", self.path.display()))?;
                w.get_ref().sync_data().with_context(|| format!("sync {}", self.path.display()))?;
            }
            None => {
                crate::io::open_writer(&self.path)?;
            }
        }
        self.size = self.written;
        self.sealed = true;
        Ok(())
    }

    /// Take the file out of the segment's care; it will no longer be removed on drop.
    pub fn into_path(mut self) -> PathBuf {
        self.keep = true;
        self.writer = None;
        std::mem::take(&mut self.path)
    }
}

impl Drop for SpilledSegment {
    fn drop(&mut self) {
        if self.keep { return; }
        self.writer = None;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "remove spill file: {}", e);
            }
        }
    }
}

/// One fetched map output, as handed out by `MergeCoordinator::reserve`.
#[derive(Debug)]
pub enum Segment {
    Buffered(BufferedSegment),
    Spilled(SpilledSegment),
}

impl Segment {
    pub fn id(&self) -> u64 {
        match self {
            Segment::Buffered(s) => s.id(),
            Segment::Spilled(s) => s.id(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Segment::Buffered(s) => s.size(),
            Segment::Spilled(s) => s.size(),
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Segment::Buffered(_) => Origin::Buffered,
            Segment::Spilled(_) => Origin::Spilled,
        }
    }

    pub fn is_sealed(&self) -> bool {
        match self {
            Segment::Buffered(s) => s.is_sealed(),
            Segment::Spilled(s) => s.is_sealed(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            Segment::Buffered(s) => s.write(bytes).map_err(anyhow::Error::from),
            Segment::Spilled(s) => s.write(bytes),
        }
    }

    /// Seal the segment. Sealing twice panics.
    pub fn seal(&mut self) -> Result<()> {
        match self {
            Segment::Buffered(s) => { s.seal(); Ok(()) }
            Segment::Spilled(s) => s.seal(),
        }
    }

    pub fn as_buffered(&self) -> Option<&BufferedSegment> {
        match self {
            Segment::Buffered(s) => Some(s),
            Segment::Spilled(_) => None,
        }
    }

    pub fn as_spilled(&self) -> Option<&SpilledSegment> {
        match self {
            Segment::Spilled(s) => Some(s),
            Segment::Buffered(_) => None,
        }
    }
}

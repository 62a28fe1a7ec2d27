use crate::constants::{RECORD_HEADER_BYTES, SPILL_WRITE_BUFFER_BYTES};
use crate::segment::SpilledSegment;
use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

// Segment data is a run of binary records: [klen u32 LE][vlen u32 LE][key][value],
// sorted by key bytes. The same layout is used in memory and on disk.

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref()).with_context(|| format!("create_dir_all {}", path.as_ref().display()))
}

pub fn open_writer(path: impl AsRef<Path>) -> Result<BufWriter<File>> {
    if let Some(parent) = path.as_ref().parent() {
        ensure_dir(parent)?;
    }
    let file = File::create(path.as_ref()).with_context(|| format!("create {}", path.as_ref().display()))?;
    Ok(BufWriter::with_capacity(SPILL_WRITE_BUFFER_BYTES, file))
}

/// Header lengths for a record, or an error if either part overflows its u32 field.
pub fn record_lengths(key_len: usize, value_len: usize) -> Result<(u32, u32)> {
    match (u32::try_from(key_len), u32::try_from(value_len)) {
        (Ok(k), Ok(v)) => Ok((k, v)),
        _ => bail!("record too large for a u32 header: key {} bytes, value {} bytes", key_len, value_len),
    }
}

fn encode(buf: &mut Vec<u8>, klen: u32, vlen: u32, key: &[u8], value: &[u8]) {
    buf.extend_from_slice(&klen.to_le_bytes());
    buf.extend_from_slice(&vlen.to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Append one record to `buf`. Keys and values must each be under 4 GiB;
/// use [`SpillWriter::write_record`] when that is not known up front.
pub fn write_bin(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    debug_assert!(key.len() <= u32::MAX as usize && value.len() <= u32::MAX as usize, "record part exceeds u32 length");
    encode(buf, key.len() as u32, value.len() as u32, key, value);
}

pub fn encoded_len(key: &[u8], value: &[u8]) -> usize { RECORD_HEADER_BYTES + key.len() + value.len() }

/// Outcome of decoding the record at some offset.
#[derive(Debug, PartialEq, Eq)]
pub enum BinLine<'a> {
    Record { key: &'a [u8], value: &'a [u8], next: usize },
    End,
    /// Trailing bytes that do not form a whole record.
    Truncated,
}

/// Decode the record starting at `off`.
pub fn read_bin_line(bytes: &[u8], off: usize) -> BinLine<'_> {
    if off >= bytes.len() { return BinLine::End; }
    if bytes.len() - off < RECORD_HEADER_BYTES { return BinLine::Truncated; }
    let klen = u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]) as usize;
    let vlen = u32::from_le_bytes([bytes[off + 4], bytes[off + 5], bytes[off + 6], bytes[off + 7]]) as usize;
    let key_start = off + RECORD_HEADER_BYTES;
    let end = match key_start.checked_add(klen).and_then(|k| k.checked_add(vlen)) {
        Some(end) if end <= bytes.len() => end,
        _ => return BinLine::Truncated,
    };
    BinLine::Record { key: &bytes[key_start..key_start + klen], value: &bytes[key_start + klen..end], next: end }
}

/// Directory that owns spill and merge output files for one task.
#[derive(Clone, Debug)]
pub struct SpillDir {
    root: PathBuf,
    keep: bool,
}

impl SpillDir {
    pub fn new(root: impl Into<PathBuf>, keep: bool) -> Result<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self { root, keep })
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn keep_intermediates(&self) -> bool { self.keep }

    /// Fresh, unique path for a new segment file.
    pub fn next_path(&self, prefix: &str) -> PathBuf {
        self.root.join(format!("{}_{}.bin", prefix, uuid::Uuid::new_v4().simple()))
    }

    pub fn create_writer(&self, prefix: &str) -> Result<SpillWriter> {
        SpillWriter::create(self.next_path(prefix), self.keep)
    }
}

/// Streams records into a new spill file and turns it into a sealed segment.
pub struct SpillWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes: u64,
    records: u64,
    keep: bool,
    scratch: Vec<u8>,
}

impl SpillWriter {
    pub fn create(path: PathBuf, keep: bool) -> Result<Self> {
        let writer = open_writer(&path)?;
        Ok(Self { path, writer: Some(writer), bytes: 0, records: 0, keep, scratch: Vec::with_capacity(256) })
    }

    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let (klen, vlen) = record_lengths(key.len(), value.len()).with_context(|| format!("write {}", self.path.display()))?;
        self.scratch.clear();
        encode(&mut self.scratch, klen, vlen, key, value);
        let w = self.writer.as_mut().context("spill writer already finished")?;
        w.write_all(&self.scratch).with_context(|| format!("write {}", self.path.display()))?;
        self.bytes += self.scratch.len() as u64;
        self.records += 1;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 { self.bytes }

    pub fn records_written(&self) -> u64 { self.records }

    /// Flush and seal. The returned segment owns the file.
    pub fn finish(mut self) -> Result<SpilledSegment> {
        if let Some(mut w) = self.writer.take() {
            w.flush().with_context(|| format!("flush {}", self.path.display()))?;
            w.get_ref().sync_data().with_context(|| format!("sync {}", self.path.display()))?;
        }
        let path = std::mem::take(&mut self.path);
        Ok(SpilledSegment::sealed_from_file(path, self.bytes, self.keep))
    }
}

impl Drop for SpillWriter {
    fn drop(&mut self) {
        // Unfinished output cannot be trusted; drop the partial file.
        if self.writer.take().is_some() && !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

use std::path::PathBuf;
use thiserror::Error;

/// Errors a fetcher can hit while writing into a segment it was handed by `reserve`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("write of {len} bytes overflows segment {id}: {written}/{capacity} bytes used")]
    Overflow { id: u64, len: usize, written: usize, capacity: usize },

    #[error("segment {0} is sealed")]
    Sealed(u64),
}

/// Errors raised from inside a merge pass.
#[derive(Error, Debug)]
pub enum MergeError {
    /// The owning task was aborted; the merge stopped at an input boundary.
    #[error("merge cancelled")]
    Cancelled,

    #[error("corrupt segment {source_name} at offset {offset}: {reason}")]
    Corrupt { source_name: String, offset: usize, reason: &'static str },

    #[error("spill file {0} vanished before the merge could read it")]
    MissingSpill(PathBuf),
}

impl MergeError {
    /// True if `err` (anywhere in its chain) is a cancellation rather than a real failure.
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        err.chain().any(|e| matches!(e.downcast_ref::<MergeError>(), Some(MergeError::Cancelled)))
    }
}

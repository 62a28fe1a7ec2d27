pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod failure;
pub mod io;
pub mod ledger;
pub mod merge;
pub mod segment;
pub mod stats;
pub mod worker;

pub use config::{MemoryThresholds, MergeConfig};
pub use coordinator::{Admission, MergeCoordinator, MergeCoordinatorBuilder, MergedOutput};
pub use error::{MergeError, SegmentError};
pub use failure::{FailureSink, TaskFailures};
pub use ledger::{LedgerSnapshot, MemoryLedger};
pub use merge::{CancelToken, Merge, MergeContext, RecordMerger};
pub use segment::{BufferedSegment, MemoryReservation, Origin, Segment, SpilledSegment};
pub use stats::{MergeStats, TierStats};
pub use worker::{MergeSync, Rendezvous, Tier, WorkerState};

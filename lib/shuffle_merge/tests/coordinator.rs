use anyhow::Result;
use parking_lot::Mutex;
use shuffle_merge::io::write_bin;
use shuffle_merge::{
    Admission, BufferedSegment, FailureSink, MergeConfig, MergeContext, MergeCoordinator, MergeError, MergeSync, Origin, Segment,
    SpilledSegment, TaskFailures, Tier, WorkerState,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn reference_config(dir: &Path) -> MergeConfig {
    MergeConfig::new(10_000, 0.8, 0.9, 0.5).with_spill_dir(dir)
}

/// Sorted run of `n` records whose keys are spread by `seed`.
fn run(seed: u64, n: usize) -> Vec<u8> {
    let mut keys: Vec<String> = (0..n as u64).map(|i| format!("{:08}", (i * 7919 + seed * 104_729) % 1_000_003)).collect();
    keys.sort();
    let mut buf = Vec::new();
    for k in &keys {
        write_bin(&mut buf, k.as_bytes(), format!("value-of-{}", k).as_bytes());
    }
    buf
}

/// Reserve and commit `bytes` as one map output, backing off while told to wait.
fn fetch(c: &MergeCoordinator, bytes: &[u8]) -> Origin {
    loop {
        match c.reserve(bytes.len() as u64) {
            Admission::Granted(mut seg) => {
                let origin = seg.origin();
                seg.write(bytes).unwrap();
                c.commit(seg).unwrap();
                return origin;
            }
            Admission::Wait => thread::sleep(Duration::from_millis(1)),
        }
    }
}

fn blank(c: &MergeCoordinator, size: u64) -> Segment {
    c.reserve(size).segment().expect("reservation granted")
}

fn barriers() -> (Arc<Barrier>, Arc<Barrier>, MergeSync) {
    let start = Arc::new(Barrier::new(2));
    let complete = Arc::new(Barrier::new(2));
    let sync = MergeSync::new(start.clone(), complete.clone());
    (start, complete, sync)
}

fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn reference_budget_triggers_exactly_one_merge() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let (start, complete, sync) = barriers();
    let c = MergeCoordinator::builder(reference_config(tmp.path())).merge_sync(Tier::Memory, sync).build().unwrap();

    c.commit(blank(&c, 3_600)).unwrap();
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Idle);
    assert_eq!(c.ledger().committed(), 3_600);

    c.commit(blank(&c, 3_600)).unwrap();
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Merging);
    assert_eq!(c.pending(Tier::Memory), 0);
    // Worker is parked before merging, so nothing has been released yet.
    assert!(c.reserve(3_600).is_wait());

    start.wait();
    complete.wait();
    c.wait_for_merges();

    let stats = c.stats();
    assert_eq!(stats.tier(Tier::Memory).unwrap().merges, 1);
    assert_eq!(stats.tier(Tier::Memory).unwrap().inputs_merged, 2);
    assert_eq!(c.ledger().committed(), 0);
    assert_eq!(c.pending(Tier::Disk), 1);
    assert_eq!(blank(&c, 3_600).origin(), Origin::Buffered);
}

#[test]
fn second_merge_waits_for_the_first() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let batches = Arc::new(Mutex::new(Vec::new()));
    let seen = batches.clone();
    let merger = move |batch: Vec<BufferedSegment>, _ctx: &MergeContext| -> Result<Option<SpilledSegment>> {
        seen.lock().push(batch.len());
        Ok(None)
    };
    let (start, complete, sync) = barriers();
    let c = MergeCoordinator::builder(reference_config(tmp.path()))
        .memory_merger(merger)
        .merge_sync(Tier::Memory, sync)
        .build()
        .unwrap();

    c.commit(blank(&c, 3_600)).unwrap();
    c.commit(blank(&c, 3_600)).unwrap();
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Merging);

    // Still over the threshold, but a merge is in flight: queue, don't dispatch.
    c.commit(blank(&c, 800)).unwrap();
    assert_eq!(c.pending(Tier::Memory), 1);
    assert!(c.reserve(1).is_wait());

    start.wait();
    complete.wait();
    c.wait_for_merges();
    assert_eq!(*batches.lock(), vec![2]);
    assert_eq!(c.ledger().committed(), 800);
    assert_eq!(c.pending(Tier::Memory), 1);

    c.commit(blank(&c, 3_600)).unwrap();
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Idle);
    c.commit(blank(&c, 3_600)).unwrap();
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Merging);

    start.wait();
    complete.wait();
    c.wait_for_merges();
    assert_eq!(*batches.lock(), vec![2, 3]);
    assert_eq!(c.ledger().snapshot().in_use(), 0);
    assert_eq!(c.stats().tier(Tier::Memory).unwrap().merges, 2);
}

#[test]
fn concurrent_fetchers_never_overlap_merges() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (active.clone(), peak.clone());
    let merger = move |batch: Vec<BufferedSegment>, _ctx: &MergeContext| -> Result<Option<SpilledSegment>> {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(2));
        drop(batch);
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    };
    let c = Arc::new(MergeCoordinator::builder(reference_config(tmp.path())).memory_merger(merger).build().unwrap());

    let fetchers: Vec<_> = (0..8u64)
        .map(|t| {
            let c = c.clone();
            thread::spawn(move || {
                for i in 0..60 {
                    fetch(&c, &run(t * 1000 + i, 4));
                }
            })
        })
        .collect();
    for f in fetchers {
        f.join().unwrap();
    }
    c.wait_for_merges();

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let stats = c.stats();
    assert_eq!(stats.admissions.commits, 480);
    assert!(stats.tier(Tier::Memory).unwrap().merges >= 1);
    assert_eq!(stats.ledger.reserved, 0);
    assert!(stats.ledger.committed < c.thresholds().merge_threshold);
}

#[test]
fn every_record_reaches_the_reader_in_key_order() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let config = reference_config(tmp.path()).with_merge_factor(3);
    let c = Arc::new(MergeCoordinator::new(config).unwrap());

    // Small runs buffer in memory; every fifth run is too big and spills.
    let fetchers: Vec<_> = (0..4u64)
        .map(|t| {
            let c = c.clone();
            thread::spawn(move || {
                let mut records = 0usize;
                let mut spilled = 0usize;
                for i in 0..25u64 {
                    let n = if i % 5 == 0 { 160 } else { 12 };
                    if fetch(&c, &run(t * 100 + i, n)) == Origin::Spilled {
                        spilled += 1;
                    }
                    records += n;
                }
                (records, spilled)
            })
        })
        .collect();
    let (mut expected, mut spilled) = (0, 0);
    for f in fetchers {
        let (r, s) = f.join().unwrap();
        expected += r;
        spilled += s;
    }
    assert_eq!(spilled, 20);

    let output = c.close().unwrap();
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0;
    for record in output.into_records().unwrap() {
        let (key, value) = record.unwrap();
        assert_eq!(value, [b"value-of-".as_slice(), key.as_slice()].concat());
        if let Some(p) = &prev {
            assert!(p <= &key, "keys out of order");
        }
        prev = Some(key);
        count += 1;
    }
    assert_eq!(count, expected);

    let stats = c.stats();
    assert!(stats.tier(Tier::Disk).unwrap().merges >= 1);
    assert_eq!(stats.tier(Tier::Final).unwrap().merges, 1);
    assert_eq!(stats.ledger.in_use(), 0);
    drop(c);
    assert_eq!(files_in(tmp.path()), 0);
}

#[test]
fn merged_output_is_a_blocking_pull() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let c = MergeCoordinator::new(reference_config(tmp.path()).with_merge_factor(2)).unwrap();
    for i in 0..3 {
        assert_eq!(fetch(&c, &run(i, 200)), Origin::Spilled);
    }
    c.wait_for_merges();
    let output = c.close().unwrap();
    let segments: Vec<SpilledSegment> = output.collect();
    assert!(!segments.is_empty() && segments.len() <= 2);
    assert!(segments.iter().all(|s| s.path().exists()));
}

#[test]
fn count_threshold_triggers_in_memory_merge() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let c = MergeCoordinator::new(reference_config(tmp.path()).with_inmem_segment_threshold(3)).unwrap();
    for i in 0..3 {
        fetch(&c, &run(i, 2));
    }
    c.wait_for_merges();
    assert_eq!(c.stats().tier(Tier::Memory).unwrap().merges, 1);
    assert_eq!(c.pending(Tier::Disk), 1);
    assert_eq!(c.ledger().committed(), 0);
}

#[test]
fn disk_merge_output_waits_for_the_final_pass() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let c = MergeCoordinator::new(reference_config(tmp.path()).with_merge_factor(2)).unwrap();
    fetch(&c, &run(1, 200));
    fetch(&c, &run(2, 200));
    assert_eq!(c.pending(Tier::Disk), 2);
    fetch(&c, &run(3, 200));
    c.wait_for_merges();
    assert_eq!(c.pending(Tier::Disk), 0);
    assert_eq!(c.pending(Tier::Final), 1);
    assert_eq!(c.stats().tier(Tier::Disk).unwrap().inputs_merged, 3);
}

#[test]
fn failed_merge_is_reported_and_fails_the_reader() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let failures = Arc::new(TaskFailures::new());
    let merger = |_batch: Vec<SpilledSegment>, _ctx: &MergeContext| -> Result<Option<SpilledSegment>> { anyhow::bail!("checksum mismatch") };
    let c = MergeCoordinator::builder(reference_config(tmp.path()).with_merge_factor(2))
        .failure_sink(failures.clone())
        .disk_merger(merger)
        .build()
        .unwrap();
    for i in 0..3 {
        fetch(&c, &run(i, 200));
    }
    c.wait_for_merges();

    assert_eq!(failures.count(), 1);
    let message = failures.first_message().unwrap();
    assert!(message.contains("checksum mismatch"));
    assert!(message.contains("disk merge of 3 segments"));
    assert_eq!(c.stats().tier(Tier::Disk).unwrap().failures, 1);
    // Inputs of the failed batch were released with it.
    assert_eq!(files_in(tmp.path()), 0);

    let err = c.close().unwrap().into_records().err().expect("reader must fail");
    assert!(format!("{:#}", err).contains("failed"));
}

#[test]
fn custom_sink_sees_every_failure() {
    struct Counting(AtomicUsize);
    impl FailureSink for Counting {
        fn report_exception(&self, _err: anyhow::Error) { self.0.fetch_add(1, Ordering::SeqCst); }
    }
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let sink = Arc::new(Counting(AtomicUsize::new(0)));
    let merger = |_batch: Vec<BufferedSegment>, _ctx: &MergeContext| -> Result<Option<SpilledSegment>> { anyhow::bail!("out of disk") };
    let c = MergeCoordinator::builder(reference_config(tmp.path()).with_inmem_segment_threshold(1))
        .failure_sink(sink.clone())
        .memory_merger(merger)
        .build()
        .unwrap();
    for i in 0..4 {
        fetch(&c, &run(i, 2));
        c.wait_for_merges();
    }
    assert_eq!(sink.0.load(Ordering::SeqCst), 4);
    assert_eq!(c.ledger().snapshot().in_use(), 0);
}

#[test]
fn abort_cancels_the_running_merge_and_frees_memory() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let failures = Arc::new(TaskFailures::new());
    let merger = |batch: Vec<BufferedSegment>, ctx: &MergeContext| -> Result<Option<SpilledSegment>> {
        while !ctx.cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        drop(batch);
        Err(MergeError::Cancelled.into())
    };
    let start = Arc::new(Barrier::new(2));
    let c = MergeCoordinator::builder(reference_config(tmp.path()))
        .failure_sink(failures.clone())
        .memory_merger(merger)
        .merge_sync(Tier::Memory, MergeSync::default().on_start(start.clone()))
        .build()
        .unwrap();

    c.commit(blank(&c, 3_600)).unwrap();
    c.commit(blank(&c, 3_600)).unwrap();
    c.commit(blank(&c, 500)).unwrap();
    fetch(&c, &run(9, 200));
    start.wait();

    c.abort();
    assert_eq!(c.ledger().snapshot().in_use(), 0);
    assert_eq!(c.pending(Tier::Memory), 0);
    assert_eq!(c.pending(Tier::Disk), 0);
    assert_eq!(failures.count(), 0);
    assert_eq!(c.stats().tier(Tier::Memory).unwrap().merges, 0);
    assert_eq!(files_in(tmp.path()), 0);
    assert!(c.close().is_err());
    assert!(c.commit(blank(&c, 10)).is_err());
}

#[test]
fn dropping_without_close_removes_spill_files() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let c = MergeCoordinator::new(reference_config(tmp.path())).unwrap();
    fetch(&c, &run(1, 200));
    fetch(&c, &run(2, 3));
    assert_eq!(files_in(tmp.path()), 1);
    let ledger_in_use = c.ledger().snapshot().in_use();
    assert!(ledger_in_use > 0);
    drop(c);
    assert_eq!(files_in(tmp.path()), 0);
}

#[test]
fn kept_intermediates_survive_abort() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let c = MergeCoordinator::new(reference_config(tmp.path()).with_keep_intermediates(true)).unwrap();
    fetch(&c, &run(1, 200));
    c.abort();
    assert_eq!(files_in(tmp.path()), 1);
}

#[test]
fn waiting_fetch_below_the_threshold_gets_memory_back() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let (start, complete, sync) = barriers();
    let c = MergeCoordinator::builder(reference_config(tmp.path())).merge_sync(Tier::Memory, sync).build().unwrap();

    // 7,100 committed: under the 7,200 trigger, yet 1,000 more would pass the 8,000 usable.
    c.commit(blank(&c, 3_600)).unwrap();
    c.commit(blank(&c, 3_500)).unwrap();
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Idle);
    assert_eq!(c.pending(Tier::Memory), 2);

    assert!(c.reserve(1_000).is_wait());
    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Merging);
    assert_eq!(c.pending(Tier::Memory), 0);
    assert!(c.ledger().snapshot().in_use() <= c.thresholds().usable);
    // The in-flight merge is not dispatched twice.
    assert!(c.reserve(1_000).is_wait());

    start.wait();
    complete.wait();
    c.wait_for_merges();
    assert_eq!(c.ledger().committed(), 0);
    assert_eq!(c.stats().tier(Tier::Memory).unwrap().merges, 1);
    assert_eq!(c.stats().tier(Tier::Memory).unwrap().inputs_merged, 2);
    assert_eq!(blank(&c, 1_000).origin(), Origin::Buffered);
}

#[test]
fn mid_size_fetches_never_stall_under_the_threshold() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let c = MergeCoordinator::new(reference_config(tmp.path())).unwrap();
    // 107 records of 33 bytes: 3,531 bytes each, so two sit under the trigger and a third never fits.
    for i in 0..12 {
        let bytes = run(i, 107);
        let mut granted = None;
        for _ in 0..2_000 {
            if let Admission::Granted(seg) = c.reserve(bytes.len() as u64) {
                granted = Some(seg);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let mut seg = granted.unwrap_or_else(|| panic!("fetch {} stalled with {:?}", i, c.ledger().snapshot()));
        assert_eq!(seg.origin(), Origin::Buffered);
        seg.write(&bytes).unwrap();
        c.commit(seg).unwrap();
    }
    c.wait_for_merges();
    assert!(c.stats().tier(Tier::Memory).unwrap().merges >= 5);
    let records = c.close().unwrap().into_records().unwrap().count();
    assert_eq!(records, 12 * 107);
}

#[test]
fn panicking_merge_is_reported_and_frees_its_tier() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let failures = Arc::new(TaskFailures::new());
    let merger = |_batch: Vec<BufferedSegment>, _ctx: &MergeContext| -> Result<Option<SpilledSegment>> { panic!("merge pass blew up") };
    let c = MergeCoordinator::builder(reference_config(tmp.path()))
        .failure_sink(failures.clone())
        .memory_merger(merger)
        .build()
        .unwrap();

    c.commit(blank(&c, 3_600)).unwrap();
    c.commit(blank(&c, 3_600)).unwrap();
    c.wait_for_merges();

    assert_eq!(c.worker_state(Tier::Memory), WorkerState::Idle);
    assert_eq!(failures.count(), 1);
    assert!(failures.first_message().unwrap().contains("merge pass blew up"));
    assert_eq!(c.stats().tier(Tier::Memory).unwrap().failures, 1);
    // The batch unwound with the panic and gave its memory back.
    assert_eq!(c.ledger().snapshot().in_use(), 0);

    let err = c.close().unwrap().into_records().err().expect("reader must fail");
    assert!(format!("{:#}", err).contains("failed"));
}

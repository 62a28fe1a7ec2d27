//! Memory accounting for fetched segments.
//!
//! Bytes move through two counters: `reserved` (claimed before the fetcher writes)
//! and `committed` (sealed data waiting for, or inside, a merge). Their sum never
//! exceeds the usable capacity. Every mutation is an O(1) update under one mutex;
//! buffer copies and merge I/O happen outside it.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

#[derive(Debug)]
pub struct MemoryLedger {
    capacity: u64,
    usable: u64,
    counters: Mutex<Counters>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    reserved: u64,
    committed: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub capacity: u64,
    pub usable: u64,
    pub reserved: u64,
    pub committed: u64,
}

impl LedgerSnapshot {
    pub fn in_use(&self) -> u64 { self.reserved + self.committed }
}

impl MemoryLedger {
    pub fn new(capacity: u64, usable: u64) -> Self {
        assert!(usable <= capacity, "usable {} exceeds capacity {}", usable, capacity);
        Self { capacity, usable, counters: Mutex::new(Counters::default()) }
    }

    pub fn capacity(&self) -> u64 { self.capacity }

    pub fn usable(&self) -> u64 { self.usable }

    /// Claim `size` bytes if they fit under the usable capacity. Never partially admits.
    pub fn try_reserve(&self, size: u64) -> bool {
        let mut c = self.counters.lock();
        let in_use = c.reserved + c.committed;
        match in_use.checked_add(size) {
            Some(total) if total <= self.usable => {
                c.reserved += size;
                trace!(size, reserved = c.reserved, committed = c.committed, "ledger reserve");
                true
            }
            _ => false,
        }
    }

    /// Move `size` bytes from reserved to committed.
    pub fn commit(&self, size: u64) {
        let mut c = self.counters.lock();
        assert!(size <= c.reserved, "commit of {} bytes exceeds reserved {}", size, c.reserved);
        c.reserved -= size;
        c.committed += size;
    }

    /// Return `size` committed bytes once a merge has consumed them.
    pub fn unreserve(&self, size: u64) {
        let mut c = self.counters.lock();
        assert!(size <= c.committed, "unreserve of {} bytes exceeds committed {} (double release?)", size, c.committed);
        c.committed -= size;
        trace!(size, reserved = c.reserved, committed = c.committed, "ledger unreserve");
    }

    /// Drop a reservation that was never committed (fetch abandoned or task aborted).
    pub fn cancel_reservation(&self, size: u64) {
        let mut c = self.counters.lock();
        assert!(size <= c.reserved, "cancel of {} bytes exceeds reserved {}", size, c.reserved);
        c.reserved -= size;
    }

    pub fn committed(&self) -> u64 { self.counters.lock().committed }

    pub fn reserved(&self) -> u64 { self.counters.lock().reserved }

    /// `committed / usable`. A snapshot; callers tolerate it going stale immediately.
    pub fn usage_ratio(&self) -> f64 {
        if self.usable == 0 { return 1.0; }
        self.committed() as f64 / self.usable as f64
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let c = *self.counters.lock();
        LedgerSnapshot { capacity: self.capacity, usable: self.usable, reserved: c.reserved, committed: c.committed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reserve_commit_unreserve() {
        let ledger = MemoryLedger::new(10_000, 8_000);
        assert!(ledger.try_reserve(3_600));
        assert!(ledger.try_reserve(3_600));
        assert!(!ledger.try_reserve(3_600), "7200 + 3600 > 8000");
        assert!(ledger.try_reserve(800), "exactly at usable is allowed");
        assert!(!ledger.try_reserve(1));
        ledger.commit(3_600);
        ledger.commit(3_600);
        assert_eq!(ledger.snapshot(), LedgerSnapshot { capacity: 10_000, usable: 8_000, reserved: 800, committed: 7_200 });
        assert!((ledger.usage_ratio() - 0.9).abs() < 1e-12);
        ledger.unreserve(7_200);
        ledger.cancel_reservation(800);
        assert_eq!(ledger.snapshot().in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn unreserve_below_zero_panics() {
        let ledger = MemoryLedger::new(100, 100);
        assert!(ledger.try_reserve(10));
        ledger.commit(10);
        ledger.unreserve(10);
        ledger.unreserve(10);
    }

    #[test]
    #[should_panic(expected = "exceeds reserved")]
    fn commit_without_reservation_panics() {
        let ledger = MemoryLedger::new(100, 100);
        ledger.commit(1);
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        let ledger = Arc::new(MemoryLedger::new(1_000_000, 100_000));
        let handles: Vec<_> = (0..8).map(|_| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                let mut granted = 0u64;
                for _ in 0..10_000 {
                    if ledger.try_reserve(7) {
                        granted += 7;
                        assert!(ledger.snapshot().in_use() <= 100_000);
                    }
                }
                granted
            })
        }).collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, ledger.reserved());
        assert!(total <= 100_000);
        assert!(total > 100_000 - 7);
    }

    #[derive(Debug, Clone)]
    enum Op { Reserve(u64), Commit, Release, Cancel }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..3_000).prop_map(Op::Reserve),
            Just(Op::Commit),
            Just(Op::Release),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn capacity_invariant_holds(ops in proptest::collection::vec(op(), 1..200)) {
            let ledger = MemoryLedger::new(10_000, 8_000);
            let mut reserved: Vec<u64> = Vec::new();
            let mut committed: Vec<u64> = Vec::new();
            for op in ops {
                match op {
                    Op::Reserve(size) => {
                        let fits = ledger.snapshot().in_use() + size <= 8_000;
                        prop_assert_eq!(ledger.try_reserve(size), fits);
                        if fits { reserved.push(size); }
                    }
                    Op::Commit => if let Some(s) = reserved.pop() { ledger.commit(s); committed.push(s); },
                    Op::Release => if let Some(s) = committed.pop() { ledger.unreserve(s); },
                    Op::Cancel => if let Some(s) = reserved.pop() { ledger.cancel_reservation(s); },
                }
                let snap = ledger.snapshot();
                prop_assert!(snap.in_use() <= 8_000);
                prop_assert_eq!(snap.reserved, reserved.iter().sum::<u64>());
                prop_assert_eq!(snap.committed, committed.iter().sum::<u64>());
            }
        }
    }
}

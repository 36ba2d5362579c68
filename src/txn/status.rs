//! Per-transaction status records
//!
//! One `TransactionStatus` exists for every live or recently-ended
//! transaction. The commit/state field `tc` is the single source of truth
//! for visibility decisions; readers inspect it with plain atomic loads.

use crate::timestamp::{ABORTED, UNCOMMITTED};
use crate::txn::accumulator::Accumulator;
use crate::{PersistitError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// One accumulator contribution attached to a transaction. Merged into the
/// accumulator's per-bucket totals when the transaction is reduced.
#[derive(Clone)]
pub struct Delta {
    accumulator: Arc<Accumulator>,
    step: u32,
    value: i64,
}

impl Delta {
    pub fn new(accumulator: Arc<Accumulator>, step: u32, value: i64) -> Self {
        Self {
            accumulator,
            step,
            value,
        }
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

/// Status record for a single transaction.
///
/// `tc` transitions: `UNCOMMITTED` -> `-commitTs` (provisional, while the
/// commit is being published) -> `commitTs`, or `UNCOMMITTED` -> `ABORTED`.
/// A positive `tc` is immutable until the record is recycled.
pub struct TransactionStatus {
    ts: AtomicI64,
    tc: AtomicI64,
    mvcc_count: AtomicU32,
    deltas: Mutex<Vec<Delta>>,
}

impl TransactionStatus {
    pub fn new(ts: i64) -> Self {
        Self {
            ts: AtomicI64::new(ts),
            tc: AtomicI64::new(UNCOMMITTED),
            mvcc_count: AtomicU32::new(0),
            deltas: Mutex::new(Vec::new()),
        }
    }

    /// Start timestamp.
    pub fn ts(&self) -> i64 {
        self.ts.load(Ordering::Acquire)
    }

    /// Raw commit/state field.
    pub fn tc(&self) -> i64 {
        self.tc.load(Ordering::Acquire)
    }

    /// Final commit timestamp, if the transaction has committed.
    pub fn commit_timestamp(&self) -> Option<i64> {
        match self.tc() {
            tc if tc > 0 && tc != UNCOMMITTED => Some(tc),
            _ => None,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.commit_timestamp().is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.tc() == ABORTED
    }

    /// Still running, or mid-commit with a provisional value.
    pub fn is_active(&self) -> bool {
        let tc = self.tc();
        tc == UNCOMMITTED || (tc < 0 && tc != ABORTED)
    }

    /// Publish the commit timestamp. The provisional negative value is
    /// stored first so that a concurrent reader never observes a final
    /// commit timestamp before the write sequence completes.
    pub(crate) fn mark_committed(&self, commit_ts: i64) -> Result<()> {
        if commit_ts <= 0 || commit_ts == UNCOMMITTED {
            return Err(PersistitError::IllegalArgument(format!(
                "invalid commit timestamp {}",
                commit_ts
            )));
        }
        if commit_ts < self.ts() {
            return Err(PersistitError::IllegalArgument(format!(
                "commit timestamp {} precedes start timestamp {}",
                commit_ts,
                self.ts()
            )));
        }
        match self.tc.compare_exchange(
            UNCOMMITTED,
            -commit_ts,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(observed) if observed == -commit_ts => {}
            Err(observed) => {
                return Err(PersistitError::IllegalState(format!(
                    "transaction ts={} cannot commit from state {}",
                    self.ts(),
                    observed
                )));
            }
        }
        self.tc.store(commit_ts, Ordering::Release);
        Ok(())
    }

    pub(crate) fn mark_aborted(&self) -> Result<()> {
        match self
            .tc
            .compare_exchange(UNCOMMITTED, ABORTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(ABORTED) => Ok(()),
            Err(observed) => Err(PersistitError::IllegalState(format!(
                "transaction ts={} cannot abort from state {}",
                self.ts(),
                observed
            ))),
        }
    }

    /// Number of MVCC versions this transaction has written that are still
    /// present in pages. Aborted statuses stay findable until this drops
    /// to zero.
    pub fn mvcc_count(&self) -> u32 {
        self.mvcc_count.load(Ordering::Acquire)
    }

    pub fn increment_mvcc_count(&self) {
        self.mvcc_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_mvcc_count(&self) {
        let previous = self.mvcc_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "mvcc count underflow");
    }

    pub fn add_delta(&self, delta: Delta) {
        self.deltas.lock().push(delta);
    }

    /// Visit the delta list under its lock.
    pub fn with_deltas<R>(&self, f: impl FnOnce(&[Delta]) -> R) -> R {
        let deltas = self.deltas.lock();
        f(&deltas)
    }

    pub(crate) fn clear_deltas(&self) {
        self.deltas.lock().clear();
    }

    /// Reinitialize a recycled record from the free list.
    pub(crate) fn reset(&self, ts: i64) {
        self.clear_deltas();
        self.mvcc_count.store(0, Ordering::Release);
        self.ts.store(ts, Ordering::Release);
        self.tc.store(UNCOMMITTED, Ordering::Release);
    }
}

impl std::fmt::Debug for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("ts", &self.ts())
            .field("tc", &self.tc())
            .field("mvcc_count", &self.mvcc_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_status_is_active() {
        let status = TransactionStatus::new(10);
        assert_eq!(status.ts(), 10);
        assert!(status.is_active());
        assert!(!status.is_committed());
        assert!(!status.is_aborted());
    }

    #[test]
    fn test_commit_transition() {
        let status = TransactionStatus::new(10);
        status.mark_committed(15).unwrap();
        assert!(status.is_committed());
        assert_eq!(status.commit_timestamp(), Some(15));
        assert!(!status.is_active());
    }

    #[test]
    fn test_commit_before_start_rejected() {
        let status = TransactionStatus::new(10);
        assert!(status.mark_committed(5).is_err());
    }

    #[test]
    fn test_abort_then_commit_rejected() {
        let status = TransactionStatus::new(10);
        status.mark_aborted().unwrap();
        assert!(status.is_aborted());
        assert!(status.mark_committed(20).is_err());
    }

    #[test]
    fn test_reset_recycles_record() {
        let status = TransactionStatus::new(10);
        status.increment_mvcc_count();
        status.mark_committed(12).unwrap();
        status.reset(50);
        assert_eq!(status.ts(), 50);
        assert_eq!(status.mvcc_count(), 0);
        assert!(status.is_active());
    }
}

//! Transaction sessions
//!
//! A [`Transaction`] wraps the status record registered in the
//! [`TransactionIndex`] with the lifecycle the application drives:
//! begin, step increments, commit, abort.

use crate::timestamp::TimestampAllocator;
use crate::txn::index::TransactionIndex;
use crate::txn::status::TransactionStatus;
use crate::txn::{ts_to_handle, MAX_STEP};
use crate::{PersistitError, Result};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

/// A snapshot-isolated transaction.
pub struct Transaction {
    index: Arc<TransactionIndex>,
    allocator: Arc<TimestampAllocator>,
    status: Arc<TransactionStatus>,
    start_ts: i64,
    step: AtomicU32,
    state: AtomicU8,
}

impl Transaction {
    pub(crate) fn begin(
        index: Arc<TransactionIndex>,
        allocator: Arc<TimestampAllocator>,
    ) -> Self {
        let status = index.register_transaction();
        let start_ts = status.ts();
        Self {
            index,
            allocator,
            status,
            start_ts,
            step: AtomicU32::new(0),
            state: AtomicU8::new(State::Active as u8),
        }
    }

    pub fn start_timestamp(&self) -> i64 {
        self.start_ts
    }

    /// The snapshot against which this transaction reads.
    pub fn snapshot_timestamp(&self) -> i64 {
        self.start_ts
    }

    pub fn status(&self) -> &Arc<TransactionStatus> {
        &self.status
    }

    pub fn index(&self) -> &Arc<TransactionIndex> {
        &self.index
    }

    /// Current step. Step 0 sees all of the transaction's own writes;
    /// step s sees only writes at steps below s.
    pub fn step(&self) -> u32 {
        self.step.load(Ordering::Acquire)
    }

    /// Advance to the next step and return it.
    pub fn increment_step(&self) -> Result<u32> {
        let next = self.step.fetch_add(1, Ordering::AcqRel) + 1;
        if next > MAX_STEP {
            self.step.store(MAX_STEP, Ordering::Release);
            return Err(PersistitError::IllegalState(format!(
                "transaction exceeded {} steps",
                MAX_STEP
            )));
        }
        Ok(next)
    }

    /// Version handle for writes made at the current step.
    pub fn version_handle(&self) -> i64 {
        ts_to_handle(self.start_ts, self.step())
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == State::Active as u8
    }

    fn transition(&self, to: State) -> Result<()> {
        match self.state.compare_exchange(
            State::Active as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(PersistitError::IllegalState(format!(
                "transaction ts={} already finished",
                self.start_ts
            ))),
        }
    }

    /// Commit: draws a commit ticket and publishes it through the index.
    /// Returns the commit timestamp.
    pub fn commit(&self) -> Result<i64> {
        self.transition(State::Committed)?;
        let commit_ts = self.allocator.update_timestamp();
        self.index.notify_committed(&self.status, commit_ts)?;
        Ok(commit_ts)
    }

    /// Abort: every write and accumulator delta of this transaction becomes
    /// permanently invisible.
    pub fn abort(&self) -> Result<()> {
        self.transition(State::Aborted)?;
        self.index.notify_aborted(&self.status)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An unfinished transaction aborts rather than lingering as a
        // phantom active entry that would pin the floor forever.
        if self.is_active() {
            let _ = self.abort();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("start_ts", &self.start_ts)
            .field("step", &self.step())
            .field("active", &self.is_active())
            .finish()
    }
}

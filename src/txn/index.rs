//! Sharded transaction index
//!
//! Tracks the status of every live, recently-committed, long-running and
//! aborted transaction in lock-striped buckets, answers visibility queries
//! against direct `tc` inspection, and maintains an advisory cache of the
//! active-transaction floor/ceiling used for accumulator reduction.
//!
//! Visibility correctness never depends on the cache being current; the
//! cache only accelerates reduction and concurrent-range queries.

use crate::timestamp::{TimestampAllocator, ABORTED, UNCOMMITTED};
use crate::txn::accumulator::Accumulator;
use crate::txn::status::TransactionStatus;
use crate::txn::{handle_to_step, handle_to_ts};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Immutable snapshot of the active-transaction set, published by pointer
/// swap from [`TransactionIndex::update_active_transaction_cache`].
#[derive(Debug, Clone)]
pub struct ActiveTransactionCache {
    floor: i64,
    ceiling: i64,
    /// Sorted start timestamps of transactions active at the refresh.
    active: Vec<i64>,
}

impl ActiveTransactionCache {
    fn empty() -> Self {
        Self {
            floor: 0,
            ceiling: 0,
            active: Vec::new(),
        }
    }

    pub fn floor(&self) -> i64 {
        self.floor
    }

    pub fn ceiling(&self) -> i64 {
        self.ceiling
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn has_active_in(&self, low: i64, high: i64) -> bool {
        // (low, high] on a sorted list
        let start = self.active.partition_point(|&ts| ts <= low);
        start < self.active.len() && self.active[start] <= high
    }
}

#[derive(Default)]
struct BucketLists {
    /// Registered transactions: running, committing or committed but not
    /// yet reduced.
    current: Vec<Arc<TransactionStatus>>,
    /// Uncommitted transactions older than the active floor.
    long_running: Vec<Arc<TransactionStatus>>,
    /// Aborted transactions whose versions are still present in pages.
    aborted: Vec<Arc<TransactionStatus>>,
    /// Recycled records.
    free: Vec<Arc<TransactionStatus>>,
}

struct Bucket {
    lists: Mutex<BucketLists>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            lists: Mutex::new(BucketLists::default()),
        }
    }
}

/// Sharded registry of transaction statuses and visibility oracle.
pub struct TransactionIndex {
    allocator: Arc<TimestampAllocator>,
    buckets: Vec<Bucket>,
    cache: RwLock<Arc<ActiveTransactionCache>>,
    /// Serializes cache rebuilds; only one walk at a time.
    cache_update_lock: Mutex<()>,
}

impl TransactionIndex {
    /// `bucket_count` must be a power of two.
    pub fn new(allocator: Arc<TimestampAllocator>, bucket_count: usize) -> Self {
        assert!(
            bucket_count > 0 && bucket_count.is_power_of_two(),
            "bucket count must be a power of two"
        );
        let buckets = (0..bucket_count).map(|_| Bucket::new()).collect();
        Self {
            allocator,
            buckets,
            cache: RwLock::new(Arc::new(ActiveTransactionCache::empty())),
            cache_update_lock: Mutex::new(()),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn allocator(&self) -> &Arc<TimestampAllocator> {
        &self.allocator
    }

    fn bucket_for(&self, ts: i64) -> &Bucket {
        &self.buckets[(ts as u64 as usize) & (self.buckets.len() - 1)]
    }

    fn bucket_index_for(&self, ts: i64) -> usize {
        (ts as u64 as usize) & (self.buckets.len() - 1)
    }

    /// Assign a start timestamp and register a status record for a new
    /// transaction. Start timestamps are totally ordered across callers.
    pub fn register_transaction(&self) -> Arc<TransactionStatus> {
        let ts = self.allocator.update_timestamp();
        let bucket = self.bucket_for(ts);
        let mut lists = bucket.lists.lock();
        let status = match lists.free.pop() {
            // Reuse only when the index holds the sole reference; a stale
            // handle elsewhere must keep seeing the old record's fields.
            Some(recycled) if Arc::strong_count(&recycled) == 1 => {
                recycled.reset(ts);
                recycled
            }
            Some(recycled) => {
                lists.free.push(recycled);
                Arc::new(TransactionStatus::new(ts))
            }
            None => Arc::new(TransactionStatus::new(ts)),
        };
        lists.current.push(status.clone());
        status
    }

    /// Publish `commit_ts` as the transaction's final commit timestamp.
    pub fn notify_committed(&self, status: &Arc<TransactionStatus>, commit_ts: i64) -> crate::Result<()> {
        status.mark_committed(commit_ts)
    }

    /// Mark the transaction aborted and relink it onto the aborted list so
    /// the oracle keeps answering ABORTED until its versions are pruned.
    pub fn notify_aborted(&self, status: &Arc<TransactionStatus>) -> crate::Result<()> {
        status.mark_aborted()?;
        status.clear_deltas();
        let bucket = self.bucket_for(status.ts());
        let mut lists = bucket.lists.lock();
        if let Some(position) = lists
            .current
            .iter()
            .position(|s| Arc::ptr_eq(s, status))
        {
            let status = lists.current.remove(position);
            lists.aborted.push(status);
        } else if let Some(position) = lists
            .long_running
            .iter()
            .position(|s| Arc::ptr_eq(s, status))
        {
            let status = lists.long_running.remove(position);
            lists.aborted.push(status);
        }
        Ok(())
    }

    /// Locate the status record for a start timestamp, if it has not been
    /// reduced away.
    pub fn status_for(&self, ts: i64) -> Option<Arc<TransactionStatus>> {
        let bucket = self.bucket_for(ts);
        let lists = bucket.lists.lock();
        lists
            .current
            .iter()
            .chain(lists.long_running.iter())
            .chain(lists.aborted.iter())
            .find(|status| status.ts() == ts)
            .cloned()
    }

    /// Is the version tagged `version_handle` visible to a reader at
    /// `(snapshot_ts, snapshot_step)`?
    ///
    /// The writer is visible iff it committed with `tc <= snapshot_ts`. A
    /// status that is no longer in any bucket was reduced, which requires
    /// `tc` below the active floor, so it is visible to every live reader.
    /// Own writes (identity match with `current`) are governed by the step
    /// horizon: step 0 sees all of them, step s sees steps `< s`.
    pub fn is_visible(
        &self,
        version_handle: i64,
        snapshot_ts: i64,
        snapshot_step: u32,
        current: Option<&Arc<TransactionStatus>>,
    ) -> bool {
        let version_ts = handle_to_ts(version_handle);
        if version_ts == 0 {
            // Primordial version, written outside any transaction.
            return true;
        }
        if let Some(current) = current {
            if current.ts() == version_ts {
                let version_step = handle_to_step(version_handle);
                return snapshot_step == 0 || version_step < snapshot_step;
            }
        }
        match self.status_for(version_ts) {
            Some(status) => match status.tc() {
                ABORTED => false,
                UNCOMMITTED => false,
                tc if tc < 0 => false,
                tc => tc <= snapshot_ts,
            },
            None => true,
        }
    }

    /// Was the writer of `version_handle` aborted? Used by version pruning.
    pub fn is_aborted(&self, version_handle: i64) -> bool {
        let version_ts = handle_to_ts(version_handle);
        if version_ts == 0 {
            return false;
        }
        self.status_for(version_ts)
            .map(|status| status.is_aborted())
            .unwrap_or(false)
    }

    /// True iff some transaction with start timestamp in `(low, high]` is
    /// active now or was active at the last cache refresh. Conservative
    /// when the cache is stale.
    pub fn has_concurrent_transaction(&self, low: i64, high: i64) -> bool {
        let cache = self.cache.read().clone();
        if high > cache.ceiling {
            return true;
        }
        cache.has_active_in(low, high)
    }

    /// Smallest start timestamp of any active transaction at the last cache
    /// refresh; never greater than the true floor.
    pub fn active_transaction_floor(&self) -> i64 {
        self.cache.read().floor
    }

    /// Timestamp at which the cache was last refreshed.
    pub fn active_transaction_ceiling(&self) -> i64 {
        self.cache.read().ceiling
    }

    pub fn active_transaction_count(&self) -> usize {
        self.cache.read().active_count()
    }

    /// Walk all buckets, rebuild the floor/ceiling/active list, and publish
    /// the new cache atomically. Only one rebuild runs at a time.
    pub fn update_active_transaction_cache(&self) {
        let _guard = self.cache_update_lock.lock();
        let ceiling = self.allocator.current_timestamp();
        let mut active = Vec::new();
        for bucket in &self.buckets {
            let lists = bucket.lists.lock();
            for status in lists.current.iter().chain(lists.long_running.iter()) {
                if status.is_active() {
                    active.push(status.ts());
                }
            }
        }
        active.sort_unstable();
        let floor = active.first().copied().unwrap_or(ceiling);
        let fresh = Arc::new(ActiveTransactionCache {
            floor,
            ceiling,
            active,
        });
        *self.cache.write() = fresh;
    }

    /// Compute the accumulator value visible at `(timestamp, step)` on top
    /// of `base` (the accumulator's base plus bucket totals). Scans the
    /// live statuses of every bucket; reduced transactions are already in
    /// the bucket totals.
    pub fn accumulator_snapshot(
        &self,
        accumulator: &Arc<Accumulator>,
        timestamp: i64,
        step: u32,
        base: i64,
    ) -> i64 {
        let mut value = base;
        for bucket in &self.buckets {
            let lists = bucket.lists.lock();
            for status in lists.current.iter().chain(lists.long_running.iter()) {
                let own = status.ts() == timestamp;
                let committed_at = status.commit_timestamp();
                if !own && committed_at.map_or(true, |tc| tc > timestamp) {
                    continue;
                }
                status.with_deltas(|deltas| {
                    for delta in deltas {
                        if !Arc::ptr_eq(delta.accumulator(), accumulator) {
                            continue;
                        }
                        if own && step != 0 && delta.step() >= step {
                            continue;
                        }
                        value = accumulator.apply(value, delta.value());
                    }
                });
            }
        }
        value
    }

    /// Merge reduced transactions into accumulator bucket totals and
    /// recycle their records. Committed statuses with `tc` at or below the
    /// active floor are folded and freed; aborted statuses are freed once
    /// their last MVCC version is pruned; uncommitted statuses older than
    /// the floor move to the long-running list.
    pub fn reduce(&self) {
        let floor = self.active_transaction_floor();
        for (bucket_index, bucket) in self.buckets.iter().enumerate() {
            let mut lists = bucket.lists.lock();
            let mut kept = Vec::with_capacity(lists.current.len());
            for status in std::mem::take(&mut lists.current) {
                match status.tc() {
                    ABORTED => lists.aborted.push(status),
                    UNCOMMITTED => {
                        if status.ts() <= floor {
                            lists.long_running.push(status);
                        } else {
                            kept.push(status);
                        }
                    }
                    tc if tc < 0 => kept.push(status),
                    tc if tc <= floor => {
                        status.with_deltas(|deltas| {
                            for delta in deltas {
                                delta.accumulator().aggregate(bucket_index, delta.value());
                            }
                        });
                        status.clear_deltas();
                        lists.free.push(status);
                    }
                    _ => kept.push(status),
                }
            }
            lists.current = kept;

            let mut still_long_running = Vec::with_capacity(lists.long_running.len());
            for status in std::mem::take(&mut lists.long_running) {
                match status.tc() {
                    ABORTED => lists.aborted.push(status),
                    tc if tc > 0 && tc != UNCOMMITTED && tc <= floor => {
                        status.with_deltas(|deltas| {
                            for delta in deltas {
                                delta.accumulator().aggregate(bucket_index, delta.value());
                            }
                        });
                        status.clear_deltas();
                        lists.free.push(status);
                    }
                    _ => still_long_running.push(status),
                }
            }
            lists.long_running = still_long_running;

            let mut still_aborted = Vec::with_capacity(lists.aborted.len());
            for status in std::mem::take(&mut lists.aborted) {
                if status.mvcc_count() == 0 {
                    status.clear_deltas();
                    lists.free.push(status);
                } else {
                    still_aborted.push(status);
                }
            }
            lists.aborted = still_aborted;
        }
    }

    /// Refresh the cache and force reduction on every bucket.
    pub fn cleanup(&self) {
        self.update_active_transaction_cache();
        self.reduce();
    }
}

impl std::fmt::Debug for TransactionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.read();
        f.debug_struct("TransactionIndex")
            .field("buckets", &self.buckets.len())
            .field("floor", &cache.floor)
            .field("ceiling", &cache.ceiling)
            .field("active", &cache.active.len())
            .finish()
    }
}

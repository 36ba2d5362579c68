//! Transactionally consistent accumulators
//!
//! An accumulator aggregates contributions (SUM/MIN/MAX/SEQ) from many
//! concurrent transactions without creating write-write conflicts on a
//! shared counter. Each update lands as a [`Delta`] on the writing
//! transaction's status; deltas of reduced transactions are folded into
//! per-bucket totals, and snapshot queries combine the base value, the
//! bucket totals, and the deltas of transactions visible at the snapshot.

use crate::txn::index::TransactionIndex;
use crate::txn::status::{Delta, TransactionStatus};
use crate::{PersistitError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Maximum accumulator slots per tree.
pub const MAX_ACCUMULATORS_PER_TREE: usize = 64;

/// Accumulator variants. SEQ is a hybrid: committed contributions combine
/// with `max` while live updates add, so recovery restores the highest ID
/// ever allocated by a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorType {
    Sum,
    Min,
    Max,
    Seq,
}

impl AccumulatorType {
    /// Commutative combine used for bucket totals and snapshots.
    pub fn apply_value(self, a: i64, b: i64) -> i64 {
        match self {
            AccumulatorType::Sum => a.wrapping_add(b),
            AccumulatorType::Min => a.min(b),
            AccumulatorType::Max => a.max(b),
            AccumulatorType::Seq => a.max(b),
        }
    }

    /// Combine used for the live counter.
    pub fn update_value(self, a: i64, b: i64) -> i64 {
        match self {
            AccumulatorType::Sum | AccumulatorType::Seq => a.wrapping_add(b),
            AccumulatorType::Min => a.min(b),
            AccumulatorType::Max => a.max(b),
        }
    }

    /// Delta payload: the caller's argument for SUM/MIN/MAX, the
    /// post-increment live value for SEQ.
    pub fn select_value(self, value: i64, updated: i64) -> i64 {
        match self {
            AccumulatorType::Seq => updated,
            _ => value,
        }
    }

    /// Identity element of `apply_value`.
    pub fn neutral(self) -> i64 {
        match self {
            AccumulatorType::Sum => 0,
            AccumulatorType::Min => i64::MAX,
            AccumulatorType::Max => i64::MIN,
            AccumulatorType::Seq => i64::MIN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccumulatorType::Sum => "SUM",
            AccumulatorType::Min => "MIN",
            AccumulatorType::Max => "MAX",
            AccumulatorType::Seq => "SEQ",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "SUM" => Ok(AccumulatorType::Sum),
            "MIN" => Ok(AccumulatorType::Min),
            "MAX" => Ok(AccumulatorType::Max),
            "SEQ" => Ok(AccumulatorType::Seq),
            other => Err(PersistitError::CorruptVolume(format!(
                "unknown accumulator type {:?}",
                other
            ))),
        }
    }
}

/// Typed aggregator bound to a (tree, index) slot.
pub struct Accumulator {
    acc_type: AccumulatorType,
    tree_name: String,
    index: usize,
    base: AtomicI64,
    live: AtomicI64,
    bucket_values: Vec<AtomicI64>,
}

impl Accumulator {
    /// `bucket_count` must equal the owning transaction index's bucket
    /// count; delta reduction is striped per bucket.
    pub fn new(
        acc_type: AccumulatorType,
        tree_name: &str,
        index: usize,
        base: i64,
        bucket_count: usize,
    ) -> Result<Self> {
        if index >= MAX_ACCUMULATORS_PER_TREE {
            return Err(PersistitError::IllegalArgument(format!(
                "accumulator index {} out of range [0,{})",
                index, MAX_ACCUMULATORS_PER_TREE
            )));
        }
        let bucket_values = (0..bucket_count)
            .map(|_| AtomicI64::new(acc_type.neutral()))
            .collect();
        Ok(Self {
            acc_type,
            tree_name: tree_name.to_string(),
            index,
            base: AtomicI64::new(base),
            live: AtomicI64::new(base),
            bucket_values,
        })
    }

    pub fn accumulator_type(&self) -> AccumulatorType {
        self.acc_type
    }

    pub fn tree_name(&self) -> &str {
        &self.tree_name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn base_value(&self) -> i64 {
        self.base.load(Ordering::Acquire)
    }

    /// Apply an update on behalf of `status` at `step`. The live counter
    /// moves immediately regardless of commit outcome; the snapshot-visible
    /// contribution is recorded as a delta on the status.
    pub fn update(
        self: &Arc<Self>,
        value: i64,
        status: &Arc<TransactionStatus>,
        step: u32,
    ) -> Result<i64> {
        if self.acc_type == AccumulatorType::Seq && value <= 0 {
            return Err(PersistitError::IllegalArgument(format!(
                "SEQ accumulator requires a positive increment, got {}",
                value
            )));
        }
        let updated = self.update_live(value);
        let payload = self.acc_type.select_value(value, updated);
        status.add_delta(Delta::new(self.clone(), step, payload));
        Ok(updated)
    }

    fn update_live(&self, value: i64) -> i64 {
        let mut prev = self.live.load(Ordering::Acquire);
        loop {
            let updated = self.acc_type.update_value(prev, value);
            match self.live.compare_exchange_weak(
                prev,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return updated,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Dirty read of the live counter. Includes uncommitted and aborted
    /// contributions; useful for telemetry, not snapshot-consistent.
    pub fn live_value(&self) -> i64 {
        self.live.load(Ordering::Acquire)
    }

    /// Fold a reduced transaction's delta into the bucket total. The caller
    /// holds the bucket lock, so the store does not race.
    pub(crate) fn aggregate(&self, bucket_index: usize, value: i64) {
        let current = self.bucket_values[bucket_index].load(Ordering::Acquire);
        let combined = self.acc_type.apply_value(current, value);
        self.bucket_values[bucket_index].store(combined, Ordering::Release);
    }

    /// Value visible at `timestamp` within the caller's step horizon.
    /// Bucket totals already cover every dropped transaction; only live
    /// statuses are scanned.
    pub fn snapshot_value(
        self: &Arc<Self>,
        index: &TransactionIndex,
        timestamp: i64,
        step: u32,
    ) -> i64 {
        let mut value = self.base.load(Ordering::Acquire);
        for bucket in &self.bucket_values {
            value = self
                .acc_type
                .apply_value(value, bucket.load(Ordering::Acquire));
        }
        index.accumulator_snapshot(self, timestamp, step, value)
    }

    /// Combine one delta payload into a running snapshot value.
    pub(crate) fn apply(&self, a: i64, b: i64) -> i64 {
        self.acc_type.apply_value(a, b)
    }

    /// Reset base and live after a checkpoint value has been recovered.
    pub(crate) fn set_base(&self, base: i64) {
        self.base.store(base, Ordering::Release);
        self.live.store(base, Ordering::Release);
        for bucket in &self.bucket_values {
            bucket.store(self.acc_type.neutral(), Ordering::Release);
        }
    }

    /// Serialized checkpoint record: tree name (u16 length + UTF-8),
    /// index (i32), type name (u8 length + ASCII), value (i64). Big-endian.
    pub fn encode_checkpoint(&self, value: i64) -> Vec<u8> {
        encode_checkpoint_record(&self.tree_name, self.index, self.acc_type, value)
    }
}

impl std::fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accumulator")
            .field("type", &self.acc_type)
            .field("tree", &self.tree_name)
            .field("index", &self.index)
            .field("base", &self.base_value())
            .field("live", &self.live_value())
            .finish()
    }
}

/// Checkpointed accumulator state, as recovered from a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulatorState {
    pub tree_name: String,
    pub index: usize,
    pub acc_type: AccumulatorType,
    pub value: i64,
}

pub fn encode_checkpoint_record(
    tree_name: &str,
    index: usize,
    acc_type: AccumulatorType,
    value: i64,
) -> Vec<u8> {
    let name = tree_name.as_bytes();
    let type_name = acc_type.name().as_bytes();
    let mut out = Vec::with_capacity(2 + name.len() + 4 + 1 + type_name.len() + 8);
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    out.extend_from_slice(name);
    out.write_i32::<BigEndian>(index as i32).unwrap();
    out.write_u8(type_name.len() as u8).unwrap();
    out.extend_from_slice(type_name);
    out.write_i64::<BigEndian>(value).unwrap();
    out
}

pub fn decode_checkpoint_record(bytes: &[u8]) -> Result<AccumulatorState> {
    let mut cursor = std::io::Cursor::new(bytes);
    let name_len = cursor
        .read_u16::<BigEndian>()
        .map_err(|_| truncated_record())? as usize;
    let mut name = vec![0u8; name_len];
    cursor.read_exact(&mut name).map_err(|_| truncated_record())?;
    let index = cursor
        .read_i32::<BigEndian>()
        .map_err(|_| truncated_record())?;
    let type_len = cursor.read_u8().map_err(|_| truncated_record())? as usize;
    let mut type_name = vec![0u8; type_len];
    cursor
        .read_exact(&mut type_name)
        .map_err(|_| truncated_record())?;
    let value = cursor
        .read_i64::<BigEndian>()
        .map_err(|_| truncated_record())?;

    if index < 0 || index as usize >= MAX_ACCUMULATORS_PER_TREE {
        return Err(PersistitError::CorruptVolume(format!(
            "accumulator index {} out of range",
            index
        )));
    }
    let tree_name = String::from_utf8(name)
        .map_err(|_| PersistitError::CorruptVolume("accumulator record tree name".into()))?;
    let type_name = String::from_utf8(type_name)
        .map_err(|_| PersistitError::CorruptVolume("accumulator record type name".into()))?;
    Ok(AccumulatorState {
        tree_name,
        index: index as usize,
        acc_type: AccumulatorType::from_name(&type_name)?,
        value,
    })
}

fn truncated_record() -> PersistitError {
    PersistitError::CorruptVolume("truncated accumulator checkpoint record".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc(acc_type: AccumulatorType, base: i64) -> Arc<Accumulator> {
        Arc::new(Accumulator::new(acc_type, "t", 0, base, 8).unwrap())
    }

    #[test]
    fn test_sum_live_updates() {
        let acc = arc(AccumulatorType::Sum, 0);
        let status = Arc::new(TransactionStatus::new(1));
        assert_eq!(acc.update(5, &status, 0).unwrap(), 5);
        assert_eq!(acc.update(3, &status, 0).unwrap(), 8);
        assert_eq!(acc.live_value(), 8);
        status.with_deltas(|deltas| {
            assert_eq!(deltas.len(), 2);
            assert_eq!(deltas[0].value(), 5);
            assert_eq!(deltas[1].value(), 3);
        });
    }

    #[test]
    fn test_seq_delta_holds_post_increment() {
        let acc = arc(AccumulatorType::Seq, 100);
        let status = Arc::new(TransactionStatus::new(1));
        assert_eq!(acc.update(1, &status, 0).unwrap(), 101);
        status.with_deltas(|deltas| assert_eq!(deltas[0].value(), 101));
    }

    #[test]
    fn test_seq_rejects_non_positive() {
        let acc = arc(AccumulatorType::Seq, 0);
        let status = Arc::new(TransactionStatus::new(1));
        assert!(matches!(
            acc.update(0, &status, 0),
            Err(PersistitError::IllegalArgument(_))
        ));
        assert!(acc.update(-3, &status, 0).is_err());
    }

    #[test]
    fn test_min_max_live_semantics() {
        let min = arc(AccumulatorType::Min, 10);
        let status = Arc::new(TransactionStatus::new(1));
        assert_eq!(min.update(4, &status, 0).unwrap(), 4);
        assert_eq!(min.update(7, &status, 0).unwrap(), 4);

        let max = arc(AccumulatorType::Max, 10);
        assert_eq!(max.update(4, &status, 0).unwrap(), 10);
        assert_eq!(max.update(25, &status, 0).unwrap(), 25);
    }

    #[test]
    fn test_aggregate_is_order_insensitive() {
        let a = arc(AccumulatorType::Sum, 0);
        a.aggregate(0, 5);
        a.aggregate(1, 7);
        let b = arc(AccumulatorType::Sum, 0);
        b.aggregate(1, 7);
        b.aggregate(0, 5);
        let totals = |acc: &Arc<Accumulator>| {
            acc.bucket_values
                .iter()
                .fold(0i64, |v, bucket| v + bucket.load(Ordering::Acquire))
        };
        assert_eq!(totals(&a), totals(&b));
    }

    #[test]
    fn test_checkpoint_record_round_trip() {
        let record = encode_checkpoint_record("orders", 3, AccumulatorType::Seq, 1234);
        let state = decode_checkpoint_record(&record).unwrap();
        assert_eq!(
            state,
            AccumulatorState {
                tree_name: "orders".into(),
                index: 3,
                acc_type: AccumulatorType::Seq,
                value: 1234,
            }
        );
    }

    #[test]
    fn test_checkpoint_record_truncation_detected() {
        let record = encode_checkpoint_record("orders", 3, AccumulatorType::Sum, 9);
        for len in 0..record.len() {
            assert!(decode_checkpoint_record(&record[..len]).is_err());
        }
    }
}

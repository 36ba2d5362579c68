//! Trees
//!
//! A tree is a named B-Tree inside a volume: root page address, depth,
//! change counter, a journal handle, and up to 64 lazily-created
//! accumulator slots whose types and checkpoint bases are pinned by the
//! volume's saved state.

pub mod anti_value;
pub mod exchange;
pub mod key;
pub mod mvv;
pub mod page;
pub mod split;

pub use exchange::Exchange;
pub use key::{Key, MAX_KEY_LENGTH};
pub use split::{Sequence, SplitPolicy};

use crate::txn::accumulator::{Accumulator, AccumulatorType, MAX_ACCUMULATORS_PER_TREE};
use crate::{PersistitError, Result};
use ahash::AHashMap;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};
use std::io::Read;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Longest permitted tree name, in bytes.
pub const MAX_TREE_NAME_LENGTH: usize = 256;

/// Upper bound on a serialized tree record.
pub const MAX_TREE_RECORD_SIZE: usize = 512;

/// A named B-Tree. At most one in-memory `Tree` exists per (volume, name);
/// the volume's tree directory enforces that.
pub struct Tree {
    name: String,
    root: AtomicU64,
    depth: AtomicU32,
    change_count: AtomicI64,
    handle: AtomicU32,
    split_policy: Mutex<SplitPolicy>,
    /// Structure latch: exclusive for store/remove, shared for reads.
    latch: RwLock<()>,
    accumulators: Mutex<Vec<Option<Arc<Accumulator>>>>,
    /// Checkpoint-recovered accumulator state per slot, consulted when a
    /// slot is first touched.
    checkpoint_state: Mutex<AHashMap<usize, (AccumulatorType, i64)>>,
}

impl Tree {
    pub fn new(name: &str, root: u64, depth: u16) -> Result<Self> {
        if name.is_empty() {
            return Err(PersistitError::IllegalArgument("empty tree name".into()));
        }
        if name.len() > MAX_TREE_NAME_LENGTH {
            return Err(PersistitError::IllegalArgument(format!(
                "tree name length {} exceeds {}",
                name.len(),
                MAX_TREE_NAME_LENGTH
            )));
        }
        Ok(Self {
            name: name.to_string(),
            root: AtomicU64::new(root),
            depth: AtomicU32::new(depth as u32),
            change_count: AtomicI64::new(0),
            handle: AtomicU32::new(0),
            split_policy: Mutex::new(SplitPolicy::Pack),
            latch: RwLock::new(()),
            accumulators: Mutex::new(vec![None; MAX_ACCUMULATORS_PER_TREE]),
            checkpoint_state: Mutex::new(AHashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, root: u64) {
        self.root.store(root, Ordering::Release);
    }

    /// Tree depth; a data-only tree has depth 1.
    pub fn depth(&self) -> u16 {
        self.depth.load(Ordering::Acquire) as u16
    }

    pub(crate) fn set_depth(&self, depth: u16) {
        self.depth.store(depth as u32, Ordering::Release);
    }

    pub fn change_count(&self) -> i64 {
        self.change_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_change_count(&self, count: i64) {
        self.change_count.store(count, Ordering::Release);
    }

    pub(crate) fn bump_change_count(&self) {
        self.change_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Journal handle, 0 until assigned.
    pub fn handle(&self) -> u32 {
        self.handle.load(Ordering::Acquire)
    }

    /// Assign the journal handle exactly once. Reassigning to a different
    /// value is a contract violation; recovery must go through an explicit
    /// reopen, never a silent reset.
    pub fn set_handle(&self, handle: u32) -> Result<u32> {
        if handle == 0 {
            return Err(PersistitError::IllegalArgument(
                "tree handle must be nonzero".into(),
            ));
        }
        match self
            .handle
            .compare_exchange(0, handle, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(handle),
            Err(existing) if existing == handle => Ok(handle),
            Err(existing) => Err(PersistitError::IllegalState(format!(
                "tree {} already has handle {}",
                self.name, existing
            ))),
        }
    }

    pub fn split_policy(&self) -> SplitPolicy {
        *self.split_policy.lock()
    }

    pub fn set_split_policy(&self, policy: SplitPolicy) {
        *self.split_policy.lock() = policy;
    }

    pub(crate) fn latch(&self) -> &RwLock<()> {
        &self.latch
    }

    /// Record checkpoint-recovered accumulator state for one slot.
    pub(crate) fn seed_checkpoint_state(&self, index: usize, acc_type: AccumulatorType, value: i64) {
        self.checkpoint_state.lock().insert(index, (acc_type, value));
    }

    /// Get or lazily create the accumulator in slot `index`. The requested
    /// type must match both an existing in-memory slot and any
    /// checkpoint-recovered state for the slot.
    pub fn accumulator(
        &self,
        acc_type: AccumulatorType,
        index: usize,
        bucket_count: usize,
    ) -> Result<Arc<Accumulator>> {
        if index >= MAX_ACCUMULATORS_PER_TREE {
            return Err(PersistitError::IllegalArgument(format!(
                "accumulator index {} out of range [0,{})",
                index, MAX_ACCUMULATORS_PER_TREE
            )));
        }
        let mut slots = self.accumulators.lock();
        if let Some(existing) = &slots[index] {
            if existing.accumulator_type() != acc_type {
                return Err(PersistitError::IllegalState(format!(
                    "accumulator {}/{} is {}, requested {}",
                    self.name,
                    index,
                    existing.accumulator_type().name(),
                    acc_type.name()
                )));
            }
            return Ok(existing.clone());
        }
        let base = match self.checkpoint_state.lock().get(&index) {
            Some(&(saved_type, value)) => {
                if saved_type != acc_type {
                    return Err(PersistitError::IllegalState(format!(
                        "accumulator {}/{} checkpointed as {}, requested {}",
                        self.name,
                        index,
                        saved_type.name(),
                        acc_type.name()
                    )));
                }
                value
            }
            None => 0,
        };
        let accumulator = Arc::new(Accumulator::new(
            acc_type,
            &self.name,
            index,
            base,
            bucket_count,
        )?);
        slots[index] = Some(accumulator.clone());
        Ok(accumulator)
    }

    /// Snapshot of the live accumulator slots.
    pub fn accumulators(&self) -> Vec<Arc<Accumulator>> {
        self.accumulators
            .lock()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("name", &self.name)
            .field("root", &self.root())
            .field("depth", &self.depth())
            .field("change_count", &self.change_count())
            .finish()
    }
}

/// Decoded tree record from a volume's directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRecord {
    pub root: u64,
    pub change_count: i64,
    pub depth: u16,
    pub name: String,
}

/// Serialize a tree record: root page (i64), change count (i64), depth
/// (i16), name length (i16), name bytes.
pub fn encode_tree_record(record: &TreeRecord) -> Result<Vec<u8>> {
    if record.name.len() > MAX_TREE_NAME_LENGTH {
        return Err(PersistitError::IllegalArgument(format!(
            "tree name length {} exceeds {}",
            record.name.len(),
            MAX_TREE_NAME_LENGTH
        )));
    }
    let mut out = Vec::with_capacity(20 + record.name.len());
    out.write_i64::<BigEndian>(record.root as i64).unwrap();
    out.write_i64::<BigEndian>(record.change_count).unwrap();
    out.write_i16::<BigEndian>(record.depth as i16).unwrap();
    out.write_i16::<BigEndian>(record.name.len() as i16).unwrap();
    out.extend_from_slice(record.name.as_bytes());
    debug_assert!(out.len() <= MAX_TREE_RECORD_SIZE);
    Ok(out)
}

pub fn decode_tree_record(bytes: &[u8]) -> Result<TreeRecord> {
    if bytes.len() > MAX_TREE_RECORD_SIZE {
        return Err(PersistitError::CorruptVolume(format!(
            "tree record length {} exceeds {}",
            bytes.len(),
            MAX_TREE_RECORD_SIZE
        )));
    }
    let mut cursor = std::io::Cursor::new(bytes);
    let truncated = || PersistitError::CorruptVolume("truncated tree record".into());
    let root = cursor.read_i64::<BigEndian>().map_err(|_| truncated())?;
    let change_count = cursor.read_i64::<BigEndian>().map_err(|_| truncated())?;
    let depth = cursor.read_i16::<BigEndian>().map_err(|_| truncated())?;
    let name_len = cursor.read_i16::<BigEndian>().map_err(|_| truncated())?;
    if depth < 1 || name_len < 1 || name_len as usize > MAX_TREE_NAME_LENGTH {
        return Err(PersistitError::CorruptVolume(
            "tree record fields out of range".into(),
        ));
    }
    let mut name = vec![0u8; name_len as usize];
    cursor.read_exact(&mut name).map_err(|_| truncated())?;
    Ok(TreeRecord {
        root: root as u64,
        change_count,
        depth: depth as u16,
        name: String::from_utf8(name)
            .map_err(|_| PersistitError::CorruptVolume("tree name is not UTF-8".into()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_record_round_trip() {
        let record = TreeRecord {
            root: 42,
            change_count: 7,
            depth: 3,
            name: "orders".into(),
        };
        let bytes = encode_tree_record(&record).unwrap();
        assert_eq!(decode_tree_record(&bytes).unwrap(), record);
    }

    #[test]
    fn test_tree_name_boundary() {
        let name_256 = "t".repeat(256);
        assert!(Tree::new(&name_256, 1, 1).is_ok());
        let name_257 = "t".repeat(257);
        assert!(matches!(
            Tree::new(&name_257, 1, 1),
            Err(PersistitError::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_handle_assigned_once() {
        let tree = Tree::new("t", 1, 1).unwrap();
        assert_eq!(tree.set_handle(9).unwrap(), 9);
        assert_eq!(tree.set_handle(9).unwrap(), 9);
        assert!(matches!(
            tree.set_handle(10),
            Err(PersistitError::IllegalState(_))
        ));
    }

    #[test]
    fn test_accumulator_slot_type_pinned() {
        let tree = Tree::new("t", 1, 1).unwrap();
        let sum = tree.accumulator(AccumulatorType::Sum, 0, 8).unwrap();
        let again = tree.accumulator(AccumulatorType::Sum, 0, 8).unwrap();
        assert!(Arc::ptr_eq(&sum, &again));
        assert!(matches!(
            tree.accumulator(AccumulatorType::Min, 0, 8),
            Err(PersistitError::IllegalState(_))
        ));
    }

    #[test]
    fn test_accumulator_base_recovered_from_checkpoint_state() {
        let tree = Tree::new("t", 1, 1).unwrap();
        tree.seed_checkpoint_state(2, AccumulatorType::Seq, 103);
        let seq = tree.accumulator(AccumulatorType::Seq, 2, 8).unwrap();
        assert_eq!(seq.base_value(), 103);
        assert_eq!(seq.live_value(), 103);

        // a checkpointed slot rejects a different type
        tree.seed_checkpoint_state(3, AccumulatorType::Sum, 5);
        assert!(matches!(
            tree.accumulator(AccumulatorType::Max, 3, 8),
            Err(PersistitError::IllegalState(_))
        ));
    }

    #[test]
    fn test_tree_record_corruption_detected() {
        let record = TreeRecord {
            root: 1,
            change_count: 0,
            depth: 1,
            name: "t".into(),
        };
        let bytes = encode_tree_record(&record).unwrap();
        assert!(decode_tree_record(&bytes[..10]).is_err());
        let mut broken = bytes.clone();
        broken[16] = 0xFF; // depth goes negative
        assert!(decode_tree_record(&broken).is_err());
    }
}

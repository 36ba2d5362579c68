//! Engine façade
//!
//! `Persistit` owns every subsystem: the timestamp allocator, the
//! transaction index, one buffer pool per page size, the journal, the
//! volume map and the class index. Applications create or open volumes
//! through it, begin transactions, and drive checkpoints.

use crate::buffer::BufferPool;
use crate::class_index::{ClassIndex, ClassResolver};
use crate::config::EngineConfig;
use crate::journal::{JournalManager, MemoryJournal};
use crate::timestamp::TimestampAllocator;
use crate::tree::Exchange;
use crate::txn::index::TransactionIndex;
use crate::txn::transaction::Transaction;
use crate::volume::{Volume, VolumeSpecification};
use crate::{PersistitError, Result};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Persistit {
    config: EngineConfig,
    allocator: Arc<TimestampAllocator>,
    txn_index: Arc<TransactionIndex>,
    journal: Arc<dyn JournalManager>,
    pools: Mutex<AHashMap<usize, Arc<BufferPool>>>,
    volumes: Mutex<AHashMap<String, Arc<Volume>>>,
    system_volume: Mutex<Option<Arc<Volume>>>,
    class_index: Mutex<Option<Arc<ClassIndex>>>,
    closed: AtomicBool,
}

impl Persistit {
    /// Start an engine with an in-memory journal.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_journal(config, Arc::new(MemoryJournal::new()))
    }

    /// Start an engine against an existing journal. The clock resumes
    /// above the journal's last checkpoint so recovered commits stay in
    /// the past.
    pub fn with_journal(config: EngineConfig, journal: Arc<dyn JournalManager>) -> Result<Self> {
        config.validate()?;
        let allocator = Arc::new(TimestampAllocator::new());
        allocator.bump_to(journal.last_checkpoint_timestamp());
        let txn_index = Arc::new(TransactionIndex::new(
            allocator.clone(),
            config.transaction_buckets,
        ));
        Ok(Self {
            config,
            allocator,
            txn_index,
            journal,
            pools: Mutex::new(AHashMap::new()),
            volumes: Mutex::new(AHashMap::new()),
            system_volume: Mutex::new(None),
            class_index: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn allocator(&self) -> &Arc<TimestampAllocator> {
        &self.allocator
    }

    pub fn transaction_index(&self) -> &Arc<TransactionIndex> {
        &self.txn_index
    }

    pub fn journal(&self) -> &Arc<dyn JournalManager> {
        &self.journal
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PersistitError::IllegalState("engine is closed".into()));
        }
        Ok(())
    }

    fn pool_for(&self, page_size: usize) -> Arc<BufferPool> {
        self.pools
            .lock()
            .entry(page_size)
            .or_insert_with(|| {
                Arc::new(BufferPool::new(page_size, self.config.buffer_pool_frames))
            })
            .clone()
    }

    fn adopt_volume(&self, name: &str, volume: Arc<Volume>) {
        self.volumes
            .lock()
            .insert(name.to_string(), volume.clone());
        let mut system = self.system_volume.lock();
        if system.is_none() {
            *system = Some(volume);
        }
    }

    pub fn create_volume(&self, name: &str, spec: VolumeSpecification) -> Result<Arc<Volume>> {
        self.check_open()?;
        if self.volumes.lock().contains_key(name) {
            return Err(PersistitError::VolumeAlreadyExists(name.to_string()));
        }
        let pool = self.pool_for(spec.page_size);
        let volume = Volume::create(
            name,
            spec,
            pool,
            self.txn_index.clone(),
            self.journal.clone(),
        )?;
        self.adopt_volume(name, volume.clone());
        Ok(volume)
    }

    pub fn open_volume(&self, name: &str, spec: VolumeSpecification) -> Result<Arc<Volume>> {
        self.check_open()?;
        if self.volumes.lock().contains_key(name) {
            return Err(PersistitError::VolumeAlreadyExists(name.to_string()));
        }
        let pool = self.pool_for(spec.page_size);
        let volume = Volume::open(
            name,
            spec,
            0,
            pool,
            self.txn_index.clone(),
            self.journal.clone(),
        )?;
        self.adopt_volume(name, volume.clone());
        Ok(volume)
    }

    pub fn volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.volumes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| PersistitError::VolumeNotFound(name.to_string()))
    }

    /// Cursor over a tree, creating the tree if requested.
    pub fn exchange(
        &self,
        volume_name: &str,
        tree_name: &str,
        create: bool,
    ) -> Result<Exchange> {
        let volume = self.volume(volume_name)?;
        let tree = volume
            .tree(tree_name, create)?
            .ok_or_else(|| PersistitError::IllegalState(format!(
                "tree {} does not exist in volume {}",
                tree_name, volume_name
            )))?;
        Ok(Exchange::new(volume, tree))
    }

    /// Begin a snapshot-isolated transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.check_open()?;
        Ok(Transaction::begin(
            self.txn_index.clone(),
            self.allocator.clone(),
        ))
    }

    /// The process-wide class-handle dictionary, bound to the system
    /// volume (the first volume this engine opened). The resolver is
    /// installed on first use.
    pub fn class_index(&self, resolver: Arc<dyn ClassResolver>) -> Result<Arc<ClassIndex>> {
        self.check_open()?;
        let mut slot = self.class_index.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let volume = self
            .system_volume
            .lock()
            .clone()
            .ok_or_else(|| PersistitError::IllegalState("no system volume open".into()))?;
        let index = Arc::new(ClassIndex::new(volume, resolver));
        *slot = Some(index.clone());
        Ok(index)
    }

    /// Checkpoint: reduce the transaction index, persist volume metadata
    /// and accumulator snapshots, flush journaled pages, and mark the
    /// durability point in the journal. Returns the checkpoint timestamp.
    pub fn checkpoint(&self) -> Result<i64> {
        self.check_open()?;
        let checkpoint_ts = self.allocator.update_timestamp();
        self.txn_index.cleanup();
        let volumes: Vec<Arc<Volume>> = self.volumes.lock().values().cloned().collect();
        for volume in &volumes {
            volume.checkpoint(checkpoint_ts)?;
        }
        self.journal.checkpoint(checkpoint_ts)?;
        log::info!("checkpoint at timestamp {}", checkpoint_ts);
        Ok(checkpoint_ts)
    }

    /// Final checkpoint, then close every volume.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let checkpoint_ts = self.allocator.update_timestamp();
        self.txn_index.cleanup();
        let volumes: Vec<Arc<Volume>> = self.volumes.lock().values().cloned().collect();
        for volume in &volumes {
            volume.checkpoint(checkpoint_ts)?;
            volume.close()?;
        }
        self.journal.checkpoint(checkpoint_ts)?;
        self.volumes.lock().clear();
        *self.class_index.lock() = None;
        Ok(())
    }
}

impl Drop for Persistit {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                log::warn!("error closing engine: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Persistit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistit")
            .field("volumes", &self.volumes.lock().len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::accumulator::AccumulatorType;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, name: &str, page_size: usize, initial: u64, maximum: u64) -> VolumeSpecification {
        VolumeSpecification {
            path: dir.path().join(name),
            page_size,
            initial_pages: initial,
            extension_pages: 16,
            maximum_pages: maximum,
            read_only: false,
            temporary: false,
        }
    }

    #[test]
    fn test_create_volume_page_accounting() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        let volume = engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        assert_eq!(volume.page_count(), 16);
        assert_eq!(volume.next_available_page(), 1);

        // first tree use claims page 1 for the directory root and page 2
        // for the new tree's root
        engine.exchange("data", "kv", true).unwrap();
        assert_eq!(volume.next_available_page(), 3);
        engine.close().unwrap();
    }

    #[test]
    fn test_duplicate_volume_name_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        assert!(matches!(
            engine.create_volume("data", spec(&dir, "other.v01", 4096, 16, 4096)),
            Err(PersistitError::VolumeAlreadyExists(_))
        ));
        engine.close().unwrap();
    }

    #[test]
    fn test_transactional_store_and_snapshot_isolation() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let mut writer_ex = engine.exchange("data", "kv", true).unwrap();

        let writer = engine.begin().unwrap();
        writer_ex.key_mut().clear().append_string("k").unwrap();
        writer_ex.store(b"v1", Some(&writer)).unwrap();

        // a concurrent snapshot does not see the uncommitted write
        let reader = engine.begin().unwrap();
        let mut reader_ex = engine.exchange("data", "kv", false).unwrap();
        reader_ex.key_mut().clear().append_string("k").unwrap();
        assert_eq!(reader_ex.fetch(Some(&reader)).unwrap(), None);

        // the writer sees its own write
        assert_eq!(
            writer_ex.fetch(Some(&writer)).unwrap(),
            Some(b"v1".to_vec())
        );

        writer.commit().unwrap();
        // the old snapshot still does not see it
        assert_eq!(reader_ex.fetch(Some(&reader)).unwrap(), None);
        reader.commit().unwrap();

        // a new snapshot does
        let late = engine.begin().unwrap();
        assert_eq!(reader_ex.fetch(Some(&late)).unwrap(), Some(b"v1".to_vec()));
        late.commit().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_aborted_write_never_visible() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let mut exchange = engine.exchange("data", "kv", true).unwrap();

        let txn = engine.begin().unwrap();
        exchange.key_mut().clear().append_string("k").unwrap();
        exchange.store(b"doomed", Some(&txn)).unwrap();
        txn.abort().unwrap();

        assert_eq!(exchange.fetch(None).unwrap(), None);
        engine.close().unwrap();
    }

    #[test]
    fn test_splits_preserve_traversal_order() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 1024, 16, 4096))
            .unwrap();
        let mut exchange = engine.exchange("data", "kv", true).unwrap();

        for i in 0..300u32 {
            exchange
                .key_mut()
                .clear()
                .append_string(&format!("key{:05}", i))
                .unwrap();
            exchange.store(format!("value{}", i).as_bytes(), None).unwrap();
        }
        assert!(exchange.tree().depth() > 1);

        // forward traversal returns every key in order
        exchange.key_mut().clear();
        let mut seen = Vec::new();
        while exchange.next(None).unwrap() {
            seen.push(exchange.key().reader().decode_string().unwrap());
        }
        assert_eq!(seen.len(), 300);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);

        // backward traversal finds the last key first
        exchange.key_mut().clear();
        assert!(exchange.previous(None).unwrap());
        assert_eq!(
            exchange.key().reader().decode_string().unwrap(),
            "key00299"
        );
        engine.close().unwrap();
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Persistit::new(EngineConfig::default()).unwrap();
            engine
                .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
                .unwrap();
            let mut exchange = engine.exchange("data", "kv", true).unwrap();
            for i in 0..50u32 {
                exchange
                    .key_mut()
                    .clear()
                    .append_int(i as i64)
                    .unwrap();
                exchange.store(format!("payload-{}", i).as_bytes(), None).unwrap();
            }
            engine.close().unwrap();
        }

        // fresh engine, fresh journal: everything must come from the file
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .open_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let mut exchange = engine.exchange("data", "kv", false).unwrap();
        for i in (0..50u32).step_by(7) {
            exchange.key_mut().clear().append_int(i as i64).unwrap();
            assert_eq!(
                exchange.fetch(None).unwrap(),
                Some(format!("payload-{}", i).into_bytes())
            );
        }
        engine.close().unwrap();
    }

    #[test]
    fn test_sum_accumulator_snapshots() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let tree = engine
            .volume("data")
            .unwrap()
            .tree("counts", true)
            .unwrap()
            .unwrap();
        let index = engine.transaction_index();
        let acc = tree
            .accumulator(AccumulatorType::Sum, 0, index.bucket_count())
            .unwrap();

        let t1 = engine.begin().unwrap();
        acc.update(5, t1.status(), t1.step()).unwrap();
        let c1 = t1.commit().unwrap();

        let t2 = engine.begin().unwrap();
        acc.update(3, t2.status(), t2.step()).unwrap();
        let c2 = t2.commit().unwrap();

        assert_eq!(acc.snapshot_value(index, c1 - 1, 0), 0);
        assert_eq!(acc.snapshot_value(index, c1, 0), 5);
        assert_eq!(acc.snapshot_value(index, c2, 0), 8);
        assert_eq!(acc.live_value(), 8);
        engine.close().unwrap();
    }

    #[test]
    fn test_seq_accumulator_recovers_committed_maximum() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        {
            let engine =
                Persistit::with_journal(EngineConfig::default(), journal.clone()).unwrap();
            engine
                .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
                .unwrap();
            let tree = engine
                .volume("data")
                .unwrap()
                .tree("ids", true)
                .unwrap()
                .unwrap();
            let acc = tree
                .accumulator(AccumulatorType::Seq, 0, engine.transaction_index().bucket_count())
                .unwrap();

            let t1 = engine.begin().unwrap();
            assert_eq!(acc.update(1, t1.status(), t1.step()).unwrap(), 1);
            t1.commit().unwrap();

            let t2 = engine.begin().unwrap();
            assert_eq!(acc.update(1, t2.status(), t2.step()).unwrap(), 2);
            t2.abort().unwrap();

            let t3 = engine.begin().unwrap();
            assert_eq!(acc.update(1, t3.status(), t3.step()).unwrap(), 3);
            t3.commit().unwrap();

            engine.checkpoint().unwrap();
            // crash: the engine is dropped without a clean close path
            // mattering; the journal and file carry the state
            engine.close().unwrap();
        }

        let engine = Persistit::with_journal(EngineConfig::default(), journal).unwrap();
        engine
            .open_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let tree = engine
            .volume("data")
            .unwrap()
            .tree("ids", true)
            .unwrap()
            .unwrap();
        let acc = tree
            .accumulator(AccumulatorType::Seq, 0, engine.transaction_index().bucket_count())
            .unwrap();
        // highest committed allocation was 3; the next strictly exceeds it
        assert_eq!(acc.base_value(), 3);
        let t4 = engine.begin().unwrap();
        assert_eq!(acc.update(1, t4.status(), t4.step()).unwrap(), 4);
        t4.commit().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_transactional_remove_range() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let mut exchange = engine.exchange("data", "kv", true).unwrap();
        for i in 0..10i64 {
            exchange.key_mut().clear().append_int(i).unwrap();
            exchange.store(b"x", None).unwrap();
        }

        let txn = engine.begin().unwrap();
        exchange.key_mut().clear().append_int(3).unwrap();
        let mut until = crate::tree::Key::new();
        until.append_int(7).unwrap();
        assert_eq!(exchange.remove_range(&until, Some(&txn)).unwrap(), 4);

        // the remover no longer sees keys 3..6; a concurrent snapshot does
        let other = engine.begin().unwrap();
        let mut other_ex = engine.exchange("data", "kv", false).unwrap();
        for i in 3..7i64 {
            exchange.key_mut().clear().append_int(i).unwrap();
            assert_eq!(exchange.fetch(Some(&txn)).unwrap(), None, "key {}", i);
            other_ex.key_mut().clear().append_int(i).unwrap();
            assert!(other_ex.fetch(Some(&other)).unwrap().is_some());
        }
        other.commit().unwrap();
        txn.commit().unwrap();

        // after commit, new snapshots see the range gone
        let late = engine.begin().unwrap();
        for i in 0..10i64 {
            exchange.key_mut().clear().append_int(i).unwrap();
            let expected_present = !(3..7).contains(&i);
            assert_eq!(
                exchange.fetch(Some(&late)).unwrap().is_some(),
                expected_present,
                "key {}",
                i
            );
        }
        late.commit().unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn test_steps_order_intra_transaction_reads() {
        let dir = TempDir::new().unwrap();
        let engine = Persistit::new(EngineConfig::default()).unwrap();
        engine
            .create_volume("data", spec(&dir, "data.v01", 4096, 16, 4096))
            .unwrap();
        let mut exchange = engine.exchange("data", "kv", true).unwrap();

        let txn = engine.begin().unwrap();
        txn.increment_step().unwrap(); // step 1
        exchange.key_mut().clear().append_string("k").unwrap();
        exchange.store(b"at-step-1", Some(&txn)).unwrap();
        // at step 1 the write (made at step 1) is not yet readable
        assert_eq!(exchange.fetch(Some(&txn)).unwrap(), None);
        txn.increment_step().unwrap(); // step 2
        assert_eq!(
            exchange.fetch(Some(&txn)).unwrap(),
            Some(b"at-step-1".to_vec())
        );
        txn.commit().unwrap();
        engine.close().unwrap();
    }
}

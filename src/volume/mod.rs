//! Volumes
//!
//! A volume is one paged file holding a directory tree, zero or more user
//! trees, and per-volume statistics. The directory tree (rooted from the
//! header) stores tree records and checkpointed accumulator records; the
//! volume guarantees at most one in-memory [`Tree`] per name.

pub mod header;
pub mod storage;

use crate::buffer::{Buffer, BufferPool};
use crate::journal::JournalManager;
use crate::tree::{
    decode_tree_record, encode_tree_record, Exchange, Key, Tree, TreeRecord,
};
use crate::tree::page;
use crate::txn::accumulator::{decode_checkpoint_record, Accumulator};
use crate::txn::index::TransactionIndex;
use crate::{PersistitError, Result};
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use storage::VolumeStorage;

/// Page sizes a volume may be created with.
pub const VALID_PAGE_SIZES: [usize; 5] = [1024, 2048, 4096, 8192, 16384];

/// Name of the reserved directory tree.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

/// Name of the reserved class-index tree.
pub const CLASS_INDEX_TREE_NAME: &str = "_classIndex";

const DIRECTORY_TREE_PREFIX: &str = "tree";
const DIRECTORY_ACCUMULATOR_PREFIX: &str = "acc";

/// How a volume file is laid out and grown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpecification {
    pub path: PathBuf,
    pub page_size: usize,
    pub initial_pages: u64,
    pub extension_pages: u64,
    pub maximum_pages: u64,
    pub read_only: bool,
    /// Temporary volumes bypass the journal and are not crash-recoverable.
    pub temporary: bool,
}

impl VolumeSpecification {
    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            path: path.into(),
            page_size,
            initial_pages: 32,
            extension_pages: 32,
            maximum_pages: u64::MAX / page_size.max(1) as u64,
            read_only: false,
            temporary: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_PAGE_SIZES.contains(&self.page_size) {
            return Err(PersistitError::IllegalArgument(format!(
                "invalid page size {}; must be one of {:?}",
                self.page_size, VALID_PAGE_SIZES
            )));
        }
        if self.initial_pages < 2 {
            return Err(PersistitError::IllegalArgument(
                "volume needs at least two initial pages".into(),
            ));
        }
        if self.maximum_pages < self.initial_pages {
            return Err(PersistitError::IllegalArgument(format!(
                "maximum pages {} below initial pages {}",
                self.maximum_pages, self.initial_pages
            )));
        }
        Ok(())
    }
}

/// Operation counters persisted into the header at metadata flush.
#[derive(Debug, Default)]
pub struct VolumeStatistics {
    fetch: AtomicU64,
    traverse: AtomicU64,
    store: AtomicU64,
    remove: AtomicU64,
}

impl VolumeStatistics {
    pub fn fetch_counter(&self) -> u64 {
        self.fetch.load(Ordering::Acquire)
    }

    pub fn traverse_counter(&self) -> u64 {
        self.traverse.load(Ordering::Acquire)
    }

    pub fn store_counter(&self) -> u64 {
        self.store.load(Ordering::Acquire)
    }

    pub fn remove_counter(&self) -> u64 {
        self.remove.load(Ordering::Acquire)
    }

    pub(crate) fn bump_fetch(&self) {
        self.fetch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_traverse(&self) {
        self.traverse.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_store(&self) {
        self.store.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn bump_remove(&self) {
        self.remove.fetch_add(1, Ordering::AcqRel);
    }

    fn seed(&self, fetch: u64, traverse: u64, store: u64, remove: u64) {
        self.fetch.store(fetch, Ordering::Release);
        self.traverse.store(traverse, Ordering::Release);
        self.store.store(store, Ordering::Release);
        self.remove.store(remove, Ordering::Release);
    }
}

/// An open volume.
pub struct Volume {
    name: String,
    spec: VolumeSpecification,
    storage: Arc<VolumeStorage>,
    pool: Arc<BufferPool>,
    txn_index: Arc<TransactionIndex>,
    head: Mutex<Option<Arc<Buffer>>>,
    directory_root: AtomicU64,
    garbage_root: AtomicU64,
    directory_tree: Mutex<Option<Arc<Tree>>>,
    trees: Mutex<AHashMap<String, Arc<Tree>>>,
    statistics: VolumeStatistics,
    next_tree_handle: AtomicU32,
    closed: AtomicBool,
}

impl Volume {
    /// Create a volume file. The directory tree claims its root page on
    /// first use, so a fresh volume has handed out no pages yet.
    pub fn create(
        name: &str,
        spec: VolumeSpecification,
        pool: Arc<BufferPool>,
        txn_index: Arc<TransactionIndex>,
        journal: Arc<dyn JournalManager>,
    ) -> Result<Arc<Self>> {
        let storage = VolumeStorage::create(&spec, txn_index.allocator().clone(), journal)?;
        let head = pool.pin_fixed(&storage, 0)?;

        let volume = Arc::new(Self {
            name: name.to_string(),
            spec,
            storage: storage.clone(),
            pool: pool.clone(),
            txn_index,
            head: Mutex::new(Some(head)),
            directory_root: AtomicU64::new(0),
            garbage_root: AtomicU64::new(0),
            directory_tree: Mutex::new(None),
            trees: Mutex::new(AHashMap::new()),
            statistics: VolumeStatistics::default(),
            next_tree_handle: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        let directory_tree = Arc::new(Tree::new(DIRECTORY_TREE_NAME, 0, 1)?);
        *volume.directory_tree.lock() = Some(directory_tree);
        volume.flush_metadata()?;
        pool.flush_volume(&storage)?;
        storage.flush_journaled_pages()?;
        Ok(volume)
    }

    /// Open an existing volume. `expected_id` of zero accepts whatever id
    /// the header carries; a nonzero mismatch is a corruption error.
    pub fn open(
        name: &str,
        spec: VolumeSpecification,
        expected_id: u64,
        pool: Arc<BufferPool>,
        txn_index: Arc<TransactionIndex>,
        journal: Arc<dyn JournalManager>,
    ) -> Result<Arc<Self>> {
        let storage = VolumeStorage::open(&spec, expected_id, txn_index.allocator().clone(), journal)?;
        let head = pool.pin_fixed(&storage, 0)?;
        let (directory_root, garbage_root, counters) = head.with_content(|bytes| {
            (
                header::get_directory_root(bytes),
                header::get_garbage_root(bytes),
                (
                    header::get_fetch_counter(bytes),
                    header::get_traverse_counter(bytes),
                    header::get_store_counter(bytes),
                    header::get_remove_counter(bytes),
                ),
            )
        });
        let volume = Arc::new(Self {
            name: name.to_string(),
            spec,
            storage: storage.clone(),
            pool: pool.clone(),
            txn_index,
            head: Mutex::new(Some(head)),
            directory_root: AtomicU64::new(directory_root),
            garbage_root: AtomicU64::new(garbage_root),
            directory_tree: Mutex::new(None),
            trees: Mutex::new(AHashMap::new()),
            statistics: VolumeStatistics::default(),
            next_tree_handle: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });
        volume
            .statistics
            .seed(counters.0, counters.1, counters.2, counters.3);

        // a zero root means no tree was ever created in this volume
        let depth = if directory_root == 0 {
            1
        } else {
            volume.discover_depth(directory_root)?
        };
        let directory_tree = Arc::new(Tree::new(DIRECTORY_TREE_NAME, directory_root, depth)?);
        *volume.directory_tree.lock() = Some(directory_tree);
        Ok(volume)
    }

    fn create_tree_root(&self) -> Result<u64> {
        let root = self.storage.alloc_new_page()?;
        let mut claim = self.pool.get(&self.storage, root, true)?;
        page::init(claim.bytes_mut()?, page::PageType::Data);
        claim.mark_dirty(self.storage.allocator().update_timestamp());
        Ok(root)
    }

    fn discover_depth(&self, root: u64) -> Result<u16> {
        let mut depth = 1u16;
        let mut page_addr = root;
        loop {
            let claim = self.pool.get(&self.storage, page_addr, false)?;
            match page::page_type(claim.bytes())? {
                page::PageType::Data => return Ok(depth),
                page::PageType::Index => {
                    let leftmost = page::leftmost_child(claim.bytes());
                    if leftmost == 0 || depth > 20 {
                        return Err(PersistitError::CorruptVolume(format!(
                            "directory tree of volume {} is malformed",
                            self.name
                        )));
                    }
                    depth += 1;
                    page_addr = leftmost;
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.storage.id()
    }

    pub fn specification(&self) -> &VolumeSpecification {
        &self.spec
    }

    pub fn storage(&self) -> &Arc<VolumeStorage> {
        &self.storage
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn txn_index(&self) -> &Arc<TransactionIndex> {
        &self.txn_index
    }

    pub fn statistics(&self) -> &VolumeStatistics {
        &self.statistics
    }

    pub fn page_count(&self) -> u64 {
        self.storage.page_count()
    }

    pub fn next_available_page(&self) -> u64 {
        self.storage.next_available_page()
    }

    pub fn directory_root(&self) -> u64 {
        self.directory_root.load(Ordering::Acquire)
    }

    pub fn garbage_root(&self) -> u64 {
        self.garbage_root.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn directory_tree(&self) -> Result<Arc<Tree>> {
        self.directory_tree
            .lock()
            .clone()
            .ok_or_else(|| PersistitError::IllegalState("volume not initialized".into()))
    }

    fn directory_exchange(self: &Arc<Self>) -> Result<Exchange> {
        let guard = self.directory_tree.lock();
        let tree = guard
            .clone()
            .ok_or_else(|| PersistitError::IllegalState("volume not initialized".into()))?;
        if tree.root() == 0 {
            // first use: materialize the directory tree's root page
            let root = self.create_tree_root()?;
            tree.set_root(root);
            self.directory_root.store(root, Ordering::Release);
        }
        drop(guard);
        Ok(Exchange::new(self.clone(), tree))
    }

    fn tree_record_key(name: &str) -> Result<Key> {
        let mut key = Key::new();
        key.append_string(DIRECTORY_TREE_PREFIX)?;
        key.append_string(name)?;
        Ok(key)
    }

    fn accumulator_record_key(tree_name: &str, index: usize) -> Result<Key> {
        let mut key = Key::new();
        key.append_string(DIRECTORY_ACCUMULATOR_PREFIX)?;
        key.append_string(tree_name)?;
        key.append_int(index as i64)?;
        Ok(key)
    }

    /// Look up a tree, optionally creating it. Creation is serialized on
    /// the directory lock so only one `Tree` object ever exists per name.
    pub fn tree(self: &Arc<Self>, name: &str, create: bool) -> Result<Option<Arc<Tree>>> {
        if name == DIRECTORY_TREE_NAME {
            return Err(PersistitError::IllegalArgument(format!(
                "tree name {} is reserved",
                name
            )));
        }
        let mut trees = self.trees.lock();
        if let Some(tree) = trees.get(name) {
            return Ok(Some(tree.clone()));
        }
        // nothing can exist before the directory tree does; a lookup must
        // not materialize it (or touch a read-only volume)
        if !create && self.directory_tree()?.root() == 0 {
            return Ok(None);
        }

        let mut exchange = self.directory_exchange()?;
        *exchange.key_mut() = Self::tree_record_key(name)?;
        if let Some(bytes) = exchange.fetch(None)? {
            let record = decode_tree_record(&bytes)?;
            let tree = Arc::new(Tree::new(name, record.root, record.depth)?);
            tree.set_change_count(record.change_count);
            tree.set_handle(self.next_tree_handle.fetch_add(1, Ordering::AcqRel))?;
            self.load_accumulator_state(&tree)?;
            trees.insert(name.to_string(), tree.clone());
            return Ok(Some(tree));
        }
        if !create {
            return Ok(None);
        }

        // validate the name before allocating anything
        let tree = Arc::new(Tree::new(name, 0, 1)?);
        let root = self.create_tree_root()?;
        tree.set_root(root);
        tree.set_handle(self.next_tree_handle.fetch_add(1, Ordering::AcqRel))?;
        self.store_tree_record(&tree)?;
        log::debug!("created tree {} in volume {}", name, self.name);
        trees.insert(name.to_string(), tree.clone());
        Ok(Some(tree))
    }

    fn load_accumulator_state(self: &Arc<Self>, tree: &Arc<Tree>) -> Result<()> {
        let mut prefix = Key::new();
        prefix.append_string(DIRECTORY_ACCUMULATOR_PREFIX)?;
        prefix.append_string(tree.name())?;
        let mut exchange = self.directory_exchange()?;
        exchange.key_mut().copy_from(&prefix);
        while exchange.next(None)? {
            if !exchange.key().starts_with(&prefix) {
                break;
            }
            let record = exchange
                .value()
                .map(decode_checkpoint_record)
                .transpose()?
                .ok_or_else(|| {
                    PersistitError::CorruptVolume("missing accumulator record value".into())
                })?;
            tree.seed_checkpoint_state(record.index, record.acc_type, record.value);
        }
        Ok(())
    }

    pub(crate) fn store_tree_record(self: &Arc<Self>, tree: &Arc<Tree>) -> Result<()> {
        let record = TreeRecord {
            root: tree.root(),
            change_count: tree.change_count(),
            depth: tree.depth(),
            name: tree.name().to_string(),
        };
        let mut exchange = self.directory_exchange()?;
        *exchange.key_mut() = Self::tree_record_key(tree.name())?;
        exchange.store(&encode_tree_record(&record)?, None)
    }

    /// Persist one accumulator's checkpoint snapshot into the directory
    /// tree.
    pub(crate) fn store_accumulator_record(
        self: &Arc<Self>,
        accumulator: &Arc<Accumulator>,
        value: i64,
    ) -> Result<()> {
        let mut exchange = self.directory_exchange()?;
        *exchange.key_mut() =
            Self::accumulator_record_key(accumulator.tree_name(), accumulator.index())?;
        exchange.store(&accumulator.encode_checkpoint(value), None)
    }

    /// Checkpoint this volume at `checkpoint_ts`: persist tree records,
    /// accumulator snapshots, the header, and every journaled page image.
    pub fn checkpoint(self: &Arc<Self>, checkpoint_ts: i64) -> Result<()> {
        if self.storage.is_read_only() {
            return Ok(());
        }
        let trees: Vec<Arc<Tree>> = self.trees.lock().values().cloned().collect();
        for tree in &trees {
            for accumulator in tree.accumulators() {
                let value = accumulator.snapshot_value(&self.txn_index, checkpoint_ts, 0);
                self.store_accumulator_record(&accumulator, value)?;
            }
            self.store_tree_record(tree)?;
        }
        self.flush_metadata()?;
        self.pool.flush_volume(&self.storage)?;
        self.storage.flush_journaled_pages()?;
        Ok(())
    }

    /// Re-encode volatile state into the header page. Advances the clock
    /// one tick and dirties the head buffer only when a field actually
    /// changed.
    pub fn flush_metadata(&self) -> Result<bool> {
        if self.storage.is_read_only() {
            return Ok(false);
        }
        let head = self
            .head
            .lock()
            .clone()
            .ok_or_else(|| PersistitError::VolumeClosed(self.name.clone()))?;
        // the directory root moves when the directory tree's root splits
        if let Some(directory) = self.directory_tree.lock().clone() {
            self.directory_root.store(directory.root(), Ordering::Release);
        }
        let timestamp = self.storage.allocator().update_timestamp();
        let changed = head.with_content_mut(|bytes| {
            let mut changed = false;
            changed |= header::change_next_available_page(bytes, self.storage.next_available_page());
            changed |= header::change_extended_page_count(bytes, self.storage.page_count());
            changed |= header::change_directory_root(bytes, self.directory_root());
            changed |= header::change_garbage_root(bytes, self.garbage_root());
            changed |= header::change_open_time(bytes, self.storage.open_time());
            changed |= header::change_last_extension_time(bytes, self.storage.last_extension_time());
            changed |= header::change_last_read_time(bytes, self.storage.last_read_time());
            changed |= header::change_last_write_time(bytes, self.storage.last_write_time());
            changed |= header::change_fetch_counter(bytes, self.statistics.fetch_counter());
            changed |= header::change_traverse_counter(bytes, self.statistics.traverse_counter());
            changed |= header::change_store_counter(bytes, self.statistics.store_counter());
            changed |= header::change_remove_counter(bytes, self.statistics.remove_counter());
            changed |= header::change_read_counter(bytes, self.storage.read_counter());
            changed |= header::change_write_counter(bytes, self.storage.write_counter());
            changed
        });
        if changed {
            head.mark_dirty(timestamp);
        }
        Ok(changed)
    }

    /// Flush everything and release the head buffer. Safe to call twice.
    pub fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.storage.is_read_only() {
            let trees: Vec<Arc<Tree>> = self.trees.lock().values().cloned().collect();
            for tree in &trees {
                self.store_tree_record(tree)?;
            }
            self.flush_metadata()?;
            self.pool.flush_volume(&self.storage)?;
            self.storage.flush_journaled_pages()?;
        }
        if let Some(head) = self.head.lock().take() {
            self.pool.release_fixed(&head);
        }
        self.pool.invalidate_volume(&self.storage);
        self.storage.close()?;
        log::info!("closed volume {}", self.name);
        Ok(())
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("id", &self.id())
            .field("pages", &self.page_count())
            .finish()
    }
}

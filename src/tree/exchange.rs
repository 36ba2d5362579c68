//! Exchange: cursor over one tree
//!
//! An `Exchange` binds a (volume, tree) pair to a working key and value
//! and drives every B-Tree operation: fetch, store, remove, ordered
//! traversal and range removal. Pages are claimed through the buffer
//! pool; structural changes run under the tree's exclusive latch and
//! splits are placed by the tree's split policy.

use crate::buffer::PageClaim;
use crate::timestamp::TimestampAllocator;
use crate::tree::anti_value::put_anti_value;
use crate::tree::key::Key;
use crate::tree::page;
use crate::tree::split::Sequence;
use crate::tree::{mvv, Tree};
use crate::txn::status::TransactionStatus;
use crate::txn::transaction::Transaction;
use crate::volume::Volume;
use crate::{PersistitError, Result};
use std::sync::Arc;

/// Upper bound on descent depth; exceeding it means a page cycle.
const MAX_DESCENT: usize = 20;

pub struct Exchange {
    volume: Arc<Volume>,
    tree: Arc<Tree>,
    key: Key,
    value: Option<Vec<u8>>,
    spare_key: Key,
    sequence: Sequence,
}

impl Exchange {
    pub fn new(volume: Arc<Volume>, tree: Arc<Tree>) -> Self {
        Self {
            volume,
            tree,
            key: Key::new(),
            value: None,
            spare_key: Key::new(),
            sequence: Sequence::None,
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    /// Value produced by the last fetch or traverse.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    fn allocator(&self) -> &Arc<TimestampAllocator> {
        self.volume.storage().allocator()
    }

    fn snapshot_params<'t>(
        &self,
        txn: Option<&'t Transaction>,
    ) -> (i64, u32, Option<&'t Arc<TransactionStatus>>) {
        match txn {
            Some(txn) => (txn.snapshot_timestamp(), txn.step(), Some(txn.status())),
            None => (self.allocator().current_timestamp(), 0, None),
        }
    }

    fn check_key(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(PersistitError::InvalidKey("empty key".into()));
        }
        let capacity = page::capacity(self.volume.storage().page_size());
        if self.key.encoded_size() > capacity / 2 {
            return Err(PersistitError::InvalidKey(format!(
                "key length {} too large for page size {}",
                self.key.encoded_size(),
                self.volume.storage().page_size()
            )));
        }
        Ok(())
    }

    fn check_active(txn: Option<&Transaction>) -> Result<()> {
        if let Some(txn) = txn {
            if !txn.is_active() {
                return Err(PersistitError::IllegalState(
                    "transaction already finished".into(),
                ));
            }
        }
        Ok(())
    }

    fn claim(&self, page_addr: u64, writer: bool) -> Result<PageClaim> {
        self.volume
            .pool()
            .get(self.volume.storage(), page_addr, writer)
    }

    /// Walk from the root to the data page covering `key_bytes`, returning
    /// the leaf address and the index-page path above it.
    fn descend(&self, key_bytes: &[u8]) -> Result<(u64, Vec<u64>)> {
        let mut page_addr = self.tree.root();
        let mut path = Vec::new();
        for _ in 0..MAX_DESCENT {
            let claim = self.claim(page_addr, false)?;
            match page::page_type(claim.bytes())? {
                page::PageType::Data => return Ok((page_addr, path)),
                page::PageType::Index => {
                    let child = page::find_child(claim.bytes(), key_bytes)?;
                    if child == 0 {
                        return Err(PersistitError::CorruptVolume(format!(
                            "index page {} has no child for key",
                            page_addr
                        )));
                    }
                    path.push(page_addr);
                    page_addr = child;
                }
            }
        }
        Err(PersistitError::CorruptVolume(
            "page cycle detected during descent".into(),
        ))
    }

    /// Fetch the value visible at the caller's snapshot. Fills the
    /// exchange's value field and returns a copy.
    pub fn fetch(&mut self, txn: Option<&Transaction>) -> Result<Option<Vec<u8>>> {
        self.check_key()?;
        Self::check_active(txn)?;
        let tree = self.tree.clone();
        let _latch = tree.latch().read();
        let (snapshot_ts, step, current) = self.snapshot_params(txn);
        let (leaf, _) = self.descend(self.key.as_bytes())?;
        let claim = self.claim(leaf, false)?;
        let value = match page::get_data(claim.bytes(), self.key.as_bytes())? {
            None => None,
            Some(cell) => mvv::fetch_visible(
                cell,
                self.volume.txn_index(),
                snapshot_ts,
                step,
                current,
            )?
            .and_then(mvv::data_bytes)
            .map(|bytes| bytes.to_vec()),
        };
        drop(claim);
        self.volume.statistics().bump_fetch();
        self.value = value.clone();
        Ok(value)
    }

    /// Store `value` under the current key. Inside a transaction the write
    /// lands as a new version visible per MVCC rules; outside it lands as
    /// a primordial version visible to everyone.
    pub fn store(&mut self, value: &[u8], txn: Option<&Transaction>) -> Result<()> {
        self.check_key()?;
        Self::check_active(txn)?;
        let capacity = page::capacity(self.volume.storage().page_size());
        if value.len() > capacity / 4 {
            return Err(PersistitError::IllegalArgument(format!(
                "value length {} too large for page size {}",
                value.len(),
                self.volume.storage().page_size()
            )));
        }

        let tree = self.tree.clone();
        let _latch = tree.latch().write();
        let key_bytes = self.key.as_bytes().to_vec();
        let existing = self.read_cell(&key_bytes)?;
        let handle = txn.map(|t| t.version_handle()).unwrap_or(0);
        let payload = mvv::encode_data(value);
        let cell = self.build_cell(key_bytes.len(), existing, handle, &payload)?;
        if let Some(txn) = txn {
            txn.status().increment_mvcc_count();
        }
        self.put_entry(&key_bytes, &cell)?;
        self.tree.bump_change_count();
        self.volume.statistics().bump_store();
        Ok(())
    }

    /// Remove the current key. Inside a transaction this writes a
    /// tombstone version; outside it removes the entry physically.
    /// Returns true iff a visible value existed.
    pub fn remove(&mut self, txn: Option<&Transaction>) -> Result<bool> {
        self.check_key()?;
        Self::check_active(txn)?;
        let tree = self.tree.clone();
        let _latch = tree.latch().write();
        let key_bytes = self.key.as_bytes().to_vec();
        let Some(cell) = self.read_cell(&key_bytes)? else {
            return Ok(false);
        };
        let (snapshot_ts, step, current) = self.snapshot_params(txn);
        let visible = mvv::fetch_visible(
            &cell,
            self.volume.txn_index(),
            snapshot_ts,
            step,
            current,
        )?;
        if !visible.map_or(false, |payload| mvv::data_bytes(payload).is_some()) {
            return Ok(false);
        }

        match txn {
            Some(txn) => {
                let tombstone = mvv::encode_tombstone();
                let cell = self.build_cell(key_bytes.len(), Some(cell), txn.version_handle(), &tombstone)?;
                txn.status().increment_mvcc_count();
                self.put_entry(&key_bytes, &cell)?;
            }
            None => {
                let (leaf, _) = self.descend(&key_bytes)?;
                let mut claim = self.claim(leaf, true)?;
                page::remove_entry(claim.bytes_mut()?, &key_bytes)?;
                claim.mark_dirty(self.allocator().update_timestamp());
            }
        }
        self.tree.bump_change_count();
        self.volume.statistics().bump_remove();
        Ok(true)
    }

    /// Remove every key in `[current key, until)`. Transactional removal
    /// writes an anti-value tombstone carrying the elided upper endpoint
    /// into each covered key; non-transactional removal is physical.
    /// Returns the number of keys covered.
    pub fn remove_range(&mut self, until: &Key, txn: Option<&Transaction>) -> Result<usize> {
        self.check_key()?;
        Self::check_active(txn)?;
        if until.as_bytes() < self.key.as_bytes() {
            return Err(PersistitError::IllegalArgument(
                "range upper bound precedes lower bound".into(),
            ));
        }
        let tree = self.tree.clone();
        let _latch = tree.latch().write();

        // collect covered entries before mutating anything
        let mut covered: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let low = self.key.as_bytes().to_vec();
        let (mut leaf, _) = self.descend(&low)?;
        'scan: loop {
            let claim = self.claim(leaf, false)?;
            for entry in page::data_entries(claim.bytes())? {
                if entry.key < &low[..] {
                    continue;
                }
                if entry.key >= until.as_bytes() {
                    break 'scan;
                }
                covered.push((entry.key.to_vec(), entry.value.to_vec()));
            }
            let sibling = page::right_sibling(claim.bytes());
            drop(claim);
            if sibling == 0 {
                break;
            }
            leaf = sibling;
        }

        for (key_bytes, cell) in &covered {
            match txn {
                Some(txn) => {
                    self.spare_key = Key::from_encoded(key_bytes)?;
                    let anti = put_anti_value(&self.spare_key, until)?;
                    let payload = mvv::encode_anti_value(&anti);
                    let cell = self.build_cell(
                        key_bytes.len(),
                        Some(cell.clone()),
                        txn.version_handle(),
                        &payload,
                    )?;
                    txn.status().increment_mvcc_count();
                    self.put_entry(key_bytes, &cell)?;
                }
                None => {
                    let (leaf, _) = self.descend(key_bytes)?;
                    let mut claim = self.claim(leaf, true)?;
                    page::remove_entry(claim.bytes_mut()?, key_bytes)?;
                    claim.mark_dirty(self.allocator().update_timestamp());
                }
            }
            self.volume.statistics().bump_remove();
        }
        if !covered.is_empty() {
            self.tree.bump_change_count();
        }
        Ok(covered.len())
    }

    /// Advance to the next key with a visible value. An empty key starts
    /// before the first entry.
    pub fn next(&mut self, txn: Option<&Transaction>) -> Result<bool> {
        Self::check_active(txn)?;
        let tree = self.tree.clone();
        let _latch = tree.latch().read();
        let (snapshot_ts, step, current) = self.snapshot_params(txn);
        let search = self.key.as_bytes().to_vec();
        let (mut leaf, _) = self.descend(&search)?;
        loop {
            let claim = self.claim(leaf, false)?;
            for entry in page::data_entries(claim.bytes())? {
                if entry.key <= &search[..] {
                    continue;
                }
                let visible = mvv::fetch_visible(
                    entry.value,
                    self.volume.txn_index(),
                    snapshot_ts,
                    step,
                    current,
                )?;
                if let Some(data) = visible.and_then(mvv::data_bytes) {
                    self.key = Key::from_encoded(entry.key)?;
                    self.value = Some(data.to_vec());
                    self.volume.statistics().bump_traverse();
                    return Ok(true);
                }
            }
            let sibling = page::right_sibling(claim.bytes());
            drop(claim);
            if sibling == 0 {
                return Ok(false);
            }
            leaf = sibling;
        }
    }

    /// Step back to the previous key with a visible value. An empty key
    /// starts after the last entry.
    pub fn previous(&mut self, txn: Option<&Transaction>) -> Result<bool> {
        Self::check_active(txn)?;
        let tree = self.tree.clone();
        let _latch = tree.latch().read();
        let (snapshot_ts, step, current) = self.snapshot_params(txn);
        let bound = if self.key.is_empty() {
            None
        } else {
            Some(self.key.as_bytes().to_vec())
        };
        let found = self.previous_in(
            self.tree.root(),
            bound.as_deref(),
            snapshot_ts,
            step,
            current,
            0,
        )?;
        match found {
            Some((key_bytes, data)) => {
                self.key = Key::from_encoded(&key_bytes)?;
                self.value = Some(data);
                self.volume.statistics().bump_traverse();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn previous_in(
        &self,
        page_addr: u64,
        bound: Option<&[u8]>,
        snapshot_ts: i64,
        step: u32,
        current: Option<&Arc<TransactionStatus>>,
        depth: usize,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if depth > MAX_DESCENT {
            return Err(PersistitError::CorruptVolume(
                "page cycle detected during descent".into(),
            ));
        }
        let claim = self.claim(page_addr, false)?;
        match page::page_type(claim.bytes())? {
            page::PageType::Data => {
                let mut best: Option<(Vec<u8>, Vec<u8>)> = None;
                for entry in page::data_entries(claim.bytes())? {
                    if let Some(bound) = bound {
                        if entry.key >= bound {
                            break;
                        }
                    }
                    let visible = mvv::fetch_visible(
                        entry.value,
                        self.volume.txn_index(),
                        snapshot_ts,
                        step,
                        current,
                    )?;
                    if let Some(data) = visible.and_then(mvv::data_bytes) {
                        best = Some((entry.key.to_vec(), data.to_vec()));
                    }
                }
                Ok(best)
            }
            page::PageType::Index => {
                let mut children = vec![page::leftmost_child(claim.bytes())];
                for entry in page::index_entries(claim.bytes())? {
                    if let Some(bound) = bound {
                        if entry.key > bound {
                            break;
                        }
                    }
                    children.push(entry.child);
                }
                drop(claim);
                for child in children.into_iter().rev() {
                    if child == 0 {
                        continue;
                    }
                    if let Some(found) =
                        self.previous_in(child, bound, snapshot_ts, step, current, depth + 1)?
                    {
                        return Ok(Some(found));
                    }
                }
                Ok(None)
            }
        }
    }

    fn read_cell(&self, key_bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let (leaf, _) = self.descend(key_bytes)?;
        let claim = self.claim(leaf, false)?;
        Ok(page::get_data(claim.bytes(), key_bytes)?.map(|cell| cell.to_vec()))
    }

    /// Prune the existing cell and append one new version.
    fn build_cell(
        &self,
        key_len: usize,
        existing: Option<Vec<u8>>,
        handle: i64,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let cell = match existing {
            Some(old) => {
                let mut pruned = mvv::prune(&old, self.volume.txn_index())?;
                mvv::append_version(&mut pruned, handle, payload);
                pruned
            }
            None => mvv::new_cell(handle, payload),
        };
        let capacity = page::capacity(self.volume.storage().page_size());
        if page::data_entry_size(key_len, cell.len()) > capacity {
            return Err(PersistitError::IllegalState(
                "live version chain exceeds page capacity".into(),
            ));
        }
        Ok(cell)
    }

    /// Insert or replace `(key, cell)` in the tree, splitting pages as
    /// needed. The caller holds the tree's exclusive latch.
    fn put_entry(&mut self, key_bytes: &[u8], cell: &[u8]) -> Result<()> {
        let (leaf, path) = self.descend(key_bytes)?;
        let mut claim = self.claim(leaf, true)?;
        let ts = self.allocator().update_timestamp();
        if page::insert_data(claim.bytes_mut()?, key_bytes, cell)? {
            claim.mark_dirty(ts);
            return Ok(());
        }

        // split: merge the new entry into the page's entry list
        let used_before = page::used(claim.bytes());
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = page::data_entries(claim.bytes())?
            .iter()
            .map(|e| (e.key.to_vec(), e.value.to_vec()))
            .collect();
        let (insert_at, replace) =
            match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key_bytes)) {
                Ok(i) => {
                    entries[i].1 = cell.to_vec();
                    (i, true)
                }
                Err(i) => {
                    entries.insert(i, (key_bytes.to_vec(), cell.to_vec()));
                    (i, false)
                }
            };
        self.sequence = if insert_at + 1 == entries.len() {
            Sequence::Forward
        } else if insert_at == 0 {
            Sequence::Reverse
        } else {
            Sequence::None
        };

        let sizes: Vec<usize> = entries
            .iter()
            .map(|(k, v)| page::data_entry_size(k.len(), v.len()))
            .collect();
        let total: usize = sizes.iter().sum();
        let capacity = page::capacity(self.volume.storage().page_size());
        let policy = self.tree.split_policy();
        let mut best_score = 0i64;
        let mut best_at = None;
        let mut left_size = 0usize;
        for boundary in 1..entries.len() {
            left_size += sizes[boundary - 1];
            let right_size = total - left_size;
            let score = policy.split_fit(
                boundary,
                insert_at,
                replace,
                left_size,
                right_size,
                used_before,
                total,
                capacity,
                best_score,
                self.sequence,
            );
            if score > best_score {
                best_score = score;
                best_at = Some(boundary);
            }
        }
        let Some(boundary) = best_at else {
            return Err(PersistitError::IllegalState(
                "no legal split boundary".into(),
            ));
        };

        let right_addr = self.volume.storage().alloc_new_page()?;
        let (left_entries, right_entries) = entries.split_at(boundary);
        let pivot_key = right_entries[0].0.clone();
        {
            let mut right_claim = self.claim(right_addr, true)?;
            let bytes = right_claim.bytes_mut()?;
            page::init(bytes, page::PageType::Data);
            page::set_right_sibling(bytes, page::right_sibling(claim.bytes()));
            page::rewrite_data(bytes, right_entries)?;
            right_claim.mark_dirty(ts);
        }
        {
            let bytes = claim.bytes_mut()?;
            page::rewrite_data(bytes, left_entries)?;
            page::set_right_sibling(bytes, right_addr);
        }
        claim.mark_dirty(ts);
        drop(claim);

        self.insert_into_parent(path, pivot_key, right_addr, ts)
    }

    /// Thread a new (pivot, child) boundary up the index levels, splitting
    /// index pages and growing the root as needed.
    fn insert_into_parent(
        &mut self,
        mut path: Vec<u64>,
        pivot: Vec<u8>,
        child: u64,
        ts: i64,
    ) -> Result<()> {
        let mut pivot = pivot;
        let mut child = child;
        loop {
            let Some(parent) = path.pop() else {
                // grow the tree by one level
                let new_root = self.volume.storage().alloc_new_page()?;
                let mut claim = self.claim(new_root, true)?;
                let bytes = claim.bytes_mut()?;
                page::init(bytes, page::PageType::Index);
                page::set_leftmost_child(bytes, self.tree.root());
                if !page::insert_index(bytes, &pivot, child)? {
                    return Err(PersistitError::IllegalState(
                        "pivot key does not fit in a fresh root".into(),
                    ));
                }
                claim.mark_dirty(ts);
                self.tree.set_root(new_root);
                self.tree.set_depth(self.tree.depth() + 1);
                return Ok(());
            };

            let mut claim = self.claim(parent, true)?;
            if page::insert_index(claim.bytes_mut()?, &pivot, child)? {
                claim.mark_dirty(ts);
                return Ok(());
            }

            // split the index page and promote one boundary
            let leftmost = page::leftmost_child(claim.bytes());
            let mut entries: Vec<(Vec<u8>, u64)> = page::index_entries(claim.bytes())?
                .iter()
                .map(|e| (e.key.to_vec(), e.child))
                .collect();
            match entries.binary_search_by(|(k, _)| k.as_slice().cmp(&pivot[..])) {
                Ok(_) => {
                    return Err(PersistitError::IllegalState(
                        "duplicate boundary key in index page".into(),
                    ))
                }
                Err(i) => entries.insert(i, (pivot.clone(), child)),
            }

            let sizes: Vec<usize> = entries
                .iter()
                .map(|(k, _)| page::index_entry_size(k.len()))
                .collect();
            let total: usize = sizes.iter().sum();
            let capacity = page::capacity(self.volume.storage().page_size());
            let policy = self.tree.split_policy();
            let mut best_score = 0i64;
            let mut best_at = None;
            let mut left_size = 0usize;
            for promoted in 1..entries.len() - 1 {
                left_size += sizes[promoted - 1];
                let right_size = total - left_size - sizes[promoted];
                let score = policy.split_fit(
                    promoted,
                    0,
                    false,
                    left_size,
                    right_size,
                    total,
                    total,
                    capacity,
                    best_score,
                    Sequence::None,
                );
                if score > best_score {
                    best_score = score;
                    best_at = Some(promoted);
                }
            }
            let Some(promoted) = best_at else {
                return Err(PersistitError::IllegalState(
                    "no legal split boundary in index page".into(),
                ));
            };

            let right_addr = self.volume.storage().alloc_new_page()?;
            let (promoted_key, promoted_child) = entries[promoted].clone();
            let left_entries = entries[..promoted].to_vec();
            let right_entries = entries[promoted + 1..].to_vec();
            {
                let mut right_claim = self.claim(right_addr, true)?;
                let bytes = right_claim.bytes_mut()?;
                page::init(bytes, page::PageType::Index);
                page::rewrite_index(bytes, promoted_child, &right_entries)?;
                right_claim.mark_dirty(ts);
            }
            {
                let bytes = claim.bytes_mut()?;
                page::rewrite_index(bytes, leftmost, &left_entries)?;
            }
            claim.mark_dirty(ts);
            drop(claim);

            pivot = promoted_key;
            child = right_addr;
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("tree", &self.tree.name())
            .field("key", &self.key)
            .finish()
    }
}

//! Buffer pool
//!
//! Fixed-size page frames shared by every volume of one page size. A frame
//! is pinned while any claim is outstanding; replacement walks the LRU
//! list and skips pinned and fixed frames. Dirty frames are written back
//! through their owning volume (journal-routed for durable volumes) before
//! the frame is reused.

use crate::volume::storage::VolumeStorage;
use crate::{PersistitError, Result};
use lru::LruCache;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

type ReadGuard = ArcRwLockReadGuard<RawRwLock, Vec<u8>>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Vec<u8>>;

struct FrameMeta {
    /// (volume id, page address) currently held, None for an empty frame.
    key: Option<(u64, u64)>,
    storage: Option<Arc<VolumeStorage>>,
}

/// One page frame.
pub struct Buffer {
    frame_index: usize,
    meta: Mutex<FrameMeta>,
    content: Arc<RwLock<Vec<u8>>>,
    dirty: AtomicBool,
    dirtied_at: AtomicI64,
    pin_count: AtomicU32,
    /// Fixed frames (volume head pages) are never eviction candidates.
    fixed: AtomicBool,
}

impl Buffer {
    fn new(frame_index: usize, page_size: usize) -> Self {
        Self {
            frame_index,
            meta: Mutex::new(FrameMeta {
                key: None,
                storage: None,
            }),
            content: Arc::new(RwLock::new(vec![0u8; page_size])),
            dirty: AtomicBool::new(false),
            dirtied_at: AtomicI64::new(0),
            pin_count: AtomicU32::new(0),
            fixed: AtomicBool::new(false),
        }
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Page address currently loaded, if any.
    pub fn page(&self) -> Option<u64> {
        self.meta.lock().key.map(|(_, page)| page)
    }

    pub fn volume_id(&self) -> Option<u64> {
        self.meta.lock().key.map(|(volume, _)| volume)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn dirtied_at(&self) -> i64 {
        self.dirtied_at.load(Ordering::Acquire)
    }

    /// Record a modification stamped with `timestamp`. The stamp threads
    /// into the journal so checkpoints know the page's dirty epoch.
    pub fn mark_dirty(&self, timestamp: i64) {
        self.dirty.store(true, Ordering::Release);
        self.dirtied_at.fetch_max(timestamp, Ordering::AcqRel);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let previous = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "pin count underflow");
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.load(Ordering::Acquire)
    }

    fn set_fixed(&self, fixed: bool) {
        self.fixed.store(fixed, Ordering::Release);
    }

    /// Short read access to the page bytes; blocks on a writer.
    pub fn with_content<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.content.read();
        f(&guard)
    }

    /// Short write access to the page bytes.
    pub fn with_content_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.content.write();
        f(&mut guard)
    }
}

enum ClaimGuard {
    Read(ReadGuard),
    Write(WriteGuard),
}

/// RAII claim on a pinned page frame. Dropping the claim releases the page
/// lock and the pin.
pub struct PageClaim {
    buffer: Arc<Buffer>,
    guard: Option<ClaimGuard>,
}

impl PageClaim {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn page(&self) -> u64 {
        self.buffer.page().unwrap_or(u64::MAX)
    }

    pub fn bytes(&self) -> &[u8] {
        match self.guard.as_ref() {
            Some(ClaimGuard::Read(guard)) => guard,
            Some(ClaimGuard::Write(guard)) => guard,
            None => unreachable!("claim already released"),
        }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self.guard.as_mut() {
            Some(ClaimGuard::Write(guard)) => Ok(guard),
            Some(ClaimGuard::Read(_)) => Err(PersistitError::IllegalState(
                "write access through a reader claim".into(),
            )),
            None => unreachable!("claim already released"),
        }
    }

    pub fn is_writer(&self) -> bool {
        matches!(self.guard, Some(ClaimGuard::Write(_)))
    }

    pub fn mark_dirty(&self, timestamp: i64) {
        self.buffer.mark_dirty(timestamp);
    }
}

impl Drop for PageClaim {
    fn drop(&mut self) {
        // release the page lock before the pin so an evictor that sees
        // pin_count == 0 always wins the content lock
        self.guard.take();
        self.buffer.unpin();
    }
}

struct PoolIndex {
    lru: LruCache<(u64, u64), usize>,
    free: Vec<usize>,
}

/// Pool of page frames for one page size.
pub struct BufferPool {
    page_size: usize,
    frames: Vec<Arc<Buffer>>,
    index: Mutex<PoolIndex>,
}

impl BufferPool {
    pub fn new(page_size: usize, frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|i| Arc::new(Buffer::new(i, page_size)))
            .collect::<Vec<_>>();
        let free = (0..frame_count).rev().collect();
        Self {
            page_size,
            frames,
            index: Mutex::new(PoolIndex {
                lru: LruCache::unbounded(),
                free,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Claim a page. `writer` requests exclusive access. A miss loads the
    /// page (journal first) into a free or evicted frame; when every frame
    /// is pinned the claim fails with `InUse`.
    pub fn get(
        &self,
        storage: &Arc<VolumeStorage>,
        page: u64,
        writer: bool,
    ) -> Result<PageClaim> {
        if storage.page_size() != self.page_size {
            return Err(PersistitError::IllegalArgument(format!(
                "volume page size {} does not match pool page size {}",
                storage.page_size(),
                self.page_size
            )));
        }
        let key = (storage.id(), page);

        let loading = {
            let mut index = self.index.lock();
            if let Some(&frame) = index.lru.get(&key) {
                let buffer = self.frames[frame].clone();
                buffer.pin();
                drop(index);
                // blocking claim outside the index lock
                let guard = if writer {
                    ClaimGuard::Write(self.frames[frame].content.write_arc())
                } else {
                    ClaimGuard::Read(self.frames[frame].content.read_arc())
                };
                return Ok(PageClaim {
                    buffer,
                    guard: Some(guard),
                });
            }

            let (frame, guard) = match index.free.pop() {
                Some(frame) => {
                    let guard = self.frames[frame]
                        .content
                        .try_write_arc()
                        .ok_or_else(|| {
                            PersistitError::IllegalState("free frame is locked".into())
                        })?;
                    (frame, guard)
                }
                None => self.evict_victim(&mut index)?,
            };
            let buffer = self.frames[frame].clone();
            {
                let mut meta = buffer.meta.lock();
                meta.key = Some(key);
                meta.storage = Some(storage.clone());
            }
            buffer.clear_dirty();
            buffer.pin();
            index.lru.put(key, frame);
            (buffer, guard)
        };

        let (buffer, mut guard) = loading;
        if let Err(e) = storage.read_page(page, &mut guard) {
            drop(guard);
            let mut index = self.index.lock();
            index.lru.pop(&key);
            {
                let mut meta = buffer.meta.lock();
                meta.key = None;
                meta.storage = None;
            }
            index.free.push(buffer.frame_index);
            buffer.unpin();
            return Err(e);
        }
        let guard = if writer {
            ClaimGuard::Write(guard)
        } else {
            ClaimGuard::Read(WriteGuard::downgrade(guard))
        };
        Ok(PageClaim {
            buffer,
            guard: Some(guard),
        })
    }

    /// Select the least recently used unpinned, unfixed frame; write back
    /// its content if dirty and hand the emptied frame to the caller with
    /// the content lock held.
    fn evict_victim(&self, index: &mut PoolIndex) -> Result<(usize, WriteGuard)> {
        let mut chosen = None;
        for (key, &frame) in index.lru.iter().rev() {
            let buffer = &self.frames[frame];
            if buffer.pin_count() > 0 || buffer.is_fixed() {
                continue;
            }
            if let Some(guard) = buffer.content.try_write_arc() {
                chosen = Some((*key, frame, guard));
                break;
            }
        }
        let Some((key, frame, guard)) = chosen else {
            return Err(PersistitError::InUse(
                "all buffer pool frames are pinned".into(),
            ));
        };
        let buffer = &self.frames[frame];
        if buffer.is_dirty() {
            let storage = buffer
                .meta
                .lock()
                .storage
                .clone()
                .ok_or_else(|| PersistitError::IllegalState("dirty frame without volume".into()))?;
            storage.write_page(key.1, &guard, buffer.dirtied_at())?;
            buffer.clear_dirty();
        }
        index.lru.pop(&key);
        {
            let mut meta = buffer.meta.lock();
            meta.key = None;
            meta.storage = None;
        }
        Ok((frame, guard))
    }

    /// Write back every dirty frame of one volume. Used by checkpoint and
    /// close.
    pub fn flush_volume(&self, storage: &Arc<VolumeStorage>) -> Result<()> {
        let candidates: Vec<Arc<Buffer>> = {
            let index = self.index.lock();
            index
                .lru
                .iter()
                .filter(|((volume, _), _)| *volume == storage.id())
                .map(|(_, &frame)| self.frames[frame].clone())
                .collect()
        };
        for buffer in candidates {
            let guard = buffer.content.read();
            // the frame may have been evicted and reused since the scan
            let meta_key = buffer.meta.lock().key;
            match meta_key {
                Some((volume, page)) if volume == storage.id() => {
                    if buffer.is_dirty() {
                        storage.write_page(page, &guard, buffer.dirtied_at())?;
                        buffer.clear_dirty();
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drop every clean mapping of one volume; used on close so a stale
    /// frame never serves a different volume reusing the same id.
    pub fn invalidate_volume(&self, storage: &Arc<VolumeStorage>) {
        let mut index = self.index.lock();
        let keys: Vec<(u64, u64)> = index
            .lru
            .iter()
            .filter(|((volume, _), _)| *volume == storage.id())
            .map(|(key, _)| *key)
            .collect();
        for key in keys {
            if let Some(frame) = index.lru.pop(&key) {
                let buffer = &self.frames[frame];
                let mut meta = buffer.meta.lock();
                meta.key = None;
                meta.storage = None;
                drop(meta);
                buffer.clear_dirty();
                buffer.set_fixed(false);
                index.free.push(frame);
            }
        }
    }

    /// Pin a page permanently (volume head). The returned buffer stays in
    /// the pool until [`BufferPool::release_fixed`].
    pub fn pin_fixed(&self, storage: &Arc<VolumeStorage>, page: u64) -> Result<Arc<Buffer>> {
        let claim = self.get(storage, page, false)?;
        let buffer = claim.buffer().clone();
        buffer.pin();
        buffer.set_fixed(true);
        drop(claim);
        Ok(buffer)
    }

    pub fn release_fixed(&self, buffer: &Arc<Buffer>) {
        buffer.set_fixed(false);
        buffer.unpin();
    }
}

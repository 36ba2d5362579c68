//! Volume file storage
//!
//! Positional page I/O against a single backing file, guarded by an OS
//! file lock so no second process opens the same volume for writing. Reads
//! consult the journal first; writes to durable volumes are routed through
//! the journal and reach the file at checkpoint.

use crate::journal::JournalManager;
use crate::timestamp::TimestampAllocator;
use crate::volume::{header, VolumeSpecification};
use crate::{PersistitError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Volume ids are 40-bit nonzero random integers.
pub const VOLUME_ID_BITS: u32 = 40;

pub fn random_volume_id() -> u64 {
    loop {
        let id = rand::random::<u64>() & ((1u64 << VOLUME_ID_BITS) - 1);
        if id != 0 {
            return id;
        }
    }
}

/// Low-level storage for one volume file.
pub struct VolumeStorage {
    path: PathBuf,
    page_size: usize,
    id: u64,
    read_only: bool,
    temporary: bool,
    allocator: Arc<TimestampAllocator>,
    journal: Arc<dyn JournalManager>,
    file: Mutex<File>,
    /// Serializes extension and allocation against each other.
    claim: Mutex<()>,
    next_available_page: AtomicU64,
    extended_page_count: AtomicU64,
    initial_pages: u64,
    extension_pages: u64,
    maximum_pages: u64,
    closed: AtomicBool,
    read_counter: AtomicU64,
    write_counter: AtomicU64,
    last_read_time: AtomicI64,
    last_write_time: AtomicI64,
    last_extension_time: AtomicI64,
    create_time: AtomicI64,
    open_time: AtomicI64,
    last_exception: Mutex<Option<String>>,
}

impl std::fmt::Debug for VolumeStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeStorage")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .field("temporary", &self.temporary)
            .field("closed", &self.closed)
            .finish()
    }
}

impl VolumeStorage {
    /// Create a new volume file. On any failure the half-created file is
    /// removed so a retry starts clean.
    pub fn create(
        spec: &VolumeSpecification,
        allocator: Arc<TimestampAllocator>,
        journal: Arc<dyn JournalManager>,
    ) -> Result<Arc<Self>> {
        spec.validate()?;
        if spec.read_only {
            return Err(PersistitError::ReadOnlyVolume(format!(
                "cannot create volume {} read-only",
                spec.path.display()
            )));
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&spec.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(PersistitError::VolumeAlreadyExists(
                    spec.path.display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let result = Self::init_created(file, spec, allocator, journal);
        if result.is_err() {
            // tear down the partial volume
            let _ = std::fs::remove_file(&spec.path);
        }
        result
    }

    fn init_created(
        file: File,
        spec: &VolumeSpecification,
        allocator: Arc<TimestampAllocator>,
        journal: Arc<dyn JournalManager>,
    ) -> Result<Arc<Self>> {
        lock_file(&file, false, &spec.path)?;

        let id = random_volume_id();
        let create_ts = allocator.update_timestamp();
        let storage = Arc::new(Self {
            path: spec.path.clone(),
            page_size: spec.page_size,
            id,
            read_only: false,
            temporary: spec.temporary,
            allocator,
            journal,
            file: Mutex::new(file),
            claim: Mutex::new(()),
            next_available_page: AtomicU64::new(1),
            extended_page_count: AtomicU64::new(spec.initial_pages),
            initial_pages: spec.initial_pages,
            extension_pages: spec.extension_pages,
            maximum_pages: spec.maximum_pages,
            closed: AtomicBool::new(false),
            read_counter: AtomicU64::new(0),
            write_counter: AtomicU64::new(0),
            last_read_time: AtomicI64::new(0),
            last_write_time: AtomicI64::new(0),
            last_extension_time: AtomicI64::new(0),
            create_time: AtomicI64::new(create_ts),
            open_time: AtomicI64::new(create_ts),
            last_exception: Mutex::new(None),
        });

        storage.resize(spec.initial_pages)?;

        let mut head = vec![0u8; spec.page_size];
        header::put_signature(&mut head);
        header::put_version(&mut head, header::VERSION);
        header::put_page_size(&mut head, spec.page_size as u32);
        header::put_id(&mut head, id);
        header::change_next_available_page(&mut head, 1);
        header::change_extended_page_count(&mut head, spec.initial_pages);
        header::change_initial_pages(&mut head, spec.initial_pages);
        header::change_maximum_pages(&mut head, spec.maximum_pages);
        header::change_extension_pages(&mut head, spec.extension_pages);
        header::change_create_time(&mut head, create_ts);
        header::change_open_time(&mut head, create_ts);
        storage.write_page_direct(0, &head)?;
        storage.sync()?;

        log::info!(
            "created volume {} id={:#x} pageSize={} initialPages={}",
            spec.path.display(),
            id,
            spec.page_size,
            spec.initial_pages
        );
        Ok(storage)
    }

    /// Open an existing volume file and verify its header against the
    /// specification.
    pub fn open(
        spec: &VolumeSpecification,
        expected_id: u64,
        allocator: Arc<TimestampAllocator>,
        journal: Arc<dyn JournalManager>,
    ) -> Result<Arc<Self>> {
        spec.validate()?;
        if !spec.path.exists() {
            return Err(PersistitError::VolumeNotFound(
                spec.path.display().to_string(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(!spec.read_only)
            .open(&spec.path)?;
        lock_file(&file, spec.read_only, &spec.path)?;

        let mut head = vec![0u8; spec.page_size];
        read_fully(&file, 0, &mut head)?;
        header::check(&head, spec.page_size as u32)?;

        let id = header::get_id(&head);
        if expected_id != 0 && id != expected_id {
            return Err(PersistitError::CorruptVolume(format!(
                "volume {} id {:#x} does not match recorded id {:#x}",
                spec.path.display(),
                id,
                expected_id
            )));
        }

        let file_len = file.metadata()?.len();
        let extended = file_len / spec.page_size as u64;
        let open_ts = allocator.update_timestamp();

        let storage = Arc::new(Self {
            path: spec.path.clone(),
            page_size: spec.page_size,
            id,
            read_only: spec.read_only,
            temporary: spec.temporary,
            allocator,
            journal,
            file: Mutex::new(file),
            claim: Mutex::new(()),
            next_available_page: AtomicU64::new(header::get_next_available_page(&head)),
            extended_page_count: AtomicU64::new(extended),
            initial_pages: header::get_initial_pages(&head),
            extension_pages: header::get_extension_pages(&head),
            maximum_pages: header::get_maximum_pages(&head),
            closed: AtomicBool::new(false),
            read_counter: AtomicU64::new(header::get_read_counter(&head)),
            write_counter: AtomicU64::new(header::get_write_counter(&head)),
            last_read_time: AtomicI64::new(header::get_last_read_time(&head)),
            last_write_time: AtomicI64::new(header::get_last_write_time(&head)),
            last_extension_time: AtomicI64::new(header::get_last_extension_time(&head)),
            create_time: AtomicI64::new(header::get_create_time(&head)),
            open_time: AtomicI64::new(open_ts),
            last_exception: Mutex::new(None),
        });

        log::info!(
            "opened volume {} id={:#x} pages={} nextAvailable={}",
            spec.path.display(),
            id,
            extended,
            storage.next_available_page()
        );
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn allocator(&self) -> &Arc<TimestampAllocator> {
        &self.allocator
    }

    pub fn journal(&self) -> &Arc<dyn JournalManager> {
        &self.journal
    }

    pub fn next_available_page(&self) -> u64 {
        self.next_available_page.load(Ordering::Acquire)
    }

    /// Number of pages currently materialized in the file.
    pub fn page_count(&self) -> u64 {
        self.extended_page_count.load(Ordering::Acquire)
    }

    pub fn initial_pages(&self) -> u64 {
        self.initial_pages
    }

    pub fn extension_pages(&self) -> u64 {
        self.extension_pages
    }

    pub fn maximum_pages(&self) -> u64 {
        self.maximum_pages
    }

    pub fn read_counter(&self) -> u64 {
        self.read_counter.load(Ordering::Acquire)
    }

    pub fn write_counter(&self) -> u64 {
        self.write_counter.load(Ordering::Acquire)
    }

    pub fn last_read_time(&self) -> i64 {
        self.last_read_time.load(Ordering::Acquire)
    }

    pub fn last_write_time(&self) -> i64 {
        self.last_write_time.load(Ordering::Acquire)
    }

    pub fn last_extension_time(&self) -> i64 {
        self.last_extension_time.load(Ordering::Acquire)
    }

    pub fn create_time(&self) -> i64 {
        self.create_time.load(Ordering::Acquire)
    }

    pub fn open_time(&self) -> i64 {
        self.open_time.load(Ordering::Acquire)
    }

    pub fn last_exception(&self) -> Option<String> {
        self.last_exception.lock().clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PersistitError::VolumeClosed(
                self.path.display().to_string(),
            ));
        }
        Ok(())
    }

    fn check_page_address(&self, page: u64, for_write: bool) -> Result<()> {
        let limit = self.next_available_page();
        // page 0 (the header) is addressable; pages at or beyond the
        // allocation frontier are not, except that a writer may touch the
        // page just handed out by alloc_new_page
        let in_range = if for_write {
            page < limit.max(self.page_count())
        } else {
            page < limit
        };
        if !in_range {
            return Err(PersistitError::InvalidPageAddress {
                volume: self.path.display().to_string(),
                address: page,
            });
        }
        Ok(())
    }

    /// Read a page, journal first. `buf` must be exactly one page.
    pub fn read_page(&self, page: u64, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        if buf.len() != self.page_size {
            return Err(PersistitError::IllegalArgument(format!(
                "buffer length {} does not match page size {}",
                buf.len(),
                self.page_size
            )));
        }
        self.check_page_address(page, false)?;

        if self.journal.read_page_from_journal(self.id, page, buf)? {
            return Ok(());
        }

        let offset = page * self.page_size as u64;
        self.record_io(read_fully_locked(&self.file, offset, buf))?;
        self.read_counter.fetch_add(1, Ordering::AcqRel);
        self.last_read_time
            .store(self.allocator.current_timestamp(), Ordering::Release);
        Ok(())
    }

    /// Write a page. Temporary volumes go straight to disk; durable
    /// volumes delegate to the journal, which flushes to the volume at
    /// checkpoint.
    pub fn write_page(&self, page: u64, data: &[u8], timestamp: i64) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(PersistitError::ReadOnlyVolume(
                self.path.display().to_string(),
            ));
        }
        if data.len() != self.page_size {
            return Err(PersistitError::IllegalArgument(format!(
                "buffer length {} does not match page size {}",
                data.len(),
                self.page_size
            )));
        }
        self.check_page_address(page, true)?;

        if self.temporary {
            self.write_page_direct(page, data)?;
        } else {
            self.journal
                .write_page_to_journal(self.id, page, data, timestamp)?;
        }
        self.write_counter.fetch_add(1, Ordering::AcqRel);
        self.last_write_time.store(timestamp, Ordering::Release);
        Ok(())
    }

    /// Write bytes to the file without journal indirection. Used for the
    /// create path and for checkpoint flushes of journaled images.
    pub fn write_page_direct(&self, page: u64, data: &[u8]) -> Result<()> {
        let offset = page * self.page_size as u64;
        self.record_io(write_fully_locked(&self.file, offset, data))
    }

    /// Atomically hand out the next page address, extending the file when
    /// the frontier crosses the extended region. Never returns page 0.
    pub fn alloc_new_page(&self) -> Result<u64> {
        self.check_open()?;
        if self.read_only {
            return Err(PersistitError::ReadOnlyVolume(
                self.path.display().to_string(),
            ));
        }
        let _claim = self.claim.lock();
        let page = self.next_available_page.load(Ordering::Acquire);
        if page >= self.maximum_pages {
            return Err(PersistitError::VolumeFull(
                self.path.display().to_string(),
            ));
        }
        if page >= self.extended_page_count.load(Ordering::Acquire) {
            self.extend_locked()?;
        }
        self.next_available_page.store(page + 1, Ordering::Release);
        Ok(page)
    }

    /// Grow the file by the extension increment, up to the maximum.
    pub fn extend(&self) -> Result<()> {
        let _claim = self.claim.lock();
        self.extend_locked()
    }

    fn extend_locked(&self) -> Result<()> {
        let current = self.extended_page_count.load(Ordering::Acquire);
        if current >= self.maximum_pages {
            return Err(PersistitError::VolumeFull(
                self.path.display().to_string(),
            ));
        }
        if self.extension_pages == 0 {
            return Err(PersistitError::VolumeFull(format!(
                "{} has no extension increment",
                self.path.display()
            )));
        }
        let target = (current + self.extension_pages).min(self.maximum_pages);
        self.resize(target)?;
        self.extended_page_count.store(target, Ordering::Release);
        self.last_extension_time
            .store(self.allocator.update_timestamp(), Ordering::Release);
        log::debug!(
            "extended volume {} from {} to {} pages",
            self.path.display(),
            current,
            target
        );
        Ok(())
    }

    /// Materialize the file out to `target_pages`. Writing one byte at the
    /// new end forces the filesystem to commit the region; the file is
    /// never truncated shorter.
    pub fn resize(&self, target_pages: u64) -> Result<()> {
        let target_bytes = target_pages * self.page_size as u64;
        let mut file = self.file.lock();
        let current = file.metadata()?.len();
        if current < target_bytes {
            file.seek(SeekFrom::Start(target_bytes - 1))?;
            file.write_all(&[0u8])?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.record_io(self.file.lock().sync_all().map_err(Into::into))
    }

    /// Flush journaled page images to the backing file. Part of the
    /// checkpoint protocol.
    pub fn flush_journaled_pages(&self) -> Result<()> {
        if self.temporary {
            return Ok(());
        }
        for (page, data) in self.journal.drain_volume(self.id)? {
            self.write_page_direct(page, &data)?;
        }
        self.sync()
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let file = self.file.lock();
        file.sync_all()?;
        let _ = file.unlock();
        Ok(())
    }

    fn record_io<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            *self.last_exception.lock() = Some(e.to_string());
        }
        result
    }
}

fn lock_file(file: &File, shared: bool, path: &Path) -> Result<()> {
    let locked = if shared {
        fs4::FileExt::try_lock_shared(file)
    } else {
        fs4::FileExt::try_lock_exclusive(file)
    };
    locked.map_err(|_| PersistitError::InUse(format!("volume {} is locked", path.display())))
}

fn read_fully_locked(file: &Mutex<File>, offset: u64, buf: &mut [u8]) -> Result<()> {
    let file = file.lock();
    read_fully(&file, offset, buf)
}

fn write_fully_locked(file: &Mutex<File>, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = file.lock();
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

/// Positional read tolerating partial reads; a region past EOF reads as
/// zeros (sparse pages).
fn read_fully(mut file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            for byte in &mut buf[filled..] {
                *byte = 0;
            }
            break;
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use tempfile::TempDir;

    fn spec(dir: &TempDir, name: &str) -> VolumeSpecification {
        VolumeSpecification {
            path: dir.path().join(name),
            page_size: 1024,
            initial_pages: 4,
            extension_pages: 4,
            maximum_pages: 16,
            read_only: false,
            temporary: false,
        }
    }

    fn create(dir: &TempDir, name: &str) -> Arc<VolumeStorage> {
        VolumeStorage::create(
            &spec(dir, name),
            Arc::new(TimestampAllocator::new()),
            Arc::new(MemoryJournal::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_create_initializes_header_and_size() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.next_available_page(), 1);
        assert_ne!(storage.id(), 0);
        assert!(storage.id() < (1u64 << VOLUME_ID_BITS));
        let len = std::fs::metadata(storage.path()).unwrap().len();
        assert_eq!(len, 4 * 1024);
    }

    #[test]
    fn test_create_twice_reports_already_exists() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        let err = VolumeStorage::create(
            &spec(&dir, "v1.v01"),
            Arc::new(TimestampAllocator::new()),
            Arc::new(MemoryJournal::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PersistitError::VolumeAlreadyExists(_)));
        drop(storage);
    }

    #[test]
    fn test_open_verifies_id() {
        let dir = TempDir::new().unwrap();
        let id = {
            let storage = create(&dir, "v1.v01");
            storage.close().unwrap();
            storage.id()
        };
        let err = VolumeStorage::open(
            &spec(&dir, "v1.v01"),
            id + 1,
            Arc::new(TimestampAllocator::new()),
            Arc::new(MemoryJournal::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PersistitError::CorruptVolume(_)));

        let storage = VolumeStorage::open(
            &spec(&dir, "v1.v01"),
            id,
            Arc::new(TimestampAllocator::new()),
            Arc::new(MemoryJournal::new()),
        )
        .unwrap();
        assert_eq!(storage.id(), id);
    }

    #[test]
    fn test_alloc_extends_then_fills_to_maximum() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        // pages 1..=15 are allocatable; page 0 is the header
        for expected in 1..16 {
            assert_eq!(storage.alloc_new_page().unwrap(), expected);
        }
        assert!(matches!(
            storage.alloc_new_page(),
            Err(PersistitError::VolumeFull(_))
        ));
        assert_eq!(storage.page_count(), 16);
    }

    #[test]
    fn test_extension_fires_when_maximum_allows() {
        let dir = TempDir::new().unwrap();
        let storage = VolumeStorage::create(
            &VolumeSpecification {
                path: dir.path().join("v1.v01"),
                page_size: 1024,
                initial_pages: 16,
                extension_pages: 16,
                maximum_pages: 64,
                read_only: false,
                temporary: false,
            },
            Arc::new(TimestampAllocator::new()),
            Arc::new(MemoryJournal::new()),
        )
        .unwrap();
        assert_eq!(storage.page_count(), 16);

        // twenty allocations: pages 1..=15 fit the initial region
        for expected in 1..16 {
            assert_eq!(storage.alloc_new_page().unwrap(), expected);
            assert_eq!(storage.page_count(), 16);
        }
        assert_eq!(storage.last_extension_time(), 0);

        // the sixteenth allocation crosses the frontier and grows the
        // file by one extension increment
        assert_eq!(storage.alloc_new_page().unwrap(), 16);
        assert_eq!(storage.page_count(), 32);
        assert!(storage.last_extension_time() > 0);
        assert_eq!(
            std::fs::metadata(storage.path()).unwrap().len(),
            32 * 1024
        );

        // allocations keep succeeding inside the extended region
        for expected in 17..=20 {
            assert_eq!(storage.alloc_new_page().unwrap(), expected);
        }
        assert_eq!(storage.page_count(), 32);
        assert_eq!(storage.next_available_page(), 21);
    }

    #[test]
    fn test_page_zero_never_allocated() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        for _ in 0..10 {
            assert_ne!(storage.alloc_new_page().unwrap(), 0);
        }
    }

    #[test]
    fn test_read_page_rejects_out_of_range() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            storage.read_page(5, &mut buf),
            Err(PersistitError::InvalidPageAddress { .. })
        ));
    }

    #[test]
    fn test_write_routes_through_journal_until_checkpoint() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let storage = VolumeStorage::create(
            &spec(&dir, "v1.v01"),
            Arc::new(TimestampAllocator::new()),
            journal.clone(),
        )
        .unwrap();

        let page = storage.alloc_new_page().unwrap();
        let data = vec![0xABu8; 1024];
        storage.write_page(page, &data, 7).unwrap();

        // journal-first read returns the new image
        let mut buf = vec![0u8; 1024];
        storage.read_page(page, &mut buf).unwrap();
        assert_eq!(buf, data);

        // not yet on disk
        let mut direct = vec![0u8; 1024];
        read_fully_locked(&storage.file, page * 1024, &mut direct).unwrap();
        assert_ne!(direct, data);

        storage.flush_journaled_pages().unwrap();
        read_fully_locked(&storage.file, page * 1024, &mut direct).unwrap();
        assert_eq!(direct, data);
    }

    #[test]
    fn test_resize_never_truncates() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        storage.resize(8).unwrap();
        assert_eq!(std::fs::metadata(storage.path()).unwrap().len(), 8 * 1024);
        storage.resize(2).unwrap();
        assert_eq!(std::fs::metadata(storage.path()).unwrap().len(), 8 * 1024);
    }

    #[test]
    fn test_closed_volume_rejects_io() {
        let dir = TempDir::new().unwrap();
        let storage = create(&dir, "v1.v01");
        let page = storage.alloc_new_page().unwrap();
        storage.close().unwrap();
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            storage.read_page(page, &mut buf),
            Err(PersistitError::VolumeClosed(_))
        ));
    }
}

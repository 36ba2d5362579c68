//! Class-handle dictionary
//!
//! Maps application class identities to compact integer handles so that
//! serialized values carry a short handle instead of a full class name.
//! Records live in the reserved `_classIndex` tree of the system volume
//! under two indexes (by handle, by name+SUID) plus a distinguished
//! next-id counter key. Handles are never reassigned.
//!
//! Class identity comes from an injected [`ClassResolver`], never from
//! ambient runtime state.

use crate::tree::{Exchange, Key, Tree};
use crate::volume::{Volume, CLASS_INDEX_TREE_NAME};
use crate::{PersistitError, Result};
use ahash::AHashMap;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;

const BY_HANDLE: i64 = 1;
const BY_NAME: i64 = 2;
const NEXT_ID: i64 = 0;

/// Identity of a resolvable class: name plus serial-version UID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassDescriptor {
    pub name: String,
    pub suid: i64,
}

/// Supplies the runtime identity for a class name.
pub trait ClassResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<ClassDescriptor>;
}

/// A registered class with its stable handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    name: String,
    suid: i64,
    handle: i32,
}

impl ClassInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn suid(&self) -> i64 {
        self.suid
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }
}

/// Process-wide class-handle dictionary backed by one volume.
pub struct ClassIndex {
    volume: Arc<Volume>,
    resolver: Arc<dyn ClassResolver>,
    by_handle: Mutex<AHashMap<i32, Arc<ClassInfo>>>,
    by_name: Mutex<AHashMap<String, Vec<Arc<ClassInfo>>>>,
    /// Handles probed and found absent, to avoid repeated tree reads.
    known_null: Mutex<Vec<i32>>,
    /// Serializes handle allocation and record writes.
    write_lock: Mutex<()>,
}

impl ClassIndex {
    pub fn new(volume: Arc<Volume>, resolver: Arc<dyn ClassResolver>) -> Self {
        Self {
            volume,
            resolver,
            by_handle: Mutex::new(AHashMap::new()),
            by_name: Mutex::new(AHashMap::new()),
            known_null: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    fn tree(&self) -> Result<Arc<Tree>> {
        self.volume
            .tree(CLASS_INDEX_TREE_NAME, true)?
            .ok_or_else(|| PersistitError::IllegalState("class index tree missing".into()))
    }

    fn exchange(&self) -> Result<Exchange> {
        Ok(Exchange::new(self.volume.clone(), self.tree()?))
    }

    fn handle_key(handle: i32) -> Result<Key> {
        let mut key = Key::new();
        key.append_int(BY_HANDLE)?;
        key.append_int(handle as i64)?;
        Ok(key)
    }

    fn name_key(name: &str, suid: i64) -> Result<Key> {
        let mut key = Key::new();
        key.append_int(BY_NAME)?;
        key.append_string(name)?;
        key.append_int(suid)?;
        Ok(key)
    }

    fn next_id_key() -> Result<Key> {
        let mut key = Key::new();
        key.append_int(NEXT_ID)?;
        Ok(key)
    }

    fn register(&self, info: Arc<ClassInfo>) {
        self.by_handle.lock().insert(info.handle, info.clone());
        self.by_name
            .lock()
            .entry(info.name.clone())
            .or_default()
            .push(info.clone());
        self.known_null.lock().retain(|&h| h != info.handle);
    }

    /// Resolve a stored handle to its class. `Ok(None)` means the handle
    /// was never assigned; the miss is cached until a registration
    /// invalidates it.
    pub fn lookup_by_handle(&self, handle: i32) -> Result<Option<Arc<ClassInfo>>> {
        if let Some(info) = self.by_handle.lock().get(&handle) {
            return Ok(Some(info.clone()));
        }
        if self.known_null.lock().contains(&handle) {
            return Ok(None);
        }

        let mut exchange = self.exchange()?;
        *exchange.key_mut() = Self::handle_key(handle)?;
        let Some(record) = exchange.fetch(None)? else {
            self.known_null.lock().push(handle);
            return Ok(None);
        };
        let (stored_handle, name, suid) = decode_class_record(&record)?;
        if stored_handle != handle {
            return Err(PersistitError::CorruptVolume(format!(
                "class record for handle {} carries handle {}",
                handle, stored_handle
            )));
        }
        let descriptor = self.resolver.resolve(&name).ok_or_else(|| {
            PersistitError::Conversion(format!("class {} cannot be resolved", name))
        })?;
        if descriptor.suid != suid {
            return Err(PersistitError::Conversion(format!(
                "class {} has SUID {}, stored SUID is {}",
                name, descriptor.suid, suid
            )));
        }
        let info = Arc::new(ClassInfo {
            name,
            suid,
            handle,
        });
        self.register(info.clone());
        Ok(Some(info))
    }

    /// Handle for a class, allocating and persisting one if absent.
    pub fn lookup_by_class(&self, descriptor: &ClassDescriptor) -> Result<Arc<ClassInfo>> {
        if let Some(info) = self.cached_by_descriptor(descriptor) {
            return Ok(info);
        }

        let _write = self.write_lock.lock();
        // another thread may have registered it while we waited
        if let Some(info) = self.cached_by_descriptor(descriptor) {
            return Ok(info);
        }

        let mut exchange = self.exchange()?;
        *exchange.key_mut() = Self::name_key(&descriptor.name, descriptor.suid)?;
        if let Some(record) = exchange.fetch(None)? {
            let (handle, name, suid) = decode_class_record(&record)?;
            let info = Arc::new(ClassInfo { name, suid, handle });
            self.register(info.clone());
            return Ok(info);
        }

        // allocate the next handle under the write lock
        *exchange.key_mut() = Self::next_id_key()?;
        let next = match exchange.fetch(None)? {
            Some(bytes) => decode_next_id(&bytes)? + 1,
            None => 1,
        };
        exchange.store(&encode_next_id(next), None)?;

        let info = Arc::new(ClassInfo {
            name: descriptor.name.clone(),
            suid: descriptor.suid,
            handle: next,
        });
        let record = encode_class_record(info.handle, &info.name, info.suid);
        *exchange.key_mut() = Self::name_key(&info.name, info.suid)?;
        exchange.store(&record, None)?;
        *exchange.key_mut() = Self::handle_key(info.handle)?;
        exchange.store(&record, None)?;

        log::debug!(
            "registered class {} suid={} handle={}",
            info.name,
            info.suid,
            info.handle
        );
        self.register(info.clone());
        Ok(info)
    }

    fn cached_by_descriptor(&self, descriptor: &ClassDescriptor) -> Option<Arc<ClassInfo>> {
        self.by_name
            .lock()
            .get(&descriptor.name)?
            .iter()
            .find(|info| info.suid == descriptor.suid)
            .cloned()
    }
}

fn encode_class_record(handle: i32, name: &str, suid: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + name.len());
    out.write_i32::<BigEndian>(handle).unwrap();
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    out.extend_from_slice(name.as_bytes());
    out.write_i64::<BigEndian>(suid).unwrap();
    out
}

fn decode_class_record(bytes: &[u8]) -> Result<(i32, String, i64)> {
    let mut cursor = std::io::Cursor::new(bytes);
    let truncated = || PersistitError::CorruptVolume("truncated class record".into());
    let handle = cursor.read_i32::<BigEndian>().map_err(|_| truncated())?;
    let name_len = cursor.read_u16::<BigEndian>().map_err(|_| truncated())? as usize;
    let mut name = vec![0u8; name_len];
    cursor.read_exact(&mut name).map_err(|_| truncated())?;
    let suid = cursor.read_i64::<BigEndian>().map_err(|_| truncated())?;
    let name = String::from_utf8(name)
        .map_err(|_| PersistitError::CorruptVolume("class name is not UTF-8".into()))?;
    Ok((handle, name, suid))
}

fn encode_next_id(next: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.write_i32::<BigEndian>(next).unwrap();
    out
}

fn decode_next_id(bytes: &[u8]) -> Result<i32> {
    std::io::Cursor::new(bytes)
        .read_i32::<BigEndian>()
        .map_err(|_| PersistitError::CorruptVolume("truncated class counter".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::journal::MemoryJournal;
    use crate::timestamp::TimestampAllocator;
    use crate::txn::index::TransactionIndex;
    use crate::volume::VolumeSpecification;
    use tempfile::TempDir;

    struct MapResolver {
        classes: AHashMap<String, i64>,
    }

    impl ClassResolver for MapResolver {
        fn resolve(&self, name: &str) -> Option<ClassDescriptor> {
            self.classes.get(name).map(|&suid| ClassDescriptor {
                name: name.to_string(),
                suid,
            })
        }
    }

    fn resolver(entries: &[(&str, i64)]) -> Arc<MapResolver> {
        Arc::new(MapResolver {
            classes: entries
                .iter()
                .map(|(name, suid)| (name.to_string(), *suid))
                .collect(),
        })
    }

    fn volume(dir: &TempDir, journal: Arc<MemoryJournal>) -> Arc<Volume> {
        let allocator = Arc::new(TimestampAllocator::new());
        Volume::create(
            "system",
            VolumeSpecification {
                path: dir.path().join("system.v01"),
                page_size: 4096,
                initial_pages: 16,
                extension_pages: 16,
                maximum_pages: 4096,
                read_only: false,
                temporary: false,
            },
            Arc::new(BufferPool::new(4096, 64)),
            Arc::new(TransactionIndex::new(allocator, 16)),
            journal,
        )
        .unwrap()
    }

    fn reopen(dir: &TempDir, journal: Arc<MemoryJournal>) -> Arc<Volume> {
        let allocator = Arc::new(TimestampAllocator::new());
        Volume::open(
            "system",
            VolumeSpecification {
                path: dir.path().join("system.v01"),
                page_size: 4096,
                initial_pages: 16,
                extension_pages: 16,
                maximum_pages: 4096,
                read_only: false,
                temporary: false,
            },
            0,
            Arc::new(BufferPool::new(4096, 64)),
            Arc::new(TransactionIndex::new(allocator, 16)),
            journal,
        )
        .unwrap()
    }

    #[test]
    fn test_handle_round_trip() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let index = ClassIndex::new(volume(&dir, journal), resolver(&[("A.B.C", 42)]));

        let descriptor = ClassDescriptor {
            name: "A.B.C".into(),
            suid: 42,
        };
        let info = index.lookup_by_class(&descriptor).unwrap();
        let by_handle = index.lookup_by_handle(info.handle()).unwrap().unwrap();
        assert_eq!(by_handle.name(), "A.B.C");
        assert_eq!(by_handle.suid(), 42);
        index.volume.close().unwrap();
    }

    #[test]
    fn test_handles_are_stable_and_distinct() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let index = ClassIndex::new(
            volume(&dir, journal),
            resolver(&[("A", 1), ("B", 2)]),
        );

        let a = index
            .lookup_by_class(&ClassDescriptor { name: "A".into(), suid: 1 })
            .unwrap();
        let b = index
            .lookup_by_class(&ClassDescriptor { name: "B".into(), suid: 2 })
            .unwrap();
        assert_ne!(a.handle(), b.handle());
        let again = index
            .lookup_by_class(&ClassDescriptor { name: "A".into(), suid: 1 })
            .unwrap();
        assert_eq!(a.handle(), again.handle());
        index.volume.close().unwrap();
    }

    #[test]
    fn test_registration_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let handle = {
            let index = ClassIndex::new(volume(&dir, journal.clone()), resolver(&[("A.B.C", 42)]));
            let info = index
                .lookup_by_class(&ClassDescriptor { name: "A.B.C".into(), suid: 42 })
                .unwrap();
            index.volume.close().unwrap();
            info.handle()
        };

        let index = ClassIndex::new(reopen(&dir, journal), resolver(&[("A.B.C", 42)]));
        let info = index.lookup_by_handle(handle).unwrap().unwrap();
        assert_eq!(info.name(), "A.B.C");
        index.volume.close().unwrap();
    }

    #[test]
    fn test_suid_mismatch_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let handle = {
            let index = ClassIndex::new(volume(&dir, journal.clone()), resolver(&[("A.B.C", 42)]));
            let info = index
                .lookup_by_class(&ClassDescriptor { name: "A.B.C".into(), suid: 42 })
                .unwrap();
            index.volume.close().unwrap();
            info.handle()
        };

        // the class evolved: its runtime SUID is now 43
        let index = ClassIndex::new(reopen(&dir, journal), resolver(&[("A.B.C", 43)]));
        assert!(matches!(
            index.lookup_by_handle(handle),
            Err(PersistitError::Conversion(_))
        ));
        index.volume.close().unwrap();
    }

    #[test]
    fn test_unknown_handle_cached_as_negative() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let index = ClassIndex::new(volume(&dir, journal), resolver(&[]));
        assert!(index.lookup_by_handle(99).unwrap().is_none());
        assert!(index.known_null.lock().contains(&99));
        // second probe is served from the negative cache
        assert!(index.lookup_by_handle(99).unwrap().is_none());
        index.volume.close().unwrap();
    }

    #[test]
    fn test_unresolvable_class_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(MemoryJournal::new());
        let index = ClassIndex::new(volume(&dir, journal.clone()), resolver(&[("Gone", 7)]));
        let handle = {
            let info = index
                .lookup_by_class(&ClassDescriptor { name: "Gone".into(), suid: 7 })
                .unwrap();
            info.handle()
        };
        index.volume.close().unwrap();

        let index = ClassIndex::new(reopen(&dir, journal), resolver(&[]));
        assert!(matches!(
            index.lookup_by_handle(handle),
            Err(PersistitError::Conversion(_))
        ));
        index.volume.close().unwrap();
    }
}
